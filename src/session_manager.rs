//! Owns every session in the process: creation, lifecycle delegation,
//! and the optional shared feeder thread that multiple sessions replay
//! off the same data source without each paying for its own stream.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dashmap::DashMap;

use crate::config::SimulatorConfig;
use crate::core_types::{OrderId, SessionId, TimestampNs};
use crate::data_source::{source_event_to_market_event, DataSource};
use crate::error::{SimError, SimResult};
use crate::event_queue::OverflowPolicy;
use crate::messages::{EventKind, EventPayload, MarketEvent};
use crate::models::{AccountState, Order, Position};
use crate::session::{EventCallback, Session, SessionConfig, SessionStatus};

/// Parameters a caller supplies when opening a new session; everything
/// not specified falls back to [`SimulatorConfig`]'s defaults.
#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    pub session_id: Option<SessionId>,
    pub symbols: Vec<String>,
    pub start_time: TimestampNs,
    pub end_time: TimestampNs,
    pub initial_capital: Option<f64>,
    pub speed_factor: Option<f64>,
}

pub struct SessionManager {
    config: SimulatorConfig,
    wal_dir: PathBuf,
    source: Arc<dyn DataSource>,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    feeder_handle: Mutex<Option<JoinHandle<()>>>,
    feeder_running: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(config: SimulatorConfig, source: Arc<dyn DataSource>) -> Self {
        let wal_dir = PathBuf::from(&config.execution.wal_directory);
        Self {
            config,
            wal_dir,
            source,
            sessions: Arc::new(DashMap::new()),
            feeder_handle: Mutex::new(None),
            feeder_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn create_session(&self, req: NewSessionRequest) -> SimResult<SessionId> {
        if self.config.defaults.max_sessions > 0
            && self.sessions.len() >= self.config.defaults.max_sessions
        {
            return Err(SimError::Config(format!(
                "session limit reached ({})",
                self.config.defaults.max_sessions
            )));
        }

        let id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.sessions.contains_key(&id) {
            return Err(SimError::Config(format!("session {id} already exists")));
        }

        let cfg = SessionConfig {
            symbols: req.symbols,
            start_time: req.start_time,
            end_time: req.end_time,
            initial_capital: req.initial_capital.unwrap_or(self.config.defaults.initial_capital),
            speed_factor: req.speed_factor.unwrap_or(self.config.defaults.speed_factor),
            queue_capacity: self.config.defaults.session_queue_capacity,
            overflow_policy: OverflowPolicy::Block,
            execution: self.config.execution.clone(),
            fees: self.config.fees,
            wal_dir: self.wal_dir.clone(),
        };

        let session = Arc::new(Session::new(id.clone(), cfg));
        self.sessions.insert(id.clone(), session);
        tracing::info!(session_id = %id, "session created");
        Ok(id)
    }

    fn get(&self, id: &str) -> SimResult<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SimError::SessionNotFound(id.to_string()))
    }

    pub fn start_session(&self, id: &str) -> SimResult<()> {
        let session = self.get(id)?;
        if self.config.execution.enable_shared_feed {
            self.ensure_shared_feeder();
        }
        session.start(Arc::clone(&self.source));
        Ok(())
    }

    pub fn pause_session(&self, id: &str) -> SimResult<()> {
        self.get(id)?.pause();
        Ok(())
    }

    pub fn resume_session(&self, id: &str) -> SimResult<()> {
        self.get(id)?.resume();
        Ok(())
    }

    pub fn stop_session(&self, id: &str) -> SimResult<()> {
        self.get(id)?.stop();
        Ok(())
    }

    pub fn destroy_session(&self, id: &str) -> SimResult<()> {
        let session = self.get(id)?;
        session.stop();
        self.sessions.remove(id);
        Ok(())
    }

    pub fn set_speed(&self, id: &str, speed: f64) -> SimResult<()> {
        self.get(id)?.set_speed(speed);
        Ok(())
    }

    pub fn jump_to(&self, id: &str, ts: TimestampNs) -> SimResult<()> {
        let session = self.get(id)?;
        session.jump_to(ts, Arc::clone(&self.source));
        Ok(())
    }

    pub fn fast_forward(&self, id: &str, ts: TimestampNs) -> SimResult<()> {
        let session = self.get(id)?;
        session.fast_forward(ts);
        Ok(())
    }

    pub fn status(&self, id: &str) -> SimResult<SessionStatus> {
        Ok(self.get(id)?.status())
    }

    pub fn watermark(&self, id: &str) -> SimResult<TimestampNs> {
        Ok(self.get(id)?.watermark())
    }

    pub fn submit_order(&self, id: &str, order: Order) -> SimResult<OrderId> {
        self.get(id)?.submit_order(order)
    }

    pub fn cancel_order(&self, id: &str, order_id: OrderId) -> SimResult<bool> {
        Ok(self.get(id)?.cancel_order(order_id))
    }

    pub fn list_orders(&self, id: &str) -> SimResult<Vec<Order>> {
        Ok(self.get(id)?.get_orders())
    }

    pub fn get_order(&self, id: &str, order_id: OrderId) -> SimResult<Option<Order>> {
        Ok(self.get(id)?.get_order(order_id))
    }

    pub fn account_state(&self, id: &str) -> SimResult<AccountState> {
        Ok(self.get(id)?.account_state())
    }

    pub fn positions(&self, id: &str) -> SimResult<rustc_hash::FxHashMap<String, Position>> {
        Ok(self.get(id)?.positions())
    }

    pub fn performance_summary(&self, id: &str) -> SimResult<(f64, f64, f64)> {
        Ok(self.get(id)?.performance_summary())
    }

    pub fn apply_dividend(&self, id: &str, symbol: &str, amount_per_share: f64) -> SimResult<()> {
        self.get(id)?.apply_dividend(symbol, amount_per_share);
        Ok(())
    }

    pub fn apply_split(&self, id: &str, symbol: &str, ratio: f64) -> SimResult<()> {
        self.get(id)?.apply_split(symbol, ratio);
        Ok(())
    }

    pub fn save_checkpoint(&self, id: &str) -> SimResult<()> {
        self.get(id)?.save_session_checkpoint()
    }

    pub fn add_event_callback(&self, id: &str, cb: EventCallback) -> SimResult<()> {
        self.get(id)?.add_event_callback(cb);
        Ok(())
    }

    /// Lazily starts the one shared feeder thread. Idempotent: a second
    /// session opting into the shared feed just rides the thread that is
    /// already running. Each iteration, the thread gathers every running
    /// session not yet fed this round, streams the union of their symbols
    /// over the union of their windows, and routes each event to every
    /// session whose own symbols/window it falls within. A session created
    /// after the feeder started is picked up on the feeder's next poll,
    /// not instantaneously.
    fn ensure_shared_feeder(&self) {
        if self.feeder_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poll_interval = self.config.execution.poll_interval_seconds.max(1);
        tracing::info!(poll_interval, "starting shared feeder thread");
        let running = Arc::clone(&self.feeder_running);
        let sessions = Arc::clone(&self.sessions);
        let source = Arc::clone(&self.source);
        let handle = std::thread::spawn(move || {
            let mut fed: HashSet<SessionId> = HashSet::new();
            while running.load(Ordering::SeqCst) {
                let targets: Vec<(SessionId, Arc<Session>)> = sessions
                    .iter()
                    .filter(|e| e.value().status() == SessionStatus::Running)
                    .filter(|e| !fed.contains(e.key()))
                    .map(|e| (e.key().clone(), Arc::clone(e.value())))
                    .collect();

                if targets.is_empty() {
                    std::thread::sleep(std::time::Duration::from_secs(poll_interval));
                    continue;
                }

                let mut symbols: HashSet<String> = HashSet::new();
                let mut window_start = TimestampNs::MAX;
                let mut window_end = TimestampNs::MIN;
                for (_, session) in &targets {
                    symbols.extend(session.symbols());
                    let (start, end) = session.window();
                    window_start = window_start.min(start);
                    window_end = window_end.max(end);
                }
                let symbols: Vec<String> = symbols.into_iter().collect();

                let events = source.stream_events(&symbols, window_start, window_end);
                for e in events {
                    let market_event = source_event_to_market_event(e);
                    for (_, session) in &targets {
                        let (start, end) = session.window();
                        let in_window = market_event.timestamp_ns >= start && market_event.timestamp_ns < end;
                        if in_window && session.symbols().iter().any(|s| s == &market_event.symbol) {
                            session.push_shared_event(market_event.clone());
                        }
                    }
                }

                for (id, session) in targets {
                    session.mark_feed_complete();
                    fed.insert(id);
                }

                std::thread::sleep(std::time::Duration::from_secs(poll_interval));
            }
        });
        *self.feeder_handle.lock().unwrap() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.feeder_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.feeder_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        for entry in self.sessions.iter() {
            entry.value().stop();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a `MarketEvent` from a raw data-source event kind; used by
/// callers (e.g. the demo binary) that want to hand-feed events instead
/// of relying on `Session::start`'s own preload.
pub fn trade_event(symbol: String, timestamp_ns: TimestampNs, price: f64, size: f64) -> MarketEvent {
    MarketEvent {
        timestamp_ns,
        sequence: 0,
        kind: EventKind::Trade,
        symbol,
        payload: EventPayload::Trade(crate::messages::TradeData { price, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::InMemoryDataSource;
    use tempfile::tempdir;

    fn manager(dir: PathBuf) -> SessionManager {
        let mut config = SimulatorConfig::default();
        config.execution.wal_directory = dir.to_string_lossy().to_string();
        config.execution.enable_margin_call_checks = false;
        SessionManager::new(config, Arc::new(InMemoryDataSource::new(Vec::new())))
    }

    #[test]
    fn create_and_list_sessions() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let id = mgr
            .create_session(NewSessionRequest {
                session_id: None,
                symbols: vec!["AAPL".to_string()],
                start_time: 0,
                end_time: 1000,
                initial_capital: None,
                speed_factor: None,
            })
            .unwrap();
        assert_eq!(mgr.session_count(), 1);
        assert_eq!(mgr.list_sessions(), vec![id.clone()]);
        assert_eq!(mgr.status(&id).unwrap(), SessionStatus::Created);
    }

    #[test]
    fn duplicate_session_id_rejected() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let req = |id: &str| NewSessionRequest {
            session_id: Some(id.to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 1000,
            initial_capital: None,
            speed_factor: None,
        };
        mgr.create_session(req("dup")).unwrap();
        assert!(mgr.create_session(req("dup")).is_err());
    }

    #[test]
    fn unknown_session_operations_error() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        assert!(mgr.start_session("ghost").is_err());
        assert!(mgr.account_state("ghost").is_err());
    }

    #[test]
    fn session_limit_enforced() {
        let dir = tempdir().unwrap();
        let mut config = SimulatorConfig::default();
        config.execution.wal_directory = dir.path().to_string_lossy().to_string();
        config.defaults.max_sessions = 1;
        let mgr = SessionManager::new(config, Arc::new(InMemoryDataSource::new(Vec::new())));
        let req = |id: &str| NewSessionRequest {
            session_id: Some(id.to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 1000,
            initial_capital: None,
            speed_factor: None,
        };
        mgr.create_session(req("a")).unwrap();
        assert!(mgr.create_session(req("b")).is_err());
    }
}
