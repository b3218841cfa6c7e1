//! A single tenant: its own clock, event queue, matching engine,
//! ledger, WAL and worker thread. Sessions never see each other's
//! orders; the only thing shared across sessions is the data source
//! and (optionally) one feeder thread managed by the session manager.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::checkpoint::{self, Checkpoint};
use crate::clock::SimClock;
use crate::config::{ExecutionConfig, FeeConfig, MarketSession};
use crate::core_types::{OrderId, SessionId, TimestampNs};
use crate::data_source::{source_event_to_market_event, DataSource};
use crate::error::{RejectReason, SimError, SimResult};
use crate::event_queue::{EventQueue, OverflowPolicy};
use crate::ledger::Ledger;
use crate::matching::MatchingEngine;
use crate::messages::{
    CorporateActionKind, EventKind, EventPayload, MarketEvent, QuoteData, SessionEvent,
};
use crate::models::{Fill, Nbbo, Order, OrderStatus, OrderType, Side, TimeInForce};
use crate::perf::PerformanceTracker;
use crate::wal::{WalConfig, WalEntry, WalWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub symbols: Vec<String>,
    pub start_time: TimestampNs,
    pub end_time: TimestampNs,
    pub initial_capital: f64,
    pub speed_factor: f64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub execution: ExecutionConfig,
    pub fees: FeeConfig,
    pub wal_dir: PathBuf,
}

pub type EventCallback = Arc<dyn Fn(&str, &SessionEvent) + Send + Sync>;

pub struct Session {
    pub id: SessionId,
    config: RwLock<SessionConfig>,
    status: Mutex<SessionStatus>,
    clock: Arc<SimClock>,
    queue: Arc<EventQueue>,
    matching: Mutex<MatchingEngine>,
    ledger: Mutex<Ledger>,
    perf: Mutex<PerformanceTracker>,
    wal: Mutex<Option<WalWriter>>,
    orders: Mutex<FxHashMap<OrderId, Order>>,
    halted_symbols: Mutex<FxHashSet<String>>,
    /// Circuit-breaker halt expiry per symbol, set when a `HALT` event
    /// carries `luld_halt_duration_sec > 0`. Pruned on every tick and
    /// before `submit_order`'s halt check so a halt auto-lifts once its
    /// window passes, even with no later `RESUME` event on the tape.
    halt_end_times: Mutex<FxHashMap<String, TimestampNs>>,
    ssr_symbols: Mutex<FxHashSet<String>>,
    /// Prior session-day reference price per symbol, used to evaluate the
    /// SSR intraday-decline trigger. Seeded from each symbol's first quote.
    reference_prices: Mutex<FxHashMap<String, f64>>,
    pub last_event_ns: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    last_checkpoint_events: AtomicU64,
    next_order_id: AtomicU64,
    should_stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Per-session polling-feeder thread (§ poll_interval_seconds mode).
    /// Never populated when `enable_shared_feed` is set: that mode's I/O
    /// is owned by the session manager's single shared feeder thread.
    feeder: Mutex<Option<JoinHandle<()>>>,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        let clock = Arc::new(SimClock::new(config.start_time, config.speed_factor));
        let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow_policy));
        let matching = MatchingEngine::new(config.execution.clone());
        let ledger = Ledger::new(config.initial_capital, config.execution.clone());
        let perf = PerformanceTracker::new(config.start_time, config.initial_capital);

        let wal = if config.execution.enable_wal {
            let path = checkpoint::wal_path(&config.wal_dir, &id);
            WalWriter::open(WalConfig::new(path, config.execution.wal_max_bytes)).ok()
        } else {
            None
        };

        let session = Self {
            id,
            config: RwLock::new(config),
            status: Mutex::new(SessionStatus::Created),
            clock,
            queue,
            matching: Mutex::new(matching),
            ledger: Mutex::new(ledger),
            perf: Mutex::new(perf),
            wal: Mutex::new(wal),
            orders: Mutex::new(FxHashMap::default()),
            halted_symbols: Mutex::new(FxHashSet::default()),
            halt_end_times: Mutex::new(FxHashMap::default()),
            ssr_symbols: Mutex::new(FxHashSet::default()),
            reference_prices: Mutex::new(FxHashMap::default()),
            last_event_ns: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            last_checkpoint_events: AtomicU64::new(0),
            next_order_id: AtomicU64::new(1),
            should_stop: AtomicBool::new(false),
            worker: Mutex::new(None),
            feeder: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        };
        session.try_recover();
        session
    }

    fn wal_dir(&self) -> PathBuf {
        self.config.read().unwrap().wal_dir.clone()
    }

    fn try_recover(&self) {
        let dir = self.wal_dir();
        let Some(ckpt) = checkpoint::load_checkpoint(&self.id, &dir) else {
            return;
        };
        self.restore_from_checkpoint(&ckpt);

        let wal_path = checkpoint::wal_path(&dir, &self.id);
        if let Ok(entries) = crate::wal::load_entries_after(&wal_path, ckpt.last_event_ns) {
            for entry in entries {
                self.replay_wal_entry(&entry);
            }
        }
        tracing::info!(session_id = %self.id, last_event_ns = self.last_event_ns.load(Ordering::SeqCst), "session recovered");
    }

    fn restore_from_checkpoint(&self, ckpt: &Checkpoint) {
        self.ledger.lock().unwrap().restore_state(ckpt.account);
        self.ledger
            .lock()
            .unwrap()
            .restore_positions(ckpt.positions_map());
        *self.orders.lock().unwrap() = ckpt.orders.iter().map(|o| (o.id, o.clone())).collect();

        let mut matching = self.matching.lock().unwrap();
        for (symbol, nbbo) in ckpt.nbbo_cache.iter() {
            matching.update_nbbo(*nbbo, symbol);
        }
        for order in &ckpt.orders {
            if matches!(
                order.status,
                OrderStatus::Accepted | OrderStatus::PartiallyFilled | OrderStatus::PendingNew
            ) {
                let mut o = order.clone();
                matching.submit_order(&mut o);
            }
        }
        drop(matching);

        self.last_event_ns
            .store(ckpt.last_event_ns.max(0) as u64, Ordering::SeqCst);
        self.events_processed
            .store(ckpt.events_processed, Ordering::SeqCst);
        self.last_checkpoint_events
            .store(ckpt.events_processed, Ordering::SeqCst);
    }

    fn replay_wal_entry(&self, entry: &WalEntry) {
        match entry.event.as_str() {
            "fill" => {
                let Some(fill) = parse_fill(entry) else { return };
                let fees = entry.fields.get("fees").and_then(|v| v.as_f64()).unwrap_or(0.0);
                self.ledger.lock().unwrap().apply_fill(&fill.symbol, &fill, fees);
            }
            "market_event" => {
                if let Some(kind) = entry.fields.get("type").and_then(|v| v.as_str()) {
                    let symbol = entry
                        .fields
                        .get("symbol")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if kind == "QUOTE" {
                        if let Some(nbbo) = parse_nbbo(entry, entry.ts_ns) {
                            let mut matching = self.matching.lock().unwrap();
                            matching.update_nbbo(nbbo, &symbol);
                            drop(matching);
                            self.ledger.lock().unwrap().mark_to_market(&symbol, nbbo.mid());
                        }
                    } else if kind == "TRADE" {
                        if let Some(price) = entry.fields.get("price").and_then(|v| v.as_f64()) {
                            self.ledger.lock().unwrap().mark_to_market(&symbol, price);
                        }
                    }
                }
            }
            "dividend" => {
                if let (Some(symbol), Some(amount)) = (
                    entry.fields.get("symbol").and_then(|v| v.as_str()),
                    entry.fields.get("amount_per_share").and_then(|v| v.as_f64()),
                ) {
                    self.ledger.lock().unwrap().apply_dividend(symbol, amount);
                }
            }
            "split" => {
                if let (Some(symbol), Some(ratio)) = (
                    entry.fields.get("symbol").and_then(|v| v.as_str()),
                    entry.fields.get("ratio").and_then(|v| v.as_f64()),
                ) {
                    self.ledger.lock().unwrap().apply_split(symbol, ratio);
                }
            }
            _ => {}
        }
        self.last_event_ns.store(entry.ts_ns.max(0) as u64, Ordering::SeqCst);
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    pub fn watermark(&self) -> TimestampNs {
        self.last_event_ns.load(Ordering::SeqCst) as TimestampNs
    }

    pub fn add_event_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    fn fan_out(&self, event: &SessionEvent) {
        let subscribers: Vec<EventCallback> = self.callbacks.lock().unwrap().clone();
        for cb in subscribers {
            cb(&self.id, event);
        }
    }

    /// Preloads every event for the configured window from the data
    /// source into the queue. This is the "default feeder" mode: one
    /// batched call, no separate thread.
    fn preload_events(&self, source: &dyn DataSource) {
        let cfg = self.config.read().unwrap().clone();
        let raw = source.stream_events(&cfg.symbols, cfg.start_time, cfg.end_time);
        for e in raw {
            self.push_event(source_event_to_market_event(e));
        }
    }

    fn push_event(&self, event: MarketEvent) {
        if !self.queue.push(event) {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Symbols this session is replaying, for the shared feeder to union
    /// across every running session.
    pub fn symbols(&self) -> Vec<String> {
        self.config.read().unwrap().symbols.clone()
    }

    /// `[start, end)` window this session is configured for.
    pub fn window(&self) -> (TimestampNs, TimestampNs) {
        let cfg = self.config.read().unwrap();
        (cfg.start_time, cfg.end_time)
    }

    /// Entry point used by the session manager's shared feeder thread to
    /// hand this session an event it streamed on its behalf.
    pub fn push_shared_event(&self, event: MarketEvent) {
        self.push_event(event);
    }

    /// Called by the shared feeder once it has exhausted the window for
    /// this session, so the worker's `wait_and_pop` stops blocking.
    pub fn mark_feed_complete(&self) {
        self.queue.stop();
    }

    /// Polling feeder mode (`poll_interval_seconds > 0`, shared feed off):
    /// slices `[start, end)` into `poll_interval_seconds`-wide windows and
    /// streams each in turn, pacing itself with a real sleep between
    /// windows so a session backed by a growing live-ish feed only ever
    /// has to hold one window's worth of events at a time.
    fn run_polling_feeder(self: Arc<Self>, source: Arc<dyn DataSource>) {
        let (start, end, symbols, poll_secs) = {
            let cfg = self.config.read().unwrap();
            (cfg.start_time, cfg.end_time, cfg.symbols.clone(), cfg.execution.poll_interval_seconds)
        };
        let window_ns = (poll_secs.max(1) as TimestampNs) * 1_000_000_000;
        let mut cursor = start;
        while cursor < end {
            if self.should_stop.load(Ordering::SeqCst) {
                return;
            }
            let window_end = (cursor + window_ns).min(end);
            for e in source.stream_events(&symbols, cursor, window_end) {
                self.push_event(source_event_to_market_event(e));
            }
            cursor = window_end;
            if cursor < end {
                std::thread::sleep(std::time::Duration::from_secs(poll_secs.max(1)));
            }
        }
        self.queue.stop();
    }

    /// Starts the clock and worker thread. `source` is cloned behind an
    /// `Arc` by the caller (the session manager) so the worker can pull
    /// from it without the session owning a `'static` reference itself.
    pub fn start(self: &Arc<Self>, source: Arc<dyn DataSource>) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == SessionStatus::Running {
                return;
            }
            *status = SessionStatus::Running;
        }
        self.should_stop.store(false, Ordering::SeqCst);
        self.queue.reset();
        self.clock.start();

        let (shared_feed, poll_interval) = {
            let cfg = self.config.read().unwrap();
            (cfg.execution.enable_shared_feed, cfg.execution.poll_interval_seconds)
        };
        if shared_feed {
            // The session manager's shared feeder thread owns streaming
            // and will push events via `push_shared_event` then call
            // `mark_feed_complete`; this session does no feeding itself.
        } else if poll_interval > 0 {
            let this = Arc::clone(self);
            let src = Arc::clone(&source);
            let handle = std::thread::spawn(move || this.run_polling_feeder(src));
            *self.feeder.lock().unwrap() = Some(handle);
        } else {
            self.preload_events(source.as_ref());
            // The preload above loads the whole configured window up front, so
            // once the worker drains it there is nothing more coming: mark the
            // queue stopped now so `wait_and_pop` returns `None` (not a hang)
            // the instant the last preloaded event is consumed.
            self.queue.stop();
        }

        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.run_loop());
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
            let Some(event) = self.queue.wait_and_pop() else {
                break;
            };
            if !self.clock.wait_for_next_event(event.timestamp_ns) {
                break;
            }
            self.process_event(&event, true);
            self.maybe_checkpoint();
        }
        if !self.should_stop.load(Ordering::SeqCst) {
            *self.status.lock().unwrap() = SessionStatus::Completed;
            self.fan_out(&SessionEvent::SessionCompleted);
        }
    }

    fn process_event(&self, event: &MarketEvent, emit_callbacks: bool) {
        self.last_event_ns
            .store(event.timestamp_ns.max(0) as u64, Ordering::SeqCst);
        self.append_wal_market_event(event);
        self.prune_expired_halts(event.timestamp_ns);

        match (&event.kind, &event.payload) {
            (EventKind::Quote, EventPayload::Quote(q)) => {
                self.handle_quote(&event.symbol, q, event.timestamp_ns, emit_callbacks);
            }
            (EventKind::Trade, EventPayload::Trade(t)) => {
                self.ledger.lock().unwrap().mark_to_market(&event.symbol, t.price);
            }
            (EventKind::Halt, _) => {
                self.halted_symbols.lock().unwrap().insert(event.symbol.clone());
                let halt_duration_sec = self.config.read().unwrap().execution.luld_halt_duration_sec;
                if halt_duration_sec > 0 {
                    let halt_end = event.timestamp_ns + halt_duration_sec as TimestampNs * 1_000_000_000;
                    self.halt_end_times.lock().unwrap().insert(event.symbol.clone(), halt_end);
                } else {
                    self.halt_end_times.lock().unwrap().remove(&event.symbol);
                }
            }
            (EventKind::Resume, _) => {
                self.halted_symbols.lock().unwrap().remove(&event.symbol);
                self.halt_end_times.lock().unwrap().remove(&event.symbol);
            }
            (EventKind::Dividend, EventPayload::Dividend(d)) => {
                let enabled = self.config.read().unwrap().execution.enable_auto_corporate_actions;
                if enabled {
                    self.ledger.lock().unwrap().apply_dividend(&event.symbol, d.amount_per_share);
                    self.append_wal(event.timestamp_ns, "dividend", serde_json::json!({
                        "symbol": event.symbol, "amount_per_share": d.amount_per_share,
                    }));
                    if emit_callbacks {
                        self.fan_out(&SessionEvent::CorporateAction {
                            symbol: event.symbol.clone(),
                            kind: CorporateActionKind::Dividend { amount_per_share: d.amount_per_share },
                        });
                    }
                }
            }
            (EventKind::Split, EventPayload::Split(s)) => {
                let enabled = self.config.read().unwrap().execution.enable_auto_corporate_actions;
                if enabled {
                    self.ledger.lock().unwrap().apply_split(&event.symbol, s.ratio);
                    self.append_wal(event.timestamp_ns, "split", serde_json::json!({
                        "symbol": event.symbol, "ratio": s.ratio,
                    }));
                    if emit_callbacks {
                        self.fan_out(&SessionEvent::CorporateAction {
                            symbol: event.symbol.clone(),
                            kind: CorporateActionKind::Split { ratio: s.ratio },
                        });
                    }
                }
            }
            _ => {}
        }

        let equity = self.ledger.lock().unwrap().state().equity;
        self.perf.lock().unwrap().record(event.timestamp_ns, equity);
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        if emit_callbacks {
            self.fan_out(&SessionEvent::MarketData(event.clone()));
        }

        self.enforce_margin(event.timestamp_ns, emit_callbacks);
    }

    fn handle_quote(&self, symbol: &str, q: &QuoteData, ts: TimestampNs, emit_callbacks: bool) {
        let nbbo = Nbbo {
            bid: q.bid,
            bid_size: q.bid_size,
            ask: q.ask,
            ask_size: q.ask_size,
            timestamp_ns: ts,
        };
        self.evaluate_ssr_trigger(symbol, nbbo.mid());

        let result = self.matching.lock().unwrap().update_nbbo(nbbo, symbol);

        for fill in result.fills {
            self.process_fill(fill, emit_callbacks);
        }
        for order_id in result.expired {
            if let Some(order) = self.orders.lock().unwrap().get_mut(&order_id) {
                order.status = OrderStatus::Expired;
                order.expired_at_ns = Some(ts);
            }
            self.append_wal(ts, "order_canceled", serde_json::json!({"id": order_id}));
            if emit_callbacks {
                self.fan_out(&SessionEvent::OrderExpired { order_id });
            }
        }

        self.ledger.lock().unwrap().mark_to_market(symbol, nbbo.mid());
    }

    /// Lifts any halt whose recorded expiry has passed as of `ts`. A halt
    /// with no recorded expiry (manual halt, or `luld_halt_duration_sec ==
    /// 0`) is left in place for an explicit `RESUME` to clear.
    fn prune_expired_halts(&self, ts: TimestampNs) {
        let expired: Vec<String> = self
            .halt_end_times
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, end)| **end <= ts)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut ends = self.halt_end_times.lock().unwrap();
        let mut halted = self.halted_symbols.lock().unwrap();
        for symbol in expired {
            ends.remove(&symbol);
            halted.remove(&symbol);
        }
    }

    /// Rule 201: once a symbol drops `ssr_threshold_pct` from its session
    /// reference price, short sales are restricted until end of session.
    /// The reference price is seeded on the symbol's first quote and never
    /// rewritten, so the trigger never "un-fires" mid-session.
    fn evaluate_ssr_trigger(&self, symbol: &str, mid: f64) {
        let cfg = self.config.read().unwrap();
        if !cfg.execution.enable_short_sale_restrictions || mid <= 0.0 {
            return;
        }
        let threshold_pct = cfg.execution.ssr_threshold_pct;
        drop(cfg);

        let mut refs = self.reference_prices.lock().unwrap();
        let reference = *refs.entry(symbol.to_string()).or_insert(mid);
        if reference > 0.0 {
            let decline_pct = (reference - mid) / reference * 100.0;
            if decline_pct >= threshold_pct {
                self.ssr_symbols.lock().unwrap().insert(symbol.to_string());
            }
        }
    }

    fn process_fill(&self, mut fill: Fill, emit_callbacks: bool) {
        let (impact_bps, enable_impact, enable_slippage, slippage_bps) = {
            let cfg = self.config.read().unwrap();
            (
                cfg.execution.market_impact_bps,
                cfg.execution.enable_market_impact,
                cfg.execution.enable_slippage,
                cfg.execution.fixed_slippage_bps,
            )
        };

        if enable_impact {
            let avail = self
                .matching
                .lock()
                .unwrap()
                .get_nbbo(&fill.symbol)
                .map(|n| match fill.side {
                    Side::Buy => n.ask_size,
                    Side::Sell => n.bid_size,
                })
                .unwrap_or(0.0);
            if avail > 0.0 {
                let ratio = (fill.qty / avail).min(1.0);
                let adj = impact_bps * ratio / 10_000.0;
                fill.price *= match fill.side {
                    Side::Buy => 1.0 + adj,
                    Side::Sell => 1.0 - adj,
                };
            }
        }
        if enable_slippage {
            let adj = slippage_bps / 10_000.0;
            fill.price *= match fill.side {
                Side::Buy => 1.0 + adj,
                Side::Sell => 1.0 - adj,
            };
        }

        let is_maker = self
            .orders
            .lock()
            .unwrap()
            .get(&fill.order_id)
            .map(|o| o.is_maker)
            .unwrap_or(false);
        let fees = self
            .config
            .read()
            .unwrap()
            .fees
            .calculate_fees(fill.qty, fill.price, matches!(fill.side, Side::Sell), is_maker);

        {
            let mut orders = self.orders.lock().unwrap();
            if let Some(order) = orders.get_mut(&fill.order_id) {
                order.filled_qty += fill.qty;
                order.last_fill_price = fill.price;
                order.status = if order.remaining() > 0.0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Filled
                };
                order.updated_at_ns = fill.timestamp_ns;
                order.filled_at_ns = Some(fill.timestamp_ns);
            }
        }

        self.ledger.lock().unwrap().apply_fill(&fill.symbol, &fill, fees);

        self.append_wal(
            fill.timestamp_ns,
            "fill",
            serde_json::json!({
                "order_id": fill.order_id, "symbol": fill.symbol,
                "side": matches!(fill.side, Side::Buy), "qty": fill.qty,
                "price": fill.price, "fees": fees,
            }),
        );

        if emit_callbacks {
            self.fan_out(&SessionEvent::OrderFilled {
                order_id: fill.order_id,
                is_partial: fill.is_partial,
                fill,
            });
        }
    }

    fn enforce_margin(&self, ts: TimestampNs, emit_callbacks: bool) {
        let breached = self.ledger.lock().unwrap().check_margin_breach();
        if !breached {
            return;
        }
        let state = self.ledger.lock().unwrap().state();
        if emit_callbacks {
            self.fan_out(&SessionEvent::MarginCall {
                equity: state.equity,
                maintenance_margin: state.maintenance_margin,
            });
        }

        let positions: Vec<(String, f64)> = self
            .ledger
            .lock()
            .unwrap()
            .positions()
            .iter()
            .filter(|(_, p)| p.qty != 0.0)
            .map(|(s, p)| (s.clone(), p.qty))
            .collect();

        for (symbol, qty) in positions {
            let Some(nbbo) = self.matching.lock().unwrap().get_nbbo(&symbol) else { continue };
            let side = if qty > 0.0 { Side::Sell } else { Side::Buy };
            let price = match side {
                Side::Sell => nbbo.bid,
                Side::Buy => nbbo.ask,
            };
            if price <= 0.0 {
                continue;
            }
            let fill = Fill {
                order_id: 0,
                symbol,
                side,
                qty: qty.abs(),
                price,
                timestamp_ns: ts,
                is_partial: false,
            };
            self.process_fill(fill, emit_callbacks);
        }
    }

    fn maybe_checkpoint(&self) {
        let interval = self.config.read().unwrap().execution.checkpoint_interval_events;
        if interval == 0 {
            return;
        }
        let processed = self.events_processed.load(Ordering::SeqCst);
        let last = self.last_checkpoint_events.load(Ordering::SeqCst);
        if processed - last >= interval {
            if self.save_session_checkpoint().is_ok() {
                self.last_checkpoint_events.store(processed, Ordering::SeqCst);
            }
        }
    }

    pub fn save_session_checkpoint(&self) -> SimResult<()> {
        let dir = self.wal_dir();
        let ledger = self.ledger.lock().unwrap();
        let ckpt = Checkpoint {
            session_id: self.id.clone(),
            checkpoint_ns: crate::core_types::wall_clock_now_ns(),
            last_event_ns: self.last_event_ns.load(Ordering::SeqCst) as TimestampNs,
            events_processed: self.events_processed.load(Ordering::SeqCst),
            account: ledger.state(),
            positions: ledger.positions().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            orders: self.orders.lock().unwrap().values().cloned().collect(),
            nbbo_cache: self.matching.lock().unwrap().all_nbbo(),
        };
        drop(ledger);
        checkpoint::save_checkpoint(&ckpt, &dir)?;

        if let Some(wal) = self.wal.lock().unwrap().as_mut() {
            let _ = wal.truncate_after_checkpoint(ckpt.checkpoint_ns);
        }
        let keep = self.config.read().unwrap().execution.checkpoints_to_keep;
        let _ = crate::wal::cleanup_old_archives(&dir, &self.id, keep);
        Ok(())
    }

    pub fn pause(&self) {
        self.clock.pause();
        *self.status.lock().unwrap() = SessionStatus::Paused;
        self.append_wal(self.watermark(), "session_paused", serde_json::json!({}));
        self.fan_out(&SessionEvent::SessionPaused);
    }

    pub fn resume(&self) {
        self.clock.resume();
        *self.status.lock().unwrap() = SessionStatus::Running;
        self.append_wal(self.watermark(), "session_resumed", serde_json::json!({}));
        self.fan_out(&SessionEvent::SessionResumed);
    }

    pub fn stop(&self) {
        let _ = self.save_session_checkpoint();
        self.should_stop.store(true, Ordering::SeqCst);
        self.clock.stop();
        self.queue.stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.feeder.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.status.lock().unwrap() = SessionStatus::Stopped;
    }

    pub fn set_speed(&self, speed: f64) {
        self.config.write().unwrap().speed_factor = speed;
        self.clock.set_speed(speed);
    }

    /// Hard reset: stop, clear all state, rebuild from `ts`, and resume
    /// whatever run-state the session was in.
    pub fn jump_to(self: &Arc<Self>, ts: TimestampNs, source: Arc<dyn DataSource>) {
        let was_running = matches!(self.status(), SessionStatus::Running | SessionStatus::Paused);
        let was_paused = self.status() == SessionStatus::Paused;

        self.should_stop.store(true, Ordering::SeqCst);
        self.clock.stop();
        self.queue.stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.feeder.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.matching.lock().unwrap().reset();
        self.queue.clear();
        self.orders.lock().unwrap().clear();
        self.halted_symbols.lock().unwrap().clear();
        self.halt_end_times.lock().unwrap().clear();
        self.ssr_symbols.lock().unwrap().clear();
        self.reference_prices.lock().unwrap().clear();
        self.last_event_ns.store(0, Ordering::SeqCst);
        self.events_processed.store(0, Ordering::SeqCst);
        self.last_checkpoint_events.store(0, Ordering::SeqCst);

        let initial_capital = self.config.read().unwrap().initial_capital;
        let exec_cfg = self.config.read().unwrap().execution.clone();
        *self.ledger.lock().unwrap() = Ledger::new(initial_capital, exec_cfg);
        *self.perf.lock().unwrap() = PerformanceTracker::new(ts, initial_capital);

        self.config.write().unwrap().start_time = ts;
        self.clock.set_time(ts);

        if was_running {
            self.should_stop.store(false, Ordering::SeqCst);
            self.queue.reset();
            self.clock.start();
            if was_paused {
                self.clock.pause();
            }

            let (shared_feed, poll_interval) = {
                let cfg = self.config.read().unwrap();
                (cfg.execution.enable_shared_feed, cfg.execution.poll_interval_seconds)
            };
            if shared_feed {
                // Shared feeder thread (owned by the session manager) will
                // resume pushing events via `push_shared_event`.
            } else if poll_interval > 0 {
                let this = Arc::clone(self);
                let src = Arc::clone(&source);
                let handle = std::thread::spawn(move || this.run_polling_feeder(src));
                *self.feeder.lock().unwrap() = Some(handle);
            } else {
                self.preload_events(source.as_ref());
                // Same reasoning as `start()`: the preload above is the entire
                // window, so the queue is done accepting events the moment it
                // finishes and must be marked stopped or `wait_and_pop` blocks
                // forever once drained.
                self.queue.stop();
            }

            let this = Arc::clone(self);
            let handle = std::thread::spawn(move || this.run_loop());
            *self.worker.lock().unwrap() = Some(handle);
            *self.status.lock().unwrap() = if was_paused {
                SessionStatus::Paused
            } else {
                SessionStatus::Running
            };
        } else {
            *self.status.lock().unwrap() = SessionStatus::Created;
        }
    }

    /// Drains events up to `ts` without pacing through the clock and
    /// without emitting callbacks, then resumes the worker if it was
    /// previously running. State (ledger, positions, WAL) is retained.
    pub fn fast_forward(self: &Arc<Self>, ts: TimestampNs) {
        let was_running = self.status() == SessionStatus::Running;
        self.should_stop.store(true, Ordering::SeqCst);
        self.queue.stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut drained = VecDeque::new();
        while let Some(event) = self.queue.pop() {
            if event.timestamp_ns <= ts {
                drained.push_back(event);
            } else {
                self.queue.push(event);
                break;
            }
        }
        for event in drained {
            self.process_event(&event, false);
        }
        self.clock.set_time(ts);

        if was_running {
            self.should_stop.store(false, Ordering::SeqCst);
            self.queue.reset();
            self.clock.start();
            let this = Arc::clone(self);
            let handle = std::thread::spawn(move || this.run_loop());
            *self.worker.lock().unwrap() = Some(handle);
            *self.status.lock().unwrap() = SessionStatus::Running;
        }
    }

    /// Full order-submission pipeline: gating checks, latency stamping,
    /// matching-engine dispatch, immediate fill application.
    pub fn submit_order(&self, mut order: Order) -> SimResult<OrderId> {
        if order.id == 0 {
            order.id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        }
        let now = crate::core_types::wall_clock_now_ns();
        order.created_at_ns = now;
        order.submitted_at_ns = now;
        order.updated_at_ns = now;

        let cfg = self.config.read().unwrap().clone();
        let watermark = self.watermark();

        if cfg.execution.enable_latency {
            order.min_exec_ns = if watermark > 0 {
                watermark + (cfg.execution.fixed_latency_us * 1000) as TimestampNs
            } else {
                cfg.start_time
            };
        }

        order.expire_at = Some(match order.tif {
            TimeInForce::Opg => cfg.start_time + 5 * 60 * 1_000_000_000,
            _ => cfg.end_time,
        });

        if cfg.execution.enforce_market_hours {
            let sim_ts = if watermark > 0 { watermark } else { cfg.start_time };
            match cfg.execution.market_session(sim_ts) {
                MarketSession::Closed => return self.reject(order, RejectReason::MarketClosed),
                MarketSession::Premarket | MarketSession::Afterhours => {
                    let eligible = cfg.execution.enable_extended_hours
                        && order.order_type == OrderType::Limit
                        && order.extended_hours;
                    if !eligible {
                        return self.reject(order, RejectReason::MarketClosed);
                    }
                }
                MarketSession::Regular => {}
            }
        }

        let est_price = order.limit_price.unwrap_or_else(|| {
            self.matching
                .lock()
                .unwrap()
                .get_nbbo(&order.symbol)
                .map(|n| match order.side {
                    Side::Buy => n.ask,
                    Side::Sell => n.bid,
                })
                .unwrap_or(0.0)
        });

        if cfg.execution.max_single_order_value > 0.0 {
            let order_value = order.qty * est_price;
            if order_value > cfg.execution.max_single_order_value {
                return self.reject(order, RejectReason::OrderValueLimitExceeded);
            }
        }
        if cfg.execution.max_position_value > 0.0 {
            let current_qty = self
                .ledger
                .lock()
                .unwrap()
                .positions()
                .get(&order.symbol)
                .map(|p| p.qty)
                .unwrap_or(0.0);
            let signed_qty = match order.side {
                Side::Buy => order.qty,
                Side::Sell => -order.qty,
            };
            let projected_value = (current_qty + signed_qty) * est_price;
            if projected_value.abs() > cfg.execution.max_position_value {
                return self.reject(order, RejectReason::PositionValueLimitExceeded);
            }
        }

        match order.side {
            Side::Buy => {
                if !self.ledger.lock().unwrap().has_buying_power(order.qty * est_price, true) {
                    return self.reject(order, RejectReason::InsufficientBuyingPower);
                }
            }
            Side::Sell => {
                let long_qty = self.ledger.lock().unwrap().long_qty(&order.symbol);
                if order.qty > long_qty {
                    if !cfg.execution.allow_shorting {
                        return self.reject(order, RejectReason::ShortingDisallowed);
                    }
                    if !self.ledger.lock().unwrap().has_buying_power(order.qty * est_price, false) {
                        return self.reject(order, RejectReason::InsufficientBuyingPower);
                    }
                    if cfg.execution.enable_short_sale_restrictions
                        && self.ssr_symbols.lock().unwrap().contains(&order.symbol)
                    {
                        let nbb = self
                            .matching
                            .lock()
                            .unwrap()
                            .get_nbbo(&order.symbol)
                            .map(|n| n.bid)
                            .unwrap_or(0.0);
                        let violates = order.order_type == OrderType::Market
                            || order.limit_price.is_some_and(|p| p < nbb);
                        if violates {
                            return self.reject(order, RejectReason::ShortSaleRestricted);
                        }
                    }
                }
            }
        }

        self.prune_expired_halts(watermark);
        if self.halted_symbols.lock().unwrap().contains(&order.symbol) {
            return self.reject(order, RejectReason::SymbolHalted);
        }

        if order.order_type == OrderType::Limit {
            let marketable = self
                .matching
                .lock()
                .unwrap()
                .get_nbbo(&order.symbol)
                .map(|n| match order.side {
                    Side::Buy => n.ask > 0.0 && order.limit_price.unwrap_or(0.0) >= n.ask,
                    Side::Sell => n.bid > 0.0 && order.limit_price.unwrap_or(0.0) <= n.bid,
                })
                .unwrap_or(false);
            order.is_maker = !marketable;
        }

        order.status = OrderStatus::Accepted;
        self.orders.lock().unwrap().insert(order.id, order.clone());
        self.append_wal(
            watermark,
            "order_submitted",
            serde_json::json!({
                "id": order.id, "symbol": order.symbol, "side": matches!(order.side, Side::Buy),
                "type": order.order_type as u8, "tif": order.tif as u8,
                "qty": order.qty, "limit": order.limit_price, "stop": order.stop_price,
            }),
        );
        self.fan_out(&SessionEvent::OrderAccepted { order_id: order.id });

        let fill = self.matching.lock().unwrap().submit_order_with_latency(&mut order, watermark);

        // The matching engine already applied any immediate fill to its own
        // copy of `order` (filled_qty, status). `process_fill` is the single
        // place that applies a fill to the session's order table and ledger,
        // so undo that bookkeeping here before inserting the snapshot, or the
        // quantity would be double-counted.
        if let Some(f) = &fill {
            if !f.is_empty() {
                order.filled_qty -= f.qty;
                order.status = if order.filled_qty > 0.0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Accepted
                };
            }
        }
        self.orders.lock().unwrap().insert(order.id, order.clone());

        if let Some(fill) = fill {
            if !fill.is_empty() {
                self.process_fill(fill, true);
                order = self.orders.lock().unwrap().get(&order.id).cloned().unwrap_or(order);
            }
        }

        if matches!(order.tif, TimeInForce::Ioc | TimeInForce::Fok) && order.remaining() > 0.0 {
            order.status = OrderStatus::Canceled;
            order.canceled_at_ns = Some(now);
            self.matching.lock().unwrap().cancel_order(order.id);
            self.orders.lock().unwrap().insert(order.id, order.clone());
            self.append_wal(watermark, "order_canceled", serde_json::json!({"id": order.id}));
            self.fan_out(&SessionEvent::OrderCanceled { order_id: order.id });
        }

        Ok(order.id)
    }

    fn reject(&self, mut order: Order, reason: RejectReason) -> SimResult<OrderId> {
        order.status = OrderStatus::Rejected;
        order.rejection_reason = Some(reason.to_string());
        self.fan_out(&SessionEvent::OrderRejected {
            order_id: order.id,
            reason: reason.to_string(),
        });
        Err(SimError::Rejected(reason))
    }

    pub fn cancel_order(&self, id: OrderId) -> bool {
        let removed = self.matching.lock().unwrap().cancel_order(id);
        if removed {
            if let Some(order) = self.orders.lock().unwrap().get_mut(&id) {
                order.status = OrderStatus::Canceled;
                order.canceled_at_ns = Some(crate::core_types::wall_clock_now_ns());
            }
            self.append_wal(self.watermark(), "order_canceled", serde_json::json!({"id": id}));
            self.fan_out(&SessionEvent::OrderCanceled { order_id: id });
        }
        removed
    }

    pub fn get_orders(&self) -> Vec<Order> {
        self.orders.lock().unwrap().values().cloned().collect()
    }

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        self.orders.lock().unwrap().get(&id).cloned()
    }

    pub fn account_state(&self) -> crate::models::AccountState {
        self.ledger.lock().unwrap().state()
    }

    pub fn positions(&self) -> FxHashMap<String, crate::models::Position> {
        self.ledger.lock().unwrap().positions().clone()
    }

    pub fn performance_summary(&self) -> (f64, f64, f64) {
        let perf = self.perf.lock().unwrap();
        (perf.total_return(), perf.max_drawdown(), perf.sharpe())
    }

    pub fn apply_dividend(&self, symbol: &str, amount_per_share: f64) {
        self.ledger.lock().unwrap().apply_dividend(symbol, amount_per_share);
        self.append_wal(
            self.watermark(),
            "dividend",
            serde_json::json!({"symbol": symbol, "amount_per_share": amount_per_share}),
        );
    }

    pub fn apply_split(&self, symbol: &str, ratio: f64) {
        self.ledger.lock().unwrap().apply_split(symbol, ratio);
        self.append_wal(
            self.watermark(),
            "split",
            serde_json::json!({"symbol": symbol, "ratio": ratio}),
        );
    }

    fn append_wal(&self, ts_ns: TimestampNs, event: &str, fields: serde_json::Value) {
        if let Some(wal) = self.wal.lock().unwrap().as_mut() {
            let entry = WalEntry { ts_ns, event: event.to_string(), fields };
            if let Err(e) = wal.append(&entry) {
                tracing::warn!(session_id = %self.id, error = %e, "wal append failed");
            }
        }
    }

    fn append_wal_market_event(&self, event: &MarketEvent) {
        let (kind_str, extra) = match &event.payload {
            EventPayload::Quote(q) => (
                "QUOTE",
                serde_json::json!({"bid": q.bid, "bid_size": q.bid_size, "ask": q.ask, "ask_size": q.ask_size}),
            ),
            EventPayload::Trade(t) => ("TRADE", serde_json::json!({"price": t.price, "size": t.size})),
            _ => return,
        };
        let mut fields = serde_json::json!({"symbol": event.symbol, "type": kind_str, "seq": event.sequence});
        if let serde_json::Value::Object(map) = &extra {
            if let serde_json::Value::Object(target) = &mut fields {
                for (k, v) in map {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
        self.append_wal(event.timestamp_ns, "market_event", fields);
    }
}

fn parse_fill(entry: &WalEntry) -> Option<Fill> {
    let f = &entry.fields;
    Some(Fill {
        order_id: f.get("order_id")?.as_u64()?,
        symbol: f.get("symbol")?.as_str()?.to_string(),
        side: if f.get("side")?.as_bool()? { Side::Buy } else { Side::Sell },
        qty: f.get("qty")?.as_f64()?,
        price: f.get("price")?.as_f64()?,
        timestamp_ns: entry.ts_ns,
        is_partial: false,
    })
}

fn parse_nbbo(entry: &WalEntry, ts: TimestampNs) -> Option<Nbbo> {
    let f = &entry.fields;
    Some(Nbbo {
        bid: f.get("bid")?.as_f64()?,
        bid_size: f.get("bid_size")?.as_f64()?,
        ask: f.get("ask")?.as_f64()?,
        ask_size: f.get("ask_size")?.as_f64()?,
        timestamp_ns: ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{InMemoryDataSource, SourceEvent};
    use tempfile::tempdir;

    fn test_config(dir: PathBuf) -> SessionConfig {
        SessionConfig {
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 1_000_000_000_000,
            initial_capital: 100_000.0,
            speed_factor: 0.0,
            queue_capacity: 0,
            overflow_policy: OverflowPolicy::Block,
            execution: ExecutionConfig {
                enable_margin_call_checks: false,
                ..ExecutionConfig::default()
            },
            fees: FeeConfig::default(),
            wal_dir: dir,
        }
    }

    #[test]
    fn jump_to_resets_state() {
        let dir = tempdir().unwrap();
        let session = Arc::new(Session::new("s1".to_string(), test_config(dir.path().to_path_buf())));
        let source: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::new(vec![SourceEvent::Quote {
            symbol: "AAPL".to_string(),
            timestamp_ns: 1000,
            data: QuoteData { bid: 100.0, bid_size: 10.0, ask: 101.0, ask_size: 10.0 },
        }]));
        session.start(source.clone());
        session.stop();

        session.jump_to(5000, source);
        assert_eq!(session.watermark(), 0);
        assert_eq!(session.account_state().cash, 100_000.0);
        assert!(session.get_orders().is_empty());
        assert_eq!(session.clock.current_time(), 5000);
    }

    #[test]
    fn checkpoint_round_trips_via_session() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path().to_path_buf());
        let session = Session::new("s2".to_string(), cfg);
        let order = Order {
            id: 0,
            client_order_id: String::new(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            tif: TimeInForce::Day,
            qty: 10.0,
            filled_qty: 0.0,
            limit_price: None,
            stop_price: None,
            trail_price: None,
            trail_percent: None,
            hwm: None,
            stop_triggered: false,
            is_maker: false,
            extended_hours: false,
            min_exec_ns: 0,
            status: OrderStatus::New,
            rejection_reason: None,
            last_fill_price: 0.0,
            created_at_ns: 0,
            submitted_at_ns: 0,
            updated_at_ns: 0,
            filled_at_ns: None,
            canceled_at_ns: None,
            expired_at_ns: None,
            expire_at: None,
        };
        // No NBBO yet: order rests.
        let _ = session.submit_order(order);
        assert!(session.save_session_checkpoint().is_ok());
        let loaded = checkpoint::load_checkpoint("s2", &dir.path().to_path_buf()).unwrap();
        assert_eq!(loaded.orders.len(), 1);
    }

    fn market_order(symbol: &str, side: Side, qty: f64) -> Order {
        Order {
            id: 0,
            client_order_id: String::new(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            tif: TimeInForce::Day,
            qty,
            filled_qty: 0.0,
            limit_price: None,
            stop_price: None,
            trail_price: None,
            trail_percent: None,
            hwm: None,
            stop_triggered: false,
            is_maker: false,
            extended_hours: false,
            min_exec_ns: 0,
            status: OrderStatus::New,
            rejection_reason: None,
            last_fill_price: 0.0,
            created_at_ns: 0,
            submitted_at_ns: 0,
            updated_at_ns: 0,
            filled_at_ns: None,
            canceled_at_ns: None,
            expired_at_ns: None,
            expire_at: None,
        }
    }

    #[test]
    fn checkpoint_persists_nbbo_cache() {
        let dir = tempdir().unwrap();
        let session = Session::new("s3".to_string(), test_config(dir.path().to_path_buf()));
        session.matching.lock().unwrap().update_nbbo(
            Nbbo { bid: 99.0, bid_size: 10.0, ask: 100.0, ask_size: 10.0, timestamp_ns: 1 },
            "AAPL",
        );
        assert!(session.save_session_checkpoint().is_ok());
        let loaded = checkpoint::load_checkpoint("s3", &dir.path().to_path_buf()).unwrap();
        assert_eq!(loaded.nbbo_cache.len(), 1);
        assert_eq!(loaded.nbbo_cache[0].0, "AAPL");
    }

    #[test]
    fn halt_auto_expires_after_configured_duration() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path().to_path_buf());
        cfg.execution.luld_halt_duration_sec = 60;
        let session = Session::new("s4".to_string(), cfg);

        session.process_event(
            &MarketEvent {
                timestamp_ns: 0,
                sequence: 0,
                kind: EventKind::Halt,
                symbol: "AAPL".to_string(),
                payload: EventPayload::Halt,
            },
            false,
        );
        let rejected = session.submit_order(market_order("AAPL", Side::Buy, 1.0));
        assert!(matches!(rejected, Err(SimError::Rejected(RejectReason::SymbolHalted))));

        // A later tick past the halt window should auto-lift it.
        session.process_event(
            &MarketEvent {
                timestamp_ns: 61_000_000_000,
                sequence: 1,
                kind: EventKind::Quote,
                symbol: "AAPL".to_string(),
                payload: EventPayload::Quote(QuoteData { bid: 99.0, bid_size: 10.0, ask: 100.0, ask_size: 10.0 }),
            },
            false,
        );
        let accepted = session.submit_order(market_order("AAPL", Side::Buy, 1.0));
        assert!(accepted.is_ok());
    }

    #[test]
    fn market_closed_rejects_order() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path().to_path_buf());
        cfg.execution.enforce_market_hours = true;
        cfg.start_time = 7 * 3600 * 1_000_000_000; // 02:00 ET, before premarket opens.
        let session = Session::new("s5".to_string(), cfg);
        let rejected = session.submit_order(market_order("AAPL", Side::Buy, 1.0));
        assert!(matches!(rejected, Err(SimError::Rejected(RejectReason::MarketClosed))));
    }

    #[test]
    fn max_single_order_value_rejects_oversized_order() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path().to_path_buf());
        cfg.execution.max_single_order_value = 500.0;
        let session = Session::new("s6".to_string(), cfg);
        session.matching.lock().unwrap().update_nbbo(
            Nbbo { bid: 99.0, bid_size: 10.0, ask: 100.0, ask_size: 10.0, timestamp_ns: 1 },
            "AAPL",
        );
        let rejected = session.submit_order(market_order("AAPL", Side::Buy, 10.0));
        assert!(matches!(rejected, Err(SimError::Rejected(RejectReason::OrderValueLimitExceeded))));
    }
}
