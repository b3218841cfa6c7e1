//! NBBO-gated matching engine.
//!
//! Unlike a continuous double-auction book, this engine never crosses
//! two resting orders against each other: every fill is against the
//! current NBBO of the historical tape. An order either matches
//! immediately against the quote or, if its time-in-force allows, rests
//! in `pending` until a later NBBO tick (or a cancel) resolves it.

use rand::Rng;
use rustc_hash::FxHashMap;

use crate::config::{ExecutionConfig, MarketSession};
use crate::core_types::OrderId;
use crate::models::{Fill, Nbbo, Order, OrderStatus, OrderType, Side, TimeInForce};

#[derive(Debug, Default)]
pub struct MatchResult {
    pub fills: Vec<Fill>,
    pub expired: Vec<OrderId>,
}

pub struct MatchingEngine {
    config: ExecutionConfig,
    nbbo: FxHashMap<String, Nbbo>,
    pending: FxHashMap<OrderId, Order>,
}

impl MatchingEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            nbbo: FxHashMap::default(),
            pending: FxHashMap::default(),
        }
    }

    pub fn set_config(&mut self, config: ExecutionConfig) {
        self.config = config;
    }

    pub fn reset(&mut self) {
        self.nbbo.clear();
        self.pending.clear();
    }

    pub fn get_nbbo(&self, symbol: &str) -> Option<Nbbo> {
        self.nbbo.get(symbol).copied()
    }

    /// Dumps the full NBBO cache for checkpointing.
    pub fn all_nbbo(&self) -> Vec<(String, Nbbo)> {
        self.nbbo.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn get_pending_orders(&self) -> Vec<Order> {
        self.pending.values().cloned().collect()
    }

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        self.pending.get(&id).cloned()
    }

    pub fn cancel_order(&mut self, id: OrderId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Submits a new order. Returns a fill (possibly zero-qty, meaning
    /// "no immediate match") unless the order is rejected outright.
    pub fn submit_order(&mut self, order: &mut Order) -> Option<Fill> {
        if self.should_reject_order() {
            order.status = OrderStatus::Rejected;
            order.rejection_reason = Some("randomly rejected".to_string());
            return None;
        }

        let nbbo = self.nbbo.get(&order.symbol).copied();
        match nbbo {
            Some(nbbo) => self.try_fill(order, &nbbo),
            None => {
                // No quote yet for this symbol: rest if TIF allows.
                if order.tif.allows_enqueue() {
                    self.pending.insert(order.id, order.clone());
                }
                None
            }
        }
    }

    pub fn submit_order_with_latency(&mut self, order: &mut Order, now_ns: i64) -> Option<Fill> {
        let extra = if self.config.enable_latency {
            let jitter = if self.config.random_latency_max_us > 0 {
                rand::thread_rng().gen_range(0..=self.config.random_latency_max_us)
            } else {
                0
            };
            ((self.config.fixed_latency_us + jitter) * 1000) as i64
        } else {
            0
        };
        order.min_exec_ns = now_ns + extra;
        self.submit_order(order)
    }

    /// Applies a fresh NBBO tick: updates the cache, expires any pending
    /// orders whose TIF window has passed, then re-scans every resting
    /// order for that symbol.
    pub fn update_nbbo(&mut self, nbbo: Nbbo, symbol: &str) -> MatchResult {
        self.nbbo.insert(symbol.to_string(), nbbo);

        let mut result = MatchResult::default();

        let expired_ids: Vec<OrderId> = self
            .pending
            .values()
            .filter(|o| o.symbol == symbol)
            .filter(|o| o.expire_at.is_some_and(|e| e < nbbo.timestamp_ns))
            .map(|o| o.id)
            .collect();
        for id in &expired_ids {
            self.pending.remove(id);
        }
        result.expired = expired_ids;

        let ids: Vec<OrderId> = self
            .pending
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let Some(mut order) = self.pending.remove(&id) else {
                continue;
            };
            match self.try_fill(&mut order, &nbbo) {
                Some(fill) if !fill.is_empty() => {
                    result.fills.push(fill);
                    if order.remaining() > 0.0 {
                        self.pending.insert(order.id, order);
                    }
                }
                _ => {
                    if !order.is_terminal() {
                        self.pending.insert(order.id, order);
                    }
                }
            }
        }

        result
    }

    fn should_reject_order(&self) -> bool {
        self.config.rejection_probability > 0.0
            && rand::thread_rng().gen::<f64>() < self.config.rejection_probability
    }

    fn should_fill(&self) -> bool {
        self.config.partial_fill_probability <= 0.0
            || rand::thread_rng().gen::<f64>() >= self.config.partial_fill_probability
    }

    /// The core five-step dispatch: latency gate, crossed-market gate,
    /// fill-probability gate, type dispatch, fallback-to-enqueue.
    fn try_fill(&mut self, order: &mut Order, nbbo: &Nbbo) -> Option<Fill> {
        if order.min_exec_ns > 0 && nbbo.timestamp_ns < order.min_exec_ns {
            return self.enqueue_or_none(order);
        }

        if nbbo.is_crossed() {
            return self.enqueue_or_none(order);
        }

        if !self.should_fill() {
            return self.enqueue_or_none(order);
        }

        match order.order_type {
            OrderType::Market => Some(self.execute_market(order, nbbo)),
            OrderType::Limit => {
                if self.is_marketable_limit(order, nbbo) {
                    Some(self.execute_limit(order, nbbo))
                } else {
                    self.enqueue_or_none(order)
                }
            }
            OrderType::Stop => {
                if order.stop_triggered || self.is_stop_triggered(order, nbbo) {
                    order.stop_triggered = true;
                    Some(self.execute_market(order, nbbo))
                } else {
                    self.enqueue_or_none(order)
                }
            }
            OrderType::StopLimit => {
                if order.stop_triggered || self.is_stop_triggered(order, nbbo) {
                    order.stop_triggered = true;
                    if self.is_marketable_limit(order, nbbo) {
                        Some(self.execute_limit(order, nbbo))
                    } else {
                        self.enqueue_or_none(order)
                    }
                } else {
                    self.enqueue_or_none(order)
                }
            }
            OrderType::TrailingStop => {
                self.update_trailing_stop_hwm(order, nbbo);
                if order.stop_triggered || self.is_trailing_stop_triggered(order, nbbo) {
                    order.stop_triggered = true;
                    Some(self.execute_market(order, nbbo))
                } else {
                    self.enqueue_or_none(order)
                }
            }
        }
    }

    fn enqueue_or_none(&mut self, order: &mut Order) -> Option<Fill> {
        if order.tif.allows_enqueue() {
            order.status = OrderStatus::Accepted;
            self.pending.insert(order.id, order.clone());
        }
        None
    }

    /// Both multipliers key off the NBBO tick's own timestamp, not the
    /// order's `extended_hours` flag: a resting DAY order submitted during
    /// regular hours still fills at extended-hours liquidity/slippage if
    /// the tick that finally matches it arrives premarket or afterhours.
    fn liquidity_multiplier(&self, nbbo: &Nbbo) -> f64 {
        if !self.config.enforce_market_hours {
            return 1.0;
        }
        match self.config.market_session(nbbo.timestamp_ns) {
            MarketSession::Premarket | MarketSession::Afterhours => {
                self.config.extended_hours_liquidity_pct / 100.0
            }
            _ => 1.0,
        }
    }

    fn slippage_multiplier(&self, nbbo: &Nbbo) -> f64 {
        if !self.config.enforce_market_hours {
            return 1.0;
        }
        match self.config.market_session(nbbo.timestamp_ns) {
            MarketSession::Premarket | MarketSession::Afterhours => self.config.extended_hours_slippage_mult,
            _ => 1.0,
        }
    }

    fn sampled_slippage(&self, nbbo: &Nbbo) -> f64 {
        if !self.config.enable_slippage {
            return 0.0;
        }
        let random_component = if self.config.random_slippage_max_bps > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.random_slippage_max_bps)
        } else {
            0.0
        };
        (self.config.fixed_slippage_bps + random_component) / 10_000.0 * self.slippage_multiplier(nbbo)
    }

    fn execute_market(&mut self, order: &mut Order, nbbo: &Nbbo) -> Fill {
        let (base, avail) = match order.side {
            Side::Buy => (nbbo.ask, nbbo.ask_size),
            Side::Sell => (nbbo.bid, nbbo.bid_size),
        };
        if base <= 0.0 {
            return self.zero_fill(order, nbbo.timestamp_ns);
        }

        let avail = avail * self.liquidity_multiplier(nbbo);
        let remaining = order.remaining();
        let fill_qty = if self.config.enable_partial_fills {
            remaining.min(avail)
        } else {
            remaining
        };

        if order.tif == TimeInForce::Fok && self.config.enable_partial_fills && avail < remaining {
            return self.zero_fill(order, nbbo.timestamp_ns);
        }
        if fill_qty <= 0.0 {
            return self.enqueue_then_zero(order, nbbo.timestamp_ns);
        }

        let slip = self.sampled_slippage(nbbo);
        let price = match order.side {
            Side::Buy => base * (1.0 + slip),
            Side::Sell => base * (1.0 - slip),
        };

        self.apply_fill(order, fill_qty, price, nbbo.timestamp_ns)
    }

    fn execute_limit(&mut self, order: &mut Order, nbbo: &Nbbo) -> Fill {
        let limit = order.limit_price.unwrap_or(0.0);
        let (base, avail) = match order.side {
            Side::Buy => (nbbo.ask.min(limit), nbbo.ask_size),
            Side::Sell => (nbbo.bid.max(limit), nbbo.bid_size),
        };

        let avail = avail * self.liquidity_multiplier(nbbo);
        let remaining = order.remaining();
        let fill_qty = if self.config.enable_partial_fills {
            remaining.min(avail)
        } else {
            remaining
        };

        if order.tif == TimeInForce::Fok && self.config.enable_partial_fills && avail < remaining {
            return self.zero_fill(order, nbbo.timestamp_ns);
        }
        if fill_qty <= 0.0 {
            return self.enqueue_then_zero(order, nbbo.timestamp_ns);
        }

        // `is_maker` is decided by the caller at submission time (did this
        // order cross the spread immediately, or rest first) and is not
        // re-stamped here: a resting limit order that later fills on a
        // favorable NBBO move is still the maker that provided liquidity.
        self.apply_fill(order, fill_qty, base, nbbo.timestamp_ns)
    }

    fn apply_fill(&mut self, order: &mut Order, qty: f64, price: f64, ts: i64) -> Fill {
        order.filled_qty += qty;
        order.last_fill_price = price;
        order.updated_at_ns = ts;
        let is_partial = order.remaining() > 0.0;
        order.status = if is_partial {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        if is_partial && order.tif.allows_enqueue() {
            self.pending.insert(order.id, order.clone());
        } else {
            self.pending.remove(&order.id);
        }
        Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty,
            price,
            timestamp_ns: ts,
            is_partial,
        }
    }

    fn enqueue_then_zero(&mut self, order: &mut Order, ts: i64) -> Fill {
        if order.tif.allows_enqueue() {
            self.pending.insert(order.id, order.clone());
        }
        self.zero_fill(order, ts)
    }

    fn zero_fill(&self, order: &Order, ts: i64) -> Fill {
        Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: 0.0,
            price: 0.0,
            timestamp_ns: ts,
            is_partial: false,
        }
    }

    fn is_marketable_limit(&self, order: &Order, nbbo: &Nbbo) -> bool {
        let limit = order.limit_price.unwrap_or(0.0);
        match order.side {
            Side::Buy => nbbo.ask > 0.0 && limit >= nbbo.ask,
            Side::Sell => nbbo.bid > 0.0 && limit <= nbbo.bid,
        }
    }

    fn is_stop_triggered(&self, order: &Order, nbbo: &Nbbo) -> bool {
        let stop = order.stop_price.unwrap_or(0.0);
        match order.side {
            Side::Buy => nbbo.ask > 0.0 && nbbo.ask >= stop,
            Side::Sell => nbbo.bid > 0.0 && nbbo.bid <= stop,
        }
    }

    /// Seeds the high-water mark on the first NBBO tick observed after
    /// submission only; never re-seeds it on subsequent ticks.
    fn update_trailing_stop_hwm(&self, order: &mut Order, nbbo: &Nbbo) {
        let mid = nbbo.mid();
        match order.hwm {
            None => order.hwm = Some(mid),
            Some(hwm) => {
                order.hwm = Some(match order.side {
                    Side::Sell => hwm.max(mid),
                    Side::Buy => hwm.min(mid),
                });
            }
        }
    }

    fn is_trailing_stop_triggered(&self, order: &Order, nbbo: &Nbbo) -> bool {
        let Some(hwm) = order.hwm else { return false };
        let mid = nbbo.mid();
        match order.side {
            Side::Sell => {
                let abs_trigger = order.trail_price.is_some_and(|t| mid <= hwm - t);
                let pct_trigger = order
                    .trail_percent
                    .is_some_and(|p| mid <= hwm * (1.0 - p / 100.0));
                abs_trigger || pct_trigger
            }
            Side::Buy => {
                let abs_trigger = order.trail_price.is_some_and(|t| mid >= hwm + t);
                let pct_trigger = order
                    .trail_percent
                    .is_some_and(|p| mid >= hwm * (1.0 + p / 100.0));
                abs_trigger || pct_trigger
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_order(id: OrderId, side: Side, order_type: OrderType, tif: TimeInForce, qty: f64) -> Order {
        Order {
            id,
            client_order_id: format!("c{id}"),
            symbol: "AAPL".to_string(),
            side,
            order_type,
            tif,
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

    fn nbbo(bid: f64, bid_size: f64, ask: f64, ask_size: f64, ts: i64) -> Nbbo {
        Nbbo { bid, bid_size, ask, ask_size, timestamp_ns: ts }
    }

    fn calm_config() -> ExecutionConfig {
        let mut cfg = ExecutionConfig::default();
        cfg.enable_slippage = false;
        cfg.rejection_probability = 0.0;
        cfg.partial_fill_probability = 0.0;
        cfg.enable_partial_fills = true;
        cfg
    }

    #[test]
    fn market_buy_fills_at_ask() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 100.0, 1_000_000), "AAPL");
        let mut order = base_order(1, Side::Buy, OrderType::Market, TimeInForce::Day, 10.0);
        let fill = engine.submit_order(&mut order).unwrap();
        assert_eq!(fill.qty, 10.0);
        assert_eq!(fill.price, 101.0);
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn ioc_non_marketable_limit_is_rejected_from_book() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 100.0, 1), "AAPL");
        let mut order = base_order(2, Side::Buy, OrderType::Limit, TimeInForce::Ioc, 10.0);
        order.limit_price = Some(99.0);
        let fill = engine.submit_order(&mut order);
        assert!(fill.is_none());
        assert!(engine.get_pending_orders().is_empty());
    }

    #[test]
    fn stop_latches_and_fires_once() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 100.0, 1), "AAPL");
        let mut order = base_order(3, Side::Sell, OrderType::Stop, TimeInForce::Gtc, 5.0);
        order.stop_price = Some(95.0);
        assert!(engine.submit_order(&mut order).is_none());
        assert!(engine.get_pending_orders().iter().any(|o| o.id == 3));

        let result = engine.update_nbbo(nbbo(94.0, 50.0, 95.0, 50.0, 2), "AAPL");
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].qty, 5.0);
        assert_eq!(result.fills[0].price, 94.0);

        let result2 = engine.update_nbbo(nbbo(93.0, 50.0, 94.0, 50.0, 3), "AAPL");
        assert!(result2.fills.is_empty());
    }

    #[test]
    fn trailing_stop_sell_fires_on_drop() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 100.0, 1), "AAPL");
        let mut order = base_order(4, Side::Sell, OrderType::TrailingStop, TimeInForce::Gtc, 5.0);
        order.trail_price = Some(2.0);
        assert!(engine.submit_order(&mut order).is_none());

        let result = engine.update_nbbo(nbbo(95.0, 50.0, 96.0, 50.0, 2), "AAPL");
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].qty, 5.0);
        assert_eq!(result.fills[0].price, 95.0);
    }

    #[test]
    fn fok_with_insufficient_size_cancels_without_partial() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 5.0, 1), "AAPL");
        let mut order = base_order(5, Side::Buy, OrderType::Market, TimeInForce::Fok, 10.0);
        let fill = engine.submit_order(&mut order).unwrap();
        assert_eq!(fill.qty, 0.0);
        assert!(engine.get_pending_orders().is_empty());
    }

    #[test]
    fn crossed_market_suppresses_match() {
        let mut engine = MatchingEngine::new(calm_config());
        engine.update_nbbo(nbbo(102.0, 100.0, 101.0, 100.0, 1), "AAPL");
        let mut order = base_order(6, Side::Buy, OrderType::Market, TimeInForce::Gtc, 10.0);
        assert!(engine.submit_order(&mut order).is_none());
        assert!(engine.get_pending_orders().iter().any(|o| o.id == 6));
    }

    #[test]
    fn expired_order_is_removed_on_tick() {
        let mut engine = MatchingEngine::new(calm_config());
        let mut order = base_order(7, Side::Buy, OrderType::Limit, TimeInForce::Day, 10.0);
        order.limit_price = Some(50.0);
        order.expire_at = Some(100);
        engine.submit_order(&mut order);
        assert!(engine.get_pending_orders().iter().any(|o| o.id == 7));
        let result = engine.update_nbbo(nbbo(100.0, 100.0, 101.0, 100.0, 200), "AAPL");
        assert_eq!(result.expired, vec![7]);
        assert!(engine.get_order(7).is_none());
    }
}
