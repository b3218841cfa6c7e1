//! Order, fill, position and NBBO types shared by the matching engine,
//! the ledger and the session layer.

use serde::{Deserialize, Serialize};

use crate::core_types::{OrderId, TimestampNs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
    Opg,
    Cls,
}

impl TimeInForce {
    /// IOC and FOK never rest on the book; everything else may.
    pub fn allows_enqueue(self) -> bool {
        !matches!(self, TimeInForce::Ioc | TimeInForce::Fok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

/// A resting or completed order. Invariant: `filled_qty <= qty` always,
/// and once `stop_triggered` is set it is never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub qty: f64,
    pub filled_qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trail_price: Option<f64>,
    pub trail_percent: Option<f64>,
    /// High-water mark tracked for trailing stops; seeded from the first
    /// NBBO tick observed after submission, never before.
    pub hwm: Option<f64>,
    pub stop_triggered: bool,
    pub is_maker: bool,
    pub extended_hours: bool,
    /// Earliest simulated time at which this order may execute, used to
    /// model order-to-market latency. Zero means no gate.
    pub min_exec_ns: TimestampNs,
    pub status: OrderStatus,
    pub rejection_reason: Option<String>,
    pub last_fill_price: f64,
    pub created_at_ns: i64,
    pub submitted_at_ns: i64,
    pub updated_at_ns: i64,
    pub filled_at_ns: Option<i64>,
    pub canceled_at_ns: Option<i64>,
    pub expired_at_ns: Option<i64>,
    pub expire_at: Option<TimestampNs>,
}

impl Order {
    pub fn remaining(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

/// A single execution against an order. A zero-qty fill is a "no match"
/// signal and must never be applied to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub timestamp_ns: TimestampNs,
    pub is_partial: bool,
}

impl Fill {
    pub fn is_empty(&self) -> bool {
        self.qty <= 0.0
    }
}

/// Top-of-book snapshot for one symbol. A crossed market (`bid >= ask`,
/// both sides positive) suppresses matching for that tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Nbbo {
    pub bid: f64,
    pub bid_size: f64,
    pub ask: f64,
    pub ask_size: f64,
    pub timestamp_ns: TimestampNs,
}

impl Nbbo {
    pub fn is_crossed(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.bid >= self.ask
    }

    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else if self.bid > 0.0 {
            self.bid
        } else {
            self.ask
        }
    }
}

/// A single symbol position. Invariant: `cost_basis == qty * avg_entry_price`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub qty: f64,
    pub avg_entry_price: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized_pl: f64,
}

impl Position {
    pub fn mark(&mut self, last_price: f64) {
        self.market_value = self.qty * last_price;
        self.unrealized_pl = self.market_value - self.cost_basis;
    }
}

/// Cash/margin state, recomputed in full after every mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountState {
    pub cash: f64,
    pub equity: f64,
    pub long_mv: f64,
    pub short_mv: f64,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub regt_buying_power: f64,
    pub daytrading_buying_power: f64,
    pub buying_power: f64,
    pub accrued_fees: f64,
    pub pattern_day_trader: bool,
}

impl AccountState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            equity: initial_capital,
            long_mv: 0.0,
            short_mv: 0.0,
            initial_margin: 0.0,
            maintenance_margin: 0.0,
            regt_buying_power: initial_capital * 2.0,
            daytrading_buying_power: 0.0,
            buying_power: initial_capital * 2.0,
            accrued_fees: 0.0,
            pattern_day_trader: false,
        }
    }
}
