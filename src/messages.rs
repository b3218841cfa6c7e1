//! Event-plane payloads: what flows through the event queue, the WAL,
//! and the callback fan-out.

use serde::{Deserialize, Serialize};

use crate::core_types::{OrderId, SeqNum, TimestampNs};
use crate::models::{Fill, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Trade,
    Quote,
    Bar,
    OrderNew,
    OrderFill,
    OrderCancel,
    OrderExpire,
    Dividend,
    Split,
    Halt,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeData {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteData {
    pub bid: f64,
    pub bid_size: f64,
    pub ask: f64,
    pub ask_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarData {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DividendData {
    pub amount_per_share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitData {
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Trade(TradeData),
    Quote(QuoteData),
    Bar(BarData),
    Dividend(DividendData),
    Split(SplitData),
    Halt,
    Resume,
    None,
}

/// One entry in the chronological event stream. Ordering key is
/// `(timestamp_ns, sequence)`, assigned by the event queue at push time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub timestamp_ns: TimestampNs,
    pub sequence: SeqNum,
    pub kind: EventKind,
    pub symbol: String,
    pub payload: EventPayload,
}

/// Fan-out notification delivered to callback subscribers and appended
/// to the WAL. Distinct from `MarketEvent`: this describes effects
/// (fills, rejects, lifecycle) rather than raw market data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    OrderAccepted {
        order_id: OrderId,
    },
    OrderRejected {
        order_id: OrderId,
        reason: String,
    },
    OrderFilled {
        order_id: OrderId,
        fill: Fill,
        is_partial: bool,
    },
    OrderCanceled {
        order_id: OrderId,
    },
    OrderExpired {
        order_id: OrderId,
    },
    MarketData(MarketEvent),
    SessionPaused,
    SessionResumed,
    SessionCompleted,
    MarginCall {
        equity: f64,
        maintenance_margin: f64,
    },
    CorporateAction {
        symbol: String,
        kind: CorporateActionKind,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CorporateActionKind {
    Dividend { amount_per_share: f64 },
    Split { ratio: f64 },
}

/// Direction-tagged summary used when building WAL order entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub side: Side,
    pub qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}
