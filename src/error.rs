//! Error types shared by every subsystem.
//!
//! The simulator never panics on bad input or a misbehaving data feed;
//! failures are represented as [`SimError`] and propagated with `?`. The
//! only panics left in non-test code are for invariants that a caller
//! cannot violate without a programming error (e.g. upserting an order
//! with an empty id).

use thiserror::Error;

/// Why an order submission or a mutating call was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidInput(String),
    InsufficientBuyingPower,
    ShortingDisallowed,
    SymbolHalted,
    MarketClosed,
    ShortSaleRestricted,
    RandomRejection,
    OrderValueLimitExceeded,
    PositionValueLimitExceeded,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidInput(s) => write!(f, "invalid input: {s}"),
            RejectReason::InsufficientBuyingPower => write!(f, "insufficient buying power"),
            RejectReason::ShortingDisallowed => write!(f, "shorting disallowed"),
            RejectReason::SymbolHalted => write!(f, "symbol halted"),
            RejectReason::MarketClosed => write!(f, "market closed"),
            RejectReason::ShortSaleRestricted => write!(f, "short sale restricted (Rule 201)"),
            RejectReason::RandomRejection => write!(f, "randomly rejected"),
            RejectReason::OrderValueLimitExceeded => write!(f, "order value exceeds max_single_order_value"),
            RejectReason::PositionValueLimitExceeded => write!(f, "resulting position value exceeds max_position_value"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("order rejected: {0}")]
    Rejected(RejectReason),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is not running")]
    SessionNotRunning(String),

    #[error("order not found: {0}")]
    OrderNotFound(OrderIdDisplay),

    #[error("wal io error: {0}")]
    WalIo(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

/// Thin wrapper so `OrderId` (a bare u64) gets a readable Display in errors
/// without forcing every call site to format it manually.
#[derive(Debug)]
pub struct OrderIdDisplay(pub u64);

impl std::fmt::Display for OrderIdDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type SimResult<T> = Result<T, SimError>;
