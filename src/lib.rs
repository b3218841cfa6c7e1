//! market_replay_sim - Deterministic Multi-Tenant Market Replay Simulator
//!
//! Replays historical equity trades and quotes through an NBBO-gated
//! matching engine, a per-account ledger with Reg-T/PDT margin rules,
//! and a durable WAL/checkpoint layer, each session paced by its own
//! simulated clock.
//!
//! # Modules
//!
//! - [`core_types`] - Shared type aliases (timestamps, ids)
//! - [`error`] - Error and rejection-reason types
//! - [`config`] - Execution, fee, defaults and logging configuration
//! - [`logging`] - `tracing` subscriber setup
//! - [`models`] - Order, Fill, Position, NBBO and account types
//! - [`messages`] - Event-plane payloads and session notifications
//! - [`event_queue`] - Bounded chronological priority queue
//! - [`clock`] - Simulated, speed-controlled clock
//! - [`matching`] - NBBO-gated order matching engine
//! - [`ledger`] - Per-account cash/margin/position ledger
//! - [`perf`] - Equity-curve performance tracking
//! - [`wal`] - Append-only write-ahead log
//! - [`checkpoint`] - Atomic checkpoint store and recovery
//! - [`data_source`] - Historical market-data feed contract
//! - [`session`] - A single tenant's full lifecycle
//! - [`session_manager`] - Owns every session in the process

// Core types - must be first!
pub mod core_types;

pub mod error;

// Configuration and ambient stack
pub mod config;
pub mod logging;

// Domain model and event plane
pub mod messages;
pub mod models;

// Simulation primitives
pub mod checkpoint;
pub mod clock;
pub mod data_source;
pub mod event_queue;
pub mod ledger;
pub mod matching;
pub mod perf;
pub mod wal;

// Session orchestration
pub mod session;
pub mod session_manager;

// Convenient re-exports at crate root
pub use config::{DefaultsConfig, ExecutionConfig, FeeConfig, LoggingConfig, MarketSession, SimulatorConfig};
pub use core_types::{OrderId, SeqNum, SessionId, TimestampNs};
pub use data_source::{DataSource, InMemoryDataSource};
pub use error::{RejectReason, SimError, SimResult};
pub use matching::MatchingEngine;
pub use messages::{EventKind, MarketEvent, SessionEvent};
pub use models::{AccountState, Fill, Nbbo, Order, OrderStatus, OrderType, Side, TimeInForce};
pub use session::{Session, SessionConfig, SessionStatus};
pub use session_manager::{NewSessionRequest, SessionManager};
