//! Core types used throughout the simulator.
//!
//! These are fundamental type aliases, shared by every module. Keeping
//! them in one place means a precision change (e.g. nanoseconds to
//! microseconds) is a one-line edit.

/// Nanoseconds since a fixed epoch. All event-plane time is simulated;
/// only `wall_clock_now_ns` below reads the real clock.
pub type TimestampNs = i64;

/// Monotonic per-queue sequence number used to break timestamp ties.
pub type SeqNum = u64;

/// Opaque session identifier, hex-encoded UUID v4 unless supplied by the caller.
pub type SessionId = String;

/// Order identifier, unique within a session.
pub type OrderId = u64;

/// Returns the current wall-clock time in nanoseconds since the Unix epoch.
///
/// Used only for created-at bookkeeping and WAL/checkpoint stamps, never
/// for event ordering, which runs entirely on simulated time.
pub fn wall_clock_now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
