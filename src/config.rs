//! Simulator configuration: execution model, fee schedule, session
//! defaults and logging, loaded from a single YAML file with
//! field-level defaults.
//!
//! # Decimal Precision Design
//!
//! | Field | Source | Purpose |
//! |-------|--------|---------|
//! | prices / quantities | `f64` | matches the historical tape's own precision; not a ledger of record |
//! | fee rates | `f64`, per-share/per-order | mirrors the original broker-simulator fee schedule |

use chrono::{Datelike, FixedOffset, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::core_types::TimestampNs;

/// Which part of the trading day a timestamp falls in, per
/// [`ExecutionConfig::market_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketSession {
    Closed,
    Premarket,
    Regular,
    Afterhours,
}

/// Stochastic and structural knobs for order execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub enable_latency: bool,
    pub fixed_latency_us: u64,
    pub random_latency_max_us: u64,

    pub enable_slippage: bool,
    pub fixed_slippage_bps: f64,
    pub random_slippage_max_bps: f64,

    pub enable_market_impact: bool,
    pub market_impact_bps: f64,

    pub enable_partial_fills: bool,
    pub partial_fill_probability: f64,
    pub rejection_probability: f64,

    pub allow_shorting: bool,

    pub enable_margin_call_checks: bool,
    pub enable_forced_liquidation: bool,
    pub maintenance_margin_pct: f64,
    pub pdt_equity_threshold: f64,

    pub enable_shared_feed: bool,
    pub poll_interval_seconds: u64,

    pub checkpoint_interval_events: u64,
    pub enable_wal: bool,
    pub wal_directory: String,
    pub wal_max_bytes: u64,
    pub checkpoints_to_keep: usize,

    pub enforce_market_hours: bool,
    pub enable_extended_hours: bool,
    pub premarket_start_minutes: u32,
    pub regular_start_minutes: u32,
    pub regular_end_minutes: u32,
    pub afterhours_end_minutes: u32,
    pub market_holidays: Vec<String>,
    pub extended_hours_slippage_mult: f64,
    pub extended_hours_liquidity_pct: f64,

    pub enable_short_sale_restrictions: bool,
    pub ssr_threshold_pct: f64,

    pub enable_circuit_breakers: bool,
    pub luld_tier1_pct: f64,
    pub luld_tier2_pct: f64,
    pub luld_halt_duration_sec: u64,

    pub enable_auto_corporate_actions: bool,

    /// Position-limit knobs carried over from the original broker
    /// simulator's config surface; enforced as a hard reject in
    /// `Session::submit_order` when non-zero (0 disables the check).
    pub max_position_value: f64,
    pub max_single_order_value: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enable_latency: false,
            fixed_latency_us: 0,
            random_latency_max_us: 0,

            enable_slippage: false,
            fixed_slippage_bps: 0.0,
            random_slippage_max_bps: 0.0,

            enable_market_impact: false,
            market_impact_bps: 0.0,

            enable_partial_fills: true,
            partial_fill_probability: 0.0,
            rejection_probability: 0.0,

            allow_shorting: true,

            enable_margin_call_checks: true,
            enable_forced_liquidation: true,
            maintenance_margin_pct: 0.25,
            pdt_equity_threshold: 25_000.0,

            enable_shared_feed: false,
            poll_interval_seconds: 0,

            checkpoint_interval_events: 1000,
            enable_wal: true,
            wal_directory: "logs".to_string(),
            wal_max_bytes: 50 * 1024 * 1024,
            checkpoints_to_keep: 3,

            enforce_market_hours: false,
            enable_extended_hours: false,
            premarket_start_minutes: 4 * 60,
            regular_start_minutes: 9 * 60 + 30,
            regular_end_minutes: 16 * 60,
            afterhours_end_minutes: 20 * 60,
            market_holidays: Vec::new(),
            extended_hours_slippage_mult: 2.0,
            extended_hours_liquidity_pct: 20.0,

            enable_short_sale_restrictions: false,
            ssr_threshold_pct: 10.0,

            enable_circuit_breakers: false,
            luld_tier1_pct: 5.0,
            luld_tier2_pct: 10.0,
            luld_halt_duration_sec: 300,

            enable_auto_corporate_actions: true,

            max_position_value: 0.0,
            max_single_order_value: 0.0,
        }
    }
}

impl ExecutionConfig {
    /// Classifies `ts_ns` against a fixed ET offset (UTC-5, no DST) and
    /// this config's minute-of-day boundaries, weekend, and
    /// `market_holidays` (`MM-DD`) list. Callers that don't care about
    /// market hours should check `enforce_market_hours` themselves before
    /// branching on the result.
    pub fn market_session(&self, ts_ns: TimestampNs) -> MarketSession {
        let secs = ts_ns.div_euclid(1_000_000_000);
        let nanos = ts_ns.rem_euclid(1_000_000_000) as u32;
        let Some(utc) = chrono::DateTime::from_timestamp(secs, nanos) else {
            return MarketSession::Closed;
        };
        let et_offset = FixedOffset::west_opt(5 * 3600).expect("5h is a valid fixed offset");
        let et = et_offset.from_utc_datetime(&utc.naive_utc());

        use chrono::Weekday;
        if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::Closed;
        }
        let mmdd = format!("{:02}-{:02}", et.month(), et.day());
        if self.market_holidays.iter().any(|h| h == &mmdd) {
            return MarketSession::Closed;
        }

        let minute_of_day = et.hour() * 60 + et.minute();
        if minute_of_day < self.premarket_start_minutes {
            MarketSession::Closed
        } else if minute_of_day < self.regular_start_minutes {
            MarketSession::Premarket
        } else if minute_of_day < self.regular_end_minutes {
            MarketSession::Regular
        } else if minute_of_day < self.afterhours_end_minutes {
            MarketSession::Afterhours
        } else {
            MarketSession::Closed
        }
    }
}

/// Standard US-equity commission/fee schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub per_share_commission: f64,
    pub per_order_commission: f64,
    pub sec_fee_per_million: f64,
    pub taf_fee_per_share: f64,
    pub finra_taf_cap: f64,
    pub maker_rebate_per_share: f64,
    pub taker_fee_per_share: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            per_share_commission: 0.0,
            per_order_commission: 0.0,
            sec_fee_per_million: 27.80,
            taf_fee_per_share: 0.000_166,
            finra_taf_cap: 8.30,
            maker_rebate_per_share: 0.0,
            taker_fee_per_share: 0.0,
        }
    }
}

impl FeeConfig {
    /// `per_order + qty*per_share + (sell ? SEC fee + capped TAF : 0) + maker/taker`.
    pub fn calculate_fees(&self, qty: f64, price: f64, is_sell: bool, is_maker: bool) -> f64 {
        let notional = qty * price;
        let mut fees = self.per_order_commission + qty * self.per_share_commission;
        if is_sell {
            fees += notional * self.sec_fee_per_million / 1_000_000.0;
            fees += (qty * self.taf_fee_per_share).min(self.finra_taf_cap);
        }
        fees += if is_maker {
            qty * self.maker_rebate_per_share
        } else {
            qty * self.taker_fee_per_share
        };
        fees
    }
}

/// Defaults applied to a session when the caller omits a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub initial_capital: f64,
    pub speed_factor: f64,
    pub max_sessions: usize,
    pub session_queue_capacity: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            speed_factor: 0.0,
            max_sessions: 64,
            session_queue_capacity: 0,
        }
    }
}

/// Ambient logging configuration, independent of any simulated subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    pub rotation: String,
    pub use_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "market_replay_sim.log".to_string(),
            log_level: "info".to_string(),
            rotation: "daily".to_string(),
            use_json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub execution: ExecutionConfig,
    pub fees: FeeConfig,
    pub defaults: DefaultsConfig,
    pub logging: LoggingConfig,
}

impl SimulatorConfig {
    /// Loads from a YAML file, falling back to defaults (with a warning)
    /// when the file does not exist. A present-but-malformed file is an
    /// error, since that almost always means a typo the operator should see.
    pub fn load(path: &str) -> crate::error::SimResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let cfg: SimulatorConfig = serde_yaml::from_str(&contents)
                    .map_err(|e| crate::error::SimError::Config(e.to_string()))?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Ok(SimulatorConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg = SimulatorConfig::load("/nonexistent/path/does-not-exist.yaml").unwrap();
        assert_eq!(cfg.defaults.initial_capital, 100_000.0);
        assert!(cfg.execution.enable_partial_fills);
    }

    #[test]
    fn partial_override_leaves_siblings_at_default() {
        let yaml = "execution:\n  fixed_slippage_bps: 5.0\n";
        let cfg: SimulatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.execution.fixed_slippage_bps, 5.0);
        assert_eq!(cfg.execution.random_slippage_max_bps, 0.0);
        assert!(!cfg.execution.enforce_market_hours);
    }

    #[test]
    fn zero_fee_schedule_is_free() {
        let fees = FeeConfig {
            per_share_commission: 0.0,
            per_order_commission: 0.0,
            sec_fee_per_million: 0.0,
            taf_fee_per_share: 0.0,
            finra_taf_cap: 0.0,
            maker_rebate_per_share: 0.0,
            taker_fee_per_share: 0.0,
        };
        assert_eq!(fees.calculate_fees(100.0, 50.0, true, false), 0.0);
    }

    #[test]
    fn sec_and_taf_apply_only_on_sell() {
        let fees = FeeConfig::default();
        let buy = fees.calculate_fees(100.0, 50.0, false, false);
        let sell = fees.calculate_fees(100.0, 50.0, true, false);
        assert!(sell > buy);
    }

    #[test]
    fn taf_is_capped() {
        let fees = FeeConfig::default();
        let big_sell = fees.calculate_fees(1_000_000.0, 50.0, true, false);
        // TAF alone would be 1_000_000 * 0.000166 = 166, far above the cap.
        let sec = 1_000_000.0 * 50.0 * fees.sec_fee_per_million / 1_000_000.0;
        assert!((big_sell - sec - fees.finra_taf_cap).abs() < 1e-6);
    }

    // Wednesday 2024-01-10 00:00:00 UTC == 1_704_844_800.
    const WED_2024_01_10_00_00_UTC: i64 = 1_704_844_800;

    fn ns_at(utc_secs_offset: i64) -> TimestampNs {
        (WED_2024_01_10_00_00_UTC + utc_secs_offset) * 1_000_000_000
    }

    #[test]
    fn market_session_classifies_each_window_on_a_weekday() {
        let cfg = ExecutionConfig::default();
        // 09:30 ET == 14:30 UTC: exactly the regular-session open.
        assert_eq!(cfg.market_session(ns_at(14 * 3600 + 1800)), MarketSession::Regular);
        // 08:00 ET == 13:00 UTC: premarket.
        assert_eq!(cfg.market_session(ns_at(13 * 3600)), MarketSession::Premarket);
        // 17:00 ET == 22:00 UTC: afterhours.
        assert_eq!(cfg.market_session(ns_at(22 * 3600)), MarketSession::Afterhours);
        // 02:00 ET == 07:00 UTC: before premarket opens.
        assert_eq!(cfg.market_session(ns_at(7 * 3600)), MarketSession::Closed);
        // 20:30 ET, rolled into the next UTC day: past the afterhours close.
        assert_eq!(cfg.market_session(ns_at(24 * 3600 + 3600 + 1800)), MarketSession::Closed);
    }

    #[test]
    fn market_session_closed_on_weekends() {
        let cfg = ExecutionConfig::default();
        // Saturday 2024-01-06, 09:30 ET, would be Regular on a weekday.
        let saturday_offset = -4 * 86_400 + 14 * 3600 + 1800;
        assert_eq!(cfg.market_session(ns_at(saturday_offset)), MarketSession::Closed);
    }

    #[test]
    fn market_session_closed_on_configured_holiday() {
        let mut cfg = ExecutionConfig::default();
        cfg.market_holidays.push("01-10".to_string());
        assert_eq!(cfg.market_session(ns_at(14 * 3600 + 1800)), MarketSession::Closed);
    }
}
