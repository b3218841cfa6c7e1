//! Per-session account ledger: positions, cash, margin and the Reg-T /
//! PDT buying-power model, plus corporate actions.

use rustc_hash::FxHashMap;

use crate::config::ExecutionConfig;
use crate::models::{AccountState, Fill, Position, Side};

pub struct Ledger {
    state: AccountState,
    positions: FxHashMap<String, Position>,
    config: ExecutionConfig,
    /// Guards forced liquidation so a single margin breach triggers at
    /// most one liquidation pass until equity recovers.
    margin_call_active: bool,
}

impl Ledger {
    pub fn new(initial_capital: f64, config: ExecutionConfig) -> Self {
        Self {
            state: AccountState::new(initial_capital),
            positions: FxHashMap::default(),
            config,
            margin_call_active: false,
        }
    }

    pub fn state(&self) -> AccountState {
        self.state
    }

    pub fn positions(&self) -> &FxHashMap<String, Position> {
        &self.positions
    }

    pub fn margin_call_active(&self) -> bool {
        self.margin_call_active
    }

    pub fn restore_state(&mut self, state: AccountState) {
        self.state = state;
    }

    pub fn restore_positions(&mut self, positions: FxHashMap<String, Position>) {
        self.positions = positions;
    }

    /// Applies a fill to cash and the symbol's position, recomputing
    /// avg-price per the same-sign/flip-sign rule, then recomputes equity.
    pub fn apply_fill(&mut self, symbol: &str, fill: &Fill, fees: f64) {
        if fill.is_empty() {
            return;
        }
        let delta_q = match fill.side {
            Side::Buy => fill.qty,
            Side::Sell => -fill.qty,
        };

        let pos = self.positions.entry(symbol.to_string()).or_default();
        let prev_qty = pos.qty;
        let new_qty = prev_qty + delta_q;

        if new_qty == 0.0 {
            pos.qty = 0.0;
            pos.avg_entry_price = 0.0;
            pos.cost_basis = 0.0;
        } else if prev_qty == 0.0 || prev_qty.signum() == new_qty.signum() {
            let new_avg = (pos.avg_entry_price * prev_qty + fill.price * delta_q) / new_qty;
            pos.qty = new_qty;
            pos.avg_entry_price = new_avg;
            pos.cost_basis = pos.qty * pos.avg_entry_price;
        } else {
            // Sign flip: position re-opens at the fill price.
            pos.qty = new_qty;
            pos.avg_entry_price = fill.price;
            pos.cost_basis = pos.qty * pos.avg_entry_price;
        }

        let cash_delta = match fill.side {
            Side::Buy => -(fill.qty * fill.price),
            Side::Sell => fill.qty * fill.price,
        };
        self.state.cash += cash_delta - fees;
        self.state.accrued_fees += fees;

        self.mark_to_market(symbol, fill.price);
        self.recompute_equity();
    }

    pub fn mark_to_market(&mut self, symbol: &str, last_price: f64) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.mark(last_price);
        }
        self.recompute_equity();
    }

    pub fn recompute_equity(&mut self) {
        let mut long_mv = 0.0;
        let mut short_mv = 0.0;
        for pos in self.positions.values() {
            if pos.qty > 0.0 {
                long_mv += pos.market_value;
            } else if pos.qty < 0.0 {
                short_mv += pos.market_value.abs();
            }
        }
        self.state.long_mv = long_mv;
        self.state.short_mv = short_mv;
        self.state.equity = self.state.cash + long_mv - short_mv;

        self.state.regt_buying_power = 2.0 * self.state.equity;
        self.state.pattern_day_trader = self.state.equity >= self.config.pdt_equity_threshold;
        self.state.daytrading_buying_power = if self.state.pattern_day_trader {
            4.0 * self.state.equity
        } else {
            0.0
        };
        self.state.buying_power = if self.state.pattern_day_trader {
            self.state.daytrading_buying_power
        } else {
            self.state.regt_buying_power
        };

        let max_mv = long_mv.max(short_mv);
        self.state.initial_margin = max_mv * 0.5;
        self.state.maintenance_margin = max_mv * self.config.maintenance_margin_pct;
    }

    /// `notional <= buying_power` and the post-trade equity would still
    /// cover half of the larger side's projected market value.
    pub fn has_buying_power(&self, notional: f64, is_long: bool) -> bool {
        if notional > self.state.buying_power {
            return false;
        }
        let projected_long = self.state.long_mv + if is_long { notional } else { 0.0 };
        let projected_short = self.state.short_mv + if is_long { 0.0 } else { notional };
        self.state.equity >= 0.5 * projected_long.max(projected_short)
    }

    /// Current long quantity for `symbol`, used by shorting/SSR checks.
    pub fn long_qty(&self, symbol: &str) -> f64 {
        self.positions
            .get(symbol)
            .map(|p| p.qty.max(0.0))
            .unwrap_or(0.0)
    }

    pub fn apply_dividend(&mut self, symbol: &str, amount_per_share: f64) {
        if let Some(pos) = self.positions.get(symbol) {
            if pos.qty > 0.0 {
                self.state.cash += pos.qty * amount_per_share;
            }
        }
        self.recompute_equity();
    }

    /// Preserves cost basis: `qty *= ratio`, `avg /= ratio`.
    pub fn apply_split(&mut self, symbol: &str, ratio: f64) {
        if ratio <= 0.0 {
            return;
        }
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.qty *= ratio;
            pos.avg_entry_price /= ratio;
            pos.cost_basis = pos.qty * pos.avg_entry_price;
        }
        self.recompute_equity();
    }

    /// Returns true if a margin breach is active (and forced liquidation
    /// is enabled), latching `margin_call_active` so callers only act once.
    pub fn check_margin_breach(&mut self) -> bool {
        if !self.config.enable_margin_call_checks {
            return false;
        }
        let breached = self.state.maintenance_margin > 0.0
            && self.state.equity < self.state.maintenance_margin;
        if breached {
            if self.margin_call_active {
                return false;
            }
            self.margin_call_active = self.config.enable_forced_liquidation;
            return self.margin_call_active;
        }
        self.margin_call_active = false;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn fill(side: Side, qty: f64, price: f64) -> Fill {
        Fill {
            order_id: 1,
            symbol: "AAPL".to_string(),
            side,
            qty,
            price,
            timestamp_ns: 1,
            is_partial: false,
        }
    }

    #[test]
    fn buy_then_dividend_then_split() {
        let mut ledger = Ledger::new(1000.0, ExecutionConfig::default());
        ledger.apply_fill("AAPL", &fill(Side::Buy, 2.0, 101.0), 0.0);
        assert_eq!(ledger.state().cash, 1000.0 - 202.0);

        ledger.apply_dividend("AAPL", 0.5);
        assert!((ledger.state().cash - 799.0).abs() < 1e-9);

        ledger.apply_split("AAPL", 2.0);
        let pos = ledger.positions()["AAPL"];
        assert_eq!(pos.qty, 4.0);
        assert_eq!(pos.avg_entry_price, 50.5);
        assert!((pos.cost_basis - 202.0).abs() < 1e-9);
    }

    #[test]
    fn sign_flip_resets_avg_price() {
        let mut ledger = Ledger::new(10_000.0, ExecutionConfig::default());
        ledger.apply_fill("AAPL", &fill(Side::Buy, 10.0, 100.0), 0.0);
        ledger.apply_fill("AAPL", &fill(Side::Sell, 15.0, 90.0), 0.0);
        let pos = ledger.positions()["AAPL"];
        assert_eq!(pos.qty, -5.0);
        assert_eq!(pos.avg_entry_price, 90.0);
    }

    #[test]
    fn equity_identity_holds() {
        let mut ledger = Ledger::new(5000.0, ExecutionConfig::default());
        ledger.apply_fill("AAPL", &fill(Side::Buy, 10.0, 100.0), 1.0);
        ledger.mark_to_market("AAPL", 110.0);
        let s = ledger.state();
        assert!((s.cash + s.long_mv - s.short_mv - s.equity).abs() < 1e-9);
    }

    #[test]
    fn margin_breach_latches_until_recovered() {
        let mut cfg = ExecutionConfig::default();
        cfg.maintenance_margin_pct = 0.25;
        let mut ledger = Ledger::new(1000.0, cfg);
        ledger.apply_fill("AAPL", &fill(Side::Buy, 100.0, 10.0), 0.0);
        ledger.mark_to_market("AAPL", 1.0);
        // equity craters, maintenance margin now exceeds equity.
        assert!(ledger.check_margin_breach());
        assert!(!ledger.check_margin_breach());
        ledger.mark_to_market("AAPL", 100.0);
        assert!(!ledger.check_margin_breach());
    }
}
