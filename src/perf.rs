//! Equity-curve performance tracking: total return, max drawdown, and
//! an annualized Sharpe ratio over the session's observed return series.

use crate::core_types::TimestampNs;

#[derive(Debug, Clone, Copy)]
pub struct EquityPoint {
    pub timestamp_ns: TimestampNs,
    pub equity: f64,
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    points: Vec<EquityPoint>,
}

impl PerformanceTracker {
    pub fn new(start_time: TimestampNs, initial_capital: f64) -> Self {
        Self {
            points: vec![EquityPoint {
                timestamp_ns: start_time,
                equity: initial_capital,
            }],
        }
    }

    /// Appends an equity observation, collapsing consecutive duplicate
    /// timestamps (keeping the latest value for that instant).
    pub fn record(&mut self, timestamp_ns: TimestampNs, equity: f64) {
        if let Some(last) = self.points.last_mut() {
            if last.timestamp_ns == timestamp_ns {
                last.equity = equity;
                return;
            }
        }
        self.points.push(EquityPoint { timestamp_ns, equity });
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn total_return(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) if first.equity != 0.0 => {
                (last.equity - first.equity) / first.equity
            }
            _ => 0.0,
        }
    }

    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::MIN;
        let mut worst = 0.0;
        for p in &self.points {
            peak = peak.max(p.equity);
            if peak > 0.0 {
                let dd = (peak - p.equity) / peak;
                if dd > worst {
                    worst = dd;
                }
            }
        }
        worst
    }

    fn returns(&self) -> Vec<f64> {
        self.points
            .windows(2)
            .filter_map(|w| {
                if w[0].equity == 0.0 {
                    None
                } else {
                    Some((w[1].equity - w[0].equity) / w[0].equity)
                }
            })
            .collect()
    }

    /// `mean(returns) / stdev(returns) * sqrt(252)`. Zero when fewer
    /// than two returns or the sample has zero variance.
    pub fn sharpe(&self) -> f64 {
        let returns = self.returns();
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let stdev = variance.sqrt();
        if stdev == 0.0 {
            return 0.0;
        }
        mean / stdev * (252.0_f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_equity_has_zero_return_and_sharpe() {
        let mut tracker = PerformanceTracker::new(0, 1000.0);
        tracker.record(1, 1000.0);
        tracker.record(2, 1000.0);
        assert_eq!(tracker.total_return(), 0.0);
        assert_eq!(tracker.sharpe(), 0.0);
        assert_eq!(tracker.max_drawdown(), 0.0);
    }

    #[test]
    fn drawdown_tracks_worst_peak_to_trough() {
        let mut tracker = PerformanceTracker::new(0, 1000.0);
        tracker.record(1, 1200.0);
        tracker.record(2, 900.0);
        tracker.record(3, 1100.0);
        assert!((tracker.max_drawdown() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn duplicate_timestamps_collapse() {
        let mut tracker = PerformanceTracker::new(0, 1000.0);
        tracker.record(5, 1100.0);
        tracker.record(5, 1200.0);
        assert_eq!(tracker.points().len(), 2);
        assert_eq!(tracker.points().last().unwrap().equity, 1200.0);
    }

    #[test]
    fn total_return_positive() {
        let mut tracker = PerformanceTracker::new(0, 1000.0);
        tracker.record(1, 1100.0);
        assert!((tracker.total_return() - 0.1).abs() < 1e-9);
    }
}
