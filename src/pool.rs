//! The aggregate credit pool adapted by AIMD on a delay signal.
//!
//! The pool converges to the largest credit budget that keeps the measured
//! scheduler delay at or below the SLO: while the delay stays under the
//! target, the budget grows additively (scaled by the number of registered
//! clients, so per-client growth stays roughly constant); once the delay
//! overshoots and shedding is enabled, the budget shrinks multiplicatively
//! in proportion to the overshoot.
//!
//! The pool itself is pure arithmetic. The control loop is its only
//! mutator; the serving path only computes issuances from it.

use std::time::Duration;

use crate::config::Config;

#[derive(Debug)]
pub(crate) struct CreditPool {
    total: f64,
    slo: Duration,
    a_factor: f64,
    b_factor: f64,
    load_shedding: bool,
    /// Registry size observed at the last control tick.
    num_clients: usize,
}

impl CreditPool {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            total: f64::from(config.initial_credits),
            slo: config.slo,
            a_factor: config.a_factor,
            b_factor: config.b_factor,
            load_shedding: config.load_shedding,
            num_clients: 0,
        }
    }

    /// Applies the AIMD update rule. Called once per control tick,
    /// after expired clients have been removed from the registry.
    pub(crate) fn on_tick(&mut self, delay: Duration, num_clients: usize) {
        self.num_clients = num_clients;
        let overcommit = num_clients.max(1) as f64;

        if delay <= self.slo {
            self.total += self.a_factor * overcommit;
        } else if self.load_shedding {
            let overshoot = (delay - self.slo).as_secs_f64() / self.slo.as_secs_f64();
            let factor = (1.0 - self.b_factor * overshoot).max(0.0);
            // Keep a small positive floor so the pool can recover even if
            // every client went idle during shedding.
            self.total = (self.total * factor).max(overcommit);
        }
    }

    /// Computes the credit grant for one client: an even share of the pool,
    /// biased upward by the client's reported demand, never exceeding the
    /// whole pool and never below one.
    pub(crate) fn issuance(&self, demand: u32) -> u32 {
        let ceiling = (self.total as u32).max(1);
        let share = (self.total / self.num_clients.max(1) as f64) as u32;
        share.max(demand).clamp(1, ceiling)
    }

    pub(crate) fn total(&self) -> f64 {
        self.total
    }
}
