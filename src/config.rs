//! Configuration of a breakwater instance.
//!
//! Note: all fields are immutable after the instance is created.
//! The config structure (usually encoded in TOML) follows stable
//! guarantees.

use std::time::Duration;

use eyre::{ensure, Result};
use serde::Deserialize;

/// The instance config.
///
/// # Examples
/// ```toml
/// [rpc.overload]
/// server_side = true
/// slo = "200us"
/// rtt = "1ms"
/// initial_credits = 10
/// client_expiration = "1s"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The target upper bound on the measured scheduler queueing delay.
    ///
    /// While the measured delay stays at or below this value, the credit
    /// pool grows; above it, the pool shrinks if `load_shedding` is set.
    ///
    /// `200us` by default.
    #[serde(with = "humantime_serde", default = "default_slo")]
    pub slo: Duration,
    /// The control-loop tick period, also the assumed round-trip time.
    ///
    /// `1ms` by default.
    #[serde(with = "humantime_serde", default = "default_rtt")]
    pub rtt: Duration,
    /// Bootstrap value of the aggregate credit pool.
    ///
    /// `10` by default.
    #[serde(default = "default_initial_credits")]
    pub initial_credits: u32,
    /// How long a request may wait in the local outgoing queue before it
    /// is dropped. The same period bounds how long the server keeps a
    /// silent client registered.
    ///
    /// `1s` by default, `None` disables both expirations.
    #[serde(with = "humantime_serde", default = "default_client_expiration")]
    pub client_expiration: Option<Duration>,
    /// Additive-increase coefficient: per-client pool growth per tick
    /// while the delay stays under the SLO.
    ///
    /// `0.5` by default.
    #[serde(default = "default_a_factor")]
    pub a_factor: f64,
    /// Multiplicative-decrease coefficient: how aggressively the pool
    /// shrinks per unit of SLO overshoot.
    ///
    /// `0.5` by default.
    #[serde(default = "default_b_factor")]
    pub b_factor: f64,
    /// Whether the pool shrinks when the delay exceeds the SLO.
    ///
    /// `true` by default.
    #[serde(default = "default_load_shedding")]
    pub load_shedding: bool,
    /// Whether this instance owns the control loop. Exactly one instance
    /// per endpoint should.
    pub server_side: bool,
    /// Enables credit observability gauges and counters.
    ///
    /// `false` by default.
    #[serde(default)]
    pub track_credits: bool,
    /// Capacity of the client-side outgoing queue; requests beyond it
    /// are dropped immediately.
    ///
    /// `50` by default.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
    /// Whether a transport failure returns the credit consumed for the
    /// attempt.
    ///
    /// `true` by default.
    #[serde(default = "default_credits_on_fail")]
    pub credits_on_fail: bool,
}

fn default_slo() -> Duration {
    Duration::from_micros(200)
}

fn default_rtt() -> Duration {
    Duration::from_millis(1)
}

fn default_initial_credits() -> u32 {
    10
}

fn default_client_expiration() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_a_factor() -> f64 {
    0.5
}

fn default_b_factor() -> f64 {
    0.5
}

fn default_load_shedding() -> bool {
    true
}

fn default_pending_limit() -> usize {
    50
}

fn default_credits_on_fail() -> bool {
    true
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.slo > Duration::ZERO, "slo must be positive");
        ensure!(self.rtt > Duration::ZERO, "rtt must be positive");
        ensure!(self.a_factor > 0.0, "a_factor must be positive");
        ensure!(
            self.b_factor > 0.0 && self.b_factor <= 1.0,
            "b_factor must be in (0, 1]"
        );
        ensure!(
            self.client_expiration != Some(Duration::ZERO),
            "client_expiration must be positive"
        );
        ensure!(self.pending_limit > 0, "pending_limit must be positive");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            slo: default_slo(),
            rtt: default_rtt(),
            initial_credits: default_initial_credits(),
            client_expiration: default_client_expiration(),
            a_factor: default_a_factor(),
            b_factor: default_b_factor(),
            load_shedding: default_load_shedding(),
            server_side: false,
            track_credits: false,
            pending_limit: default_pending_limit(),
            credits_on_fail: default_credits_on_fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("server_side = true").unwrap();
        assert_eq!(config.slo, Duration::from_micros(200));
        assert_eq!(config.rtt, Duration::from_millis(1));
        assert_eq!(config.initial_credits, 10);
        assert_eq!(config.client_expiration, Some(Duration::from_secs(1)));
        assert_eq!(config.a_factor, 0.5);
        assert_eq!(config.b_factor, 0.5);
        assert!(config.load_shedding);
        assert!(config.server_side);
        assert!(!config.track_credits);
        assert_eq!(config.pending_limit, 50);
        assert!(config.credits_on_fail);
        config.validate().unwrap();
    }

    #[test]
    fn full_config() {
        let config: Config = toml::from_str(
            r#"
            slo = "500us"
            rtt = "250us"
            initial_credits = 100
            client_expiration = "10ms"
            a_factor = 1.0
            b_factor = 0.02
            load_shedding = false
            server_side = false
            track_credits = true
            pending_limit = 128
            credits_on_fail = false
            "#,
        )
        .unwrap();

        assert_eq!(config.slo, Duration::from_micros(500));
        assert_eq!(config.rtt, Duration::from_micros(250));
        assert_eq!(config.client_expiration, Some(Duration::from_millis(10)));
        assert!(!config.load_shedding);
        assert!(config.track_credits);
        config.validate().unwrap();
    }

    #[test]
    fn validation() {
        let valid = Config::for_tests();

        let config = Config {
            a_factor: 0.0,
            ..valid.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            b_factor: 1.5,
            ..valid.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            pending_limit: 0,
            ..valid.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            client_expiration: Some(Duration::ZERO),
            ..valid
        };
        assert!(config.validate().is_err());
    }
}
