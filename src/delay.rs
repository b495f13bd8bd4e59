//! The scheduler-delay signal driving the credit controller.

use std::time::Duration;

use metrics::gauge;

/// A pluggable estimate of the scheduler queueing delay.
///
/// By default the control loop measures its own wake-up lag past the tick
/// deadline, which is exactly the time it spent queued in the scheduler.
/// Embedders with a better signal (e.g. runtime instrumentation or
/// `/proc/schedstat`) can supply their own source; tests supply synthetic
/// delays.
///
/// Closures work out of the box:
///
/// ```
/// # use std::time::Duration;
/// # use breakwater::DelaySource;
/// fn synthetic() -> impl DelaySource {
///     || Duration::from_micros(50)
/// }
/// ```
pub trait DelaySource: Send + 'static {
    /// Returns the next raw delay sample. Called once per control tick.
    fn sample(&mut self) -> Duration;
}

impl<F> DelaySource for F
where
    F: FnMut() -> Duration + Send + 'static,
{
    fn sample(&mut self) -> Duration {
        self()
    }
}

/// Exponential smoothing of the raw samples, so one noisy wake-up doesn't
/// flip the controller into shedding.
pub(crate) struct DelayEma {
    ema: Option<f64>,
    alpha: f64,
}

impl DelayEma {
    pub(crate) fn new(samples: usize) -> Self {
        // https://en.wikipedia.org/wiki/Moving_average#Relationship_between_SMA_and_EMA
        let alpha = 2.0 / (samples + 1) as f64;

        Self { ema: None, alpha }
    }

    pub(crate) fn push(&mut self, delay: Duration) -> Duration {
        let delay = delay.as_secs_f64();

        let ema = if let Some(ema) = self.ema {
            ema * (1.0 - self.alpha) + delay * self.alpha
        } else {
            delay
        };

        gauge!("breakwater_delay_seconds", ema);

        self.ema = Some(ema);
        Duration::from_secs_f64(ema)
    }
}

impl Drop for DelayEma {
    fn drop(&mut self) {
        if self.ema.is_some() {
            gauge!("breakwater_delay_seconds", f64::NAN);
        }
    }
}
