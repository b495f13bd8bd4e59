//! The per-instance control loop.
//!
//! Ticks every `rtt`, samples the scheduler-delay signal, applies the
//! AIMD update to the credit pool, and expires silent clients. It is the
//! only writer of the pool; the serving path only reads it.

use std::sync::Arc;

use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant},
};

use crate::{
    delay::{DelayEma, DelaySource},
    server::AdmissionControl,
};

/// How many raw samples the delay EMA effectively averages over.
const DELAY_EMA_SAMPLES: usize = 8;

pub(crate) struct ControlLoop {
    handle: JoinHandle<()>,
}

impl ControlLoop {
    pub(crate) fn spawn(
        server: Arc<AdmissionControl>,
        rtt: Duration,
        ttl: Option<Duration>,
        mut source: Option<Box<dyn DelaySource>>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ema = DelayEma::new(DELAY_EMA_SAMPLES);
            let mut deadline = Instant::now() + rtt;

            loop {
                time::sleep_until(deadline).await;

                // Wake-up lag past the deadline is exactly the time this
                // task spent queued in the scheduler.
                let raw = match &mut source {
                    Some(source) => source.sample(),
                    None => Instant::now().saturating_duration_since(deadline),
                };
                let delay = ema.push(raw);
                server.on_tick(delay, ttl);

                // Anchor the cadence to the deadline, not to `now`, so lag
                // doesn't drift the tick; after a long stall, re-anchor
                // instead of bursting through the missed ticks.
                deadline = (deadline + rtt).max(Instant::now());
            }
        });

        Self { handle }
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
