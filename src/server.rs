//! The server-side admission filter.
//!
//! Sits between the transport and the handler: validates the caller's
//! presented credit, refreshes the per-client record, and either invokes
//! the handler or rejects without touching it. The issuance attached to
//! the response reflects the pool at admission time, so the client's next
//! send is budgeted against the most current state.

use std::future::Future;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::{
    config::Config,
    errors::Error,
    metadata::{Request, Response},
    pool::CreditPool,
    registry::Registry,
};

pub(crate) struct AdmissionControl {
    registry: Registry,
    /// Written by the control loop only; the serving path computes
    /// issuances from it under a short lock.
    pool: Mutex<CreditPool>,
    track: bool,
}

impl AdmissionControl {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            registry: Registry::default(),
            pool: Mutex::new(CreditPool::new(config)),
            track: config.track_credits,
        }
    }

    pub(crate) async fn intercept<Req, Res, H, Fut>(
        &self,
        request: Request<Req>,
        handler: H,
    ) -> Result<Response<Res>, Error>
    where
        H: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Error>>,
    {
        let id = request
            .metadata
            .client_id()
            .ok_or_else(|| Error::invalid_argument("missing `id` header"))?;
        let demand = request.metadata.demand()?;

        if !self.registry.check_in(&id, demand, Instant::now()) {
            if self.track {
                counter!("breakwater_rejected_total", 1);
            }
            trace!(message = "request rejected", id = %id, demand);
            return Err(Error::resource_exhausted("no credits issued for this client"));
        }

        if self.track {
            counter!("breakwater_admitted_total", 1);
        }

        let granted = self.pool.lock().issuance(demand);
        self.registry.set_issued(&id, granted);
        trace!(message = "request admitted", id = %id, demand, granted);

        let mut response = handler(request).await?;
        response.metadata.set_credits(granted);
        Ok(response)
    }

    /// One control tick: expire silent clients, then apply the AIMD
    /// update against the post-expiry client count.
    pub(crate) fn on_tick(&self, delay: Duration, ttl: Option<Duration>) {
        if let Some(ttl) = ttl {
            let expired = self.registry.expire(ttl, Instant::now());
            if expired > 0 {
                debug!(message = "expired silent clients", count = expired);
            }
        }

        let num_clients = self.registry.len();
        let total = {
            let mut pool = self.pool.lock();
            pool.on_tick(delay, num_clients);
            pool.total()
        };

        trace!(message = "control tick", delay = ?delay, clients = num_clients, pool = total);

        if self.track {
            gauge!("breakwater_credit_pool", total);
            gauge!("breakwater_clients", num_clients as f64);
            gauge!("breakwater_credits_issued", self.registry.total_issued() as f64);
            gauge!("breakwater_demand", self.registry.total_demand() as f64);
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_total(&self) -> f64 {
        self.pool.lock().total()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}
