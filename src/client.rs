//! The client-side outgoing gate.
//!
//! Every outbound RPC queues locally, waits for a credit, and carries the
//! instance identity and an advisory demand to the server; the reply
//! carries back a fresh credit budget. The gate is the only place the
//! client suspends: the serving side admits or rejects immediately.
//!
//! The credit counter lives under a mutex and the wake-up signal is a
//! `Notify`, which stores at most one permit and wakes exactly one waiter
//! per permit. Every transition of the counter from zero to positive
//! raises the signal once; a waiter that leaves credits behind re-raises
//! it, so a large grant drains the queue waiter by waiter.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant},
};
use tracing::trace;

use crate::{
    config::Config,
    errors::Error,
    metadata::{Request, Response},
    registry::ClientId,
};

pub(crate) struct OutgoingGate {
    id: ClientId,
    /// Credits available for outgoing requests.
    credits: Mutex<u32>,
    /// Binary wake-up signal staging waiters while `credits == 0`.
    no_credit: Notify,
    /// Queued outgoing requests; its depth is the advisory demand.
    pending: AtomicUsize,
    pending_limit: usize,
    expiration: Option<Duration>,
    credits_on_fail: bool,
    track: bool,
}

/// Occupies one slot of the outgoing queue until dropped.
struct PendingToken<'a>(&'a OutgoingGate);

impl Drop for PendingToken<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

impl OutgoingGate {
    pub(crate) fn new(config: &Config) -> Self {
        let no_credit = Notify::new();
        // The signal starts raised and the counter at one, so the first
        // send proceeds straight to the counter check instead of waiting
        // for a grant nobody will deliver.
        no_credit.notify_one();

        Self {
            id: ClientId::generate(),
            credits: Mutex::new(1),
            no_credit,
            pending: AtomicUsize::new(0),
            pending_limit: config.pending_limit,
            expiration: config.client_expiration,
            credits_on_fail: config.credits_on_fail,
            track: config.track_credits,
        }
    }

    pub(crate) fn id(&self) -> &ClientId {
        &self.id
    }

    pub(crate) async fn intercept<Req, Res, F, Fut>(
        &self,
        mut request: Request<Req>,
        transport: F,
    ) -> Result<Response<Res>, Error>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Error>>,
    {
        let Some(token) = self.try_enqueue() else {
            if self.track {
                counter!("breakwater_queue_dropped_total", 1);
            }
            return Err(Error::resource_exhausted("outgoing queue is full"));
        };

        self.acquire().await?;

        request.metadata.set_client_id(&self.id);
        // Snapshot the demand while this request still occupies its slot.
        request.metadata.set_demand(self.demand());
        drop(token);

        let result = transport(request).await;

        match &result {
            Ok(response) => self.on_reply(response.metadata.credits()),
            Err(err) => {
                trace!(message = "transport failed", id = %self.id, error = %err);
                self.on_failure();
            }
        }

        result
    }

    fn try_enqueue(&self) -> Option<PendingToken<'_>> {
        self.pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.pending_limit).then_some(n + 1)
            })
            .ok()
            .map(|_| PendingToken(self))
    }

    /// Best-effort count of pending outgoing requests; races are fine.
    fn demand(&self) -> u32 {
        self.pending.load(Ordering::Relaxed).min(u32::MAX as usize) as u32
    }

    /// Waits until one credit is consumed or the wait expires.
    async fn acquire(&self) -> Result<(), Error> {
        let deadline = self.expiration.map(|expiration| Instant::now() + expiration);

        loop {
            let notified = self.no_credit.notified();
            let signaled = match deadline {
                Some(deadline) => time::timeout_at(deadline, notified).await.is_ok(),
                None => {
                    notified.await;
                    true
                }
            };

            if !signaled {
                // A permit delivered right at the deadline is handed to the
                // next waiter when the `Notified` future drops, so expiry
                // cannot lose a wake-up.
                if self.track {
                    counter!("breakwater_expired_total", 1);
                }
                trace!(message = "request expired in queue", id = %self.id);
                return Err(Error::resource_exhausted("request expired in outgoing queue"));
            }

            let mut credits = self.credits.lock();
            if *credits > 0 {
                *credits -= 1;
                let rest = *credits;
                drop(credits);

                self.update_gauge(rest);
                if rest > 0 {
                    // Cascade: the remainder belongs to the next waiter.
                    self.no_credit.notify_one();
                }
                return Ok(());
            }
            // Another waiter got here first; wait for the next grant.
        }
    }

    /// Ingests the budget carried by a reply.
    fn on_reply(&self, granted: Option<u32>) {
        let mut credits = self.credits.lock();
        *credits = match granted {
            Some(granted) => granted.max(1),
            // Floor at one to avoid a permanent stall on silent servers.
            None => (*credits).max(1),
        };
        let updated = *credits;
        drop(credits);

        trace!(message = "credits updated", id = %self.id, granted = ?granted, credits = updated);
        self.update_gauge(updated);
        self.no_credit.notify_one();
    }

    /// Returns the credit consumed for a failed attempt.
    fn on_failure(&self) {
        if !self.credits_on_fail {
            return;
        }

        let mut credits = self.credits.lock();
        *credits = credits.saturating_add(1);
        let updated = *credits;
        drop(credits);

        self.update_gauge(updated);
        self.no_credit.notify_one();
    }

    fn update_gauge(&self, credits: u32) {
        if self.track {
            gauge!("breakwater_outgoing_credits", f64::from(credits));
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> u32 {
        *self.credits.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::Code;

    use super::*;

    fn gate(config: &Config) -> Arc<OutgoingGate> {
        Arc::new(OutgoingGate::new(config))
    }

    fn config() -> Config {
        Config::for_tests()
    }

    async fn stalled_call(gate: Arc<OutgoingGate>) -> tokio::task::JoinHandle<()> {
        let handle = tokio::spawn(async move {
            let _ = gate
                .intercept(Request::new(()), |_req| std::future::pending::<Result<Response<()>, Error>>())
                .await;
        });
        // Let the call take the bootstrap credit and enter the transport.
        tokio::task::yield_now().await;
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_drops_the_excess_request() {
        let config = Config {
            pending_limit: 3,
            client_expiration: None,
            ..config()
        };
        let gate = gate(&config);

        // Consume the only credit; the server never replies.
        let stalled = stalled_call(gate.clone()).await;

        // Fill the queue with waiters.
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            waiters.push(tokio::spawn(async move {
                let _ = gate
                    .intercept(Request::new(()), |_req| {
                        std::future::pending::<Result<Response<()>, Error>>()
                    })
                    .await;
            }));
        }
        tokio::task::yield_now().await;

        // The queue is full, so the next send fails without waiting.
        let err = gate
            .intercept(Request::new(()), |_req| async {
                Ok(Response::new(()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "outgoing queue is full");

        stalled.abort();
        for waiter in waiters {
            waiter.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_request_expires() {
        let expiration = Duration::from_millis(10);
        let config = Config {
            client_expiration: Some(expiration),
            ..config()
        };
        let gate = gate(&config);

        let stalled = stalled_call(gate.clone()).await;

        let started = Instant::now();
        let err = gate
            .intercept(Request::new(()), |_req| async {
                Ok(Response::new(()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "request expired in outgoing queue");
        assert_eq!(started.elapsed(), expiration);
        assert_eq!(gate.demand(), 0);

        stalled.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn grant_cascades_through_waiters() {
        let config = Config {
            client_expiration: None,
            ..config()
        };
        let gate = gate(&config);

        // Waiters queue behind the single bootstrap credit; the first
        // reply grants enough budget for all of them.
        let mut calls = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            calls.push(tokio::spawn(async move {
                gate.intercept(Request::new(()), |_req| async {
                    let mut response = Response::new(());
                    response.metadata.set_credits(4);
                    Ok(response)
                })
                .await
            }));
        }

        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert!(gate.available() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_restores_the_credit() {
        let config = Config {
            credits_on_fail: true,
            ..config()
        };
        let gate = gate(&config);
        assert_eq!(gate.available(), 1);

        let err = gate
            .intercept(Request::new(()), |_req| async {
                Err::<Response<()>, _>(Error::new(Code::Unavailable, "connection reset"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(gate.available(), 1);

        // A queued waiter is unblocked by the restored credit.
        gate.intercept(Request::new(()), |_req| async {
            Ok(Response::new(()))
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_consumes_the_credit_without_restoration() {
        let config = Config {
            credits_on_fail: false,
            client_expiration: Some(Duration::from_millis(10)),
            ..config()
        };
        let gate = gate(&config);

        let _ = gate
            .intercept(Request::new(()), |_req| async {
                Err::<Response<()>, _>(Error::new(Code::Unavailable, "connection reset"))
            })
            .await;
        assert_eq!(gate.available(), 0);

        // No credits left, so the next send expires.
        let err = gate
            .intercept(Request::new(()), |_req| async {
                Ok(Response::new(()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_without_credits_keeps_a_floor_of_one() {
        let gate = gate(&config());

        for _ in 0..3 {
            gate.intercept(Request::new(()), |_req| async {
                Ok(Response::new(()))
            })
            .await
            .unwrap();
            assert_eq!(gate.available(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn demand_counts_the_current_request() {
        let gate = gate(&config());

        let response = gate
            .intercept(Request::new(()), |req| async move {
                let mut response = Response::new(());
                response.metadata.insert("demand-seen", req.metadata.get("demand").unwrap());
                Ok(response)
            })
            .await
            .unwrap();

        // The only pending request is the one being sent.
        assert_eq!(response.metadata.get("demand-seen"), Some("1"));
    }
}
