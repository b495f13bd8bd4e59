//! Receiver-driven, credit-based admission control for RPC fabrics.
//!
//! A server issues credits to its clients and a client sends a request
//! only with a credit in hand, so load is shed at the sender before it
//! ever reaches an overloaded server. The server adapts the aggregate
//! credit pool with AIMD against a scheduler-delay SLO; requests carry
//! the client's demand out, responses carry the refreshed budget back.
//!
//! The crate is transport-agnostic: [`Breakwater::client_intercept`] and
//! [`Breakwater::server_intercept`] wrap whatever closure performs the
//! actual call, exchanging the `id`/`demand`/`credits` headers through
//! [`Metadata`].
//!
//! Configuration can be found in [`Config`].
#![warn(rust_2018_idioms, unreachable_pub, missing_docs)]

use std::{future::Future, sync::Arc};

use eyre::Result;

pub use crate::{
    config::Config,
    delay::DelaySource,
    errors::{Code, Error},
    metadata::{Metadata, Request, Response, CREDITS_KEY, DEMAND_KEY, ID_KEY},
    registry::ClientId,
};

mod client;
mod config;
mod control;
mod delay;
mod errors;
mod metadata;
mod pool;
mod registry;
mod server;


/// A single admission-control instance, one per logical endpoint.
///
/// The client side gates outgoing RPCs behind a locally tracked credit
/// counter; the server side validates presented credits and reissues
/// budgets. The control loop (spawned iff [`Config::server_side`])
/// terminates when the instance is dropped.
pub struct Breakwater {
    gate: client::OutgoingGate,
    server: Arc<server::AdmissionControl>,
    _control: Option<control::ControlLoop>,
}

impl Breakwater {
    /// Creates an instance with the built-in delay signal (the control
    /// loop's own scheduling lag).
    ///
    /// Must be called inside a tokio runtime if `config.server_side`.
    pub fn new(config: Config) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates an instance with a custom scheduler-delay signal.
    pub fn with_delay_source(config: Config, source: impl DelaySource) -> Result<Self> {
        Self::build(config, Some(Box::new(source)))
    }

    fn build(config: Config, source: Option<Box<dyn DelaySource>>) -> Result<Self> {
        config.validate()?;

        let gate = client::OutgoingGate::new(&config);
        let server = Arc::new(server::AdmissionControl::new(&config));
        let control = config.server_side.then(|| {
            control::ControlLoop::spawn(
                server.clone(),
                config.rtt,
                config.client_expiration,
                source,
            )
        });

        Ok(Self {
            gate,
            server,
            _control: control,
        })
    }

    /// The server-side middleware: validates the caller's credit and
    /// either invokes `handler` or rejects without touching it. The
    /// response carries the client's refreshed budget in its metadata.
    pub async fn server_intercept<Req, Res, H, Fut>(
        &self,
        request: Request<Req>,
        handler: H,
    ) -> Result<Response<Res>, Error>
    where
        H: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Error>>,
    {
        self.server.intercept(request, handler).await
    }

    /// The client-side middleware: queues behind the local credit
    /// counter, attaches `id` and `demand` metadata, invokes `transport`,
    /// and ingests the budget carried by the reply.
    pub async fn client_intercept<Req, Res, F, Fut>(
        &self,
        request: Request<Req>,
        transport: F,
    ) -> Result<Response<Res>, Error>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Error>>,
    {
        self.gate.intercept(request, transport).await
    }

    /// This instance's self-assigned client identity.
    pub fn client_id(&self) -> &ClientId {
        self.gate.id()
    }
}
