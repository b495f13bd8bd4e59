//! Per-RPC metadata and the request/response envelopes seen by the
//! interceptors.
//!
//! The admission layer exchanges three string headers with the peer:
//! `id` and `demand` on the way out, `credits` on the way back. Embedders
//! map [`Metadata`] onto their transport's header mechanism.

use fxhash::FxHashMap;

use crate::{errors::Error, registry::ClientId};

/// Wire name of the client identity header (request).
pub const ID_KEY: &str = "id";
/// Wire name of the advisory demand header (request).
pub const DEMAND_KEY: &str = "demand";
/// Wire name of the credit grant header (response).
pub const CREDITS_KEY: &str = "credits";

/// String key-value headers attached to a request or a response.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: FxHashMap<String, String>,
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Inserts a key-value pair, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub(crate) fn client_id(&self) -> Option<ClientId> {
        self.get(ID_KEY).map(ClientId::from)
    }

    pub(crate) fn set_client_id(&mut self, id: &ClientId) {
        self.insert(ID_KEY, id.to_string());
    }

    /// Parses the advisory demand header. A missing header means zero
    /// demand; a malformed one is a protocol violation.
    pub(crate) fn demand(&self) -> Result<u32, Error> {
        match self.get(DEMAND_KEY) {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::invalid_argument(format!("malformed `demand` header: {raw}"))),
        }
    }

    pub(crate) fn set_demand(&mut self, demand: u32) {
        self.insert(DEMAND_KEY, demand.to_string());
    }

    /// Parses the credit grant header. Responses are decoded leniently:
    /// a missing or malformed header means "no update".
    pub(crate) fn credits(&self) -> Option<u32> {
        self.get(CREDITS_KEY)?.parse().ok()
    }

    pub(crate) fn set_credits(&mut self, credits: u32) {
        self.insert(CREDITS_KEY, credits.to_string());
    }
}

/// An outbound RPC passing through the interceptors.
#[derive(Debug)]
pub struct Request<T> {
    /// Headers exchanged with the peer.
    pub metadata: Metadata,
    /// The transport-opaque payload.
    pub payload: T,
}

impl<T> Request<T> {
    /// Wraps a payload with empty metadata.
    pub fn new(payload: T) -> Self {
        Self {
            metadata: Metadata::new(),
            payload,
        }
    }
}

/// A reply passing through the interceptors.
#[derive(Debug)]
pub struct Response<T> {
    /// Headers exchanged with the peer.
    pub metadata: Metadata,
    /// The transport-opaque payload.
    pub payload: T,
}

impl<T> Response<T> {
    /// Wraps a payload with empty metadata.
    pub fn new(payload: T) -> Self {
        Self {
            metadata: Metadata::new(),
            payload,
        }
    }
}
