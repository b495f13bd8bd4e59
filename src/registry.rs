//! Per-client registration records on the serving side.
//!
//! The serving path touches one record per RPC under the entry lock of
//! the map; the control loop walks the whole map once per tick to expire
//! silent clients. Critical sections are a few loads and stores, so a
//! sharded map is plenty.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use derive_more::Display;
use fxhash::FxBuildHasher;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Opaque stable client identity carried in the `id` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{_0}")]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Generates a fresh random identity. Called once per instance.
    pub(crate) fn generate() -> Self {
        use std::{
            collections::hash_map::RandomState,
            hash::{BuildHasher, Hasher},
        };

        // `RandomState` is randomly seeded.
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u32(42);
        Self(format!("{:016x}", hasher.finish()).into())
    }
}

impl From<&str> for ClientId {
    fn from(raw: &str) -> Self {
        Self(raw.into())
    }
}

pub(crate) struct ClientRecord {
    pub(crate) demand: u32,
    pub(crate) issued: u32,
    pub(crate) last_seen: Instant,
    reg_seq: u64,
}

#[derive(Default)]
pub(crate) struct Registry {
    map: DashMap<ClientId, ClientRecord, FxBuildHasher>,
    reg_seq: AtomicU64,
}

impl Registry {
    /// Records a sighting of `id` and tries to consume one issued credit.
    ///
    /// A previously unseen client is registered with one issued credit,
    /// so its first request doubles as registration and is admitted.
    pub(crate) fn check_in(&self, id: &ClientId, demand: u32, now: Instant) -> bool {
        let mut record = self.map.entry(id.clone()).or_insert_with(|| {
            let reg_seq = self.reg_seq.fetch_add(1, Ordering::Relaxed);
            debug!(message = "client registered", id = %id, seq = reg_seq);
            ClientRecord {
                demand: 0,
                issued: 1,
                last_seen: now,
                reg_seq,
            }
        });

        record.demand = demand;
        record.last_seen = now;

        if record.issued > 0 {
            record.issued -= 1;
            true
        } else {
            false
        }
    }

    /// Replaces the client's issued budget with a fresh issuance.
    pub(crate) fn set_issued(&self, id: &ClientId, issued: u32) {
        if let Some(mut record) = self.map.get_mut(id) {
            record.issued = issued;
        }
    }

    /// Removes clients not seen for over `ttl`. Their issued credits are
    /// already accounted in the pool and flow to others at the next
    /// issuance.
    pub(crate) fn expire(&self, ttl: Duration, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|id, record| {
            let keep = now.duration_since(record.last_seen) <= ttl;
            if !keep {
                debug!(message = "client expired", id = %id, seq = record.reg_seq);
            }
            keep
        });
        // New clients may check in concurrently, hence saturating.
        before.saturating_sub(self.map.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ClientId) -> bool {
        self.map.contains_key(id)
    }

    /// Sum of currently issued credits across clients.
    pub(crate) fn total_issued(&self) -> u64 {
        self.map.iter().map(|r| u64::from(r.issued)).sum()
    }

    /// Sum of last reported demands across clients.
    pub(crate) fn total_demand(&self) -> u64 {
        self.map.iter().map(|r| u64::from(r.demand)).sum()
    }
}
