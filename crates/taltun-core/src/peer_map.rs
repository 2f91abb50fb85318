//! The peer table: `virtual_ip → Peer`, copy-on-write.
//!
//! Readers load an immutable snapshot through `arc-swap` without taking a
//! lock; the RX hot path does this once per cache miss. Writers clone the
//! map, mutate the clone, and publish it atomically, serialized by one
//! mutex. Peers are never removed during a run, so snapshots only ever
//! grow stale by missing the newest peers for one load.

use crate::peer::Peer;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Snapshot = HashMap<u32, Arc<Peer>>;

/// Copy-on-write map of all configured peers.
pub struct PeerTable {
    map: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
}

impl PeerTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: ArcSwap::from_pointee(Snapshot::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert (or replace) a peer, publishing a new snapshot.
    pub fn insert(&self, peer: Arc<Peer>) {
        let _guard = self.write_lock.lock();
        let mut next = Snapshot::clone(&self.map.load());
        next.insert(peer.virtual_ip(), peer);
        self.map.store(Arc::new(next));
    }

    /// Look a peer up by virtual IP in the current snapshot.
    #[must_use]
    pub fn get(&self, virtual_ip: u32) -> Option<Arc<Peer>> {
        self.map.load().get(&virtual_ip).cloned()
    }

    /// The full current snapshot, for iteration (housekeeper, cookie scan).
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.map.load_full()
    }

    /// Number of configured peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
