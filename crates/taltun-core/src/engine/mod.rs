//! Engine orchestration: the worker set and the shared state they run on.
//!
//! The engine owns the peer table, the router, the cookie protector, and
//! the bounded queues, and runs a small fixed set of dedicated threads:
//!
//! - one RX worker per UDP socket (socket count = logical CPUs, all bound
//!   to the same port via SO_REUSEPORT),
//! - one TUN-read/encrypt worker (absent in lighthouse mode),
//! - one UDP write worker draining the TX batch queue,
//! - one housekeeper ticking at 1 Hz for rekey and keepalive,
//! - one handshake worker serializing the crypto-heavy control plane.
//!
//! No worker holds a lock across blocking I/O. Shutdown is a flag: sockets
//! and the TUN device use short poll timeouts, so every loop observes
//! [`Engine::close`] within tens of milliseconds and exits cleanly.

mod control;
mod rx;
mod tx;

use crate::batch::TxBatch;
use crate::config::{EngineConfig, PeerSetup};
use crate::device::TunIo;
use crate::error::{EngineError, Result};
use crate::ipv4::{addr_to_u32, u32_to_addr};
use crate::peer::Peer;
use crate::peer_map::PeerTable;
use crate::router::Router;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use taltun_crypto::aead::data_nonce;
use taltun_crypto::cookie::CookieProtector;
use taltun_crypto::identity::StaticIdentity;
use taltun_net::UdpBatchSocket;
use tracing::{debug, info, warn};

/// Headroom reserved at the front of decrypted packets for the TUN driver.
pub(crate) const TUN_HEADROOM: usize = 16;

/// Handshake queue depth.
const HANDSHAKE_QUEUE_CAPACITY: usize = 500;

/// Queue depth at which RX workers start demanding cookies.
pub(crate) const HANDSHAKE_HIGH_WATER: usize = 250;

/// TX batch queue depth.
const TX_QUEUE_CAPACITY: usize = 256;

/// A handshake packet copied off the RX path, awaiting the handshake worker.
pub(crate) struct HandshakeRequest {
    pub addr: SocketAddr,
    pub packet: Vec<u8>,
    pub sock_idx: usize,
}

/// Drop and progress counters. Data-plane errors are never propagated; they
/// end up here.
#[derive(Debug, Default)]
pub struct EngineStats {
    malformed: AtomicU64,
    unknown_peer: AtomicU64,
    auth_failed: AtomicU64,
    replay_rejected: AtomicU64,
    backpressure_drops: AtomicU64,
    no_tun_drops: AtomicU64,
    handshakes_completed: AtomicU64,
    packets_relayed: AtomicU64,
    cookies_sent: AtomicU64,
}

macro_rules! stat_accessors {
    ($($field:ident),* $(,)?) => {
        $(
            #[must_use]
            pub fn $field(&self) -> u64 {
                self.$field.load(Ordering::Relaxed)
            }
        )*
    };
}

impl EngineStats {
    stat_accessors!(
        malformed,
        unknown_peer,
        auth_failed,
        replay_rejected,
        backpressure_drops,
        no_tun_drops,
        handshakes_completed,
        packets_relayed,
        cookies_sent,
    );

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The mesh VPN data-plane engine.
pub struct Engine {
    cfg: EngineConfig,
    identity: StaticIdentity,
    local_vip: u32,

    cookies: CookieProtector,
    peers: PeerTable,
    router: Router,

    handshake_tx: Sender<HandshakeRequest>,
    handshake_rx: Receiver<HandshakeRequest>,
    tx_queue_tx: Sender<TxBatch>,
    tx_queue_rx: Receiver<TxBatch>,

    tx_counter: AtomicU64,
    closed: AtomicBool,

    sockets: Vec<Arc<UdpBatchSocket>>,
    tun: Option<Arc<dyn TunIo>>,

    stats: EngineStats,
}

impl Engine {
    /// Build an engine from validated configuration. No I/O happens here;
    /// call [`Engine::initialize`] (or [`Engine::initialize_with`]) next.
    ///
    /// # Errors
    ///
    /// Fails when the cookie secrets cannot be generated.
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        let identity = StaticIdentity::from_private_bytes(cfg.secret_key);
        let local_vip = addr_to_u32(cfg.local_vip);
        if local_vip == 0 {
            return Err(EngineError::Config("local VIP must be a valid IPv4 address".into()));
        }

        let (handshake_tx, handshake_rx) = bounded(HANDSHAKE_QUEUE_CAPACITY);
        let (tx_queue_tx, tx_queue_rx) = bounded(TX_QUEUE_CAPACITY);

        Ok(Self {
            cfg,
            identity,
            local_vip,
            cookies: CookieProtector::new()?,
            peers: PeerTable::new(),
            router: Router::new(),
            handshake_tx,
            handshake_rx,
            tx_queue_tx,
            tx_queue_rx,
            tx_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sockets: Vec::new(),
            tun: None,
            stats: EngineStats::default(),
        })
    }

    /// Register a peer: create its state, publish it in the peer map, and
    /// install its `/32` plus every `allowed_ips` prefix in the router.
    ///
    /// # Errors
    ///
    /// Rejects the zero VIP.
    pub fn add_peer(&self, setup: &PeerSetup) -> Result<()> {
        let vip = addr_to_u32(setup.vip);
        if vip == 0 {
            return Err(EngineError::Config(format!(
                "invalid peer virtual IP: {}",
                setup.vip
            )));
        }

        let peer = Arc::new(Peer::new(vip, setup.endpoint));
        self.peers.insert(Arc::clone(&peer));
        self.router.insert(vip, 32, Arc::clone(&peer));
        for net in &setup.allowed_ips {
            self.router
                .insert(addr_to_u32(net.network()), net.prefix_len(), Arc::clone(&peer));
        }

        info!(
            peer = %setup.vip,
            endpoint = ?setup.endpoint,
            allowed_ips = setup.allowed_ips.len(),
            "peer configured"
        );
        Ok(())
    }

    /// Create the OS resources: one SO_REUSEPORT socket per logical CPU and,
    /// outside lighthouse mode, the TUN device with its address and routes.
    ///
    /// # Errors
    ///
    /// Propagates socket and TUN setup failures as fatal.
    pub fn initialize(&mut self) -> Result<()> {
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        let mut sockets = Vec::with_capacity(workers);
        for _ in 0..workers {
            sockets.push(Arc::new(
                UdpBatchSocket::bind_reuseport(self.cfg.local_bind)
                    .map_err(EngineError::SocketSetup)?,
            ));
        }

        let tun: Option<Arc<dyn TunIo>> = if self.cfg.mode.has_tun() {
            let device =
                taltun_net::TunDevice::create(&self.cfg.tun_name).map_err(EngineError::TunSetup)?;
            taltun_net::route::configure_interface(&self.cfg.tun_name, self.cfg.local_vip, self.cfg.mtu)
                .map_err(EngineError::TunSetup)?;
            if !self.cfg.routes.is_empty() {
                taltun_net::route::add_routes(&self.cfg.tun_name, &self.cfg.routes)
                    .map_err(EngineError::TunSetup)?;
            }
            Some(Arc::new(device))
        } else {
            None
        };

        info!(
            sockets = sockets.len(),
            bind = %self.cfg.local_bind,
            mode = ?self.cfg.mode,
            "engine resources initialized"
        );
        self.initialize_with(sockets, tun);
        Ok(())
    }

    /// Attach pre-built sockets and an optional TUN device. The seam the
    /// integration tests use to run the full pipeline over loopback.
    pub fn initialize_with(
        &mut self,
        sockets: Vec<Arc<UdpBatchSocket>>,
        tun: Option<Arc<dyn TunIo>>,
    ) {
        self.sockets = sockets;
        self.tun = tun;
    }

    /// Run the engine until [`Engine::close`] is called or a worker hits a
    /// fatal error. Spawns the worker set, fires the initial handshake
    /// burst, then blocks.
    ///
    /// # Errors
    ///
    /// Returns the first fatal worker error; clean shutdown returns `Ok`.
    ///
    /// # Panics
    ///
    /// Panics if called before sockets were attached.
    pub fn run(self: Arc<Self>) -> Result<()> {
        assert!(!self.sockets.is_empty(), "run() before initialize()");

        let worker_count = self.sockets.len() + 4;
        let (err_tx, err_rx) = bounded::<EngineError>(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for sock_idx in 0..self.sockets.len() {
            handles.push(Self::spawn_worker(
                &self,
                format!("taltun-rx{sock_idx}"),
                err_tx.clone(),
                move |engine| rx::rx_worker(engine, sock_idx),
            ));
        }
        if self.tun.is_some() {
            handles.push(Self::spawn_worker(
                &self,
                "taltun-tun".into(),
                err_tx.clone(),
                tx::tun_worker,
            ));
        }
        handles.push(Self::spawn_worker(
            &self,
            "taltun-txw".into(),
            err_tx.clone(),
            tx::udp_write_worker,
        ));
        handles.push(Self::spawn_worker(
            &self,
            "taltun-hskp".into(),
            err_tx.clone(),
            control::housekeeper_worker,
        ));
        handles.push(Self::spawn_worker(
            &self,
            "taltun-hs".into(),
            err_tx.clone(),
            control::handshake_worker,
        ));
        drop(err_tx);

        info!(
            rx_workers = self.sockets.len(),
            vip = %u32_to_addr(self.local_vip),
            "engine running"
        );

        // Dial every peer we already know an endpoint for.
        for peer in self.peers.snapshot().values() {
            if peer.endpoint().is_some() {
                control::send_handshake_init(&self, peer);
            }
        }

        let mut result = loop {
            match err_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(err) => break Err(err),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.closed() {
                        break Ok(());
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };

        self.close();
        for handle in handles {
            if handle.join().is_err() && result.is_ok() {
                result = Err(EngineError::WorkerPanic("worker thread panicked".into()));
            }
        }
        result
    }

    fn spawn_worker<F>(
        engine: &Arc<Self>,
        name: String,
        err_tx: Sender<EngineError>,
        body: F,
    ) -> thread::JoinHandle<()>
    where
        F: FnOnce(&Engine) -> Result<()> + Send + 'static,
    {
        let engine = Arc::clone(engine);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(err) = body(&engine) {
                    if !engine.closed() {
                        warn!(worker = %name, %err, "worker failed");
                        let _ = err_tx.send(err);
                    }
                }
            })
            .expect("spawning a named thread cannot fail")
    }

    /// Begin shutdown: workers observe the flag through their poll timeouts
    /// and exit; [`Engine::run`] then joins them and returns.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("engine shutting down");
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// This node's virtual IP.
    #[must_use]
    pub fn local_vip(&self) -> Ipv4Addr {
        u32_to_addr(self.local_vip)
    }

    /// Look up a configured peer (diagnostics and tests).
    #[must_use]
    pub fn peer(&self, vip: Ipv4Addr) -> Option<Arc<Peer>> {
        self.peers.get(addr_to_u32(vip))
    }

    /// Drop and progress counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Next data-packet nonce from the sender counter.
    pub(crate) fn next_nonce(&self) -> [u8; taltun_crypto::aead::NONCE_SIZE] {
        data_nonce(self.tx_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Count a TX-queue drop; the first one is logged.
    pub(crate) fn note_backpressure(&self) {
        if self.stats.backpressure_drops.fetch_add(1, Ordering::Relaxed) == 0 {
            debug!("TX queue full; dropping packets");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("vip", &u32_to_addr(self.local_vip))
            .field("mode", &self.cfg.mode)
            .field("peers", &self.peers.len())
            .field("closed", &self.closed())
            .finish()
    }
}

/// Single-entry peer cache held by each data-plane worker.
///
/// Consecutive packets of one flow share a key (sender VIP on RX, inner
/// destination on TX); the cache turns the map or trie lookup into a
/// comparison for that common case. Correctness is unaffected by staleness:
/// the cached value is an `Arc` into a prior snapshot, and peers are never
/// removed during a run.
#[derive(Default)]
pub(crate) struct EntryCache {
    key: u32,
    peer: Option<Arc<Peer>>,
}

impl EntryCache {
    pub(crate) fn get<F>(&mut self, key: u32, lookup: F) -> Option<Arc<Peer>>
    where
        F: FnOnce() -> Option<Arc<Peer>>,
    {
        if let Some(peer) = &self.peer {
            if self.key == key {
                return Some(Arc::clone(peer));
            }
        }
        let found = lookup();
        if let Some(peer) = &found {
            self.key = key;
            self.peer = Some(Arc::clone(peer));
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_cache_hit_skips_lookup() {
        let mut cache = EntryCache::default();
        let peer = Arc::new(Peer::new(5, None));

        let first = cache.get(5, || Some(Arc::clone(&peer)));
        assert!(first.is_some());

        // A second lookup for the same key must not invoke the closure.
        let second = cache.get(5, || panic!("cache miss on hot flow"));
        assert_eq!(second.unwrap().virtual_ip(), 5);
    }

    #[test]
    fn test_entry_cache_miss_updates() {
        let mut cache = EntryCache::default();
        let a = Arc::new(Peer::new(1, None));
        let b = Arc::new(Peer::new(2, None));

        cache.get(1, || Some(Arc::clone(&a)));
        let found = cache.get(2, || Some(Arc::clone(&b)));
        assert_eq!(found.unwrap().virtual_ip(), 2);
        let hit = cache.get(2, || panic!("should be cached"));
        assert_eq!(hit.unwrap().virtual_ip(), 2);
    }

    #[test]
    fn test_entry_cache_negative_not_cached() {
        let mut cache = EntryCache::default();
        assert!(cache.get(9, || None).is_none());
        // A miss must not poison the cache for the next lookup.
        let peer = Arc::new(Peer::new(9, None));
        assert!(cache.get(9, || Some(Arc::clone(&peer))).is_some());
    }
}
