//! Per-peer session state.
//!
//! A [`Peer`] is the authoritative record for one remote node: its virtual
//! IP (immutable, the map key), its last-known UDP endpoint (mutable,
//! peers roam), its session keys, replay filter, DoS cookie cache, and
//! advisory timers.
//!
//! Locking is deliberately fine-grained: crypto state, endpoint, cookie,
//! and replay filter each sit behind their own short-lived lock so the hot
//! paths never contend on one big mutex. Timestamps are relaxed atomics;
//! last-writer-wins is acceptable for keepalive bookkeeping. Peers are
//! created at configuration time and live for the whole run; the map and
//! the router share them through `Arc`.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use taltun_crypto::aead::{ReplayFilter, SessionCipher, TAG_SIZE};
use taltun_crypto::cookie::COOKIE_SIZE;
use taltun_crypto::CryptoError;

/// Session age that triggers a rekey handshake.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(120);

/// Transmit silence that triggers a keepalive.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between lighthouse peer-update emissions per peer.
pub const NOTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Lifetime of a cached DoS cookie.
pub const COOKIE_TTL: Duration = Duration::from_secs(300);

/// Lifecycle of a peer's session, derived from its crypto state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No session key, no handshake in flight.
    NewCold,
    /// Handshake init dispatched, no key yet.
    Dialing,
    /// Session key installed.
    Established,
    /// Session key installed and a rekey handshake in flight.
    Rekeying,
}

struct SessionKeys {
    current: Option<SessionCipher>,
    previous: Option<SessionCipher>,
    last_handshake: Option<Instant>,
    handshake_pending: bool,
}

struct CachedCookie {
    bytes: [u8; COOKIE_SIZE],
    received_at: Instant,
}

/// Authoritative state for one remote node.
pub struct Peer {
    virtual_ip: u32,

    keys: RwLock<SessionKeys>,
    endpoint: RwLock<Option<SocketAddr>>,
    cookie: Mutex<Option<CachedCookie>>,
    replay: Mutex<ReplayFilter>,

    last_sent_ns: AtomicU64,
    last_rx_ns: AtomicU64,
    last_notify_ns: AtomicU64,

    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
}

impl Peer {
    /// Create a peer for `virtual_ip`, optionally with a configured initial
    /// endpoint.
    #[must_use]
    pub fn new(virtual_ip: u32, endpoint: Option<SocketAddr>) -> Self {
        let now = monotonic_ns();
        Self {
            virtual_ip,
            keys: RwLock::new(SessionKeys {
                current: None,
                previous: None,
                last_handshake: None,
                handshake_pending: false,
            }),
            endpoint: RwLock::new(endpoint),
            cookie: Mutex::new(None),
            replay: Mutex::new(ReplayFilter::new()),
            last_sent_ns: AtomicU64::new(now),
            last_rx_ns: AtomicU64::new(now),
            last_notify_ns: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
        }
    }

    /// The peer's virtual IP (primary key, immutable).
    #[must_use]
    pub fn virtual_ip(&self) -> u32 {
        self.virtual_ip
    }

    /// Last-known UDP endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    /// Record a new endpoint, keeping the old one when nothing changed.
    ///
    /// Returns `true` when the endpoint actually moved (roaming or first
    /// discovery), which is what triggers direct-route promotion.
    pub fn set_endpoint(&self, addr: SocketAddr) -> bool {
        let mut endpoint = self.endpoint.write();
        if *endpoint == Some(addr) {
            return false;
        }
        *endpoint = Some(addr);
        true
    }

    /// Install a freshly derived session key.
    ///
    /// The predecessor key is retained for one rotation so packets sealed
    /// under it while the handshake raced the data path still open.
    pub fn install_session_key(&self, cipher: SessionCipher) {
        let mut keys = self.keys.write();
        if let Some(current) = keys.current.take() {
            keys.previous = Some(current);
        }
        keys.current = Some(cipher);
        keys.last_handshake = Some(Instant::now());
        keys.handshake_pending = false;
    }

    /// Whether a handshake has ever completed.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.keys.read().current.is_some()
    }

    /// Snapshot of the current cipher for the encrypt paths.
    #[must_use]
    pub fn current_cipher(&self) -> Option<SessionCipher> {
        self.keys.read().current.clone()
    }

    /// Decrypt `ciphertext` (trailing 16-byte tag) into `out`.
    ///
    /// Tries the current key, then the previous one, so in-flight packets
    /// sealed just before a rekey still decrypt. Returns the plaintext
    /// length written at `out[..len]`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoSessionKey`] before the first handshake;
    /// [`CryptoError::AuthFailed`] when both keys reject the packet.
    pub fn open_into(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        if ciphertext.len() < TAG_SIZE || out.len() < ciphertext.len() - TAG_SIZE {
            return Err(CryptoError::AuthFailed);
        }
        let (current, previous) = {
            let keys = self.keys.read();
            (keys.current.clone(), keys.previous.clone())
        };
        let Some(current) = current else {
            return Err(CryptoError::NoSessionKey);
        };

        let ct_len = ciphertext.len() - TAG_SIZE;
        let (ct, tag) = ciphertext.split_at(ct_len);
        out[..ct_len].copy_from_slice(ct);

        match current.open_in_place(nonce, &mut out[..ct_len], tag) {
            Ok(()) => Ok(ct_len),
            Err(_) => {
                // A failed open leaves the buffer untouched; retry under the
                // pre-rekey key.
                let previous = previous.ok_or(CryptoError::AuthFailed)?;
                previous
                    .open_in_place(nonce, &mut out[..ct_len], tag)
                    .map_err(|_| CryptoError::AuthFailed)?;
                Ok(ct_len)
            }
        }
    }

    /// Whether the session is due for a rekey handshake.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        let keys = self.keys.read();
        keys.current.is_some()
            && !keys.handshake_pending
            && keys
                .last_handshake
                .is_some_and(|at| at.elapsed() > REKEY_INTERVAL)
    }

    /// Flag that a handshake init has been dispatched.
    pub fn mark_handshake_pending(&self) {
        self.keys.write().handshake_pending = true;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        let keys = self.keys.read();
        match (keys.current.is_some(), keys.handshake_pending) {
            (false, false) => PeerState::NewCold,
            (false, true) => PeerState::Dialing,
            (true, false) => PeerState::Established,
            (true, true) => PeerState::Rekeying,
        }
    }

    /// Whether transmit silence warrants a keepalive. Deliberately looks at
    /// sends only: the goal is holding the NAT binding open from our side.
    #[must_use]
    pub fn needs_keepalive(&self) -> bool {
        let last = self.last_sent_ns.load(Ordering::Relaxed);
        monotonic_ns().saturating_sub(last) > KEEPALIVE_TIMEOUT.as_nanos() as u64
    }

    /// Rate gate for lighthouse peer-update emission: accepts at most once
    /// per [`NOTIFY_INTERVAL`], racing emitters resolved by compare-exchange.
    #[must_use]
    pub fn should_notify(&self) -> bool {
        let now = monotonic_ns();
        let last = self.last_notify_ns.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) <= NOTIFY_INTERVAL.as_nanos() as u64 {
            return false;
        }
        self.last_notify_ns
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Record an outbound packet for keepalive accounting.
    pub fn note_sent(&self) {
        self.last_sent_ns.store(monotonic_ns(), Ordering::Relaxed);
    }

    /// Record an authenticated inbound packet.
    pub fn note_rx(&self) {
        self.last_rx_ns.store(monotonic_ns(), Ordering::Relaxed);
    }

    /// Run the replay filter over a received counter.
    #[must_use]
    pub fn validate_replay(&self, counter: u64) -> bool {
        self.replay.lock().validate_and_update(counter)
    }

    /// Cache a DoS cookie received from this peer.
    pub fn set_cookie(&self, cookie: &[u8]) {
        if cookie.len() != COOKIE_SIZE {
            return;
        }
        let mut bytes = [0u8; COOKIE_SIZE];
        bytes.copy_from_slice(cookie);
        *self.cookie.lock() = Some(CachedCookie {
            bytes,
            received_at: Instant::now(),
        });
    }

    /// The cached cookie, if still fresh. Expired cookies are dropped.
    #[must_use]
    pub fn cookie(&self) -> Option<[u8; COOKIE_SIZE]> {
        let mut cached = self.cookie.lock();
        match cached.as_ref() {
            Some(cookie) if cookie.received_at.elapsed() <= COOKIE_TTL => Some(cookie.bytes),
            Some(_) => {
                *cached = None;
                None
            }
            None => None,
        }
    }

    /// Add to the transmit byte counter.
    pub fn add_bytes_tx(&self, n: u64) {
        self.bytes_tx.fetch_add(n, Ordering::Relaxed);
    }

    /// Add to the receive byte counter.
    pub fn add_bytes_rx(&self, n: u64) {
        self.bytes_rx.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes sent to this peer.
    #[must_use]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Total bytes received from this peer.
    #[must_use]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn backdate_handshake(&self, by: Duration) {
        let mut keys = self.keys.write();
        keys.last_handshake = keys
            .last_handshake
            .and_then(|at| at.checked_sub(by));
    }

    #[cfg(test)]
    fn backdate_sent(&self, by: Duration) {
        let last = self.last_sent_ns.load(Ordering::Relaxed);
        self.last_sent_ns
            .store(last.saturating_sub(by.as_nanos() as u64), Ordering::Relaxed);
    }

    #[cfg(test)]
    fn backdate_cookie(&self, by: Duration) {
        if let Some(cookie) = self.cookie.lock().as_mut() {
            cookie.received_at = cookie.received_at.checked_sub(by).unwrap();
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("virtual_ip", &crate::ipv4::u32_to_addr(self.virtual_ip))
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

/// Nanoseconds since the process epoch; monotonic and cheap enough for
/// relaxed timestamp fields.
fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use taltun_crypto::aead::data_nonce;

    fn cipher(byte: u8) -> SessionCipher {
        SessionCipher::new([byte; 32])
    }

    fn seal(cipher: &SessionCipher, counter: u64, plaintext: &[u8]) -> Vec<u8> {
        let nonce = data_nonce(counter);
        let mut buf = plaintext.to_vec();
        let tag = cipher.seal_in_place(&nonce, &mut buf).unwrap();
        buf.extend_from_slice(&tag);
        buf
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), port))
    }

    #[test]
    fn test_open_without_session_key() {
        let peer = Peer::new(1, None);
        let mut out = [0u8; 64];
        assert_eq!(
            peer.open_into(&data_nonce(1), &[0u8; 32], &mut out),
            Err(CryptoError::NoSessionKey)
        );
    }

    #[test]
    fn test_rekey_keeps_previous_key_working() {
        let peer = Peer::new(1, None);
        let old = cipher(1);
        let new = cipher(2);

        peer.install_session_key(old.clone());
        let sealed_under_old = seal(&old, 7, b"in flight during rekey");

        peer.install_session_key(new.clone());

        // Packets under the new key decrypt.
        let sealed_under_new = seal(&new, 8, b"fresh");
        let mut out = [0u8; 64];
        let n = peer
            .open_into(&data_nonce(8), &sealed_under_new, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"fresh");

        // And so do packets sealed just before the rotation.
        let n = peer
            .open_into(&data_nonce(7), &sealed_under_old, &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"in flight during rekey");
    }

    #[test]
    fn test_two_rotations_expire_oldest_key() {
        let peer = Peer::new(1, None);
        let first = cipher(1);
        peer.install_session_key(first.clone());
        peer.install_session_key(cipher(2));
        peer.install_session_key(cipher(3));

        let sealed = seal(&first, 1, b"stale");
        let mut out = [0u8; 64];
        assert_eq!(
            peer.open_into(&data_nonce(1), &sealed, &mut out),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_needs_rekey_lifecycle() {
        let peer = Peer::new(1, None);
        assert!(!peer.needs_rekey(), "no session, no rekey");

        peer.install_session_key(cipher(1));
        assert!(!peer.needs_rekey(), "fresh session");

        peer.backdate_handshake(REKEY_INTERVAL + Duration::from_secs(1));
        assert!(peer.needs_rekey());

        peer.mark_handshake_pending();
        assert!(!peer.needs_rekey(), "pending handshake suppresses rekey");
    }

    #[test]
    fn test_state_machine_transitions() {
        let peer = Peer::new(1, None);
        assert_eq!(peer.state(), PeerState::NewCold);

        peer.mark_handshake_pending();
        assert_eq!(peer.state(), PeerState::Dialing);

        peer.install_session_key(cipher(1));
        assert_eq!(peer.state(), PeerState::Established);

        peer.mark_handshake_pending();
        assert_eq!(peer.state(), PeerState::Rekeying);

        peer.install_session_key(cipher(2));
        assert_eq!(peer.state(), PeerState::Established);
    }

    #[test]
    fn test_needs_keepalive_after_tx_silence() {
        let peer = Peer::new(1, None);
        assert!(!peer.needs_keepalive());

        peer.backdate_sent(KEEPALIVE_TIMEOUT + Duration::from_secs(1));
        assert!(peer.needs_keepalive());

        peer.note_sent();
        assert!(!peer.needs_keepalive());
    }

    #[test]
    fn test_should_notify_gate() {
        let peer = Peer::new(1, None);
        assert!(peer.should_notify(), "first notification passes");
        assert!(!peer.should_notify(), "second within interval is gated");
    }

    #[test]
    fn test_set_endpoint_roaming() {
        let peer = Peer::new(1, Some(addr(9000)));
        assert!(!peer.set_endpoint(addr(9000)), "same endpoint is a no-op");
        assert!(peer.set_endpoint(addr(9001)), "port change is roaming");
        assert_eq!(peer.endpoint(), Some(addr(9001)));
    }

    #[test]
    fn test_cookie_cache_expiry() {
        let peer = Peer::new(1, None);
        assert_eq!(peer.cookie(), None);

        peer.set_cookie(&[0x42; COOKIE_SIZE]);
        assert_eq!(peer.cookie(), Some([0x42; COOKIE_SIZE]));

        peer.backdate_cookie(COOKIE_TTL + Duration::from_secs(1));
        assert_eq!(peer.cookie(), None, "expired cookie is dropped");
        assert_eq!(peer.cookie(), None);
    }

    #[test]
    fn test_replay_through_peer() {
        let peer = Peer::new(1, None);
        assert!(peer.validate_replay(42));
        assert!(peer.validate_replay(40));
        assert!(!peer.validate_replay(42));
    }
}
