//! Control plane: housekeeper, handshake worker, and control-message sends.
//!
//! Handshake processing is deliberately single-threaded: one worker drains
//! the queue, so the ECDH and key installs for any one peer never race each
//! other. Control messages (handshakes, cookie replies, peer updates) are
//! small and rare; they bypass the TX batch queue and go straight out a
//! socket. Keepalives are data frames and take the batch path like any
//! other encrypted packet.

use super::{tx, Engine, EngineStats, HandshakeRequest};
use crate::buffer_pool;
use crate::error::Result;
use crate::ipv4::u32_to_addr;
use crate::peer::Peer;
use crate::wire;
use crossbeam_channel::RecvTimeoutError;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taltun_crypto::aead::{SessionCipher, TAG_SIZE};
use taltun_crypto::kdf;
use tracing::{debug, info, trace};

/// Housekeeper tick period.
const TICK: Duration = Duration::from_secs(1);

/// Sleep slice between shutdown checks.
const NAP: Duration = Duration::from_millis(250);

/// 1 Hz worker driving rekey and keepalive for every peer.
pub(crate) fn housekeeper_worker(engine: &Engine) -> Result<()> {
    let mut last_tick = Instant::now();
    debug!("housekeeper started");

    while !engine.closed() {
        std::thread::sleep(NAP);
        if last_tick.elapsed() < TICK {
            continue;
        }
        last_tick = Instant::now();

        for peer in engine.peers.snapshot().values() {
            if peer.needs_rekey() {
                trace!(peer = %u32_to_addr(peer.virtual_ip()), "rekey due");
                peer.mark_handshake_pending();
                send_handshake_init(engine, peer);
            }
            // Keepalives require a known endpoint.
            if peer.endpoint().is_some() && peer.needs_keepalive() {
                send_keepalive(engine, peer);
            }
        }
    }
    Ok(())
}

/// Single-threaded consumer of the handshake queue.
pub(crate) fn handshake_worker(engine: &Engine) -> Result<()> {
    debug!("handshake worker started");
    loop {
        let request = match engine.handshake_rx.recv_timeout(NAP) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => {
                if engine.closed() {
                    return Ok(());
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        process_handshake(engine, &request);
    }
}

/// Derive and install a session key from a handshake packet, then handle
/// endpoint discovery and route promotion.
fn process_handshake(engine: &Engine, request: &HandshakeRequest) {
    let Ok(handshake) = wire::parse_handshake(&request.packet) else {
        EngineStats::bump(&engine.stats.malformed);
        return;
    };
    let Some(peer) = engine.peers.get(handshake.sender_vip) else {
        EngineStats::bump(&engine.stats.unknown_peer);
        return;
    };
    let Ok(shared) = engine.identity.shared_secret(handshake.public_key) else {
        EngineStats::bump(&engine.stats.malformed);
        return;
    };

    let key = kdf::derive_session_key(&shared, kdf::labels::SESSION_V1);
    peer.install_session_key(SessionCipher::new(key));
    EngineStats::bump(&engine.stats.handshakes_completed);

    // First discovery or a moved endpoint: record it and promote the exact
    // /32 so traffic leaves any lighthouse-relayed prefix for the direct
    // path.
    if peer.set_endpoint(request.addr) {
        promote_peer_route(engine, &peer);
        info!(
            peer = %u32_to_addr(handshake.sender_vip),
            endpoint = %request.addr,
            "handshake complete; direct path established"
        );
    } else {
        debug!(peer = %u32_to_addr(handshake.sender_vip), "session key renewed");
    }

    if handshake.msg_type == wire::MSG_HANDSHAKE_INIT {
        send_handshake_resp(engine, request.addr, request.sock_idx);
    }
}

/// Re-install the peer's `/32` in the router, making the direct path the
/// longest match.
fn promote_peer_route(engine: &Engine, peer: &Arc<Peer>) {
    engine.router.insert(peer.virtual_ip(), 32, Arc::clone(peer));
}

/// Send a handshake init to the peer's recorded endpoint, attaching any
/// cached cookie.
pub(crate) fn send_handshake_init(engine: &Engine, peer: &Peer) {
    let Some(endpoint) = peer.endpoint() else {
        return;
    };
    send_handshake_to(engine, peer, endpoint);
}

/// Send a handshake init to an explicit address (peer-update hole punch
/// aims at the advertised endpoint, not the recorded one).
pub(crate) fn send_handshake_to(engine: &Engine, peer: &Peer, endpoint: SocketAddr) {
    let cookie = peer.cookie();
    let public_key = engine.identity.public_bytes();

    let mut packet = [0u8; wire::HANDSHAKE_FULL_SIZE];
    let Ok(len) = wire::encode_handshake(
        &mut packet,
        wire::MSG_HANDSHAKE_INIT,
        engine.local_vip,
        &public_key,
        cookie.as_ref().map(|c| &c[..]),
    ) else {
        return;
    };
    send_control(engine, &packet[..len], endpoint, 0);
}

fn send_handshake_resp(engine: &Engine, endpoint: SocketAddr, sock_idx: usize) {
    let public_key = engine.identity.public_bytes();
    let mut packet = [0u8; wire::HANDSHAKE_BASE_SIZE];
    let Ok(len) = wire::encode_handshake(
        &mut packet,
        wire::MSG_HANDSHAKE_RESP,
        engine.local_vip,
        &public_key,
        None,
    ) else {
        return;
    };
    send_control(engine, &packet[..len], endpoint, sock_idx);
}

/// Hand a minted cookie back to a rate-limited initiator.
pub(crate) fn send_cookie_reply(engine: &Engine, endpoint: SocketAddr, cookie: &[u8], sock_idx: usize) {
    let mut packet = [0u8; wire::COOKIE_REPLY_SIZE];
    let Ok(len) = wire::encode_cookie_reply(&mut packet, cookie) else {
        return;
    };
    send_control(engine, &packet[..len], endpoint, sock_idx);
}

/// Advertise `target_vip`'s endpoint to another mesh member.
pub(crate) fn send_peer_update(
    engine: &Engine,
    to: SocketAddr,
    target_vip: u32,
    endpoint: SocketAddrV4,
) {
    let mut packet = [0u8; wire::PEER_UPDATE_SIZE];
    let Ok(len) = wire::encode_peer_update(&mut packet, target_vip, endpoint) else {
        return;
    };
    trace!(about = %u32_to_addr(target_vip), %endpoint, %to, "emitting peer update");
    send_control(engine, &packet[..len], to, 0);
}

/// Encrypted zero-length data frame through the normal TX batch path; a
/// full queue silently drops it, the next tick retries.
fn send_keepalive(engine: &Engine, peer: &Peer) {
    let (Some(endpoint), Some(cipher)) = (peer.endpoint(), peer.current_cipher()) else {
        return;
    };
    let pool = buffer_pool::global();
    let mut buf = pool.acquire();

    let nonce = engine.next_nonce();
    if wire::encode_data_header(&mut buf, engine.local_vip, &nonce).is_err() {
        pool.release(buf);
        return;
    }
    let tag = match cipher.seal_in_place(&nonce, &mut buf[wire::HEADER_SIZE..wire::HEADER_SIZE]) {
        Ok(tag) => tag,
        Err(_) => {
            pool.release(buf);
            return;
        }
    };
    buf[wire::HEADER_SIZE..wire::HEADER_SIZE + TAG_SIZE].copy_from_slice(&tag);

    peer.note_sent();
    tx::enqueue_single(engine, buf, wire::HEADER_SIZE + TAG_SIZE, endpoint);
}

fn send_control(engine: &Engine, data: &[u8], endpoint: SocketAddr, sock_idx: usize) {
    let Some(sock) = engine.sockets.get(sock_idx).or_else(|| engine.sockets.first()) else {
        return;
    };
    if let Err(err) = sock.send_to(data, endpoint) {
        debug!(%err, %endpoint, "control send failed");
    }
}
