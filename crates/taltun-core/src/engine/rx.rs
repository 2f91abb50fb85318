//! RX path: UDP batches in, classified, decrypted, routed.
//!
//! Each RX worker owns one SO_REUSEPORT socket and loops on batched reads.
//! Control traffic (handshakes, cookies, peer updates) is handled or queued
//! immediately; data traffic is decrypted into a pooled buffer with TUN
//! headroom, replay-checked, and routed: delivered to the local TUN batch,
//! re-encrypted and relayed to another peer, or passed to the TUN as the
//! gateway fallback.
//!
//! Buffer discipline: `process_packet` takes ownership of the UDP buffer
//! and every path through it either releases that buffer or hands it to a
//! structure that will (the TUN batcher, the TX queue).

use super::{control, tx, Engine, EngineStats, EntryCache, HANDSHAKE_HIGH_WATER, TUN_HEADROOM};
use crate::batch::BATCH_SIZE;
use crate::buffer_pool::{self, BUFFER_SIZE};
use crate::error::Result;
use crate::ipv4;
use crate::wire;
use std::net::SocketAddr;
use std::sync::Arc;
use taltun_crypto::aead::TAG_SIZE;
use taltun_net::RecvMeta;
use tracing::{debug, trace};

/// Decrypted packets accumulated for one batched TUN write.
struct TunBatcher {
    entries: Vec<(Vec<u8>, usize)>,
}

impl TunBatcher {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(BATCH_SIZE),
        }
    }

    fn add(&mut self, buf: Vec<u8>, payload_len: usize) {
        self.entries.push((buf, payload_len));
    }

    /// Write the accumulated packets to the TUN device and return every
    /// buffer to the pool.
    fn flush(&mut self, engine: &Engine) {
        if self.entries.is_empty() {
            return;
        }
        if let Some(tun) = engine.tun.as_deref() {
            let packets: Vec<&[u8]> = self
                .entries
                .iter()
                .map(|(buf, len)| &buf[..TUN_HEADROOM + len])
                .collect();
            if let Err(err) = tun.write_batch(&packets, TUN_HEADROOM) {
                debug!(%err, "TUN batch write failed");
            }
        }
        let pool = buffer_pool::global();
        for (buf, _) in self.entries.drain(..) {
            pool.release(buf);
        }
    }
}

/// One RX worker: read a UDP batch, process each packet, flush TUN writes.
pub(crate) fn rx_worker(engine: &Engine, sock_idx: usize) -> Result<()> {
    let sock = Arc::clone(&engine.sockets[sock_idx]);
    let pool = buffer_pool::global();

    let mut bufs: Vec<Vec<u8>> = (0..BATCH_SIZE).map(|_| pool.acquire()).collect();
    let mut metas = vec![RecvMeta::default(); BATCH_SIZE];
    let mut cache = EntryCache::default();
    let mut tun_batch = TunBatcher::new();

    debug!(worker = sock_idx, "RX worker started");
    loop {
        if engine.closed() {
            break;
        }
        let received = match sock.recv_batch(&mut bufs, &mut metas) {
            Ok(n) => n,
            Err(err) => {
                // A read error racing socket teardown is a clean exit.
                if engine.closed() {
                    break;
                }
                return Err(err.into());
            }
        };

        for i in 0..received {
            let len = metas[i].len;
            let addr = metas[i].addr;
            let buf = std::mem::replace(&mut bufs[i], pool.acquire());
            process_packet(engine, buf, len, addr, sock_idx, &mut cache, &mut tun_batch);
        }
        tun_batch.flush(engine);
    }

    for buf in bufs {
        pool.release(buf);
    }
    Ok(())
}

/// Classify and handle one received datagram. Owns `buf`.
fn process_packet(
    engine: &Engine,
    buf: Vec<u8>,
    len: usize,
    src: SocketAddr,
    sock_idx: usize,
    cache: &mut EntryCache,
    tun_batch: &mut TunBatcher,
) {
    let pool = buffer_pool::global();
    if len == 0 || len > buf.len() {
        EngineStats::bump(&engine.stats.malformed);
        pool.release(buf);
        return;
    }

    match buf[0] {
        wire::MSG_HANDSHAKE_INIT | wire::MSG_HANDSHAKE_RESP => {
            handle_handshake_packet(engine, buf, len, src, sock_idx);
        }
        wire::MSG_COOKIE_REPLY => handle_cookie_reply(engine, buf, len, src),
        wire::MSG_PEER_UPDATE => handle_peer_update(engine, buf, len),
        wire::MSG_DATA => handle_data(engine, buf, len, src, cache, tun_batch),
        _ => {
            EngineStats::bump(&engine.stats.malformed);
            pool.release(buf);
        }
    }
}

/// Handshake packets: under queue pressure, demand a valid cookie before
/// spending queue space; otherwise copy the packet off the pooled buffer
/// and enqueue it for the handshake worker.
fn handle_handshake_packet(
    engine: &Engine,
    buf: Vec<u8>,
    len: usize,
    src: SocketAddr,
    sock_idx: usize,
) {
    let pool = buffer_pool::global();
    let Ok(handshake) = wire::parse_handshake(&buf[..len]) else {
        EngineStats::bump(&engine.stats.malformed);
        pool.release(buf);
        return;
    };

    let under_load = engine.handshake_tx.len() >= HANDSHAKE_HIGH_WATER;
    if under_load {
        let valid = handshake
            .cookie
            .is_some_and(|cookie| engine.cookies.validate(src.ip(), cookie));
        if !valid {
            let cookie = engine.cookies.generate(src.ip());
            control::send_cookie_reply(engine, src, &cookie, sock_idx);
            EngineStats::bump(&engine.stats.cookies_sent);
            pool.release(buf);
            return;
        }
    }

    // Copy breaks the pool-buffer ownership before crossing the queue.
    let packet = buf[..len].to_vec();
    pool.release(buf);

    if engine
        .handshake_tx
        .try_send(super::HandshakeRequest {
            addr: src,
            packet,
            sock_idx,
        })
        .is_err()
    {
        engine.note_backpressure();
    }
}

/// A cookie came back: find the peer we sent the init to (by endpoint),
/// cache the cookie, and retry the handshake carrying it.
fn handle_cookie_reply(engine: &Engine, buf: Vec<u8>, len: usize, src: SocketAddr) {
    let pool = buffer_pool::global();
    match wire::parse_cookie_reply(&buf[..len]) {
        Ok(cookie) => {
            let snapshot = engine.peers.snapshot();
            if let Some(peer) = snapshot.values().find(|p| p.endpoint() == Some(src)) {
                trace!(peer = %crate::ipv4::u32_to_addr(peer.virtual_ip()), "cookie received");
                peer.set_cookie(cookie);
                control::send_handshake_init(engine, peer);
            }
        }
        Err(_) => EngineStats::bump(&engine.stats.malformed),
    }
    pool.release(buf);
}

/// Lighthouse told us where a peer lives: hole-punch by sending a handshake
/// init straight to the advertised endpoint.
fn handle_peer_update(engine: &Engine, buf: Vec<u8>, len: usize) {
    let pool = buffer_pool::global();
    match wire::parse_peer_update(&buf[..len]) {
        Ok(update) => {
            if let Some(peer) = engine.peers.get(update.target_vip) {
                debug!(
                    peer = %crate::ipv4::u32_to_addr(update.target_vip),
                    endpoint = %update.endpoint,
                    "peer update received; dialing advertised endpoint"
                );
                control::send_handshake_to(engine, &peer, SocketAddr::V4(update.endpoint));
            }
        }
        Err(_) => EngineStats::bump(&engine.stats.malformed),
    }
    pool.release(buf);
}

/// The data hot path.
fn handle_data(
    engine: &Engine,
    buf: Vec<u8>,
    len: usize,
    src: SocketAddr,
    cache: &mut EntryCache,
    tun_batch: &mut TunBatcher,
) {
    let pool = buffer_pool::global();
    let Ok(packet) = wire::parse_data(&buf[..len]) else {
        EngineStats::bump(&engine.stats.malformed);
        pool.release(buf);
        return;
    };

    let sender_vip = packet.sender_vip;
    let Some(peer) = cache.get(sender_vip, || engine.peers.get(sender_vip)) else {
        EngineStats::bump(&engine.stats.unknown_peer);
        pool.release(buf);
        return;
    };

    let ciphertext = packet.ciphertext;
    if ciphertext.len() < TAG_SIZE || TUN_HEADROOM + ciphertext.len() > BUFFER_SIZE {
        EngineStats::bump(&engine.stats.malformed);
        pool.release(buf);
        return;
    }
    let plaintext_len = ciphertext.len() - TAG_SIZE;
    let counter = packet.counter();

    // Decrypt into a fresh pooled buffer, leaving TUN headroom in front.
    let mut plaintext_buf = pool.acquire();
    if peer
        .open_into(
            packet.nonce,
            ciphertext,
            &mut plaintext_buf[TUN_HEADROOM..TUN_HEADROOM + plaintext_len],
        )
        .is_err()
    {
        EngineStats::bump(&engine.stats.auth_failed);
        pool.release(plaintext_buf);
        pool.release(buf);
        return;
    }
    pool.release(buf);

    // Authenticated from here on. Replay rejection must come before any
    // state change so a replayed packet cannot move the endpoint.
    if !peer.validate_replay(counter) {
        EngineStats::bump(&engine.stats.replay_rejected);
        pool.release(plaintext_buf);
        return;
    }

    // Roaming: an authenticated packet from a new address moves the peer.
    peer.set_endpoint(src);
    peer.note_rx();

    if plaintext_len == 0 {
        // Keepalive.
        pool.release(plaintext_buf);
        return;
    }
    peer.add_bytes_rx(plaintext_len as u64);

    let dst = ipv4::extract_dst_ip(&plaintext_buf[TUN_HEADROOM..TUN_HEADROOM + plaintext_len])
        .unwrap_or(0);

    // Routing decision: local delivery, relay, or gateway fallback.
    if dst == engine.local_vip {
        deliver_local(engine, plaintext_buf, plaintext_len, tun_batch);
        return;
    }
    if let Some(target) = engine.router.lookup(dst) {
        if target.virtual_ip() != peer.virtual_ip() {
            relay(engine, plaintext_buf, plaintext_len, &target, &peer);
            return;
        }
    }
    deliver_local(engine, plaintext_buf, plaintext_len, tun_batch);
}

/// Queue a decrypted packet for the TUN write batch. Lighthouses have no
/// TUN; they only relay and signal, so local delivery drops.
fn deliver_local(engine: &Engine, buf: Vec<u8>, payload_len: usize, tun_batch: &mut TunBatcher) {
    if engine.tun.is_none() {
        EngineStats::bump(&engine.stats.no_tun_drops);
        buffer_pool::global().release(buf);
        return;
    }
    tun_batch.add(buf, payload_len);
}

/// Re-encrypt a decrypted packet for `target` and queue it for TX; then
/// consider signaling both sides so they can punch a direct path.
fn relay(
    engine: &Engine,
    plaintext_buf: Vec<u8>,
    plaintext_len: usize,
    target: &Arc<crate::peer::Peer>,
    from: &Arc<crate::peer::Peer>,
) {
    let pool = buffer_pool::global();
    let (Some(endpoint), Some(cipher)) = (target.endpoint(), target.current_cipher()) else {
        pool.release(plaintext_buf);
        return;
    };

    let mut out = pool.acquire();
    out[wire::HEADER_SIZE..wire::HEADER_SIZE + plaintext_len]
        .copy_from_slice(&plaintext_buf[TUN_HEADROOM..TUN_HEADROOM + plaintext_len]);
    pool.release(plaintext_buf);

    let nonce = engine.next_nonce();
    if wire::encode_data_header(&mut out, engine.local_vip, &nonce).is_err() {
        pool.release(out);
        return;
    }
    let tag = match cipher.seal_in_place(
        &nonce,
        &mut out[wire::HEADER_SIZE..wire::HEADER_SIZE + plaintext_len],
    ) {
        Ok(tag) => tag,
        Err(_) => {
            pool.release(out);
            return;
        }
    };
    let tag_start = wire::HEADER_SIZE + plaintext_len;
    out[tag_start..tag_start + TAG_SIZE].copy_from_slice(&tag);

    target.add_bytes_tx((plaintext_len + TAG_SIZE) as u64);
    tx::enqueue_single(engine, out, tag_start + TAG_SIZE, endpoint);
    EngineStats::bump(&engine.stats.packets_relayed);

    // Signaling: when both endpoints are known, tell each side where the
    // other lives, rate-gated per recipient.
    if let (Some(SocketAddr::V4(from_v4)), SocketAddr::V4(target_v4)) = (from.endpoint(), endpoint)
    {
        if from.should_notify() {
            control::send_peer_update(
                engine,
                SocketAddr::V4(from_v4),
                target.virtual_ip(),
                target_v4,
            );
        }
        if target.should_notify() {
            control::send_peer_update(
                engine,
                SocketAddr::V4(target_v4),
                from.virtual_ip(),
                from_v4,
            );
        }
    }
}
