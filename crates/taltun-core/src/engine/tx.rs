//! TX path: TUN reads encrypted into batches, one worker draining them.
//!
//! The TUN worker reads outbound IP packets with wire-header headroom,
//! resolves the target peer through the LPM router (with a single-entry
//! cache for consecutive same-flow packets), encrypts into a fresh pooled
//! buffer, and accumulates TX batches. The UDP write worker is the queue's
//! only consumer: it sends each batch with one vectorized syscall,
//! round-robining across the socket set, and returns every buffer.

use super::{Engine, EntryCache, TUN_HEADROOM};
use crate::batch::{self, TxBatch, TxRequest, BATCH_SIZE};
use crate::buffer_pool;
use crate::error::Result;
use crate::ipv4;
use crate::wire;
use crossbeam_channel::{RecvTimeoutError, TrySendError};
use std::net::SocketAddr;
use std::time::Duration;
use taltun_crypto::aead::TAG_SIZE;
use tracing::{debug, trace};

/// How long the write worker sleeps between shutdown checks when idle.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// TUN-read/encrypt worker: absent in lighthouse mode.
pub(crate) fn tun_worker(engine: &Engine) -> Result<()> {
    let Some(tun) = engine.tun.clone() else {
        return Ok(());
    };
    let pool = buffer_pool::global();
    let batches = batch::global();

    let mut bufs: Vec<Vec<u8>> = (0..BATCH_SIZE).map(|_| pool.acquire()).collect();
    let mut sizes = vec![0usize; BATCH_SIZE];
    let mut cache = EntryCache::default();
    let mut current = batches.acquire();

    debug!("TUN worker started");
    loop {
        if engine.closed() {
            break;
        }
        let read = match tun.read_batch(&mut bufs, &mut sizes, wire::HEADER_SIZE) {
            Ok(n) => n,
            Err(err) => {
                if engine.closed() {
                    break;
                }
                return Err(err.into());
            }
        };

        for i in 0..read {
            let size = sizes[i];
            if size == 0 {
                continue;
            }
            encrypt_outbound(
                engine,
                &bufs[i][wire::HEADER_SIZE..wire::HEADER_SIZE + size],
                &mut cache,
                &mut current,
            );
            if current.is_full() {
                send_batch_safe(engine, current);
                current = batches.acquire();
            }
        }
        // Partial batches ship after every read burst.
        if !current.is_empty() {
            send_batch_safe(engine, current);
            current = batches.acquire();
        }
    }

    for buf in bufs {
        pool.release(buf);
    }
    current.release_buffers(pool);
    batches.release(current);
    Ok(())
}

/// Encrypt one outbound inner packet and append it to the batch. Packets
/// with no route, no endpoint, or no session are dropped silently; the
/// housekeeper's rekey path is what turns a cold peer warm.
fn encrypt_outbound(engine: &Engine, packet: &[u8], cache: &mut EntryCache, batch: &mut TxBatch) {
    let Some(dst) = ipv4::extract_dst_ip(packet) else {
        return;
    };
    let Some(peer) = cache.get(dst, || engine.router.lookup(dst)) else {
        trace!(dst = %ipv4::u32_to_addr(dst), "no route for outbound packet");
        return;
    };
    let (Some(endpoint), Some(cipher)) = (peer.endpoint(), peer.current_cipher()) else {
        return;
    };

    let pool = buffer_pool::global();
    let mut out = pool.acquire();
    out[wire::HEADER_SIZE..wire::HEADER_SIZE + packet.len()].copy_from_slice(packet);

    let nonce = engine.next_nonce();
    if wire::encode_data_header(&mut out, engine.local_vip, &nonce).is_err() {
        pool.release(out);
        return;
    }
    let tag = match cipher.seal_in_place(
        &nonce,
        &mut out[wire::HEADER_SIZE..wire::HEADER_SIZE + packet.len()],
    ) {
        Ok(tag) => tag,
        Err(_) => {
            pool.release(out);
            return;
        }
    };
    let tag_start = wire::HEADER_SIZE + packet.len();
    out[tag_start..tag_start + TAG_SIZE].copy_from_slice(&tag);

    peer.add_bytes_tx((packet.len() + TAG_SIZE) as u64);
    peer.note_sent();

    batch.push(TxRequest {
        buf: out,
        len: tag_start + TAG_SIZE,
        addr: endpoint,
    });
}

/// Push a batch to the TX queue; on backpressure, every buffer in the batch
/// is returned to the pool and the batch shell recycled.
pub(crate) fn send_batch_safe(engine: &Engine, batch: TxBatch) {
    match engine.tx_queue_tx.try_send(batch) {
        Ok(()) => {}
        Err(TrySendError::Full(mut rejected)) | Err(TrySendError::Disconnected(mut rejected)) => {
            rejected.release_buffers(buffer_pool::global());
            batch::global().release(rejected);
            engine.note_backpressure();
        }
    }
}

/// Queue one already-encrypted packet as a single-request batch (relay and
/// keepalive paths).
pub(crate) fn enqueue_single(engine: &Engine, buf: Vec<u8>, len: usize, addr: SocketAddr) {
    let mut batch = batch::global().acquire();
    batch.push(TxRequest { buf, len, addr });
    send_batch_safe(engine, batch);
}

/// Single consumer of the TX queue: vectorized sends, round-robin sockets.
pub(crate) fn udp_write_worker(engine: &Engine) -> Result<()> {
    let pool = buffer_pool::global();
    let batches = batch::global();
    let mut sock_idx = 0usize;

    debug!("UDP write worker started");
    loop {
        let mut batch = match engine.tx_queue_rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(batch) => batch,
            Err(RecvTimeoutError::Timeout) => {
                if engine.closed() {
                    return Ok(());
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        if batch.is_empty() {
            batches.release(batch);
            continue;
        }

        let sock = &engine.sockets[sock_idx];
        sock_idx = (sock_idx + 1) % engine.sockets.len();

        let packets: Vec<(&[u8], SocketAddr)> = batch
            .requests()
            .iter()
            .map(|req| (&req.buf[..req.len], req.addr))
            .collect();

        match sock.send_batch(&packets) {
            Ok(sent) if sent < packets.len() => {
                debug!(sent, total = packets.len(), "partial batch send");
            }
            Ok(_) => {}
            // Send errors are per-packet losses, not engine failures; UDP
            // loss surfaces as inner loss.
            Err(err) => debug!(%err, "batch send failed"),
        }
        drop(packets);

        batch.release_buffers(pool);
        batches.release(batch);
    }
}
