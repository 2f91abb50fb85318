//! End-to-end pipeline tests: real engines over loopback UDP sockets, with
//! an in-memory TUN standing in for the kernel device.
//!
//! These run the full worker set (RX, TUN, TX, housekeeper, handshake)
//! and exercise handshakes, data delivery, lighthouse relay, and
//! peer-update-driven path promotion across two and three live engines.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taltun_core::config::{EngineConfig, Mode, PeerSetup};
use taltun_core::device::TunIo;
use taltun_core::Engine;
use taltun_net::UdpBatchSocket;

/// In-memory TUN: the test injects "kernel" packets and reads deliveries.
struct MemoryTun {
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
}

impl MemoryTun {
    fn new() -> (Arc<Self>, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let (inject_tx, inject_rx) = bounded(256);
        let (deliver_tx, deliver_rx) = bounded(256);
        (
            Arc::new(Self {
                inbound: inject_rx,
                outbound: deliver_tx,
            }),
            inject_tx,
            deliver_rx,
        )
    }
}

impl TunIo for MemoryTun {
    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        let first = match self.inbound.recv_timeout(Duration::from_millis(50)) {
            Ok(packet) => packet,
            Err(_) => return Ok(0),
        };

        let mut pending = Some(first);
        let mut filled = 0;
        while filled < bufs.len().min(sizes.len()) {
            let packet = match pending.take() {
                Some(packet) => packet,
                None => match self.inbound.try_recv() {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
            };
            bufs[filled][offset..offset + packet.len()].copy_from_slice(&packet);
            sizes[filled] = packet.len();
            filled += 1;
        }
        Ok(filled)
    }

    fn write_batch(&self, packets: &[&[u8]], offset: usize) -> io::Result<usize> {
        for packet in packets {
            let _ = self.outbound.send(packet[offset..].to_vec());
        }
        Ok(packets.len())
    }
}

struct TestNode {
    engine: Arc<Engine>,
    inject: Sender<Vec<u8>>,
    delivered: Receiver<Vec<u8>>,
    addr: SocketAddr,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.engine.close();
    }
}

fn bind_loopback() -> (Arc<UdpBatchSocket>, SocketAddr) {
    let sock = Arc::new(UdpBatchSocket::bind_reuseport("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

fn peer(vip: &str, endpoint: Option<SocketAddr>, allowed_ips: &[&str]) -> PeerSetup {
    PeerSetup {
        vip: vip.parse().unwrap(),
        endpoint,
        allowed_ips: allowed_ips.iter().map(|s| s.parse().unwrap()).collect(),
    }
}

fn start_node(
    mode: Mode,
    vip: &str,
    secret_key: [u8; 32],
    peers: &[PeerSetup],
    sock: Arc<UdpBatchSocket>,
    addr: SocketAddr,
) -> TestNode {
    let cfg = EngineConfig {
        mode,
        local_bind: addr,
        tun_name: String::from("unused"),
        mtu: 1420,
        secret_key,
        local_vip: vip.parse().unwrap(),
        routes: Vec::new(),
        debug: true,
    };

    let mut engine = Engine::new(cfg).unwrap();
    for setup in peers {
        engine.add_peer(setup).unwrap();
    }

    let (tun, inject, delivered) = MemoryTun::new();
    let tun: Option<Arc<dyn TunIo>> = if mode.has_tun() { Some(tun) } else { None };
    engine.initialize_with(vec![sock], tun);

    let engine = Arc::new(engine);
    let runner = Arc::clone(&engine);
    std::thread::spawn(move || runner.run());

    TestNode {
        engine,
        inject,
        delivered,
        addr,
    }
}

/// Minimal IPv4 packet with the given addresses and payload.
fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP, nominally
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

fn recv_delivery(node: &TestNode, timeout: Duration) -> Option<Vec<u8>> {
    node.delivered.recv_timeout(timeout).ok()
}

fn vip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[test]
fn test_handshake_and_data_delivery() {
    let (sock_x, addr_x) = bind_loopback();
    let (sock_y, addr_y) = bind_loopback();

    // X knows Y's endpoint; Y learns X's from the handshake.
    let x = start_node(
        Mode::Client,
        "10.0.0.2",
        [2u8; 32],
        &[peer("10.0.0.1", Some(addr_y), &[])],
        sock_x,
        addr_x,
    );
    let y = start_node(
        Mode::Server,
        "10.0.0.1",
        [3u8; 32],
        &[peer("10.0.0.2", None, &[])],
        sock_y,
        addr_y,
    );

    wait_for("mutual handshake", Duration::from_secs(5), || {
        x.engine.peer(vip("10.0.0.1")).unwrap().has_session()
            && y.engine.peer(vip("10.0.0.2")).unwrap().has_session()
    });

    // Y must have learned X's real source address.
    wait_for("endpoint discovery", Duration::from_secs(5), || {
        y.engine.peer(vip("10.0.0.2")).unwrap().endpoint() == Some(x.addr)
    });

    // A 100-byte inner packet from X arrives at Y's TUN byte-identical.
    let payload = vec![0x5Au8; 80];
    let packet = ip_packet(vip("10.0.0.2"), vip("10.0.0.1"), &payload);
    assert_eq!(packet.len(), 100);
    x.inject.send(packet.clone()).unwrap();

    let delivered = recv_delivery(&y, Duration::from_secs(5)).expect("packet at Y's TUN");
    assert_eq!(delivered, packet);

    // And the reverse direction works over the discovered endpoint.
    let reply = ip_packet(vip("10.0.0.1"), vip("10.0.0.2"), b"pong");
    y.inject.send(reply.clone()).unwrap();
    let delivered = recv_delivery(&x, Duration::from_secs(5)).expect("reply at X's TUN");
    assert_eq!(delivered, reply);

    let x_peer = x.engine.peer(vip("10.0.0.1")).unwrap();
    assert!(x_peer.bytes_tx() > 0);
    assert!(x_peer.bytes_rx() > 0);
}

/// A forwarding wiretap between one client and a backend engine. Forwards
/// both directions; when `divert` is set, non-keepalive DATA packets from
/// the client are captured on `tap` instead of being forwarded.
struct Wiretap {
    front_addr: SocketAddr,
    tap: Receiver<Vec<u8>>,
    divert: Arc<std::sync::atomic::AtomicBool>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl Drop for Wiretap {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

fn start_wiretap(backend: SocketAddr) -> Wiretap {
    use std::sync::atomic::{AtomicBool, Ordering};

    let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let front_addr = sock.local_addr().unwrap();

    let (tap_tx, tap_rx) = bounded(64);
    let divert = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let divert_flag = Arc::clone(&divert);
    let stop_flag = Arc::clone(&stop);
    std::thread::spawn(move || {
        let mut client: Option<SocketAddr> = None;
        let mut buf = [0u8; 2048];
        while !stop_flag.load(Ordering::SeqCst) {
            let (len, src) = match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => continue,
            };
            if src == backend {
                if let Some(client) = client {
                    let _ = sock.send_to(&buf[..len], client);
                }
            } else {
                client = Some(src);
                // A keepalive is exactly header + tag (33 bytes); anything
                // longer carries payload worth capturing.
                if divert_flag.load(Ordering::SeqCst) && buf[0] == 0x03 && len > 33 {
                    let _ = tap_tx.send(buf[..len].to_vec());
                } else {
                    let _ = sock.send_to(&buf[..len], backend);
                }
            }
        }
    });

    Wiretap {
        front_addr,
        tap: tap_rx,
        divert,
        stop,
    }
}

#[test]
fn test_roaming_and_replay_protection() {
    use std::sync::atomic::Ordering;

    let (sock_x, addr_x) = bind_loopback();
    let (sock_y, addr_y) = bind_loopback();
    let tap = start_wiretap(addr_y);

    // X dials Y through the wiretap, so Y first records the tap's address
    // as X's endpoint.
    let x = start_node(
        Mode::Client,
        "10.0.1.2",
        [4u8; 32],
        &[peer("10.0.1.1", Some(tap.front_addr), &[])],
        sock_x,
        addr_x,
    );
    let y = start_node(
        Mode::Server,
        "10.0.1.1",
        [5u8; 32],
        &[peer("10.0.1.2", None, &[])],
        sock_y,
        addr_y,
    );

    wait_for("mutual handshake", Duration::from_secs(5), || {
        x.engine.peer(vip("10.0.1.1")).unwrap().has_session()
            && y.engine.peer(vip("10.0.1.2")).unwrap().has_session()
    });
    assert_eq!(
        y.engine.peer(vip("10.0.1.2")).unwrap().endpoint(),
        Some(tap.front_addr)
    );

    let first = ip_packet(vip("10.0.1.2"), vip("10.0.1.1"), b"through the tap");
    x.inject.send(first.clone()).unwrap();
    assert_eq!(
        recv_delivery(&y, Duration::from_secs(5)).expect("forwarded delivery"),
        first
    );

    // Capture the next encrypted frame instead of forwarding it.
    tap.divert.store(true, Ordering::SeqCst);
    let second = ip_packet(vip("10.0.1.2"), vip("10.0.1.1"), b"roaming frame");
    x.inject.send(second.clone()).unwrap();
    let wire = tap.tap.recv_timeout(Duration::from_secs(5)).expect("captured frame");

    // Roaming: the same authenticated frame arriving from a brand-new
    // source address must be delivered and must move the recorded endpoint.
    let roamed = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    roamed.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let roamed_addr = roamed.local_addr().unwrap();
    roamed.send_to(&wire, addr_y).unwrap();

    assert_eq!(
        recv_delivery(&y, Duration::from_secs(5)).expect("roamed delivery"),
        second
    );
    wait_for("endpoint moved to roamed address", Duration::from_secs(5), || {
        y.engine.peer(vip("10.0.1.2")).unwrap().endpoint() == Some(roamed_addr)
    });

    // Subsequent TX from Y targets the new endpoint.
    let reply = ip_packet(vip("10.0.1.1"), vip("10.0.1.2"), b"to the new place");
    y.inject.send(reply).unwrap();
    let mut buf = [0u8; 2048];
    let (_, reply_src) = roamed.recv_from(&mut buf).expect("reply at roamed address");
    assert_eq!(reply_src, addr_y);

    // Replaying the identical frame from yet another address must be
    // rejected and must not move the endpoint.
    let replayer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    replayer.send_to(&wire, addr_y).unwrap();

    wait_for("replay rejected", Duration::from_secs(5), || {
        y.engine.stats().replay_rejected() >= 1
    });
    assert_eq!(
        y.engine.peer(vip("10.0.1.2")).unwrap().endpoint(),
        Some(roamed_addr),
        "replay must not update the endpoint"
    );
    match y.delivered.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("replayed frame leaked to TUN: {other:?}"),
    }
}

#[test]
fn test_lighthouse_relay_and_direct_path_promotion() {
    let (sock_a, addr_a) = bind_loopback();
    let (sock_l, addr_l) = bind_loopback();
    let (sock_c, addr_c) = bind_loopback();

    // A and C know only the lighthouse's endpoint. Each routes the other's
    // /32 through L (the later `allowed_ips` insert overrides the direct
    // /32 installed when the peer itself was added).
    let a = start_node(
        Mode::Client,
        "10.0.2.2",
        [6u8; 32],
        &[
            peer("10.0.2.3", None, &[]),
            peer("10.0.2.1", Some(addr_l), &["10.0.2.3/32"]),
        ],
        sock_a,
        addr_a,
    );
    let l = start_node(
        Mode::Lighthouse,
        "10.0.2.1",
        [7u8; 32],
        &[peer("10.0.2.2", None, &[]), peer("10.0.2.3", None, &[])],
        sock_l,
        addr_l,
    );
    let c = start_node(
        Mode::Client,
        "10.0.2.3",
        [8u8; 32],
        &[
            peer("10.0.2.2", None, &[]),
            peer("10.0.2.1", Some(addr_l), &["10.0.2.2/32"]),
        ],
        sock_c,
        addr_c,
    );

    // Both clients dial the lighthouse at startup.
    wait_for("sessions with lighthouse", Duration::from_secs(5), || {
        l.engine.peer(vip("10.0.2.2")).unwrap().has_session()
            && l.engine.peer(vip("10.0.2.3")).unwrap().has_session()
    });

    // A → C travels through L's relay path.
    let packet = ip_packet(vip("10.0.2.2"), vip("10.0.2.3"), b"via lighthouse");
    a.inject.send(packet.clone()).unwrap();
    let delivered = recv_delivery(&c, Duration::from_secs(5)).expect("relayed packet at C");
    assert_eq!(delivered, packet);
    assert!(l.engine.stats().packets_relayed() >= 1);

    // The relay emitted peer updates; both sides hole-punch and complete a
    // direct handshake, learning each other's true endpoints.
    wait_for("direct path promotion", Duration::from_secs(10), || {
        a.engine.peer(vip("10.0.2.3")).unwrap().endpoint() == Some(c.addr)
            && c.engine.peer(vip("10.0.2.2")).unwrap().endpoint() == Some(a.addr)
    });
    assert!(a.engine.peer(vip("10.0.2.3")).unwrap().has_session());
    assert!(c.engine.peer(vip("10.0.2.2")).unwrap().has_session());

    // Traffic now flows directly: the lighthouse's relay counter stops
    // moving while packets keep arriving.
    let relayed_before = l.engine.stats().packets_relayed();
    for i in 0..5 {
        let direct = ip_packet(vip("10.0.2.2"), vip("10.0.2.3"), &[i; 16]);
        a.inject.send(direct.clone()).unwrap();
        let delivered = recv_delivery(&c, Duration::from_secs(5)).expect("direct packet at C");
        assert_eq!(delivered, direct);
    }
    assert_eq!(l.engine.stats().packets_relayed(), relayed_before);

    // Lighthouse local delivery drops silently: packets addressed to the
    // lighthouse's own VIP have no TUN to land on.
    let to_l = ip_packet(vip("10.0.2.2"), vip("10.0.2.1"), b"no tun there");
    a.inject.send(to_l).unwrap();
    wait_for("lighthouse drop counted", Duration::from_secs(5), || {
        l.engine.stats().no_tun_drops() >= 1
    });
}

#[test]
fn test_keepalives_hold_session_quietly() {
    let (sock_x, addr_x) = bind_loopback();
    let (sock_y, addr_y) = bind_loopback();

    let x = start_node(
        Mode::Client,
        "10.0.3.2",
        [9u8; 32],
        &[peer("10.0.3.1", Some(addr_y), &[])],
        sock_x,
        addr_x,
    );
    let y = start_node(
        Mode::Server,
        "10.0.3.1",
        [10u8; 32],
        &[peer("10.0.3.2", None, &[])],
        sock_y,
        addr_y,
    );

    wait_for("mutual handshake", Duration::from_secs(5), || {
        x.engine.peer(vip("10.0.3.1")).unwrap().has_session()
            && y.engine.peer(vip("10.0.3.2")).unwrap().has_session()
    });

    // Idle past the keepalive timeout: the housekeeper sends encrypted
    // empty frames. They must authenticate and vanish without a delivery.
    std::thread::sleep(Duration::from_secs(12));

    assert_eq!(y.engine.stats().auth_failed(), 0);
    assert_eq!(y.engine.stats().malformed(), 0);
    assert_eq!(y.engine.stats().replay_rejected(), 0);
    match y.delivered.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("keepalive leaked to TUN: {other:?}"),
    }

    // The session still works afterwards.
    let packet = ip_packet(vip("10.0.3.2"), vip("10.0.3.1"), b"still alive");
    x.inject.send(packet.clone()).unwrap();
    let delivered = recv_delivery(&y, Duration::from_secs(5)).expect("post-idle delivery");
    assert_eq!(delivered, packet);
}
