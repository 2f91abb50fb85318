//! Longest-prefix-match router over virtual IPs.
//!
//! A stride-4 radix trie: each level consumes one nibble of the IPv4
//! address, giving 16-way fan-out and a fixed maximum depth of 8 (a /32).
//! Prefix lengths that are not multiples of 4 terminate at the nearest
//! aligned ancestor; mesh configurations use /24 and /32, which align.
//!
//! Lookups walk the trie without locks or allocations, remembering the last
//! node that carried a peer, so the longest match wins. Inserts clone only
//! the path from the root to the target node and publish the new root
//! atomically, so a reader mid-walk keeps a consistent old tree and the
//! next load observes the new one.

use crate::peer::Peer;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

const FAN_OUT: usize = 16;
const MAX_DEPTH: usize = 8;

#[derive(Clone, Default)]
struct TrieNode {
    children: [Option<Arc<TrieNode>>; FAN_OUT],
    peer: Option<Arc<Peer>>,
}

/// Copy-on-write LPM trie mapping IPv4 prefixes to peers.
pub struct Router {
    root: ArcSwap<TrieNode>,
    write_lock: Mutex<()>,
}

impl Router {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(TrieNode::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Install `prefix/prefix_len → peer`, replacing any previous peer at
    /// that exact prefix. `prefix_len` is clamped to 32 and truncated down
    /// to the nearest multiple of 4.
    pub fn insert(&self, prefix: u32, prefix_len: u8, peer: Arc<Peer>) {
        let depth = (usize::from(prefix_len.min(32)) / 4).min(MAX_DEPTH);

        let _guard = self.write_lock.lock();
        let old_root = self.root.load_full();
        let new_root = insert_path(&old_root, prefix, depth, 0, peer);
        self.root.store(Arc::new(new_root));
    }

    /// Longest-prefix match for `ip`. Lock-free and allocation-free.
    #[must_use]
    pub fn lookup(&self, ip: u32) -> Option<Arc<Peer>> {
        let root = self.root.load();
        let mut node: &TrieNode = &root;
        let mut best: Option<&Arc<Peer>> = node.peer.as_ref();

        for level in 0..MAX_DEPTH {
            let nibble = nibble_at(ip, level);
            match node.children[nibble].as_deref() {
                Some(child) => {
                    node = child;
                    if node.peer.is_some() {
                        best = node.peer.as_ref();
                    }
                }
                None => break,
            }
        }
        best.cloned()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Nibble of `ip` consumed at trie `level`, most significant first.
fn nibble_at(ip: u32, level: usize) -> usize {
    ((ip >> (28 - 4 * level)) & 0xF) as usize
}

/// Clone the path from `node` towards the target depth, attaching `peer` at
/// the final node. Untouched subtrees are shared with the old tree.
fn insert_path(node: &TrieNode, prefix: u32, depth: usize, level: usize, peer: Arc<Peer>) -> TrieNode {
    let mut copy = node.clone();
    if level == depth {
        copy.peer = Some(peer);
        return copy;
    }

    let nibble = nibble_at(prefix, level);
    let child = match node.children[nibble].as_deref() {
        Some(child) => insert_path(child, prefix, depth, level + 1, peer),
        None => insert_path(&TrieNode::default(), prefix, depth, level + 1, peer),
    };
    copy.children[nibble] = Some(Arc::new(child));
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::addr_to_u32;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> u32 {
        addr_to_u32(s.parse::<Ipv4Addr>().unwrap())
    }

    fn peer(vip: u32) -> Arc<Peer> {
        Arc::new(Peer::new(vip, None))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = Router::new();
        let a = peer(1);
        let b = peer(2);

        router.insert(ip("10.0.0.0"), 24, Arc::clone(&a));
        router.insert(ip("10.0.0.5"), 32, Arc::clone(&b));

        assert_eq!(router.lookup(ip("10.0.0.5")).unwrap().virtual_ip(), 2);
        assert_eq!(router.lookup(ip("10.0.0.9")).unwrap().virtual_ip(), 1);
        assert!(router.lookup(ip("10.1.0.1")).is_none());
    }

    #[test]
    fn test_exact_slash32_only() {
        let router = Router::new();
        router.insert(ip("192.168.1.7"), 32, peer(7));

        assert!(router.lookup(ip("192.168.1.7")).is_some());
        assert!(router.lookup(ip("192.168.1.8")).is_none());
    }

    #[test]
    fn test_insert_replaces_at_same_prefix() {
        let router = Router::new();
        router.insert(ip("10.0.0.0"), 24, peer(1));
        router.insert(ip("10.0.0.0"), 24, peer(2));
        assert_eq!(router.lookup(ip("10.0.0.1")).unwrap().virtual_ip(), 2);
    }

    #[test]
    fn test_unaligned_prefix_truncates() {
        let router = Router::new();
        // /30 terminates at the /28 ancestor, widening the match.
        router.insert(ip("10.0.0.4"), 30, peer(1));
        assert!(router.lookup(ip("10.0.0.15")).is_some());
        assert!(router.lookup(ip("10.0.0.16")).is_none());
    }

    #[test]
    fn test_default_route() {
        let router = Router::new();
        router.insert(0, 0, peer(99));
        assert_eq!(router.lookup(ip("8.8.8.8")).unwrap().virtual_ip(), 99);
    }

    #[test]
    fn test_old_snapshot_survives_insert() {
        let router = Router::new();
        router.insert(ip("10.0.0.0"), 24, peer(1));

        // Hold a guard across a concurrent insert; the walk stays valid.
        let before = router.lookup(ip("10.0.0.1")).unwrap();
        router.insert(ip("10.0.0.0"), 24, peer(2));
        assert_eq!(before.virtual_ip(), 1);
        assert_eq!(router.lookup(ip("10.0.0.1")).unwrap().virtual_ip(), 2);
    }

    #[test]
    fn test_disjoint_prefixes() {
        let router = Router::new();
        router.insert(ip("10.0.0.0"), 8, peer(1));
        router.insert(ip("172.16.0.0"), 12, peer(2));
        router.insert(ip("192.168.0.0"), 16, peer(3));

        assert_eq!(router.lookup(ip("10.200.1.1")).unwrap().virtual_ip(), 1);
        assert_eq!(router.lookup(ip("172.16.5.5")).unwrap().virtual_ip(), 2);
        assert_eq!(router.lookup(ip("192.168.9.9")).unwrap().virtual_ip(), 3);
        assert!(router.lookup(ip("8.8.8.8")).is_none());
    }
}
