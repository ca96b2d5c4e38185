//! Sorted MAC-to-peer table (spec §4.3, §3), grounded on `peer.c`'s
//! `fastd_eth_addr_add`/`fastd_eth_addr_cleanup`, with the insertion
//! off-by-one from the C source corrected (`i > min`, not `i > min+1`).

use crate::peer::PeerId;

pub type Millis = u64;
pub type Mac = [u8; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    mac: Mac,
    peer: PeerId,
    last_seen: Millis,
}

/// Binary-search-ordered array of learned MAC addresses.
#[derive(Default)]
pub struct MacTable {
    entries: Vec<Entry>,
}

impl MacTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, mac: &Mac) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.mac.cmp(mac))
    }

    pub fn find(&self, mac: &Mac) -> Option<PeerId> {
        self.search(mac).ok().map(|i| self.entries[i].peer)
    }

    /// Learn `mac -> peer`: on hit, overwrite peer and last-seen; on miss,
    /// insert keeping the array sorted.
    pub fn add(&mut self, mac: Mac, peer: PeerId, now: Millis) {
        match self.search(&mac) {
            Ok(i) => {
                self.entries[i].peer = peer;
                self.entries[i].last_seen = now;
            }
            Err(min) => {
                self.entries.insert(
                    min,
                    Entry {
                        mac,
                        peer,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Remove every mapping pointing at `peer` (used when a peer is reset
    /// or deleted).
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.entries.retain(|e| e.peer != peer);
    }

    /// Repoint every mapping pointing at `from` to `to` (used on merge).
    pub fn rewrite_peer(&mut self, from: PeerId, to: PeerId) {
        for e in &mut self.entries {
            if e.peer == from {
                e.peer = to;
            }
        }
    }

    /// Drop entries not seen within `stale_time` of `now`.
    pub fn cleanup(&mut self, now: Millis, stale_time: Millis) {
        self.entries
            .retain(|e| now.saturating_sub(e.last_seen) <= stale_time);
    }

    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].mac < w[1].mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> Mac {
        [0, 0, 0, 0, 0, b]
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let mut t = MacTable::new();
        let p = PeerId::from_raw(1, 0);
        for b in [5, 1, 9, 3, 7] {
            t.add(mac(b), p, 0);
        }
        assert!(t.is_sorted());
        assert_eq!(t.len(), 5);
        for b in [5, 1, 9, 3, 7] {
            assert_eq!(t.find(&mac(b)), Some(p));
        }
    }

    #[test]
    fn learning_same_mac_overwrites_peer_and_timestamp() {
        let mut t = MacTable::new();
        let p1 = PeerId::from_raw(1, 0);
        let p2 = PeerId::from_raw(2, 0);
        t.add(mac(1), p1, 0);
        t.add(mac(1), p2, 500);
        assert_eq!(t.find(&mac(1)), Some(p2));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn cleanup_drops_stale_entries_only() {
        let mut t = MacTable::new();
        let p = PeerId::from_raw(1, 0);
        t.add(mac(1), p, 0);
        t.add(mac(2), p, 900);
        t.cleanup(1000, 500);
        assert_eq!(t.find(&mac(1)), None);
        assert_eq!(t.find(&mac(2)), Some(p));
    }

    #[test]
    fn rewrite_peer_moves_all_mappings() {
        let mut t = MacTable::new();
        let temp = PeerId::from_raw(1, 0);
        let perm = PeerId::from_raw(2, 0);
        t.add(mac(1), temp, 0);
        t.add(mac(2), temp, 0);
        t.add(mac(3), perm, 0);
        t.rewrite_peer(temp, perm);
        assert_eq!(t.find(&mac(1)), Some(perm));
        assert_eq!(t.find(&mac(2)), Some(perm));
        assert_eq!(t.find(&mac(3)), Some(perm));
    }

    proptest::proptest! {
        #[test]
        fn stays_sorted_and_distinct_after_any_sequence(
            macs in proptest::collection::vec(0u8..20, 0..64)
        ) {
            let mut t = MacTable::new();
            let p = PeerId::from_raw(1, 0);
            for b in macs {
                t.add(mac(b), p, 0);
            }
            proptest::prop_assert!(t.is_sorted());
            let mut seen = std::collections::HashSet::new();
            for b in 0u8..20 {
                if t.find(&mac(b)).is_some() {
                    proptest::prop_assert!(seen.insert(b));
                }
            }
        }
    }
}
