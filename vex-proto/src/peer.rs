//! Peer table (spec §4.3), grounded on `peer.c`. A generational index
//! replaces the original's raw `fastd_peer*` linked list (spec §9: "tasks
//! reference peers by a stable identifier ... so a delayed task can detect
//! a deleted peer and no-op").

use vex_core::PeerAddress;

use crate::error::{Error, Result};
use crate::mac::{Mac, MacTable};
use crate::state::ProtocolState;
use crate::task::TaskQueue;

pub type Millis = u64;

/// Stable reference to a peer slot. `generation` is bumped on delete so a
/// task holding a stale `PeerId` observes the slot no longer matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    index: u32,
    generation: u32,
}

impl PeerId {
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Wait,
    Temp,
    Handshake,
    Established,
}

pub struct Peer {
    /// Index into the resolved config's peer list; `None` for a temporary
    /// peer (spec §3: "a peer with no config must be in TEMP").
    pub config_index: Option<usize>,
    pub address: PeerAddress,
    pub state: PeerState,
    pub last_seen: Millis,
    /// The active (and possibly superseded) method session, plus handshake
    /// retry bookkeeping; `None` before any handshake has completed.
    pub protocol_state: Option<ProtocolState>,
}

impl Peer {
    pub fn is_floating(&self) -> bool {
        !self.address.is_specified()
    }

    pub fn is_temporary(&self) -> bool {
        self.config_index.is_none()
    }
}

struct Slot {
    generation: u32,
    peer: Option<Peer>,
}

/// Peer set plus the MAC table learned against it; bundled the way the
/// original threads a single `ctx` through `fastd_peer_*` so resets can
/// drop MAC mappings and cancel tasks in one call.
pub struct PeerTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    n_floating: usize,
    pub mac: MacTable,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            n_floating: 0,
            mac: MacTable::new(),
        }
    }

    fn insert(&mut self, peer: Peer) -> PeerId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.peer = Some(peer);
            PeerId::from_raw(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                peer: Some(peer),
            });
            PeerId::from_raw(index, 0)
        }
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_ref()
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_mut()
    }

    /// `add(config)`: a permanent peer in WAIT. Floating (no configured
    /// remote) peers never schedule a handshake.
    pub fn add(&mut self, config_index: usize, remote: Option<PeerAddress>) -> PeerId {
        let address = remote.unwrap_or(PeerAddress::Unspecified);
        if !address.is_specified() {
            self.n_floating += 1;
        }
        self.insert(Peer {
            config_index: Some(config_index),
            address,
            state: PeerState::Wait,
            last_seen: 0,
            protocol_state: None,
        })
    }

    /// `add_temp(remote)`: fails with `NoFloatingSlot` unless at least one
    /// floating peer is configured.
    pub fn add_temp(&mut self, remote: PeerAddress, now: Millis) -> Result<PeerId> {
        if self.n_floating == 0 {
            return Err(Error::NoFloatingSlot);
        }
        Ok(self.insert(Peer {
            config_index: None,
            address: remote,
            state: PeerState::Temp,
            last_seen: now,
            protocol_state: None,
        }))
    }

    /// A floating permanent peer available to absorb a temporary one, i.e.
    /// one whose address is still unspecified (spec §4.6, `null` method's
    /// first-receive promotion).
    pub fn find_floating_permanent(&self) -> Option<PeerId> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(peer) = &slot.peer {
                if !peer.is_temporary() && !peer.address.is_specified() {
                    return Some(PeerId::from_raw(index as u32, slot.generation));
                }
            }
        }
        None
    }

    pub fn find_by_mac(&self, mac: &Mac) -> Option<PeerId> {
        self.mac.find(mac)
    }

    /// Drop MAC mappings, cancel tasks, reset address/state to the
    /// configured baseline and schedule an immediate handshake unless
    /// floating (spec §4.3 `reset`). Fails with `UnknownPeer` on a
    /// temporary peer: the original aborts on this (`reset_peer` is
    /// documented as never called on one).
    pub fn reset(
        &mut self,
        id: PeerId,
        tasks: &mut TaskQueue,
        configured_remote: Option<PeerAddress>,
        now: Millis,
    ) -> Result<()> {
        self.mac.remove_peer(id);
        tasks.cancel_peer(id);

        let peer = self.get_mut(id).ok_or(Error::UnknownPeer)?;
        if peer.is_temporary() {
            return Err(Error::UnknownPeer);
        }
        peer.address = configured_remote.unwrap_or(PeerAddress::Unspecified);
        peer.state = PeerState::Wait;
        peer.last_seen = now;
        peer.protocol_state = None;
        Ok(())
    }

    /// `merge(perm, temp)`: copy temp's address/state/last-seen/session
    /// into `perm`, rewrite MAC mappings, delete `temp` (spec §8 property
    /// 6, scenario S4).
    pub fn merge(&mut self, perm: PeerId, temp: PeerId, tasks: &mut TaskQueue) -> Result<()> {
        let (temp_address, temp_state, temp_seen, temp_protocol_state) = {
            let t = self.get_mut(temp).ok_or(Error::UnknownPeer)?;
            (t.address, t.state, t.last_seen, t.protocol_state.take())
        };
        let was_established = temp_state == PeerState::Established;

        {
            let was_floating = !self.get_mut(perm).ok_or(Error::UnknownPeer)?.address.is_specified();
            if was_floating {
                self.n_floating = self.n_floating.saturating_sub(1);
            }
            let p = self.get_mut(perm).ok_or(Error::UnknownPeer)?;
            p.address = temp_address;
            p.state = if was_established {
                PeerState::Established
            } else {
                PeerState::Wait
            };
            p.last_seen = temp_seen;
            p.protocol_state = temp_protocol_state;
        }

        self.mac.rewrite_peer(temp, perm);
        self.delete(temp, tasks)?;
        Ok(())
    }

    /// `delete(peer)`: drop MAC mappings, cancel tasks, unlink, free the
    /// slot (bumping its generation so stale `PeerId`s go dead).
    pub fn delete(&mut self, id: PeerId, tasks: &mut TaskQueue) -> Result<()> {
        self.mac.remove_peer(id);
        tasks.cancel_peer(id);

        let slot = self
            .slots
            .get_mut(id.index as usize)
            .ok_or(Error::UnknownPeer)?;
        if slot.generation != id.generation || slot.peer.is_none() {
            return Err(Error::UnknownPeer);
        }
        let was_floating = slot
            .peer
            .as_ref()
            .map(|p| !p.is_temporary() && !p.address.is_specified())
            .unwrap_or(false);
        slot.peer = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if was_floating {
            self.n_floating = self.n_floating.saturating_sub(1);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.peer
                .as_ref()
                .map(|p| (PeerId::from_raw(i as u32, s.generation), p))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn v4(port: u16) -> PeerAddress {
        PeerAddress::from_socket_addr(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(10, 0, 0, 1),
            port,
        )))
    }

    #[test]
    fn add_temp_fails_without_floating_slot() {
        let mut table = PeerTable::new();
        table.add(0, Some(v4(1000)));
        assert!(matches!(
            table.add_temp(v4(2000), 0),
            Err(Error::NoFloatingSlot)
        ));
    }

    #[test]
    fn add_temp_succeeds_with_floating_slot() {
        let mut table = PeerTable::new();
        table.add(0, None);
        let temp = table.add_temp(v4(2000), 10).unwrap();
        assert_eq!(table.get(temp).unwrap().state, PeerState::Temp);
    }

    #[test]
    fn merge_moves_mac_mappings_and_deletes_temp() {
        let mut table = PeerTable::new();
        let mut tasks = TaskQueue::new();
        let perm = table.add(0, None);
        let temp = table.add_temp(v4(2000), 10).unwrap();
        table.mac.add([1, 2, 3, 4, 5, 6], temp, 10);

        table.merge(perm, temp, &mut tasks).unwrap();

        assert_eq!(table.mac.find(&[1, 2, 3, 4, 5, 6]), Some(perm));
        assert!(table.get(temp).is_none());
        assert_eq!(table.get(perm).unwrap().address, v4(2000));
    }

    #[test]
    fn delete_frees_slot_and_invalidates_id() {
        let mut table = PeerTable::new();
        let mut tasks = TaskQueue::new();
        let id = table.add(0, Some(v4(1000)));
        table.delete(id, &mut tasks).unwrap();
        assert!(table.get(id).is_none());
    }

    #[test]
    fn reset_restores_configured_address_and_wait_state() {
        let mut table = PeerTable::new();
        let mut tasks = TaskQueue::new();
        let id = table.add(0, Some(v4(1000)));
        table.get_mut(id).unwrap().state = PeerState::Established;
        table.reset(id, &mut tasks, Some(v4(1000)), 50).unwrap();
        let peer = table.get(id).unwrap();
        assert_eq!(peer.state, PeerState::Wait);
        assert_eq!(peer.address, v4(1000));
    }

    #[test]
    fn find_floating_permanent_skips_temps_and_addressed_peers() {
        let mut table = PeerTable::new();
        table.add(0, Some(v4(1000)));
        let floating = table.add(1, None);
        assert_eq!(table.find_floating_permanent(), Some(floating));
    }
}
