//! Identity → reachability mapping.
//!
//! Subscribers are created on first observation and live for the process
//! lifetime in an insertion-ordered arena; other tables refer to them by
//! index. Interfaces are likewise referenced by slot index, so closing an
//! interface never dangles a pointer; the entry just stops resolving.

use std::collections::HashMap;
use std::net::SocketAddr;

use mycel_identity::Sid;

/// How many ticks of silence before a subscriber heard on an interface is
/// considered unreachable again.
const REACHABLE_TICKS: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reachability {
    None,
    Direct,
    Indirect,
    Unicast,
    Broadcast,
    DefaultRoute,
}

#[derive(Clone, Debug)]
pub struct Subscriber {
    pub sid: Sid,
    pub reachability: Reachability,
    /// Arena index of the subscriber packets for this one are relayed via.
    pub next_hop: Option<usize>,
    /// Slot of the interface this subscriber was last heard on.
    pub interface: Option<usize>,
    /// Unicast endpoint, when reachability is Unicast.
    pub address: Option<SocketAddr>,
    /// The next self-announce must carry our full SID, not an abbreviation.
    pub send_full: bool,
    pub last_seen_ms: u64,
}

#[derive(Default)]
pub struct SubscriberTable {
    entries: Vec<Subscriber>,
    index: HashMap<Sid, usize>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, sid: &Sid) -> Option<usize> {
        self.index.get(sid).copied()
    }

    pub fn find_or_create(&mut self, sid: Sid, now: u64) -> usize {
        if let Some(idx) = self.index.get(&sid) {
            return *idx;
        }
        let idx = self.entries.len();
        self.entries.push(Subscriber {
            sid,
            reachability: Reachability::None,
            next_hop: None,
            interface: None,
            address: None,
            send_full: false,
            last_seen_ms: now,
        });
        self.index.insert(sid, idx);
        idx
    }

    pub fn get(&self, idx: usize) -> &Subscriber {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Subscriber {
        &mut self.entries[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Subscriber)> {
        self.entries.iter().enumerate()
    }

    /// Resolve an abbreviated address against the cache. The match must be
    /// unique; an ambiguous prefix resolves to nothing, forcing the sender
    /// to fall back to the full form.
    pub fn resolve_prefix(&self, prefix: &[u8]) -> Option<usize> {
        let mut found = None;
        for (idx, subscriber) in self.entries.iter().enumerate() {
            if subscriber.sid.prefix(prefix.len()) == prefix {
                if found.is_some() {
                    return None;
                }
                found = Some(idx);
            }
        }
        found
    }

    /// Record an observation of `idx` on an interface.
    pub fn mark_heard(
        &mut self,
        idx: usize,
        reachability: Reachability,
        interface: usize,
        address: Option<SocketAddr>,
        now: u64,
    ) {
        let subscriber = &mut self.entries[idx];
        let was = subscriber.reachability;
        subscriber.reachability = reachability;
        subscriber.interface = Some(interface);
        if address.is_some() {
            subscriber.address = address;
        }
        subscriber.last_seen_ms = now;
        if was != reachability {
            log::info!(
                "ov: {} is now {:?} via interface #{}",
                subscriber.sid,
                reachability,
                interface
            );
        }
    }

    /// Record that `idx` is relayed through `via`.
    pub fn mark_indirect(&mut self, idx: usize, via: usize, now: u64) {
        let subscriber = &mut self.entries[idx];
        subscriber.reachability = Reachability::Indirect;
        subscriber.next_hop = Some(via);
        subscriber.last_seen_ms = now;
    }

    /// Expire reachability for subscribers not observed within
    /// `REACHABLE_TICKS` interface ticks. `tick_ms` maps an interface slot
    /// to its tick cadence (0 when the slot is gone).
    pub fn decay(&mut self, now: u64, tick_ms: impl Fn(usize) -> u64) {
        for subscriber in &mut self.entries {
            if subscriber.reachability == Reachability::None {
                continue;
            }
            let cadence = subscriber.interface.map(&tick_ms).unwrap_or(0);
            let horizon = if cadence > 0 { cadence * REACHABLE_TICKS } else { 30_000 };
            if subscriber.last_seen_ms + horizon < now {
                log::info!("ov: {} is no longer reachable", subscriber.sid);
                subscriber.reachability = Reachability::None;
                subscriber.next_hop = None;
            }
        }
    }

    /// Subscribers that also need their interface invalidated when a slot
    /// closes; they re-resolve on next observation.
    pub fn interface_closed(&mut self, slot: usize) {
        for subscriber in &mut self.entries {
            if subscriber.interface == Some(slot) {
                subscriber.interface = None;
                subscriber.reachability = Reachability::None;
                subscriber.next_hop = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycel_identity::{Keypair, Sid};
    use rand_core::OsRng;

    fn sid(tag: u8) -> Sid {
        let mut bytes = [tag; 32];
        bytes[0] = tag;
        Sid::from_bytes(bytes)
    }

    #[test]
    fn create_is_idempotent_and_ordered() {
        let mut table = SubscriberTable::new();
        let a = table.find_or_create(sid(1), 0);
        let b = table.find_or_create(sid(2), 0);
        assert_eq!(table.find_or_create(sid(1), 5), a);
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn prefix_resolution_requires_unique_match() {
        let mut table = SubscriberTable::new();
        let mut one = [0u8; 32];
        one[..4].copy_from_slice(&[9, 9, 1, 1]);
        let mut two = [0u8; 32];
        two[..4].copy_from_slice(&[9, 9, 2, 2]);
        let a = table.find_or_create(Sid::from_bytes(one), 0);
        table.find_or_create(Sid::from_bytes(two), 0);

        assert_eq!(table.resolve_prefix(&[9, 9, 1, 1]), Some(a));
        // both entries share this two byte prefix
        assert_eq!(table.resolve_prefix(&[9, 9]), None);
        assert_eq!(table.resolve_prefix(&[7]), None);
    }

    #[test]
    fn reachability_decays_after_ten_ticks() {
        let mut table = SubscriberTable::new();
        let idx = table.find_or_create(Keypair::generate(OsRng).sid(), 0);
        table.mark_heard(idx, Reachability::Broadcast, 0, None, 1_000);
        table.decay(5_000, |_| 500);
        assert_eq!(table.get(idx).reachability, Reachability::Broadcast);
        table.decay(6_001, |_| 500);
        assert_eq!(table.get(idx).reachability, Reachability::None);
    }

    #[test]
    fn closing_an_interface_invalidates_references() {
        let mut table = SubscriberTable::new();
        let idx = table.find_or_create(sid(3), 0);
        table.mark_heard(idx, Reachability::Direct, 2, None, 0);
        table.interface_closed(2);
        assert_eq!(table.get(idx).interface, None);
        assert_eq!(table.get(idx).reachability, Reachability::None);
    }
}
