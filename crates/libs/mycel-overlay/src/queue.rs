//! Outbound queueing and framing.
//!
//! Four priority queues feed a single packet assembler. Each queue carries a
//! latency target (frames older than it are dropped), a minimum inter-packet
//! delay, and a grace period that becomes the scheduler deadline. A fill
//! pass walks the queues in priority order, resolves each frame's next hop
//! from subscriber reachability, packs whatever fits under the chosen
//! interface's MTU, and tracks per-interface delivery for broadcasts and a
//! retransmit count for unicasts.

use std::collections::VecDeque;
use std::net::SocketAddr;

use mycel_identity::Sid;
use rand_core::{OsRng, RngCore};

use crate::buffer::OverlayBuffer;
use crate::error::OverlayError;
use crate::packet::{self, AddressContext, BROADCAST_ID_BYTES, FRAME_MDP, FRAME_RHIZOME_ADVERT};
use crate::subscriber::{Reachability, SubscriberTable};

pub const OQ_ISOCHRONOUS_VOICE: usize = 0;
pub const OQ_MESH_MANAGEMENT: usize = 1;
pub const OQ_ORDINARY: usize = 2;
pub const OQ_OPPORTUNISTIC: usize = 3;
pub const OQ_MAX: usize = 4;

/// Broadcast TTLs are clamped here before a frame first leaves the node.
pub const BROADCAST_TTL_LIMIT: u8 = 2;

const BROADCAST_FILTER_CAPACITY: usize = 1024;

/// What the TX engine needs to know about an interface slot.
#[derive(Clone, Copy, Default)]
pub struct IfaceView {
    pub up: bool,
    pub send_broadcasts: bool,
    pub mtu: usize,
}

/// Recently seen broadcast ids, for duplicate suppression. Our own fresh ids
/// are entered at generation time so we never re-forward our own broadcasts.
pub struct BroadcastFilter {
    ring: VecDeque<[u8; BROADCAST_ID_BYTES]>,
}

impl Default for BroadcastFilter {
    fn default() -> Self {
        Self { ring: VecDeque::with_capacity(BROADCAST_FILTER_CAPACITY) }
    }
}

impl BroadcastFilter {
    /// Returns true if the id was already seen; otherwise records it.
    pub fn check_and_add(&mut self, id: &[u8; BROADCAST_ID_BYTES]) -> bool {
        if self.ring.iter().any(|seen| seen == id) {
            return true;
        }
        if self.ring.len() == BROADCAST_FILTER_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(*id);
        false
    }
}

#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub frame_type: u8,
    pub source: Sid,
    /// Addressed recipient; `None` means broadcast.
    pub destination: Option<usize>,
    pub broadcast_id: Option<[u8; BROADCAST_ID_BYTES]>,
    pub ttl: u8,
    pub payload: Vec<u8>,
    pub enqueued_at: u64,
    pub send_copies: u8,
    /// Bitmap over interface slots this broadcast already left through.
    sent_via: u8,
    queued_broadcast: bool,
}

impl OutboundFrame {
    pub fn mdp_unicast(source: Sid, destination: usize, ttl: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_MDP,
            source,
            destination: Some(destination),
            broadcast_id: None,
            ttl,
            payload,
            enqueued_at: 0,
            send_copies: 1,
            sent_via: 0,
            queued_broadcast: false,
        }
    }

    pub fn mdp_broadcast(source: Sid, ttl: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FRAME_MDP,
            source,
            destination: None,
            broadcast_id: None,
            ttl,
            payload,
            enqueued_at: 0,
            send_copies: 1,
            sent_via: 0,
            queued_broadcast: false,
        }
    }

    pub fn with_copies(mut self, copies: u8) -> Self {
        self.send_copies = copies.max(1);
        self
    }
}

struct TxQueue {
    frames: VecDeque<OutboundFrame>,
    max_length: usize,
    latency_target: u64,
    transmit_delay: u64,
    grace_period: u64,
}

impl TxQueue {
    fn new(max_length: usize, latency_target: u64, transmit_delay: u64, grace_period: u64) -> Self {
        Self { frames: VecDeque::new(), max_length, latency_target, transmit_delay, grace_period }
    }
}

/// Where a packet should be handed to the socket layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDest {
    /// The owning interface's broadcast address.
    Broadcast,
    Unicast(SocketAddr),
}

pub struct OutgoingPacket {
    pub iface: usize,
    pub unicast: bool,
    pub dest: PacketDest,
    pub buffer: OverlayBuffer,
    pub ctx: AddressContext,
}

impl OutgoingPacket {
    /// Start a packet on an interface with a minimal sender preamble so
    /// receivers can attribute it; ticks use the full announce path instead.
    pub fn begin(
        iface: usize,
        mtu: usize,
        dest: PacketDest,
        my_sid: &Sid,
        announce_full: bool,
    ) -> Result<Self, OverlayError> {
        let mut buffer = packet::begin_packet(mtu)?;
        let mut ctx = AddressContext::new();
        packet::append_self_announce(&mut buffer, &mut ctx, my_sid, announce_full)?;
        Ok(Self {
            iface,
            unicast: matches!(dest, PacketDest::Unicast(_)),
            dest,
            buffer,
            ctx,
        })
    }
}

enum SendPlan {
    /// Destination currently unreachable; try again later.
    Skip,
    Unicast { next_hop: usize },
    Broadcast,
}

pub struct TxEngine {
    queues: [TxQueue; OQ_MAX],
    pub filter: BroadcastFilter,
    /// Relay for DEFAULT_ROUTE destinations, when one is configured.
    pub directory_service: Option<usize>,
    voice_until_ms: u64,
}

impl Default for TxEngine {
    fn default() -> Self {
        Self {
            queues: [
                TxQueue::new(20, 200, 10, 100),
                TxQueue::new(50, 2_000, 80, 500),
                TxQueue::new(100, 5_000, 100, 500),
                TxQueue::new(100, 60_000, 500, 500),
            ],
            filter: BroadcastFilter::default(),
            directory_service: None,
            voice_until_ms: 0,
        }
    }
}

impl TxEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        queue: usize,
        mut frame: OutboundFrame,
        now: u64,
    ) -> Result<(), OverlayError> {
        let q = &mut self.queues[queue];
        if q.frames.len() >= q.max_length {
            return Err(OverlayError::QueueFull(queue));
        }
        frame.enqueued_at = now;
        if queue == OQ_ISOCHRONOUS_VOICE {
            self.voice_until_ms = now + 1_000;
        }
        q.frames.push_back(frame);
        Ok(())
    }

    pub fn queued(&self, queue: usize) -> usize {
        self.queues[queue].frames.len()
    }

    /// Voice traffic was queued within the last second; rhizome piggyback
    /// traffic stands down while this holds.
    pub fn voice_mode(&self, now: u64) -> bool {
        now < self.voice_until_ms
    }

    /// When should the scheduler next run a fill pass, and with what
    /// deadline. `None` when every queue is empty or unreachable.
    pub fn next_send_time(&self, table: &SubscriberTable) -> Option<(u64, u64)> {
        let mut next: Option<(u64, u64)> = None;
        for q in &self.queues {
            let Some(head) = q.frames.iter().find(|frame| match frame.destination {
                Some(idx) => table.get(idx).reachability != Reachability::None,
                None => true,
            }) else {
                continue;
            };
            let send_time = head.enqueued_at + q.transmit_delay;
            let deadline = send_time + q.grace_period;
            next = Some(match next {
                Some((alarm, dl)) => (alarm.min(send_time), dl.min(deadline)),
                None => (send_time, deadline),
            });
        }
        next
    }

    fn prep_broadcast(frame: &mut OutboundFrame, filter: &mut BroadcastFilter) {
        if frame.queued_broadcast {
            return;
        }
        if frame.ttl > BROADCAST_TTL_LIMIT {
            frame.ttl = BROADCAST_TTL_LIMIT;
        }
        if frame.broadcast_id.is_none() {
            let mut id = [0u8; BROADCAST_ID_BYTES];
            OsRng.fill_bytes(&mut id);
            // mark our own id as seen so we never re-forward it
            filter.check_and_add(&id);
            frame.broadcast_id = Some(id);
        }
        frame.sent_via = 0;
        frame.queued_broadcast = true;
    }

    fn plan(&self, frame: &OutboundFrame, table: &SubscriberTable) -> SendPlan {
        let Some(idx) = frame.destination else {
            return SendPlan::Broadcast;
        };
        match table.get(idx).reachability {
            Reachability::None => SendPlan::Skip,
            Reachability::Indirect => match table.get(idx).next_hop {
                Some(via) => SendPlan::Unicast { next_hop: via },
                None => SendPlan::Skip,
            },
            Reachability::DefaultRoute => match self.directory_service {
                Some(via) => SendPlan::Unicast { next_hop: via },
                None => SendPlan::Skip,
            },
            Reachability::Direct | Reachability::Unicast => SendPlan::Unicast { next_hop: idx },
            Reachability::Broadcast => SendPlan::Broadcast,
        }
    }

    /// One fill pass: pack frames into `packet` (starting one if needed) and
    /// return it for sending. Ticks pass a pre-initialised packet bound to
    /// the ticking interface.
    pub fn fill_send_packet(
        &mut self,
        mut outgoing: Option<OutgoingPacket>,
        now: u64,
        table: &SubscriberTable,
        views: &[IfaceView],
        my_sid: &Sid,
    ) -> Option<OutgoingPacket> {
        for q in 0..OQ_MAX {
            let latency_target = self.queues[q].latency_target;
            let mut i = 0;
            while i < self.queues[q].frames.len() {
                if self.queues[q].frames[i].enqueued_at + latency_target < now {
                    if let Some(frame) = self.queues[q].frames.remove(i) {
                        log::debug!(
                            "ov: dropping frame type 0x{:02x} from queue {q} on expiry",
                            frame.frame_type
                        );
                    }
                    continue;
                }

                // once a frame is committed to broadcast it stays broadcast,
                // even if its destination becomes directly reachable
                let is_broadcast = self.queues[q].frames[i].queued_broadcast
                    || match self.queues[q].frames[i].destination {
                        None => true,
                        Some(idx) => table.get(idx).reachability == Reachability::Broadcast,
                    };
                let plan = if is_broadcast {
                    Self::prep_broadcast(&mut self.queues[q].frames[i], &mut self.filter);
                    SendPlan::Broadcast
                } else {
                    self.plan(&self.queues[q].frames[i], table)
                };

                let appended = match plan {
                    SendPlan::Skip => false,
                    SendPlan::Broadcast => {
                        match self.append_broadcast(&mut outgoing, q, i, views, my_sid) {
                            Ok(appended) => appended,
                            Err(()) => {
                                // no interface left to cover; retire the frame
                                self.queues[q].frames.remove(i);
                                continue;
                            }
                        }
                    }
                    SendPlan::Unicast { next_hop } => {
                        self.append_unicast(&mut outgoing, q, i, next_hop, table, views, my_sid)
                    }
                };

                if appended {
                    let remove = {
                        let frame = &mut self.queues[q].frames[i];
                        if frame.queued_broadcast {
                            !views.iter().enumerate().any(|(slot, view)| {
                                view.up
                                    && view.send_broadcasts
                                    && frame.sent_via & (1 << slot) == 0
                            })
                        } else {
                            frame.send_copies = frame.send_copies.saturating_sub(1);
                            frame.send_copies == 0
                        }
                    };
                    if remove {
                        self.queues[q].frames.remove(i);
                        continue;
                    }
                }
                i += 1;
            }
        }
        outgoing
    }

    /// Returns Ok(true) when the frame went into the packet, Ok(false) to
    /// retry later, Err(()) when no interface remains to cover.
    fn append_broadcast(
        &mut self,
        outgoing: &mut Option<OutgoingPacket>,
        q: usize,
        i: usize,
        views: &[IfaceView],
        my_sid: &Sid,
    ) -> Result<bool, ()> {
        if outgoing.is_none() {
            let sent_via = self.queues[q].frames[i].sent_via;
            let slot = views.iter().enumerate().find_map(|(slot, view)| {
                (view.up && view.send_broadcasts && sent_via & (1 << slot) == 0).then_some(slot)
            });
            let Some(slot) = slot else {
                return Err(());
            };
            match OutgoingPacket::begin(slot, views[slot].mtu, PacketDest::Broadcast, my_sid, false)
            {
                Ok(packet) => *outgoing = Some(packet),
                Err(err) => {
                    log::warn!("ov: could not start packet on interface #{slot}: {err}");
                    return Ok(false);
                }
            }
        }
        let packet = outgoing.as_mut().expect("initialised above");
        if packet.unicast {
            return Ok(false);
        }
        {
            let frame = &self.queues[q].frames[i];
            if frame.sent_via & (1 << packet.iface) != 0 {
                return Ok(false);
            }
            if Self::append_frame(packet, frame, None).is_err() {
                // leave it for the next packet
                return Ok(false);
            }
        }
        self.queues[q].frames[i].sent_via |= 1 << packet.iface;
        Ok(true)
    }

    fn append_unicast(
        &mut self,
        outgoing: &mut Option<OutgoingPacket>,
        q: usize,
        i: usize,
        next_hop: usize,
        table: &SubscriberTable,
        views: &[IfaceView],
        my_sid: &Sid,
    ) -> bool {
        let hop = table.get(next_hop);
        let Some(slot) = hop.interface else {
            return false;
        };
        if !views.get(slot).map(|view| view.up).unwrap_or(false) {
            return false;
        }
        let wants_unicast = hop.reachability == Reachability::Unicast;
        if outgoing.is_none() {
            let dest = match (wants_unicast, hop.address) {
                (true, Some(addr)) => PacketDest::Unicast(addr),
                _ => PacketDest::Broadcast,
            };
            match OutgoingPacket::begin(slot, views[slot].mtu, dest, my_sid, false) {
                Ok(packet) => *outgoing = Some(packet),
                Err(err) => {
                    log::warn!("ov: could not start packet on interface #{slot}: {err}");
                    return false;
                }
            }
        }
        let packet = outgoing.as_mut().expect("initialised above");
        if packet.iface != slot {
            return false;
        }
        if wants_unicast != packet.unicast {
            return false;
        }
        if wants_unicast {
            if let (PacketDest::Unicast(dest), Some(addr)) = (packet.dest, hop.address) {
                if dest != addr {
                    return false;
                }
            }
        }
        let dest_sid = self.queues[q].frames[i].destination.map(|idx| table.get(idx).sid);
        let frame = &self.queues[q].frames[i];
        Self::append_frame(packet, frame, dest_sid.as_ref()).is_ok()
    }

    fn append_frame(
        packet: &mut OutgoingPacket,
        frame: &OutboundFrame,
        dest_sid: Option<&Sid>,
    ) -> Result<(), OverlayError> {
        match frame.frame_type {
            FRAME_RHIZOME_ADVERT => packet::append_rhizome_advert(
                &mut packet.buffer,
                &mut packet.ctx,
                &frame.source,
                &frame.payload,
            ),
            FRAME_MDP => packet::append_mdp_frame(
                &mut packet.buffer,
                &mut packet.ctx,
                &frame.source,
                dest_sid,
                frame.broadcast_id.as_ref(),
                frame.ttl,
                &frame.payload,
            ),
            other => Err(OverlayError::UnknownFrameType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycel_identity::Keypair;

    fn up_views(count: usize) -> Vec<IfaceView> {
        (0..count).map(|_| IfaceView { up: true, send_broadcasts: true, mtu: 1200 }).collect()
    }

    fn my_sid() -> Sid {
        Keypair::generate(OsRng).sid()
    }

    #[test]
    fn broadcast_ttl_is_clamped_at_send_time() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let table = SubscriberTable::new();
        engine
            .enqueue(OQ_ORDINARY, OutboundFrame::mdp_broadcast(me, 31, vec![1]), 0)
            .expect("enqueue");
        let packet = engine
            .fill_send_packet(None, 100, &table, &up_views(1), &me)
            .expect("one packet");

        let mut rx = SubscriberTable::new();
        let frames = packet::decode_packet(packet.buffer.as_slice(), &mut rx, 0, None, false, 0)
            .expect("decode");
        let ttl = frames
            .iter()
            .find_map(|frame| match frame {
                packet::OverlayFrame::Mdp { ttl, .. } => Some(*ttl),
                _ => None,
            })
            .expect("mdp frame");
        assert!(ttl <= BROADCAST_TTL_LIMIT);
    }

    #[test]
    fn broadcast_covers_every_up_interface_then_retires() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let table = SubscriberTable::new();
        engine
            .enqueue(OQ_ORDINARY, OutboundFrame::mdp_broadcast(me, 2, vec![9]), 0)
            .expect("enqueue");
        let views = up_views(3);

        let mut covered = 0u8;
        for _ in 0..3 {
            let packet =
                engine.fill_send_packet(None, 50, &table, &views, &me).expect("packet");
            covered |= 1 << packet.iface;
        }
        assert_eq!(covered, 0b111);
        assert_eq!(engine.queued(OQ_ORDINARY), 0);
        assert!(engine.fill_send_packet(None, 60, &table, &views, &me).is_none());
    }

    #[test]
    fn expired_frames_are_dropped_on_fill() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let table = SubscriberTable::new();
        engine
            .enqueue(OQ_ISOCHRONOUS_VOICE, OutboundFrame::mdp_broadcast(me, 1, vec![1]), 0)
            .expect("enqueue");
        // voice latency target is 200ms
        assert!(engine.fill_send_packet(None, 500, &table, &up_views(1), &me).is_none());
        assert_eq!(engine.queued(OQ_ISOCHRONOUS_VOICE), 0);
    }

    #[test]
    fn unreachable_destination_waits_in_queue() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let mut table = SubscriberTable::new();
        let peer = table.find_or_create(my_sid(), 0);
        engine
            .enqueue(OQ_ORDINARY, OutboundFrame::mdp_unicast(me, peer, 4, vec![1]), 0)
            .expect("enqueue");
        assert!(engine.fill_send_packet(None, 50, &table, &up_views(1), &me).is_none());
        assert_eq!(engine.queued(OQ_ORDINARY), 1);

        table.mark_heard(peer, Reachability::Broadcast, 0, None, 50);
        assert!(engine.fill_send_packet(None, 60, &table, &up_views(1), &me).is_some());
        assert_eq!(engine.queued(OQ_ORDINARY), 0);
    }

    #[test]
    fn unicast_retransmits_send_copies_times() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let mut table = SubscriberTable::new();
        let peer = table.find_or_create(my_sid(), 0);
        table.mark_heard(peer, Reachability::Direct, 0, None, 0);
        engine
            .enqueue(
                OQ_ISOCHRONOUS_VOICE,
                OutboundFrame::mdp_unicast(me, peer, 4, vec![1]).with_copies(3),
                0,
            )
            .expect("enqueue");
        for _ in 0..3 {
            assert!(engine.fill_send_packet(None, 10, &table, &up_views(1), &me).is_some());
        }
        assert!(engine.fill_send_packet(None, 10, &table, &up_views(1), &me).is_none());
    }

    #[test]
    fn packet_never_exceeds_interface_mtu() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let table = SubscriberTable::new();
        for _ in 0..20 {
            engine
                .enqueue(
                    OQ_ORDINARY,
                    OutboundFrame::mdp_broadcast(me, 2, vec![0xAB; 300]),
                    0,
                )
                .expect("enqueue");
        }
        let views = vec![IfaceView { up: true, send_broadcasts: true, mtu: 400 }];
        while let Some(packet) = engine.fill_send_packet(None, 50, &table, &views, &me) {
            assert!(packet.buffer.position() <= 400);
        }
    }

    #[test]
    fn next_send_time_tracks_earliest_eligible_head() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        let mut table = SubscriberTable::new();
        let unreachable = table.find_or_create(my_sid(), 0);

        assert!(engine.next_send_time(&table).is_none());
        engine
            .enqueue(OQ_ORDINARY, OutboundFrame::mdp_unicast(me, unreachable, 4, vec![1]), 100)
            .expect("enqueue");
        // head unreachable, nothing to schedule
        assert!(engine.next_send_time(&table).is_none());

        engine
            .enqueue(OQ_OPPORTUNISTIC, OutboundFrame::mdp_broadcast(me, 1, vec![2]), 100)
            .expect("enqueue");
        let (alarm, deadline) = engine.next_send_time(&table).expect("scheduled");
        assert_eq!(alarm, 600); // 100 + opportunistic transmit delay
        assert_eq!(deadline, 1100);
    }

    #[test]
    fn broadcast_filter_detects_duplicates() {
        let mut filter = BroadcastFilter::default();
        let id = [1u8; BROADCAST_ID_BYTES];
        assert!(!filter.check_and_add(&id));
        assert!(filter.check_and_add(&id));
    }

    #[test]
    fn voice_mode_window() {
        let me = my_sid();
        let mut engine = TxEngine::new();
        engine
            .enqueue(OQ_ISOCHRONOUS_VOICE, OutboundFrame::mdp_broadcast(me, 1, vec![1]), 1_000)
            .expect("enqueue");
        assert!(engine.voice_mode(1_500));
        assert!(!engine.voice_mode(2_000));
    }
}
