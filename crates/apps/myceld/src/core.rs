//! The daemon engine: one task owning the scheduler, subscriber table,
//! interface manager, TX queues, and call table, multiplexing interface
//! datagrams against the timer horizon. Socket readiness is serviced before
//! due timers within a wakeup, and the timer set is drained once per wakeup.
//! The rhizome store is the only state shared outside this task (with the
//! HTTP server and sync jobs), behind a mutex with no await inside.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mycel_identity::Sid;
use mycel_overlay::iface::{
    InterfaceManager, RxEvent, StaticAddressProducer, DISCOVERY_INTERVAL_MS,
};
use mycel_overlay::mdp::{MdpPacket, MDP_PORT_RHIZOME, MDP_PORT_VOMP};
use mycel_overlay::packet::{self, AddressRef, OverlayFrame};
use mycel_overlay::queue::{
    OutboundFrame, OutgoingPacket, PacketDest, TxEngine, OQ_ISOCHRONOUS_VOICE, OQ_ORDINARY,
};
use mycel_overlay::sched::{Alarm, AlarmKind, Scheduler};
use mycel_overlay::subscriber::{Reachability, SubscriberTable};
use mycel_rhizome::bar;
use mycel_rhizome::http::{self as rhizome_http, RhizomeHttpServer};
use mycel_rhizome::{RhizomeConfig, RhizomeStore};
use mycel_vomp::call::VOMP_CALL_STATUS_INTERVAL_MS;
use mycel_vomp::codecs::{
    CODEC_8ALAW, CODEC_8ULAW, CODEC_DTMF, CODEC_GSM_FULL, CODEC_PCM,
};
use mycel_vomp::monitor::LogMonitor;
use mycel_vomp::{CallTable, CodecFlags, VompError};

use crate::config::DaemonConfig;
use crate::identity_store;

/// How many fresh BARs ride along on each tick packet.
const ADVERT_BARS: usize = 8;
/// Direct neighbours advertised per tick.
const ROUTE_ADVERT_ENTRIES: usize = 8;

fn lock_store(store: &Arc<Mutex<RhizomeStore>>) -> MutexGuard<'_, RhizomeStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Core {
    start: Instant,
    my_sid: Sid,
    my_idx: usize,
    /// The next self-announce carries the full SID.
    send_full: bool,
    http_port: u16,
    sync_peers: Vec<SocketAddr>,
    rhizome_config: RhizomeConfig,
    sched: Scheduler,
    table: SubscriberTable,
    ifaces: InterfaceManager,
    engine: TxEngine,
    vomp: CallTable,
    store: Option<Arc<Mutex<RhizomeStore>>>,
    producer: StaticAddressProducer,
    rx: mpsc::UnboundedReceiver<RxEvent>,
    cancel: CancellationToken,
}

impl Core {
    /// Build a core from configuration: identity, store, HTTP listener,
    /// interface manager. The HTTP server task is spawned here; everything
    /// else runs inside [`Core::run`].
    pub async fn bootstrap(
        config: &DaemonConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.instance_dir)?;
        let keypair = identity_store::load_or_create_keypair(&config.instance_dir)?;
        let rhizome_secret = identity_store::load_or_create_rhizome_secret(&config.instance_dir)?;
        let my_sid = keypair.sid();
        log::info!("mycel node {my_sid}");

        let (rx_tx, rx) = mpsc::unbounded_channel();
        let ifaces = InterfaceManager::new(
            config.interface_rules()?,
            config.tick_defaults(),
            config.dummy_dir(),
            rx_tx,
            cancel.child_token(),
        );

        let rhizome_config = config.rhizome_config();
        let store = if rhizome_config.enable {
            let store = Arc::new(Mutex::new(RhizomeStore::open(&config.instance_dir)?));
            let listener =
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.http_port)).await?;
            let server = RhizomeHttpServer::new(
                store.clone(),
                rhizome_config.clone(),
                Some(rhizome_secret),
                std::env::temp_dir(),
            );
            tokio::spawn(server.run(listener, cancel.child_token()));
            Some(store)
        } else {
            None
        };

        let vomp = CallTable::new(
            CodecFlags::of(&[CODEC_PCM, CODEC_GSM_FULL, CODEC_8ULAW, CODEC_8ALAW, CODEC_DTMF]),
            Box::new(LogMonitor { accept_calls: config.accept_calls }),
        );

        let producer = StaticAddressProducer(
            config
                .addresses
                .iter()
                .filter_map(|entry| match (entry.addr, entry.netmask) {
                    (IpAddr::V4(addr), IpAddr::V4(mask)) => {
                        Some((entry.name.clone(), addr, mask))
                    }
                    _ => None,
                })
                .collect(),
        );
        let sync_peers = config
            .peers
            .iter()
            .filter_map(|peer| peer.parse().ok())
            .collect();

        let mut table = SubscriberTable::new();
        let my_idx = table.find_or_create(my_sid, 0);

        Ok(Self {
            start: Instant::now(),
            my_sid,
            my_idx,
            send_full: true,
            http_port: config.http_port,
            sync_peers,
            rhizome_config,
            sched: Scheduler::new(),
            table,
            ifaces,
            engine: TxEngine::new(),
            vomp,
            store,
            producer,
            rx,
            cancel,
        })
    }

    pub fn sid(&self) -> Sid {
        self.my_sid
    }

    pub fn store(&self) -> Option<Arc<Mutex<RhizomeStore>>> {
        self.store.clone()
    }

    pub fn reachability_of(&self, sid: &Sid) -> Option<Reachability> {
        self.table.find(sid).map(|idx| self.table.get(idx).reachability)
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// The main loop. Returns self after cancellation so embedders and
    /// tests can inspect the final state.
    pub async fn run(mut self) -> Self {
        let now = self.now();
        self.sched.schedule(Alarm { kind: AlarmKind::Discover, alarm: now, deadline: now + 10 });
        self.sched.schedule(Alarm {
            kind: AlarmKind::VompTick,
            alarm: now + VOMP_CALL_STATUS_INTERVAL_MS,
            deadline: now + VOMP_CALL_STATUS_INTERVAL_MS * 3 / 2,
        });
        if self.store.is_some() && !self.sync_peers.is_empty() {
            self.sched.schedule(Alarm {
                kind: AlarmKind::RhizomeSync,
                alarm: now + self.rhizome_config.fetch_interval_ms,
                deadline: now + self.rhizome_config.fetch_interval_ms * 2,
            });
        }

        loop {
            let now = self.now();
            let sleep_ms = self
                .sched
                .next_wakeup()
                .map(|at| at.saturating_sub(now))
                .unwrap_or(60_000);
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_rx(event),
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }

            let now = self.now();
            for kind in self.sched.take_due(now) {
                self.dispatch(kind, now).await;
            }
        }
        self
    }

    async fn dispatch(&mut self, kind: AlarmKind, now: u64) {
        match kind {
            AlarmKind::Discover => self.discover(now).await,
            AlarmKind::InterfaceTick(slot) => self.tick_interface(slot, now).await,
            AlarmKind::DummyPoll(slot) => self.dummy_poll(slot, now),
            AlarmKind::NextPacket => self.send_queued(now).await,
            AlarmKind::VompTick => {
                let outs = self.vomp.tick(now);
                self.enqueue_vomp(outs, now);
                self.sched.schedule(Alarm {
                    kind: AlarmKind::VompTick,
                    alarm: now + VOMP_CALL_STATUS_INTERVAL_MS,
                    deadline: now + VOMP_CALL_STATUS_INTERVAL_MS * 3 / 2,
                });
            }
            AlarmKind::RhizomeSync => self.rhizome_sync(now),
        }
    }

    async fn discover(&mut self, now: u64) {
        let closed = self.ifaces.discover(&self.producer, now).await;
        for slot in closed {
            self.table.interface_closed(slot);
            self.sched.unschedule(AlarmKind::InterfaceTick(slot));
            self.sched.unschedule(AlarmKind::DummyPoll(slot));
        }
        if self.ifaces.take_came_up() {
            self.send_full = true;
        }

        let slots: Vec<(usize, bool, bool, u64)> = self
            .ifaces
            .slots()
            .map(|(slot, iface)| (slot, iface.is_up(), iface.dummy, iface.tick_ms))
            .collect();
        for (slot, up, dummy, tick_ms) in slots {
            if !up {
                continue;
            }
            if tick_ms > 0 && !self.sched.is_scheduled(AlarmKind::InterfaceTick(slot)) {
                self.sched.schedule(Alarm {
                    kind: AlarmKind::InterfaceTick(slot),
                    alarm: now,
                    deadline: now + 10,
                });
            }
            if dummy && !self.sched.is_scheduled(AlarmKind::DummyPoll(slot)) {
                self.sched.schedule(Alarm {
                    kind: AlarmKind::DummyPoll(slot),
                    alarm: now + 5,
                    deadline: now + 15,
                });
            }
        }

        let ifaces = &self.ifaces;
        self.table.decay(now, |slot| ifaces.tick_ms(slot));

        self.sched.schedule(Alarm {
            kind: AlarmKind::Discover,
            alarm: now + DISCOVERY_INTERVAL_MS,
            deadline: now + DISCOVERY_INTERVAL_MS * 2,
        });
    }

    /// Periodic self-advertisement on one interface: announce, route
    /// advertisements, whatever the queues can fill, and fresh bundle
    /// advertisements when there is room.
    async fn tick_interface(&mut self, slot: usize, now: u64) {
        let (mtu, tick_ms) = match self.ifaces.slot(slot) {
            Some(iface)
                if iface.is_up() && iface.tick_ms > 0 && iface.bits_per_second >= 1 =>
            {
                (iface.mtu, iface.tick_ms)
            }
            _ => return,
        };

        // keep announcing the full SID until somebody out there can
        // actually resolve an abbreviation of it
        let have_peer = self
            .table
            .iter()
            .any(|(idx, s)| idx != self.my_idx && s.reachability != Reachability::None);
        let announce_full = std::mem::take(&mut self.send_full) || !have_peer;
        let mut outgoing = match OutgoingPacket::begin(
            slot,
            mtu,
            PacketDest::Broadcast,
            &self.my_sid,
            announce_full,
        ) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("ov: could not start tick packet on #{slot}: {err}");
                return;
            }
        };

        let neighbours: Vec<(Sid, u8)> = self
            .table
            .iter()
            .filter(|(idx, subscriber)| {
                *idx != self.my_idx
                    && matches!(
                        subscriber.reachability,
                        Reachability::Direct | Reachability::Broadcast | Reachability::Unicast
                    )
            })
            .take(ROUTE_ADVERT_ENTRIES)
            .map(|(_, subscriber)| (subscriber.sid, 1))
            .collect();
        if !neighbours.is_empty() {
            if let Err(err) =
                packet::append_route_advert(&mut outgoing.buffer, &mut outgoing.ctx, &neighbours)
            {
                log::debug!("ov: route advert did not fit: {err}");
            }
        }

        let views = self.ifaces.views();
        let filled =
            self.engine
                .fill_send_packet(Some(outgoing), now, &self.table, &views, &self.my_sid);
        if let Some(mut packet) = filled {
            self.append_rhizome_adverts(&mut packet, now);
            self.send_packet(packet).await;
        }
        if let Some(iface) = self.ifaces.slot_mut(slot) {
            iface.last_tick_ms = Some(now);
        }

        self.reschedule_next_packet();
        self.sched.schedule(Alarm {
            kind: AlarmKind::InterfaceTick(slot),
            alarm: now + tick_ms,
            deadline: now + tick_ms + tick_ms / 2,
        });
    }

    /// The TX engine asked to be run: assemble and send one packet.
    async fn send_queued(&mut self, now: u64) {
        let views = self.ifaces.views();
        let filled = self.engine.fill_send_packet(None, now, &self.table, &views, &self.my_sid);
        if let Some(mut packet) = filled {
            self.append_rhizome_adverts(&mut packet, now);
            self.send_packet(packet).await;
        }
        self.reschedule_next_packet();
    }

    async fn send_packet(&mut self, packet: OutgoingPacket) {
        let slot = packet.iface;
        if let Err(err) = self.ifaces.send(&packet).await {
            log::warn!("ov: dropping packet for interface #{slot}: {err}");
            self.table.interface_closed(slot);
            self.sched.unschedule(AlarmKind::InterfaceTick(slot));
            self.sched.unschedule(AlarmKind::DummyPoll(slot));
        }
    }

    fn reschedule_next_packet(&mut self) {
        match self.engine.next_send_time(&self.table) {
            Some((alarm, deadline)) => {
                self.sched.schedule(Alarm { kind: AlarmKind::NextPacket, alarm, deadline });
            }
            None => {
                self.sched.unschedule(AlarmKind::NextPacket);
            }
        }
    }

    /// Stuff bundle advertisements at the last moment, unless voice
    /// traffic holds the floor.
    fn append_rhizome_adverts(&mut self, packet: &mut OutgoingPacket, now: u64) {
        let Some(store) = &self.store else {
            return;
        };
        if packet.unicast || self.engine.voice_mode(now) {
            return;
        }
        let bars = match lock_store(store).advertisable_bars(ADVERT_BARS) {
            Ok(bars) => bars,
            Err(err) => {
                log::warn!("rz: could not enumerate adverts: {err}");
                return;
            }
        };
        if bars.is_empty() {
            return;
        }
        let payload = bar::encode_advert(self.http_port, &bars);
        if packet::append_rhizome_advert(
            &mut packet.buffer,
            &mut packet.ctx,
            &self.my_sid,
            &payload,
        )
        .is_err()
        {
            // no room this time; the next tick will try again
        }
    }

    fn dummy_poll(&mut self, slot: usize, now: u64) {
        match self.ifaces.dummy_poll(slot) {
            Ok(packets) => {
                let heard = !packets.is_empty();
                for bytes in packets {
                    self.handle_packet(&bytes, slot, None, false, now);
                }
                if heard {
                    self.reschedule_next_packet();
                }
            }
            Err(err) => {
                log::warn!("ov: dummy poll on #{slot} failed: {err}");
                self.ifaces.close(slot);
                self.table.interface_closed(slot);
                self.sched.unschedule(AlarmKind::InterfaceTick(slot));
                return;
            }
        }
        let tick_ms = self.ifaces.tick_ms(slot);
        let next = now + (tick_ms / 2).clamp(5, 1_000);
        self.sched.schedule(Alarm {
            kind: AlarmKind::DummyPoll(slot),
            alarm: next,
            deadline: next + 100,
        });
    }

    fn rhizome_sync(&mut self, now: u64) {
        if let Some(store) = &self.store {
            for peer in &self.sync_peers {
                let peer = *peer;
                let store = store.clone();
                tokio::spawn(async move {
                    match rhizome_http::sync_with_peer(peer, &store, 10).await {
                        Ok(()) => log::debug!("rz: in sync with {peer}"),
                        Err(err) => log::debug!("rz: sync with {peer} failed: {err}"),
                    }
                });
            }
        }
        self.sched.schedule(Alarm {
            kind: AlarmKind::RhizomeSync,
            alarm: now + self.rhizome_config.fetch_interval_ms,
            deadline: now + self.rhizome_config.fetch_interval_ms * 2,
        });
    }

    fn handle_rx(&mut self, event: RxEvent) {
        let now = self.now();
        match event {
            RxEvent::Datagram { iface, src, bytes } => {
                self.handle_packet(&bytes, iface, Some(src), true, now);
            }
            RxEvent::AnyDatagram { src, bytes } => {
                let attributed = match src {
                    SocketAddr::V4(v4) => self.ifaces.find_by_src(*v4.ip()),
                    SocketAddr::V6(_) => None,
                };
                match attributed {
                    Some(iface) => self.handle_packet(&bytes, iface, Some(src), false, now),
                    None => {
                        log::debug!("ov: no interface matches broadcast from {src}");
                    }
                }
            }
            RxEvent::SocketError { iface } => {
                self.ifaces.close(iface);
                self.table.interface_closed(iface);
                self.sched.unschedule(AlarmKind::InterfaceTick(iface));
            }
        }
        // a heard announce may have made a queued frame's destination
        // reachable
        self.reschedule_next_packet();
    }

    fn handle_packet(
        &mut self,
        bytes: &[u8],
        iface: usize,
        src: Option<SocketAddr>,
        unicast: bool,
        now: u64,
    ) {
        let frames =
            match packet::decode_packet(bytes, &mut self.table, iface, src, unicast, now) {
                Ok(frames) => frames,
                Err(err) => {
                    log::debug!("ov: malformed packet on #{iface}: {err}");
                    return;
                }
            };
        for frame in frames {
            match frame {
                OverlayFrame::SelfAnnounce { sender } => {
                    // the decode already admitted and marked the sender;
                    // our own echo on a shared dummy file needs no more
                    let _ = sender;
                }
                OverlayFrame::RouteAdvert { sender, entries } => {
                    if sender == self.my_idx {
                        continue;
                    }
                    for (sid, _cost) in entries {
                        if sid == self.my_sid {
                            continue;
                        }
                        let idx = self.table.find_or_create(sid, now);
                        if self.table.get(idx).reachability == Reachability::None {
                            self.table.mark_indirect(idx, sender, now);
                        }
                    }
                }
                OverlayFrame::Mdp { sender, destination, ttl, payload } => {
                    self.handle_mdp(sender, destination, ttl, payload, now);
                }
                OverlayFrame::RhizomeAdvert { sender, payload } => {
                    self.handle_rhizome_advert(sender, src, &payload, now);
                }
            }
        }
    }

    fn handle_mdp(
        &mut self,
        sender: usize,
        destination: AddressRef,
        ttl: u8,
        payload: Vec<u8>,
        now: u64,
    ) {
        if sender == self.my_idx {
            return;
        }
        let src_sid = self.table.get(sender).sid;
        match destination {
            AddressRef::Broadcast(id) => {
                if self.engine.filter.check_and_add(&id) {
                    return;
                }
                self.deliver_mdp(src_sid, None, &payload, now);
                if ttl > 1 {
                    let mut frame =
                        OutboundFrame::mdp_broadcast(src_sid, ttl - 1, payload);
                    frame.broadcast_id = Some(id);
                    if let Err(err) = self.engine.enqueue(OQ_ORDINARY, frame, now) {
                        log::debug!("ov: cannot forward broadcast: {err}");
                    }
                    self.reschedule_next_packet();
                }
            }
            AddressRef::Subscriber(idx) if idx == self.my_idx => {
                self.deliver_mdp(src_sid, Some(self.my_sid), &payload, now);
            }
            AddressRef::Subscriber(idx) => {
                // not for us; relay if it still has life in it
                if ttl > 1 {
                    let frame = OutboundFrame::mdp_unicast(src_sid, idx, ttl - 1, payload);
                    if let Err(err) = self.engine.enqueue(OQ_ORDINARY, frame, now) {
                        log::debug!("ov: cannot relay: {err}");
                    }
                    self.reschedule_next_packet();
                }
            }
        }
    }

    fn deliver_mdp(&mut self, src: Sid, dst: Option<Sid>, body: &[u8], now: u64) {
        let datagram = match MdpPacket::decode_body(src, dst, body) {
            Ok(datagram) => datagram,
            Err(err) => {
                log::debug!("ov: bad mdp body from {src}: {err}");
                return;
            }
        };
        match datagram.dst_port {
            MDP_PORT_VOMP => {
                match self.vomp.received(datagram.src, self.my_sid, &datagram.payload, now) {
                    Ok(outs) => self.enqueue_vomp(outs, now),
                    Err(VompError::NotACallOpening) => {}
                    Err(err) => log::debug!("vomp: dropping frame from {src}: {err}"),
                }
            }
            MDP_PORT_RHIZOME => {
                log::debug!("rz: bundle transfer rides http, ignoring mdp payload");
            }
            other => {
                log::debug!("ov: no listener on mdp port {other}");
            }
        }
    }

    fn enqueue_vomp(&mut self, outs: Vec<mycel_vomp::call::VompOut>, now: u64) {
        for out in outs {
            let dest = self.table.find_or_create(out.dst, now);
            let body = MdpPacket {
                src: self.my_sid,
                dst: Some(out.dst),
                src_port: MDP_PORT_VOMP,
                dst_port: MDP_PORT_VOMP,
                payload: out.payload,
            }
            .encode_body();
            let frame = OutboundFrame::mdp_unicast(self.my_sid, dest, 31, body)
                .with_copies(out.send_copies);
            if let Err(err) = self.engine.enqueue(OQ_ISOCHRONOUS_VOICE, frame, now) {
                log::warn!("vomp: voice queue refused a frame: {err}");
            }
        }
        self.reschedule_next_packet();
    }

    /// A peer advertised bundles; fetch whatever looks new over its HTTP
    /// port. Advertisements heard on file-backed links carry no usable
    /// return address and are ignored.
    fn handle_rhizome_advert(
        &mut self,
        sender: usize,
        src: Option<SocketAddr>,
        payload: &[u8],
        now: u64,
    ) {
        let _ = now;
        if sender == self.my_idx {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let Some(src) = src else {
            return;
        };
        let (http_port, bars) = match bar::decode_advert(payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("rz: bad advert: {err}");
                return;
            }
        };
        let peer = SocketAddr::new(src.ip(), http_port);
        for advertised in bars {
            let wanted = {
                let guard = lock_store(&store);
                match guard.manifest_by_bar_prefix(&advertised.bid_prefix) {
                    Ok(Some(bytes)) => mycel_rhizome::Manifest::parse(&bytes)
                        .ok()
                        .and_then(|manifest| manifest.version())
                        .map(|version| version < advertised.version)
                        .unwrap_or(true),
                    Ok(None) => true,
                    Err(_) => false,
                }
            };
            if wanted {
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        rhizome_http::pull_by_prefix(peer, &store, &advertised.bid_prefix).await
                    {
                        log::debug!("rz: advert fetch from {peer} failed: {err}");
                    }
                });
            }
        }
    }
}
