//! Overlay packet codec.
//!
//! Every packet starts with the four byte magic, then frames: a one byte
//! type, a one byte TTL, a patched variable-width length, and the frame body.
//! Addresses inside a packet are compressed against a per-packet context: a
//! SID already written can be replayed with a single PREVIOUS byte, and a
//! SID the receiver has cached can be sent as an 8 or 12 byte prefix. A
//! packet that opens with a self-announce licenses the receiver to admit new
//! addresses into its cache; without one only cached subscribers resolve.

use std::net::SocketAddr;

use mycel_identity::{Sid, SID_BYTES};

use crate::buffer::OverlayBuffer;
use crate::error::OverlayError;
use crate::subscriber::{Reachability, SubscriberTable};

pub const MAGIC: [u8; 4] = [b'O', 0x10, 0x00, 0x01];

pub const FRAME_SELF_ANNOUNCE: u8 = 0x10;
pub const FRAME_ROUTE_ADVERT: u8 = 0x30;
pub const FRAME_MDP: u8 = 0x40;
pub const FRAME_RHIZOME_ADVERT: u8 = 0x50;

/// Address tag bytes. A tag always precedes the address bytes, so the
/// stream is self describing.
pub const OA_CODE_FULL: u8 = 0x00;
pub const OA_CODE_PREFIX8: u8 = 0x08;
pub const OA_CODE_PREVIOUS: u8 = 0x09;
pub const OA_CODE_PREFIX12: u8 = 0x0C;
pub const OA_CODE_BROADCAST: u8 = 0x0F;

pub const BROADCAST_ID_BYTES: usize = 16;
pub const MAX_TTL: u8 = 31;

/// Per-packet address compression state, reset for every packet.
#[derive(Default, Clone)]
pub struct AddressContext {
    previous: Option<Sid>,
    /// Subscriber index of the packet's announced sender, once seen.
    pub sender: Option<usize>,
    /// New addresses may only be admitted after a self-announce.
    admit: bool,
}

impl AddressContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A decoded frame destination.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressRef {
    Subscriber(usize),
    Broadcast([u8; BROADCAST_ID_BYTES]),
}

/// Decoded frames, each variant carrying only what its consumer needs.
#[derive(Clone, Debug)]
pub enum OverlayFrame {
    SelfAnnounce {
        sender: usize,
    },
    RouteAdvert {
        sender: usize,
        entries: Vec<(Sid, u8)>,
    },
    Mdp {
        sender: usize,
        destination: AddressRef,
        ttl: u8,
        payload: Vec<u8>,
    },
    RhizomeAdvert {
        sender: usize,
        payload: Vec<u8>,
    },
}

pub fn begin_packet(mtu: usize) -> Result<OverlayBuffer, OverlayError> {
    let mut buffer = OverlayBuffer::new();
    buffer.limit_size(mtu);
    buffer.append_bytes(&MAGIC)?;
    Ok(buffer)
}

fn append_address(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    sid: &Sid,
    full: bool,
) -> Result<(), OverlayError> {
    if ctx.previous.as_ref() == Some(sid) {
        buffer.append_byte(OA_CODE_PREVIOUS)?;
    } else if full {
        buffer.append_byte(OA_CODE_FULL)?;
        buffer.append_bytes(sid.as_bytes())?;
    } else {
        buffer.append_byte(OA_CODE_PREFIX12)?;
        buffer.append_bytes(sid.prefix(12))?;
    }
    ctx.previous = Some(*sid);
    Ok(())
}

fn append_broadcast_address(
    buffer: &mut OverlayBuffer,
    id: &[u8; BROADCAST_ID_BYTES],
) -> Result<(), OverlayError> {
    buffer.append_byte(OA_CODE_BROADCAST)?;
    buffer.append_bytes(id)
}

fn read_address(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    table: &mut SubscriberTable,
    now: u64,
) -> Result<AddressRef, OverlayError> {
    let code = buffer.get_byte()?;
    let sid = match code {
        OA_CODE_PREVIOUS => ctx.previous.ok_or(OverlayError::NoPreviousAddress)?,
        OA_CODE_FULL => Sid::from_slice(buffer.get_bytes(SID_BYTES)?)?,
        OA_CODE_PREFIX8 | OA_CODE_PREFIX12 => {
            let len = if code == OA_CODE_PREFIX8 { 8 } else { 12 };
            let prefix = buffer.get_bytes(len)?.to_vec();
            let idx = table
                .resolve_prefix(&prefix)
                .ok_or_else(|| OverlayError::UnresolvedAddress(hex::encode_upper(&prefix[..4])))?;
            table.get(idx).sid
        }
        OA_CODE_BROADCAST => {
            let mut id = [0u8; BROADCAST_ID_BYTES];
            id.copy_from_slice(buffer.get_bytes(BROADCAST_ID_BYTES)?);
            return Ok(AddressRef::Broadcast(id));
        }
        other => return Err(OverlayError::UnknownAddressCode(other)),
    };
    ctx.previous = Some(sid);
    let idx = if ctx.admit {
        table.find_or_create(sid, now)
    } else {
        table
            .find(&sid)
            .ok_or_else(|| OverlayError::UnresolvedAddress(hex::encode_upper(sid.prefix(4))))?
    };
    Ok(AddressRef::Subscriber(idx))
}

/// Append a self-announce frame. `full` forces the uncompressed SID (set
/// after an interface comes up so new neighbours can learn us).
pub fn append_self_announce(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    sid: &Sid,
    full: bool,
) -> Result<(), OverlayError> {
    buffer.checkpoint();
    let result = (|| {
        buffer.append_byte(FRAME_SELF_ANNOUNCE)?;
        buffer.append_byte(1)?;
        buffer.append_rfs(1 + SID_BYTES)?;
        let mark = buffer.position();
        append_address(buffer, ctx, sid, full)?;
        buffer.patch_rfs(buffer.position() - mark)
    })();
    if result.is_err() {
        buffer.rewind();
    }
    result
}

/// Append a route advertisement listing directly reachable neighbours.
pub fn append_route_advert(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    entries: &[(Sid, u8)],
) -> Result<(), OverlayError> {
    buffer.checkpoint();
    let result = (|| {
        buffer.append_byte(FRAME_ROUTE_ADVERT)?;
        buffer.append_byte(1)?;
        buffer.append_rfs(1 + entries.len() * (SID_BYTES + 1))?;
        let mark = buffer.position();
        buffer.append_byte(entries.len() as u8)?;
        for (sid, cost) in entries {
            buffer.append_bytes(sid.as_bytes())?;
            buffer.append_byte(*cost)?;
        }
        buffer.patch_rfs(buffer.position() - mark)
    })();
    if result.is_err() {
        buffer.rewind();
    }
    result
}

/// Append an MDP data frame addressed to a subscriber or a broadcast id.
pub fn append_mdp_frame(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    source: &Sid,
    destination: Option<&Sid>,
    broadcast_id: Option<&[u8; BROADCAST_ID_BYTES]>,
    ttl: u8,
    payload: &[u8],
) -> Result<(), OverlayError> {
    buffer.checkpoint();
    let result = (|| {
        buffer.append_byte(FRAME_MDP)?;
        buffer.append_byte(ttl.min(MAX_TTL))?;
        buffer.append_rfs(2 + BROADCAST_ID_BYTES.max(SID_BYTES + 1) * 2 + payload.len())?;
        let mark = buffer.position();
        match (destination, broadcast_id) {
            (Some(sid), _) => append_address(buffer, ctx, sid, false)?,
            (None, Some(id)) => append_broadcast_address(buffer, id)?,
            (None, None) => return Err(OverlayError::NoPreviousAddress),
        }
        append_address(buffer, ctx, source, false)?;
        buffer.append_bytes(payload)?;
        buffer.patch_rfs(buffer.position() - mark)
    })();
    if result.is_err() {
        buffer.rewind();
    }
    result
}

/// Append a rhizome bundle advertisement (opaque to the overlay layer).
pub fn append_rhizome_advert(
    buffer: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    source: &Sid,
    payload: &[u8],
) -> Result<(), OverlayError> {
    buffer.checkpoint();
    let result = (|| {
        buffer.append_byte(FRAME_RHIZOME_ADVERT)?;
        buffer.append_byte(1)?;
        buffer.append_rfs(1 + SID_BYTES + payload.len())?;
        let mark = buffer.position();
        append_address(buffer, ctx, source, false)?;
        buffer.append_bytes(payload)?;
        buffer.patch_rfs(buffer.position() - mark)
    })();
    if result.is_err() {
        buffer.rewind();
    }
    result
}

/// Parse a received packet into frames, updating the subscriber table.
///
/// Frame-level problems (unknown type, unresolvable abbreviation) drop that
/// frame and keep going; only a missing magic rejects the whole packet.
pub fn decode_packet(
    bytes: &[u8],
    table: &mut SubscriberTable,
    iface: usize,
    src_addr: Option<SocketAddr>,
    unicast: bool,
    now: u64,
) -> Result<Vec<OverlayFrame>, OverlayError> {
    if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
        let mut magic = [0u8; 4];
        let head = bytes.len().min(4);
        magic[..head].copy_from_slice(&bytes[..head]);
        return Err(OverlayError::BadMagic(magic));
    }
    let mut buffer = OverlayBuffer::wrap(bytes.to_vec());
    let _ = buffer.get_bytes(MAGIC.len())?;

    let mut ctx = AddressContext::new();
    let mut frames = Vec::new();

    while buffer.read_remaining() > 0 {
        let frame_type = buffer.get_byte()?;
        let ttl = buffer.get_byte()? & MAX_TTL;
        let len = buffer.get_rfs()?;
        if len > buffer.read_remaining() {
            return Err(OverlayError::TruncatedFrame { len });
        }
        let body = buffer.get_bytes(len)?.to_vec();
        let mut body = OverlayBuffer::wrap(body);

        // a fresh parse context per frame would defeat PREVIOUS compression,
        // so the packet context threads through all frames
        let parsed = decode_frame(
            frame_type,
            ttl,
            &mut body,
            &mut ctx,
            table,
            iface,
            src_addr,
            unicast,
            now,
        );
        match parsed {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => {}
            Err(err) => {
                log::debug!("ov: dropping frame type 0x{frame_type:02x}: {err}");
            }
        }
    }
    Ok(frames)
}

#[allow(clippy::too_many_arguments)]
fn decode_frame(
    frame_type: u8,
    ttl: u8,
    body: &mut OverlayBuffer,
    ctx: &mut AddressContext,
    table: &mut SubscriberTable,
    iface: usize,
    src_addr: Option<SocketAddr>,
    unicast: bool,
    now: u64,
) -> Result<Option<OverlayFrame>, OverlayError> {
    match frame_type {
        FRAME_SELF_ANNOUNCE => {
            ctx.admit = true;
            let sender = match read_address(body, ctx, table, now)? {
                AddressRef::Subscriber(idx) => idx,
                AddressRef::Broadcast(_) => return Err(OverlayError::NoPreviousAddress),
            };
            let reachability = if unicast { Reachability::Unicast } else { Reachability::Broadcast };
            table.mark_heard(sender, reachability, iface, src_addr, now);
            ctx.sender = Some(sender);
            Ok(Some(OverlayFrame::SelfAnnounce { sender }))
        }
        FRAME_ROUTE_ADVERT => {
            let sender = ctx.sender.ok_or(OverlayError::NoPreviousAddress)?;
            let count = body.get_byte()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let sid = Sid::from_slice(body.get_bytes(SID_BYTES)?)?;
                let cost = body.get_byte()?;
                entries.push((sid, cost));
            }
            Ok(Some(OverlayFrame::RouteAdvert { sender, entries }))
        }
        FRAME_MDP => {
            let destination = read_address(body, ctx, table, now)?;
            let sender = match read_address(body, ctx, table, now)? {
                AddressRef::Subscriber(idx) => idx,
                AddressRef::Broadcast(_) => return Err(OverlayError::NoPreviousAddress),
            };
            let payload = body.get_bytes(body.read_remaining())?.to_vec();
            Ok(Some(OverlayFrame::Mdp { sender, destination, ttl, payload }))
        }
        FRAME_RHIZOME_ADVERT => {
            let sender = match read_address(body, ctx, table, now)? {
                AddressRef::Subscriber(idx) => idx,
                AddressRef::Broadcast(_) => return Err(OverlayError::NoPreviousAddress),
            };
            let payload = body.get_bytes(body.read_remaining())?.to_vec();
            Ok(Some(OverlayFrame::RhizomeAdvert { sender, payload }))
        }
        other => {
            log::debug!("ov: ignoring unknown frame type 0x{other:02x}");
            Ok(None)
        }
    }
}
