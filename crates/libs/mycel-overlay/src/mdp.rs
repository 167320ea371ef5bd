//! Mesh datagram protocol: the port-addressed layer riding overlay MDP
//! frames. The overlay header carries the source and destination SIDs; the
//! MDP body adds the two ports and the application payload.

use mycel_identity::Sid;

use crate::buffer::OverlayBuffer;
use crate::error::OverlayError;

pub const MDP_PORT_VOMP: u32 = 2;
pub const MDP_PORT_RHIZOME: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdpPacket {
    pub src: Sid,
    pub dst: Option<Sid>,
    pub src_port: u32,
    pub dst_port: u32,
    pub payload: Vec<u8>,
}

impl MdpPacket {
    /// Encode the frame body (ports + payload); addresses travel in the
    /// overlay frame header.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buffer = OverlayBuffer::new();
        // writes to an uncapped buffer cannot fail
        let _ = buffer.append_u32(self.src_port);
        let _ = buffer.append_u32(self.dst_port);
        let _ = buffer.append_bytes(&self.payload);
        buffer.into_bytes()
    }

    pub fn decode_body(src: Sid, dst: Option<Sid>, body: &[u8]) -> Result<Self, OverlayError> {
        let mut buffer = OverlayBuffer::wrap(body.to_vec());
        let src_port = buffer.get_u32()?;
        let dst_port = buffer.get_u32()?;
        let payload = buffer.get_bytes(buffer.read_remaining())?.to_vec();
        Ok(Self { src, dst, src_port, dst_port, payload })
    }
}
