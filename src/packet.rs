//! Wire packet formats.
//!
//! All multi-byte fields are network byte order. The common header is 16
//! bytes and is carried by every packet type; DATA adds the segment header
//! and payload, the control types add small fixed bodies.

use std::net::IpAddr;

use crate::config::MAX_PRIORITIES;
use crate::error::{HomaError, Result};

/// Size of the common header present on every packet.
pub const COMMON_HDR_SIZE: usize = 16;

/// Size of the DATA-specific header (segment descriptor included) that
/// follows the common header.
pub const DATA_HDR_SIZE: usize = 32;

/// Size of one wire-encoded ack.
pub const ACK_SIZE: usize = 12;

/// Most acks that fit in a single ACK packet.
pub const MAX_ACKS_PER_PKT: usize = 5;

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    Data = 0x10,
    Grant = 0x11,
    Resend = 0x12,
    Unknown = 0x13,
    Busy = 0x14,
    Cutoffs = 0x15,
    NeedAck = 0x17,
    Ack = 0x18,
}

impl TryFrom<u8> for PktType {
    type Error = HomaError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x10 => Ok(PktType::Data),
            0x11 => Ok(PktType::Grant),
            0x12 => Ok(PktType::Resend),
            0x13 => Ok(PktType::Unknown),
            0x14 => Ok(PktType::Busy),
            0x15 => Ok(PktType::Cutoffs),
            0x17 => Ok(PktType::NeedAck),
            0x18 => Ok(PktType::Ack),
            _ => Err(HomaError::BadPacket("unknown packet type")),
        }
    }
}

/// Fields shared by every packet.
///
/// `sender_id` is the RPC id in the *sender's* id space; the receiver flips
/// the low bit to get its local id.
///
/// # Layout
///
/// | Offset | Size | Field     |
/// | -----: | ---: | --------- |
/// |      0 |    2 | sport     |
/// |      2 |    2 | dport     |
/// |      4 |    1 | type      |
/// |      5 |    3 | reserved  |
/// |      8 |    8 | sender_id |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    pub sender_id: u64,
}

impl CommonHeader {
    fn encode_into(&self, ty: PktType, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sport.to_be_bytes());
        buf.extend_from_slice(&self.dport.to_be_bytes());
        buf.push(ty as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.sender_id.to_be_bytes());
    }

    fn parse(bytes: &[u8]) -> Result<(Self, PktType)> {
        if bytes.len() < COMMON_HDR_SIZE {
            return Err(HomaError::BadPacket("truncated common header"));
        }
        let ty = PktType::try_from(bytes[4])?;
        Ok((
            Self {
                sport: u16::from_be_bytes([bytes[0], bytes[1]]),
                dport: u16::from_be_bytes([bytes[2], bytes[3]]),
                sender_id: u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            },
            ty,
        ))
    }
}

/// One acknowledged RPC, identified from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack {
    pub client_id: u64,
    pub client_port: u16,
    pub server_port: u16,
}

impl Ack {
    /// An ack with `client_id == 0` means "no ack".
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.client_id == 0
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_id.to_be_bytes());
        buf.extend_from_slice(&self.client_port.to_be_bytes());
        buf.extend_from_slice(&self.server_port.to_be_bytes());
    }

    fn parse(bytes: &[u8]) -> Self {
        Self {
            client_id: u64::from_be_bytes(bytes[0..8].try_into().unwrap()),
            client_port: u16::from_be_bytes([bytes[8], bytes[9]]),
            server_port: u16::from_be_bytes([bytes[10], bytes[11]]),
        }
    }
}

/// Type-specific packet contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// One segment of message data.
    ///
    /// `incoming` is the sender's unscheduled allowance for this message;
    /// `ack` may acknowledge a *different* RPC (piggybacked).
    Data {
        message_length: i64,
        incoming: i64,
        cutoff_version: u16,
        retransmit: bool,
        offset: i64,
        ack: Ack,
        payload: Vec<u8>,
    },
    Grant {
        offset: i64,
        priority: u8,
        resend_all: bool,
    },
    Resend {
        offset: i64,
        length: i64,
        priority: u8,
    },
    Unknown,
    Busy,
    Cutoffs {
        unsched_cutoffs: [i32; MAX_PRIORITIES],
        cutoff_version: u16,
    },
    NeedAck,
    Ack {
        acks: Vec<Ack>,
    },
}

/// A parsed inbound packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Source address, as reported by the datagram layer.
    pub src: IpAddr,
    pub common: CommonHeader,
    pub body: PacketBody,
}

impl Packet {
    /// Parse a datagram. The payload of a DATA packet is copied out of
    /// `bytes`; control packets borrow nothing.
    pub fn parse(src: IpAddr, bytes: &[u8]) -> Result<Packet> {
        let (common, ty) = CommonHeader::parse(bytes)?;
        let rest = &bytes[COMMON_HDR_SIZE..];
        let body = match ty {
            PktType::Data => {
                if rest.len() < DATA_HDR_SIZE {
                    return Err(HomaError::BadPacket("truncated DATA header"));
                }
                let message_length = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as i64;
                let incoming = u32::from_be_bytes(rest[4..8].try_into().unwrap()) as i64;
                let cutoff_version = u16::from_be_bytes([rest[8], rest[9]]);
                let retransmit = rest[10] != 0;
                let offset = u32::from_be_bytes(rest[12..16].try_into().unwrap()) as i64;
                let seg_length = u32::from_be_bytes(rest[16..20].try_into().unwrap()) as usize;
                let ack = Ack::parse(&rest[20..32]);
                let payload = &rest[DATA_HDR_SIZE..];
                if payload.len() < seg_length {
                    return Err(HomaError::BadPacket("DATA shorter than segment length"));
                }
                PacketBody::Data {
                    message_length,
                    incoming,
                    cutoff_version,
                    retransmit,
                    offset,
                    ack,
                    payload: payload[..seg_length].to_vec(),
                }
            }
            PktType::Grant => {
                if rest.len() < 8 {
                    return Err(HomaError::BadPacket("truncated GRANT"));
                }
                PacketBody::Grant {
                    offset: u32::from_be_bytes(rest[0..4].try_into().unwrap()) as i64,
                    priority: rest[4],
                    resend_all: rest[5] != 0,
                }
            }
            PktType::Resend => {
                if rest.len() < 12 {
                    return Err(HomaError::BadPacket("truncated RESEND"));
                }
                PacketBody::Resend {
                    offset: u32::from_be_bytes(rest[0..4].try_into().unwrap()) as i64,
                    length: u32::from_be_bytes(rest[4..8].try_into().unwrap()) as i64,
                    priority: rest[8],
                }
            }
            PktType::Unknown => PacketBody::Unknown,
            PktType::Busy => PacketBody::Busy,
            PktType::Cutoffs => {
                if rest.len() < 4 * MAX_PRIORITIES + 2 {
                    return Err(HomaError::BadPacket("truncated CUTOFFS"));
                }
                let mut unsched_cutoffs = [0i32; MAX_PRIORITIES];
                for (i, cutoff) in unsched_cutoffs.iter_mut().enumerate() {
                    *cutoff =
                        i32::from_be_bytes(rest[4 * i..4 * i + 4].try_into().unwrap());
                }
                let base = 4 * MAX_PRIORITIES;
                PacketBody::Cutoffs {
                    unsched_cutoffs,
                    cutoff_version: u16::from_be_bytes([rest[base], rest[base + 1]]),
                }
            }
            PktType::NeedAck => PacketBody::NeedAck,
            PktType::Ack => {
                if rest.len() < 4 {
                    return Err(HomaError::BadPacket("truncated ACK"));
                }
                let num_acks = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                if num_acks > MAX_ACKS_PER_PKT || rest.len() < 4 + num_acks * ACK_SIZE {
                    return Err(HomaError::BadPacket("bad ACK count"));
                }
                let acks = (0..num_acks)
                    .map(|i| Ack::parse(&rest[4 + i * ACK_SIZE..4 + (i + 1) * ACK_SIZE]))
                    .collect();
                PacketBody::Ack { acks }
            }
        };
        Ok(Packet { src, common, body })
    }

    /// Encode this packet to wire bytes. Mostly useful for tests and
    /// loopback transports; the receive path only parses.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMON_HDR_SIZE + DATA_HDR_SIZE);
        match &self.body {
            PacketBody::Data {
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                offset,
                ack,
                payload,
            } => {
                self.common.encode_into(PktType::Data, &mut buf);
                buf.extend_from_slice(&(*message_length as u32).to_be_bytes());
                buf.extend_from_slice(&(*incoming as u32).to_be_bytes());
                buf.extend_from_slice(&cutoff_version.to_be_bytes());
                buf.push(u8::from(*retransmit));
                buf.push(0);
                buf.extend_from_slice(&(*offset as u32).to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                ack.encode_into(&mut buf);
                buf.extend_from_slice(payload);
            }
            PacketBody::Grant {
                offset,
                priority,
                resend_all,
            } => {
                self.common.encode_into(PktType::Grant, &mut buf);
                buf.extend_from_slice(&(*offset as u32).to_be_bytes());
                buf.push(*priority);
                buf.push(u8::from(*resend_all));
                buf.extend_from_slice(&[0u8; 2]);
            }
            PacketBody::Resend {
                offset,
                length,
                priority,
            } => {
                self.common.encode_into(PktType::Resend, &mut buf);
                buf.extend_from_slice(&(*offset as u32).to_be_bytes());
                buf.extend_from_slice(&(*length as u32).to_be_bytes());
                buf.push(*priority);
                buf.extend_from_slice(&[0u8; 3]);
            }
            PacketBody::Unknown => self.common.encode_into(PktType::Unknown, &mut buf),
            PacketBody::Busy => self.common.encode_into(PktType::Busy, &mut buf),
            PacketBody::Cutoffs {
                unsched_cutoffs,
                cutoff_version,
            } => {
                self.common.encode_into(PktType::Cutoffs, &mut buf);
                for cutoff in unsched_cutoffs {
                    buf.extend_from_slice(&cutoff.to_be_bytes());
                }
                buf.extend_from_slice(&cutoff_version.to_be_bytes());
                buf.extend_from_slice(&[0u8; 2]);
            }
            PacketBody::NeedAck => self.common.encode_into(PktType::NeedAck, &mut buf),
            PacketBody::Ack { acks } => {
                self.common.encode_into(PktType::Ack, &mut buf);
                buf.extend_from_slice(&(acks.len() as u16).to_be_bytes());
                buf.extend_from_slice(&[0u8; 2]);
                for ack in acks {
                    ack.encode_into(&mut buf);
                }
            }
        }
        buf
    }
}
