use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed part of every inner packet: type, reserved byte, transfer id.
pub const HEADER_LEN: usize = 6;

/// The only defined ERR code: the peer has no session for the transfer id.
pub const ERR_ID_NOT_FOUND: u16 = 0x0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub transfer_id: u32,
    pub kind: PacketKind,
}

/// The five packet kinds. PSH fragment data and the REQ sequence list follow
///  the header fields on the wire and are handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// One fragment of a transfer.
    Push {
        seq: u16,
        /// The sender's current burst window - bounds how many holes the
        ///  receiver asks for per REQ.
        single_total: u16,
        total_count: u16,
    },
    /// Selective-repeat request; payload is the run-encoded sequence list.
    Request,
    /// Transfer fully received.
    Finish,
    /// Acknowledges a control packet of the given wire code.
    Ack { acked: u8 },
    /// Protocol-level error notification.
    Error { code: u16 },
}

impl PacketKind {
    pub const PUSH: u8 = 0x01;
    pub const REQUEST: u8 = 0x02;
    pub const FINISH: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const ERROR: u8 = 0x05;

    pub fn wire_code(&self) -> u8 {
        match self {
            PacketKind::Push { .. } => Self::PUSH,
            PacketKind::Request => Self::REQUEST,
            PacketKind::Finish => Self::FINISH,
            PacketKind::Ack { .. } => Self::ACK,
            PacketKind::Error { .. } => Self::ERROR,
        }
    }
}

impl PacketHeader {
    pub fn new(transfer_id: u32, kind: PacketKind) -> PacketHeader {
        PacketHeader { transfer_id, kind }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.wire_code());
        buf.put_u8(0);
        buf.put_u32(self.transfer_id);

        match self.kind {
            PacketKind::Push { seq, single_total, total_count } => {
                buf.put_u16(seq);
                buf.put_u16(single_total);
                buf.put_u16(total_count);
            }
            PacketKind::Request => {}
            PacketKind::Finish => {}
            PacketKind::Ack { acked } => {
                buf.put_u8(acked);
            }
            PacketKind::Error { code } => {
                buf.put_u16(code);
            }
        }
    }

    /// Serializes a packet that carries nothing after its header fields.
    pub fn to_packet(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 3);
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < HEADER_LEN {
            bail!("packet of {} bytes is shorter than the fixed header", buf.remaining());
        }

        let wire_code = buf.get_u8();
        let _reserved = buf.get_u8();
        let transfer_id = buf.get_u32();

        let kind = match wire_code {
            PacketKind::PUSH => {
                if buf.remaining() < 6 {
                    bail!("truncated PSH fields");
                }
                PacketKind::Push {
                    seq: buf.get_u16(),
                    single_total: buf.get_u16(),
                    total_count: buf.get_u16(),
                }
            }
            PacketKind::REQUEST => PacketKind::Request,
            PacketKind::FINISH => PacketKind::Finish,
            PacketKind::ACK => {
                if buf.remaining() < 1 {
                    bail!("truncated ACK fields");
                }
                PacketKind::Ack { acked: buf.get_u8() }
            }
            PacketKind::ERROR => {
                if buf.remaining() < 2 {
                    bail!("truncated ERR fields");
                }
                PacketKind::Error { code: buf.get_u16() }
            }
            other => bail!("unknown packet type {:#04x}", other),
        };

        Ok(PacketHeader { transfer_id, kind })
    }
}
