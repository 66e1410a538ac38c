//! MPEG-TS packet parsing.
//!
//! Only what section reassembly needs is decoded: the header fields, the
//! adaptation field discontinuity flag and the payload slice.

use thiserror::Error;

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Null packet PID.
pub const NULL_PID: u16 = 0x1FFF;

/// Packet-level rejections.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid sync byte 0x{0:02X}")]
    BadSync(u8),
    #[error("Adaptation field length {0} exceeds packet")]
    AdaptationOverflow(u8),
}

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    /// Transport scrambling control (2 bits).
    pub scrambling_control: u8,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }
}

/// A parsed TS packet.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    /// Discontinuity indicator of the adaptation field.
    pub discontinuity: bool,
    /// Payload bytes (empty when the packet carries none).
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parse a packet from the first 188 bytes of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() < TS_PACKET_SIZE {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(PacketError::BadSync(data[0]));
        }

        let header = TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        };

        let mut offset = 4;
        let mut discontinuity = false;
        if header.has_adaptation_field() {
            let af_length = data[4];
            offset = 5 + af_length as usize;
            if offset > TS_PACKET_SIZE {
                return Err(PacketError::AdaptationOverflow(af_length));
            }
            discontinuity = af_length > 0 && data[5] & 0x80 != 0;
        }

        let payload = if header.has_payload() {
            &data[offset..TS_PACKET_SIZE]
        } else {
            &[]
        };

        Ok(TsPacket {
            header,
            discontinuity,
            payload,
        })
    }
}

/// Iterator over TS packets in a byte stream, resynchronising on garbage.
pub struct TsPacketIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TsPacketIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let offset = data.iter().position(|b| *b == SYNC_BYTE).unwrap_or(data.len());
        Self { data, offset }
    }

    /// Bytes not yet consumed (a trailing partial packet).
    pub fn remainder(&self) -> &'a [u8] {
        &self.data[self.offset.min(self.data.len())..]
    }

    fn resync(&mut self) {
        self.offset += 1;
        while self.offset < self.data.len() && self.data[self.offset] != SYNC_BYTE {
            self.offset += 1;
        }
    }
}

impl<'a> Iterator for TsPacketIterator<'a> {
    type Item = TsPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset + TS_PACKET_SIZE <= self.data.len() {
            match TsPacket::parse(&self.data[self.offset..]) {
                Ok(packet) => {
                    self.offset += TS_PACKET_SIZE;
                    return Some(packet);
                }
                Err(_) => self.resync(),
            }
        }
        None
    }
}
