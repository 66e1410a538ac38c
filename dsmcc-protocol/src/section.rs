//! MPEG-2 private section validation for DSM-CC tables.
//!
//! A section is accepted only when its header is well formed, the
//! `section_syntax_indicator` and `private_indicator` bits are complementary
//! and the CRC32 computed over the whole section (trailer included) leaves a
//! zero residue. Anything else is broadcast noise and is rejected.

use crate::error::ParseError;

/// Largest private section (header + payload + CRC) accepted.
pub const MAX_SECTION_SIZE: usize = 4096;

/// Bytes before the payload of a long-form section.
pub const SECTION_HEADER_SIZE: usize = 8;

/// Table IDs used by DSM-CC.
pub mod table_id {
    /// DownloadServerInitiate / DownloadInfoIndication (U-N messages).
    pub const DSI_DII: u8 = 0x3B;
    /// DownloadDataBlock.
    pub const DDB: u8 = 0x3C;
    /// Stream descriptors (not handled).
    pub const STREAM_DESCRIPTORS: u8 = 0x3D;
    /// Private data (not handled).
    pub const PRIVATE: u8 = 0x3E;
}

/// Private section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Private indicator.
    pub private_indicator: bool,
    /// Section length (12 bits), bytes following the length field.
    pub section_length: u16,
    /// Table ID extension (transaction id low bits or module id).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// A validated section.
#[derive(Debug, Clone)]
pub struct Section<'a> {
    /// Section header.
    pub header: SectionHeader,
    /// Payload (after header, before CRC).
    pub payload: &'a [u8],
    /// CRC32 trailer.
    pub crc32: u32,
}

impl<'a> Section<'a> {
    /// Validate a raw section starting at `table_id`.
    ///
    /// Bytes past the declared length (stuffing) are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < 3 {
            return Err(ParseError::SectionHeader("section too short for header"));
        }

        let table_id = data[0];
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let private_indicator = data[1] & 0x40 != 0;
        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;

        if section_syntax_indicator == private_indicator {
            return Err(ParseError::SectionHeader(
                "syntax and private indicators are not complementary",
            ));
        }
        if !section_syntax_indicator {
            return Err(ParseError::SectionHeader("checksum trailer is not supported"));
        }

        let total_length = 3 + section_length as usize;
        if total_length > MAX_SECTION_SIZE {
            return Err(ParseError::SectionHeader("section exceeds maximum size"));
        }
        if total_length < SECTION_HEADER_SIZE + 4 {
            return Err(ParseError::SectionHeader("section length too small"));
        }
        if data.len() < total_length {
            return Err(ParseError::SectionHeader("incomplete section data"));
        }

        let residue = crc32_mpeg2(&data[..total_length]);
        if residue != 0 {
            return Err(ParseError::Crc(residue));
        }

        let header = SectionHeader {
            table_id,
            section_syntax_indicator,
            private_indicator,
            section_length,
            table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
            version_number: (data[5] >> 1) & 0x1F,
            current_next_indicator: data[5] & 0x01 != 0,
            section_number: data[6],
            last_section_number: data[7],
        };

        let crc_offset = total_length - 4;
        let crc32 = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);

        Ok(Section {
            header,
            payload: &data[SECTION_HEADER_SIZE..crc_offset],
            crc32,
        })
    }

    /// Total section length including header and CRC.
    pub fn total_length(&self) -> usize {
        3 + self.header.section_length as usize
    }

    /// Offset of the payload inside the raw section, for error positions.
    pub fn payload_offset(&self) -> usize {
        SECTION_HEADER_SIZE
    }
}

/// Section filter handed to the broadcast stack.
///
/// The ten filter bytes cover `[table_id, ext_hi, ext_lo, version,
/// section_number, last_section_number, protocol, dsmcc_type, message_id_hi,
/// message_id_lo]`, the last four being the start of the DSM-CC message
/// header. A section matches when every bit selected by `equal_mask`
/// equals the pattern and, if `not_equal_mask` selects any bit, at least one
/// of those bits differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionFilter {
    pub pattern: [u8; FILTER_LEN],
    pub equal_mask: [u8; FILTER_LEN],
    pub not_equal_mask: [u8; FILTER_LEN],
}

/// Number of filter bytes.
pub const FILTER_LEN: usize = 10;

impl SectionFilter {
    fn new(table_id: u8) -> Self {
        let mut filter = Self {
            pattern: [0; FILTER_LEN],
            equal_mask: [0; FILTER_LEN],
            not_equal_mask: [0; FILTER_LEN],
        };
        filter.pattern[0] = table_id;
        filter.equal_mask[0] = 0xFF;
        filter
    }

    fn with_message_id(mut self, message_id: u16) -> Self {
        let [hi, lo] = message_id.to_be_bytes();
        self.pattern[6..10].copy_from_slice(&[
            crate::message::PROTOCOL_DISCRIMINATOR,
            crate::message::DSMCC_TYPE_DOWNLOAD,
            hi,
            lo,
        ]);
        self.equal_mask[6..10].copy_from_slice(&[0xFF; 4]);
        self
    }

    fn with_extension(mut self, extension: u16, mask: u16) -> Self {
        self.pattern[1..3].copy_from_slice(&(extension & mask).to_be_bytes());
        self.equal_mask[1..3].copy_from_slice(&mask.to_be_bytes());
        self
    }

    /// Any DownloadServerInitiate.
    pub fn dsi() -> Self {
        Self::new(table_id::DSI_DII).with_message_id(crate::message::message_id::DSI)
    }

    /// DownloadInfoIndication for a transaction id.
    ///
    /// Bit 0 of the transaction id toggles on updates, so it is not matched.
    pub fn dii(transaction_id: u32) -> Self {
        Self::new(table_id::DSI_DII)
            .with_extension(transaction_id as u16, 0xFFFE)
            .with_message_id(crate::message::message_id::DII)
    }

    /// DownloadDataBlocks of one module.
    pub fn ddb(module_id: u16) -> Self {
        Self::new(table_id::DDB)
            .with_extension(module_id, 0xFFFF)
            .with_message_id(crate::message::message_id::DDB)
    }

    /// Apply the filter in software to a raw section.
    pub fn matches(&self, section: &[u8]) -> bool {
        // Filter byte 0 is table_id, bytes 1.. map to section bytes 3..,
        // skipping the two length bytes.
        let mut any_not_equal = false;
        let mut wants_not_equal = false;
        for i in 0..FILTER_LEN {
            let offset = if i == 0 { 0 } else { i + 2 };
            let byte = match section.get(offset) {
                Some(b) => *b,
                None => return false,
            };
            if (byte ^ self.pattern[i]) & self.equal_mask[i] != 0 {
                return false;
            }
            if self.not_equal_mask[i] != 0 {
                wants_not_equal = true;
                if (byte ^ self.pattern[i]) & self.not_equal_mask[i] != 0 {
                    any_not_equal = true;
                }
            }
        }
        !wants_not_equal || any_not_equal
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
///
/// Running it over a section including its CRC trailer yields 0.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x80000000 != 0 {
                    crc = (crc << 1) ^ 0x04C11DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}
