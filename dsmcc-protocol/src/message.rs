//! DSM-CC download messages (ISO/IEC 13818-6 §7, TR 101 202 §4.7.5).
//!
//! ```text
//! +---------+---------+----------+-------------+-------+-----+--------+
//! | proto   | type    | msg id   | transaction | 0xFF  | adp | length |
//! | 0x11 u8 | 0x03 u8 | u16      | u32         | u8    | u8  | u16    |
//! +---------+---------+----------+-------------+-------+-----+--------+
//! ```
//!
//! DSI and DII share table 0x3B, DDB uses 0x3C. For a DDB the transaction
//! field carries the download id.

use log::{debug, warn};

use crate::biop::{parse_taps, Ior, ObjectKind, BIOP_OBJECT_USE};
use crate::descriptors::{parse_descriptors, Descriptor};
use crate::error::ParseError;
use crate::reader::Reader;
use crate::section::{table_id, Section};

/// DSM-CC protocol discriminator.
pub const PROTOCOL_DISCRIMINATOR: u8 = 0x11;
/// dsmccType of U-N download messages.
pub const DSMCC_TYPE_DOWNLOAD: u8 = 0x03;

/// Size of the DSM-CC message header.
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Server id length of a DSI.
pub const SERVER_ID_SIZE: usize = 20;

/// Message ids.
pub mod message_id {
    /// DownloadInfoIndication.
    pub const DII: u16 = 0x1002;
    /// DownloadDataBlock.
    pub const DDB: u16 = 0x1003;
    /// DownloadServerInitiate.
    pub const DSI: u16 = 0x1006;
}

/// Wildcard transaction id for subscriptions that take any DSI.
pub const TRANSACTION_ID_ANY: u32 = u32::MAX;

/// Whether two transaction ids name the same message. Bits 1-15 identify
/// the message; bit 0 and the upper half change with updates.
pub fn transaction_matches(a: u32, b: u32) -> bool {
    (a ^ b) & 0xFFFE == 0
}

/// Kind of carousel a DSI announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarouselKind {
    /// Object carousel: BIOP directory tree.
    Object,
    /// Data carousel: flat list of modules.
    Data,
}

/// DSM-CC message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u16,
    /// Transaction id, or download id for a DDB.
    pub transaction_id: u32,
    pub adaptation_length: u8,
    /// Bytes following the header, adaptation included.
    pub message_length: u16,
}

impl MessageHeader {
    /// Decode the header at the start of a section payload and return a
    /// reader over the message body (adaptation skipped).
    pub fn parse<'a>(section: &Section<'a>) -> Result<(Self, Reader<'a>), ParseError> {
        let mut r = Reader::with_base(section.payload, section.payload_offset());
        r.expect_u8("protocol discriminator", PROTOCOL_DISCRIMINATOR)?;
        r.expect_u8("dsmcc type", DSMCC_TYPE_DOWNLOAD)?;
        let message_id = r.u16("message id")?;
        let transaction_id = r.u32("transaction id")?;
        r.skip("reserved", 1)?;
        let adaptation_length = r.u8("adaptation length")?;
        let message_length = r.u16("message length")?;

        let mut body = r.sub("message", message_length as usize)?;
        body.skip("adaptation header", adaptation_length as usize)?;
        if !r.is_empty() {
            debug!("{} bytes after DSM-CC message 0x{:04X}", r.remaining(), message_id);
        }

        Ok((
            Self {
                message_id,
                transaction_id,
                adaptation_length,
                message_length,
            },
            body,
        ))
    }

    fn expect<'a>(
        section: &Section<'a>,
        table: u8,
        id: u16,
    ) -> Result<(Self, Reader<'a>), ParseError> {
        if section.header.table_id != table {
            return Err(ParseError::UnexpectedValue {
                field: "table id",
                position: 0,
                value: section.header.table_id as u32,
            });
        }
        let (header, body) = Self::parse(section)?;
        if header.message_id != id {
            return Err(ParseError::UnexpectedValue {
                field: "message id",
                position: section.payload_offset() + 2,
                value: header.message_id as u32,
            });
        }
        Ok((header, body))
    }
}

/// DownloadServerInitiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsi {
    pub transaction_id: u32,
    pub server_id: [u8; SERVER_ID_SIZE],
    pub body: DsiBody,
}

/// DSI private data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DsiBody {
    ObjectCarousel(ServiceGatewayInfo),
    DataCarousel(GroupInfoIndication),
}

/// Root of an object carousel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGatewayInfo {
    /// IOR of the service gateway.
    pub ior: Ior,
    pub user_info: Vec<u8>,
}

/// Group list of a two-layer data carousel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoIndication {
    pub groups: Vec<GroupInfo>,
    pub private_data: Vec<u8>,
}

/// One group of a data carousel. Its id is the transaction id of the
/// group's DII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_id: u32,
    pub group_size: u32,
    pub compatibility: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
}

impl Dsi {
    pub fn kind(&self) -> CarouselKind {
        match self.body {
            DsiBody::ObjectCarousel(_) => CarouselKind::Object,
            DsiBody::DataCarousel(_) => CarouselKind::Data,
        }
    }

    pub fn parse(section: &Section<'_>) -> Result<Self, ParseError> {
        let (header, mut r) = MessageHeader::expect(section, table_id::DSI_DII, message_id::DSI)?;

        let mut server_id = [0u8; SERVER_ID_SIZE];
        server_id.copy_from_slice(r.bytes("server id", SERVER_ID_SIZE)?);
        let position = r.position();
        let compat_len = r.u16("compatibility descriptor length")?;
        if compat_len != 0 {
            return Err(ParseError::UnexpectedValue {
                field: "compatibility descriptor length",
                position,
                value: compat_len as u32,
            });
        }
        let private_len = r.u16("private data length")?;
        let mut private = r.sub("private data", private_len as usize)?;

        let body = if Ior::starts_gateway(private.peek()) {
            DsiBody::ObjectCarousel(parse_gateway_info(&mut private)?)
        } else {
            DsiBody::DataCarousel(parse_group_info(&mut private)?)
        };

        Ok(Self {
            transaction_id: header.transaction_id,
            server_id,
            body,
        })
    }
}

fn parse_gateway_info(r: &mut Reader<'_>) -> Result<ServiceGatewayInfo, ParseError> {
    let ior = Ior::parse(r)?;
    if ior.kind != ObjectKind::ServiceGateway {
        return Err(ParseError::UnknownKind {
            position: r.position(),
            kind: format!("{:?}", ior.kind),
        });
    }
    r.expect_u8("download taps count", 0)?;
    r.expect_u8("service context list count", 0)?;
    let user_len = r.u16("user info length")?;
    let user_info = r.bytes("user info", user_len as usize)?.to_vec();
    Ok(ServiceGatewayInfo { ior, user_info })
}

fn parse_group_info(r: &mut Reader<'_>) -> Result<GroupInfoIndication, ParseError> {
    let count = r.u16("number of groups")?;
    let mut groups = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let group_id = r.u32("group id")?;
        let group_size = r.u32("group size")?;
        let compat_len = r.u16("group compatibility length")?;
        let compatibility = r.bytes("group compatibility", compat_len as usize)?.to_vec();
        let info_len = r.u16("group info length")?;
        let descriptors = parse_descriptors(&mut r.sub("group info", info_len as usize)?)?;
        groups.push(GroupInfo {
            group_id,
            group_size,
            compatibility,
            descriptors,
        });
    }
    // Some encoders leave the trailing private data out entirely.
    let private_data = if r.remaining() >= 2 {
        let len = r.u16("group private data length")?;
        r.bytes("group private data", len as usize)?.to_vec()
    } else {
        Vec::new()
    };
    Ok(GroupInfoIndication {
        groups,
        private_data,
    })
}

/// DownloadInfoIndication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dii {
    pub transaction_id: u32,
    /// Carousel id.
    pub download_id: u32,
    pub block_size: u16,
    pub window_size: u8,
    pub ack_period: u8,
    pub tc_download_window: u32,
    pub tc_download_scenario: u32,
    pub modules: Vec<ModuleDescriptor>,
    pub private_data: Vec<u8>,
}

/// One module announced by a DII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub module_id: u16,
    pub module_size: u32,
    pub module_version: u8,
    pub info: ModuleInfo,
}

/// Per-module info of a DII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleInfo {
    /// BIOP ModuleInfo of an object carousel.
    Biop(BiopModuleInfo),
    /// Descriptor loop of a data carousel.
    Data(Vec<Descriptor>),
}

/// BIOP ModuleInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiopModuleInfo {
    /// Microseconds.
    pub module_timeout: u32,
    /// Microseconds.
    pub block_timeout: u32,
    /// Microseconds.
    pub min_block_time: u32,
    /// Association tag of the stream carrying the DDBs, if given.
    pub assoc_tag: Option<u16>,
    pub descriptors: Vec<Descriptor>,
}

impl ModuleInfo {
    pub fn descriptors(&self) -> &[Descriptor] {
        match self {
            ModuleInfo::Biop(info) => &info.descriptors,
            ModuleInfo::Data(descriptors) => descriptors,
        }
    }

    fn parse(r: &mut Reader<'_>, kind: CarouselKind) -> Result<Self, ParseError> {
        match kind {
            CarouselKind::Data => Ok(ModuleInfo::Data(parse_descriptors(r)?)),
            CarouselKind::Object => {
                let module_timeout = r.u32("module timeout")?;
                let block_timeout = r.u32("block timeout")?;
                let min_block_time = r.u32("min block time")?;
                let assoc_tag = parse_taps(r, BIOP_OBJECT_USE)?.map(|tap| tap.assoc_tag);
                let user_len = r.u8("user info length")?;
                let descriptors = parse_descriptors(&mut r.sub("user info", user_len as usize)?)?;
                if !r.is_empty() {
                    warn!("{} stray bytes after BIOP module info", r.remaining());
                }
                Ok(ModuleInfo::Biop(BiopModuleInfo {
                    module_timeout,
                    block_timeout,
                    min_block_time,
                    assoc_tag,
                    descriptors,
                }))
            }
        }
    }
}

impl Dii {
    /// Decode a DII. The kind of the owning carousel selects how module
    /// info is read.
    pub fn parse(section: &Section<'_>, kind: CarouselKind) -> Result<Self, ParseError> {
        let (header, mut r) = MessageHeader::expect(section, table_id::DSI_DII, message_id::DII)?;

        let download_id = r.u32("download id")?;
        let block_size = r.u16("block size")?;
        let window_size = r.u8("window size")?;
        let ack_period = r.u8("ack period")?;
        let tc_download_window = r.u32("tc download window")?;
        let tc_download_scenario = r.u32("tc download scenario")?;
        let compat_len = r.u16("compatibility descriptor length")?;
        r.skip("compatibility descriptor", compat_len as usize)?;

        let count = r.u16("number of modules")?;
        let mut modules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let module_id = r.u16("module id")?;
            let module_size = r.u32("module size")?;
            let module_version = r.u8("module version")?;
            let info_len = r.u8("module info length")?;
            let mut info = r.sub("module info", info_len as usize)?;
            modules.push(ModuleDescriptor {
                module_id,
                module_size,
                module_version,
                info: ModuleInfo::parse(&mut info, kind)?,
            });
        }

        let private_len = r.u16("private data length")?;
        let private_data = r.bytes("private data", private_len as usize)?.to_vec();

        Ok(Self {
            transaction_id: header.transaction_id,
            download_id,
            block_size,
            window_size,
            ack_period,
            tc_download_window,
            tc_download_scenario,
            modules,
            private_data,
        })
    }
}

/// DownloadDataBlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ddb<'a> {
    pub download_id: u32,
    pub module_id: u16,
    pub module_version: u8,
    pub block_number: u16,
    pub data: &'a [u8],
}

impl<'a> Ddb<'a> {
    pub fn parse(section: &Section<'a>) -> Result<Self, ParseError> {
        let (header, mut r) = MessageHeader::expect(section, table_id::DDB, message_id::DDB)?;
        let module_id = r.u16("module id")?;
        let module_version = r.u8("module version")?;
        r.skip("reserved", 1)?;
        let block_number = r.u16("block number")?;
        Ok(Self {
            download_id: header.transaction_id,
            module_id,
            module_version,
            block_number,
            data: r.rest(),
        })
    }
}
