//! Wire decoders for DSM-CC object and data carousels.
//!
//! Everything in this crate is a pure function of the bytes it is given:
//! no I/O, no state kept between calls. Input is untrusted broadcast data,
//! so every length is checked and every failure is a [`ParseError`] that
//! names the field and the offset where decoding stopped.
//!
//! # Layers
//!
//! ```text
//! private section ──► Section::parse (header, CRC32 gate)
//!                       │
//!                       ├─ table 0x3B ─► Dsi::parse / Dii::parse
//!                       └─ table 0x3C ─► Ddb::parse
//!
//! complete module ──► biop::parse_module ─► directories / files
//! ```
//!
//! # Example
//!
//! ```rust
//! use dsmcc_protocol::{Section, MessageHeader, message_id};
//!
//! fn route(raw: &[u8]) {
//!     let Ok(section) = Section::parse(raw) else { return };
//!     if let Ok((header, _body)) = MessageHeader::parse(&section) {
//!         if header.message_id == message_id::DSI {
//!             // new carousel root
//!         }
//!     }
//! }
//! ```

pub mod biop;
pub mod descriptors;
pub mod error;
pub mod message;
pub mod reader;
pub mod section;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use biop::{parse_module, BiopObject, Binding, Ior, ObjectId, ObjectKey, ObjectKind};
pub use descriptors::{Compressed, Descriptor};
pub use error::ParseError;
pub use message::{
    message_id, transaction_matches, BiopModuleInfo, CarouselKind, Ddb, Dii, Dsi, DsiBody,
    GroupInfo, GroupInfoIndication, MessageHeader, ModuleDescriptor, ModuleInfo,
    ServiceGatewayInfo, TRANSACTION_ID_ANY,
};
pub use reader::Reader;
pub use section::{crc32_mpeg2, table_id, Section, SectionFilter, MAX_SECTION_SIZE};
