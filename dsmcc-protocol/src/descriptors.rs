//! Data carousel descriptors (EN 301 192 / MHP) found in DII module info.
//!
//! Recognised tags decode to typed values; unknown tags are skipped with a
//! warning. A descriptor whose body does not fit its own tag's layout is
//! dropped with a warning too. Only a length byte that runs past the end of
//! the loop aborts the loop.

use log::warn;

use crate::error::ParseError;
use crate::reader::Reader;

/// Descriptor tags.
pub mod tag {
    pub const TYPE: u8 = 0x01;
    pub const NAME: u8 = 0x02;
    pub const INFO: u8 = 0x03;
    pub const MODULE_LINK: u8 = 0x04;
    pub const CRC32: u8 = 0x05;
    pub const LOCATION: u8 = 0x06;
    pub const EST_DOWNLOAD_TIME: u8 = 0x07;
    pub const GROUP_LINK: u8 = 0x08;
    pub const COMPRESSED_MODULE: u8 = 0x09;
    pub const LABEL: u8 = 0x70;
    pub const CACHING_PRIORITY: u8 = 0x71;
    pub const CONTENT_TYPE: u8 = 0x72;
}

/// Compressed module descriptor (0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressed {
    /// Compression method; low nibble 0x8 is zlib/deflate.
    pub method: u8,
    /// Size of the module once inflated.
    pub original_size: u32,
}

impl Compressed {
    /// Whether the method is deflate in a zlib wrapper.
    pub fn is_zlib(&self) -> bool {
        self.method & 0x0F == 0x08
    }
}

/// A decoded descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// MIME type of the module content.
    Type(String),
    /// Module name.
    Name(String),
    /// Human readable description.
    Info { language: [u8; 3], text: String },
    /// Chains modules that form one logical item.
    ModuleLink { position: u8, module_id: u16 },
    /// CRC32 of the module content.
    Crc32(u32),
    /// Component tag of the stream carrying the blocks.
    Location(u8),
    /// Estimated download time in seconds.
    EstDownloadTime(u32),
    /// Chains groups of a two-layer data carousel.
    GroupLink { position: u8, group_id: u32 },
    /// Module is compressed.
    Compressed(Compressed),
    /// Label (MHP).
    Label(String),
    /// Caching priority (MHP).
    CachingPriority { priority: u8, transparency_level: u8 },
    /// Content type (MHP).
    ContentType(String),
}

impl Descriptor {
    fn decode(tag: u8, body: &[u8], position: usize) -> Result<Option<Self>, ParseError> {
        let mut r = Reader::with_base(body, position);
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
        let descriptor = match tag {
            tag::TYPE => Descriptor::Type(text(r.rest())),
            tag::NAME => Descriptor::Name(text(r.rest())),
            tag::INFO => {
                let lang = r.bytes("info language", 3)?;
                Descriptor::Info {
                    language: [lang[0], lang[1], lang[2]],
                    text: text(r.rest()),
                }
            }
            tag::MODULE_LINK => Descriptor::ModuleLink {
                position: r.u8("link position")?,
                module_id: r.u16("link module id")?,
            },
            tag::CRC32 => Descriptor::Crc32(r.u32("crc32")?),
            tag::LOCATION => Descriptor::Location(r.u8("location tag")?),
            tag::EST_DOWNLOAD_TIME => Descriptor::EstDownloadTime(r.u32("download time")?),
            tag::GROUP_LINK => Descriptor::GroupLink {
                position: r.u8("link position")?,
                group_id: r.u32("link group id")?,
            },
            tag::COMPRESSED_MODULE => Descriptor::Compressed(Compressed {
                method: r.u8("compression method")?,
                original_size: r.u32("original size")?,
            }),
            tag::LABEL => Descriptor::Label(text(r.rest())),
            tag::CACHING_PRIORITY => Descriptor::CachingPriority {
                priority: r.u8("priority")?,
                transparency_level: r.u8("transparency level")?,
            },
            tag::CONTENT_TYPE => Descriptor::ContentType(text(r.rest())),
            _ => return Ok(None),
        };
        Ok(Some(descriptor))
    }
}

/// Decode a descriptor loop.
pub fn parse_descriptors(r: &mut Reader<'_>) -> Result<Vec<Descriptor>, ParseError> {
    let mut out = Vec::new();
    while !r.is_empty() {
        let tag = r.u8("descriptor tag")?;
        let length = r.u8("descriptor length")? as usize;
        let position = r.position();
        let body = r.bytes("descriptor body", length)?;
        match Descriptor::decode(tag, body, position) {
            Ok(Some(d)) => out.push(d),
            Ok(None) => warn!("Skipping unknown descriptor tag 0x{:02X} ({} bytes)", tag, length),
            Err(e) => warn!("Skipping malformed descriptor 0x{:02X}: {}", tag, e),
        }
    }
    Ok(out)
}

/// First compressed-module descriptor of a list.
pub fn find_compressed(descriptors: &[Descriptor]) -> Option<Compressed> {
    descriptors.iter().find_map(|d| match d {
        Descriptor::Compressed(c) => Some(*c),
        _ => None,
    })
}

/// First name descriptor of a list.
pub fn find_name(descriptors: &[Descriptor]) -> Option<&str> {
    descriptors.iter().find_map(|d| match d {
        Descriptor::Name(n) => Some(n.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_tags() {
        let data = [
            tag::COMPRESSED_MODULE, 5, 0x08, 0x00, 0x00, 0x10, 0x00, // compressed
            0x99, 2, 0xAA, 0xBB, // unknown
            tag::NAME, 4, b'a', b'.', b'j', b's', // name
        ];
        let mut r = Reader::new(&data);
        let list = parse_descriptors(&mut r).unwrap();
        assert_eq!(list.len(), 2);
        let c = find_compressed(&list).unwrap();
        assert!(c.is_zlib());
        assert_eq!(c.original_size, 0x1000);
        assert_eq!(find_name(&list), Some("a.js"));
    }

    #[test]
    fn test_short_body_is_skipped() {
        let data = [tag::CRC32, 2, 0x00, 0x01, tag::LOCATION, 1, 0x42];
        let mut r = Reader::new(&data);
        let list = parse_descriptors(&mut r).unwrap();
        assert_eq!(list, vec![Descriptor::Location(0x42)]);
    }

    #[test]
    fn test_length_past_end_fails() {
        let data = [tag::NAME, 10, b'x'];
        let mut r = Reader::new(&data);
        assert!(matches!(
            parse_descriptors(&mut r),
            Err(ParseError::Truncated { .. })
        ));
    }
}
