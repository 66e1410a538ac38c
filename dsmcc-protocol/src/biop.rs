//! BIOP records (TR 101 202 §4.7): object references, taps, message
//! headers, names and bindings.
//!
//! Everything here is decoded straight off the module or DSI buffer and
//! either handed up as an owned value or dropped at the end of the call.

use std::fmt;

use log::{debug, error, warn};

use crate::error::ParseError;
use crate::reader::Reader;

/// BIOP profile body.
pub const TAG_BIOP: u32 = 0x49534F06;
/// Lite options profile body (not supported, skipped).
pub const TAG_LITE_OPTIONS: u32 = 0x49534F05;
/// ObjectLocation lite component.
pub const TAG_OBJECT_LOCATION: u32 = 0x49534F50;
/// ConnBinder lite component.
pub const TAG_CONN_BINDER: u32 = 0x49534F40;

/// "BIOP".
pub const BIOP_MAGIC: u32 = 0x42494F50;

/// Tap carrying the DII of a carousel.
pub const BIOP_DELIVERY_PARA_USE: u16 = 0x0016;
/// Tap carrying the DDBs of a module.
pub const BIOP_OBJECT_USE: u16 = 0x0017;

/// Binding to a leaf object.
pub const BINDING_NOBJECT: u8 = 1;
/// Binding to a naming context (directory).
pub const BINDING_NCONTEXT: u8 = 2;

/// Longest object key accepted.
pub const MAX_OBJECT_KEY_LEN: usize = 4;

/// Object key of up to four bytes, kept with the mask of its length so keys
/// of different lengths never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub value: u32,
    pub mask: u32,
}

impl ObjectKey {
    /// Build a key from its raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_OBJECT_KEY_LEN {
            return None;
        }
        let value = bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let mask = match bytes.len() {
            0 => 0,
            4 => u32::MAX,
            n => (1u32 << (n * 8)) - 1,
        };
        Some(Self { value, mask })
    }

    fn parse(r: &mut Reader<'_>) -> Result<Self, ParseError> {
        let position = r.position();
        let len = r.u8("object key length")?;
        let bytes = r.bytes("object key", len as usize)?;
        Self::from_bytes(bytes).ok_or(ParseError::UnexpectedValue {
            field: "object key length",
            position,
            value: len as u32,
        })
    }
}

/// Identity of a carousel object: the module it lives in plus its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub module_id: u16,
    pub key: u32,
    pub key_mask: u32,
}

impl ObjectId {
    /// Root directory of a data carousel. A zero mask with a non-zero key
    /// cannot come off the wire.
    pub const DATA_ROOT: ObjectId = ObjectId {
        module_id: 0xFFFF,
        key: u32::MAX,
        key_mask: 0,
    };

    pub fn new(module_id: u16, key: ObjectKey) -> Self {
        Self {
            module_id,
            key: key.value,
            key_mask: key.mask,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:08X}/{:08X}", self.module_id, self.key, self.key_mask)
    }
}

/// BIOP object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// "srg"
    ServiceGateway,
    /// "dir"
    Directory,
    /// "fil"
    File,
    /// "str"
    Stream,
    /// "ste"
    StreamEvent,
}

impl ObjectKind {
    /// Decode a kind tag. The NUL terminator is optional.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        let tag = tag.strip_suffix(&[0]).unwrap_or(tag);
        match tag {
            b"srg" => Some(Self::ServiceGateway),
            b"dir" => Some(Self::Directory),
            b"fil" => Some(Self::File),
            b"str" => Some(Self::Stream),
            b"ste" => Some(Self::StreamEvent),
            _ => None,
        }
    }

    /// Wire tag including the terminator.
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            Self::ServiceGateway => b"srg\0",
            Self::Directory => b"dir\0",
            Self::File => b"fil\0",
            Self::Stream => b"str\0",
            Self::StreamEvent => b"ste\0",
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::ServiceGateway | Self::Directory)
    }

    fn decode(tag: &[u8], position: usize) -> Result<Self, ParseError> {
        Self::from_tag(tag).ok_or_else(|| ParseError::UnknownKind {
            position,
            kind: String::from_utf8_lossy(tag).into_owned(),
        })
    }
}

/// One tap. Only the first tap of a list is ever looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap<'a> {
    pub id: u16,
    pub tap_use: u16,
    pub assoc_tag: u16,
    pub selector: &'a [u8],
    /// Offset of the selector bytes, for error reporting.
    pub selector_position: usize,
}

impl<'a> Tap<'a> {
    fn parse(r: &mut Reader<'a>) -> Result<Self, ParseError> {
        let id = r.u16("tap id")?;
        let tap_use = r.u16("tap use")?;
        let assoc_tag = r.u16("tap association tag")?;
        let selector_length = r.u8("tap selector length")?;
        let selector_position = r.position();
        let selector = r.bytes("tap selector", selector_length as usize)?;
        Ok(Self {
            id,
            tap_use,
            assoc_tag,
            selector,
            selector_position,
        })
    }

    /// Decode the selector of a `BIOP_DELIVERY_PARA_USE` tap.
    pub fn delivery(&self) -> Result<DeliveryTap, ParseError> {
        let mut r = Reader::with_base(self.selector, self.selector_position);
        let position = r.position();
        let selector_type = r.u16("selector type")?;
        if selector_type != 1 {
            return Err(ParseError::UnexpectedValue {
                field: "selector type",
                position,
                value: selector_type as u32,
            });
        }
        Ok(DeliveryTap {
            assoc_tag: self.assoc_tag,
            transaction_id: r.u32("selector transaction id")?,
            timeout_us: r.u32("selector timeout")?,
        })
    }
}

/// Decode a tap list: count byte followed by the taps.
///
/// The first tap must have `required_use`; the others are skipped with a
/// warning. Returns `None` for an empty list.
pub fn parse_taps<'a>(
    r: &mut Reader<'a>,
    required_use: u16,
) -> Result<Option<Tap<'a>>, ParseError> {
    let count = r.u8("tap count")?;
    let mut first = None;
    for i in 0..count {
        let position = r.position();
        let tap = Tap::parse(r)?;
        if i == 0 {
            if tap.tap_use != required_use {
                return Err(ParseError::TapUse {
                    position,
                    expected: required_use,
                    actual: tap.tap_use,
                });
            }
            first = Some(tap);
        } else {
            warn!(
                "Ignoring extra tap #{} (use 0x{:04X}, assoc tag 0x{:04X})",
                i, tap.tap_use, tap.assoc_tag
            );
        }
    }
    Ok(first)
}

/// Connection parameters carried by a ConnBinder tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTap {
    pub assoc_tag: u16,
    pub transaction_id: u32,
    /// Timeout in microseconds, 0 when unspecified.
    pub timeout_us: u32,
}

/// Where an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLocation {
    pub carousel_id: u32,
    pub module_id: u16,
    pub key: ObjectKey,
}

impl ObjectLocation {
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.module_id, self.key)
    }

    fn parse(r: &mut Reader<'_>) -> Result<Self, ParseError> {
        let carousel_id = r.u32("carousel id")?;
        let module_id = r.u16("module id")?;
        let position = r.position();
        let major = r.u8("object location version")?;
        let minor = r.u8("object location version")?;
        if (major, minor) != (1, 0) {
            return Err(ParseError::UnsupportedVersion {
                what: "object location",
                position,
                major,
                minor,
            });
        }
        let key = ObjectKey::parse(r)?;
        Ok(Self {
            carousel_id,
            module_id,
            key,
        })
    }
}

/// Interoperable Object Reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ior {
    pub kind: ObjectKind,
    pub location: ObjectLocation,
    pub conn_binder: DeliveryTap,
}

impl Ior {
    /// Decode an IOR. The whole record is consumed before the type id is
    /// judged, so an [`ParseError::UnknownKind`] leaves the reader right
    /// after the IOR.
    pub fn parse(r: &mut Reader<'_>) -> Result<Self, ParseError> {
        let type_position = r.position();
        let type_len = r.u32("IOR type id length")? as usize;
        let type_id = r.sub("IOR type id", type_len)?.rest();
        r.skip("IOR alignment gap", (4 - type_len % 4) % 4)?;

        let count_position = r.position();
        let profiles = r.u32("tagged profile count")?;
        let mut body = None;
        for _ in 0..profiles {
            let tag = r.u32("profile id tag")?;
            let len = r.u32("profile data length")? as usize;
            let mut data = r.sub("profile data", len)?;
            match tag {
                TAG_BIOP if body.is_none() => body = Some(parse_profile_body(&mut data)?),
                TAG_BIOP => warn!("Ignoring additional BIOP profile body"),
                _ => debug!("Skipping profile 0x{:08X} ({} bytes)", tag, len),
            }
        }
        let (location, conn_binder) = body.ok_or(ParseError::UnexpectedValue {
            field: "BIOP profile count",
            position: count_position,
            value: 0,
        })?;

        Ok(Self {
            kind: ObjectKind::decode(type_id, type_position + 4)?,
            location,
            conn_binder,
        })
    }

    /// Whether the next bytes look like an IOR of a service gateway.
    pub fn starts_gateway(data: &[u8]) -> bool {
        let mut r = Reader::new(data);
        match r.u32("IOR type id length") {
            Ok(len @ 3..=4) => r
                .bytes("IOR type id", len as usize)
                .map(|tag| ObjectKind::from_tag(tag) == Some(ObjectKind::ServiceGateway))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn parse_profile_body(r: &mut Reader<'_>) -> Result<(ObjectLocation, DeliveryTap), ParseError> {
    let position = r.position();
    let byte_order = r.u8("profile byte order")?;
    if byte_order != 0 {
        return Err(ParseError::ByteOrder {
            position,
            value: byte_order,
        });
    }
    let position = r.position();
    let components = r.u8("lite component count")?;
    if components < 2 {
        return Err(ParseError::UnexpectedValue {
            field: "lite component count",
            position,
            value: components as u32,
        });
    }

    r.expect_u32("object location tag", TAG_OBJECT_LOCATION)?;
    let len = r.u8("object location length")?;
    let location = ObjectLocation::parse(&mut r.sub("object location", len as usize)?)?;

    r.expect_u32("conn binder tag", TAG_CONN_BINDER)?;
    let len = r.u8("conn binder length")?;
    let mut binder = r.sub("conn binder", len as usize)?;
    let position = binder.position();
    let tap = parse_taps(&mut binder, BIOP_DELIVERY_PARA_USE)?.ok_or(
        ParseError::UnexpectedValue {
            field: "conn binder tap count",
            position,
            value: 0,
        },
    )?;
    let delivery = tap.delivery()?;

    for _ in 2..components {
        let tag = r.u32("lite component tag")?;
        let len = r.u8("lite component length")?;
        r.skip("lite component", len as usize)?;
        debug!("Skipping lite component 0x{:08X}", tag);
    }
    Ok((location, delivery))
}

/// Strip the terminator from a binding name and refuse anything that is
/// not a single plain path component.
pub fn validate_name(raw: &[u8], position: usize) -> Result<String, ParseError> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    let reason = if raw.is_empty() {
        Some("empty name")
    } else if raw == b"." || raw == b".." {
        Some("relative name")
    } else if raw.iter().any(|b| matches!(b, b'/' | b'\\' | 0)) {
        Some("name contains a separator or NUL")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(ParseError::InvalidName { position, reason });
    }
    Ok(String::from_utf8_lossy(raw).into_owned())
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub kind: ObjectKind,
    pub binding_type: u8,
    pub ior: Ior,
}

impl Binding {
    /// Object id of the bound object.
    pub fn object_id(&self) -> ObjectId {
        self.ior.location.object_id()
    }

    /// Decode one binding.
    ///
    /// The full record is always consumed; entry-local errors
    /// ([`ParseError::is_entry_local`]) leave the reader on the next
    /// binding so the caller can carry on.
    pub fn parse(r: &mut Reader<'_>) -> Result<Self, ParseError> {
        let position = r.position();
        let components = r.u8("name component count")?;
        let mut first = None;
        for _ in 0..components {
            let id_position = r.position();
            let id_len = r.u8("name id length")?;
            let id = r.bytes("name id", id_len as usize)?;
            let kind_len = r.u8("name kind length")?;
            let kind_position = r.position();
            let kind = r.bytes("name kind", kind_len as usize)?;
            if first.is_none() {
                first = Some((id, id_position, kind, kind_position));
            }
        }
        let type_position = r.position();
        let binding_type = r.u8("binding type")?;
        let ior = Ior::parse(r);
        if let Err(e) = &ior {
            if !e.is_entry_local() {
                return Err(e.clone());
            }
        }
        let info_len = r.u16("binding object info length")?;
        r.skip("binding object info", info_len as usize)?;
        let ior = ior?;

        let (id, id_position, kind, kind_position) = match (components, first) {
            (1, Some(first)) => first,
            _ => {
                return Err(ParseError::InvalidName {
                    position,
                    reason: "name must have exactly one component",
                })
            }
        };
        let name = validate_name(id, id_position)?;
        let kind = ObjectKind::decode(kind, kind_position)?;

        let expected = if kind.is_directory() {
            BINDING_NCONTEXT
        } else {
            BINDING_NOBJECT
        };
        if binding_type != expected || ior.kind.is_directory() != kind.is_directory() {
            return Err(ParseError::BindingMismatch {
                position: type_position,
                binding_type,
                kind: String::from_utf8_lossy(kind.tag()).trim_end_matches('\0').to_string(),
            });
        }

        Ok(Self {
            name,
            kind,
            binding_type,
            ior,
        })
    }
}

/// BIOP message header up to and including the object info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiopHeader<'a> {
    /// Declared size of everything after the `message_size` field.
    pub message_size: u32,
    pub key: ObjectKey,
    pub kind: &'a [u8],
    pub object_info: &'a [u8],
    /// Bytes of the message left after the object info.
    pub remaining: u32,
}

impl<'a> BiopHeader<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Result<Self, ParseError> {
        let position = r.position();
        let magic = r.u32("BIOP magic")?;
        if magic != BIOP_MAGIC {
            return Err(ParseError::BadMagic {
                position,
                expected: BIOP_MAGIC,
                actual: magic,
            });
        }
        let position = r.position();
        let major = r.u8("BIOP version")?;
        let minor = r.u8("BIOP version")?;
        if (major, minor) != (1, 0) {
            return Err(ParseError::UnsupportedVersion {
                what: "BIOP",
                position,
                major,
                minor,
            });
        }
        let position = r.position();
        let byte_order = r.u8("BIOP byte order")?;
        if byte_order != 0 {
            return Err(ParseError::ByteOrder {
                position,
                value: byte_order,
            });
        }
        r.expect_u8("BIOP message type", 0)?;
        let message_size = r.u32("BIOP message size")?;

        let mut remaining = message_size;
        let position = r.position();
        let key = ObjectKey::parse(r)?;
        let key_len = key_length(key);
        remaining = consume(remaining, 1 + key_len, "message size (object key)", position)?;

        let position = r.position();
        let kind_len = r.u32("object kind length")?;
        let kind = r.sub("object kind", kind_len as usize)?.rest();
        remaining = consume(remaining, 4u32.saturating_add(kind_len), "message size (object kind)", position)?;

        let position = r.position();
        let info_len = r.u16("object info length")?;
        let object_info = r.bytes("object info", info_len as usize)?;
        remaining = consume(remaining, 2 + info_len as u32, "message size (object info)", position)?;

        Ok(Self {
            message_size,
            key,
            kind,
            object_info,
            remaining,
        })
    }
}

fn key_length(key: ObjectKey) -> u32 {
    key.mask.count_ones() / 8
}

fn consume(value: u32, subtract: u32, field: &'static str, position: usize) -> Result<u32, ParseError> {
    value.checked_sub(subtract).ok_or(ParseError::LengthUnderflow {
        field,
        position,
        value,
        subtract,
    })
}

/// A decoded object message. Streams and stream events are not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiopObject<'a> {
    Directory {
        id: ObjectId,
        /// Service gateway ("srg") rather than a plain directory.
        gateway: bool,
        bindings: Vec<Binding>,
    },
    File {
        id: ObjectId,
        content: &'a [u8],
    },
}

impl BiopObject<'_> {
    pub fn id(&self) -> ObjectId {
        match self {
            BiopObject::Directory { id, .. } | BiopObject::File { id, .. } => *id,
        }
    }
}

/// Decode every BIOP message of a complete module.
///
/// A broken header loses the message framing and fails the whole module.
/// Errors inside the body of a message whose size is known only drop that
/// message.
pub fn parse_module(module_id: u16, data: &[u8]) -> Result<Vec<BiopObject<'_>>, ParseError> {
    let mut r = Reader::new(data);
    let mut objects = Vec::new();
    while !r.is_empty() {
        let start = r.position();
        let header = BiopHeader::parse(&mut r)?;
        let mut body = r.sub("BIOP message", header.remaining as usize)?;
        let id = ObjectId::new(module_id, header.key);
        match parse_body(id, &header, &mut body) {
            Ok(Some(object)) => objects.push(object),
            Ok(None) => {}
            Err(e) => error!(
                "Dropping BIOP message at offset {} of module 0x{:04X}: {}",
                start, module_id, e
            ),
        }
    }
    Ok(objects)
}

fn parse_body<'a>(
    id: ObjectId,
    header: &BiopHeader<'a>,
    r: &mut Reader<'a>,
) -> Result<Option<BiopObject<'a>>, ParseError> {
    let kind = ObjectKind::decode(header.kind, r.position())?;

    let contexts = r.u8("service context count")?;
    for _ in 0..contexts {
        r.u32("service context id")?;
        let len = r.u16("service context data length")?;
        r.skip("service context data", len as usize)?;
    }
    let body_len = r.u32("message body length")?;
    let mut body = r.sub("message body", body_len as usize)?;
    if !r.is_empty() {
        warn!("{} stray bytes after BIOP message body of {}", r.remaining(), id);
    }

    match kind {
        ObjectKind::File => {
            let len = body.u32("content length")?;
            let content = body.sub("content", len as usize)?.rest();
            Ok(Some(BiopObject::File { id, content }))
        }
        ObjectKind::Directory | ObjectKind::ServiceGateway => {
            let count = body.u16("binding count")?;
            let mut bindings = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match Binding::parse(&mut body) {
                    Ok(binding) => bindings.push(binding),
                    Err(e) if e.is_entry_local() => warn!("Skipping binding in {}: {}", id, e),
                    Err(e) => return Err(e),
                }
            }
            Ok(Some(BiopObject::Directory {
                id,
                gateway: kind == ObjectKind::ServiceGateway,
                bindings,
            }))
        }
        ObjectKind::Stream | ObjectKind::StreamEvent => {
            debug!("Skipping stream object {}", id);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn file_ior(module_id: u16, key: &[u8]) -> Vec<u8> {
        testing::ior(b"fil\0", 7, module_id, key, 0x0B, 0x8000_0002, 0)
    }

    #[test]
    fn test_object_key_masks() {
        let short = ObjectKey::from_bytes(&[0x01]).unwrap();
        let long = ObjectKey::from_bytes(&[0x00, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(short.value, long.value);
        assert_ne!(short, long);
        assert_eq!(short.mask, 0xFF);
        assert_eq!(long.mask, u32::MAX);
        assert!(ObjectKey::from_bytes(&[0; 5]).is_none());
    }

    #[test]
    fn test_ior_decodes_location_and_binder() {
        let raw = testing::ior(b"srg\0", 0x11, 0x0010, &[0, 0, 0, 1], 0x0B, 0x8000_0002, 5_000_000);
        let mut r = Reader::new(&raw);
        let ior = Ior::parse(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(ior.kind, ObjectKind::ServiceGateway);
        assert_eq!(ior.location.carousel_id, 0x11);
        assert_eq!(ior.location.module_id, 0x0010);
        assert_eq!(ior.conn_binder.assoc_tag, 0x0B);
        assert_eq!(ior.conn_binder.transaction_id, 0x8000_0002);
        assert_eq!(ior.conn_binder.timeout_us, 5_000_000);
        assert!(Ior::starts_gateway(&raw));
    }

    #[test]
    fn test_ior_type_id_alignment() {
        let raw = testing::ior(b"fil", 1, 2, &[3], 0, 0, 0);
        let mut r = Reader::new(&raw);
        let ior = Ior::parse(&mut r).unwrap();
        assert_eq!(ior.kind, ObjectKind::File);
        assert_eq!(ior.location.key, ObjectKey { value: 3, mask: 0xFF });
        assert!(!Ior::starts_gateway(&raw));
    }

    #[test]
    fn test_ior_rejects_little_endian_profile() {
        let mut raw = testing::ior(b"dir\0", 1, 2, &[3], 0, 0, 0);
        // type id len (4) + "dir\0" (4) + profile count (4) + tag (4) + len (4)
        raw[20] = 1;
        let mut r = Reader::new(&raw);
        assert!(matches!(
            Ior::parse(&mut r),
            Err(ParseError::ByteOrder { position: 20, value: 1 })
        ));
    }

    #[test]
    fn test_tap_use_is_enforced() {
        // count, id, use = 0x0016, assoc, selector len 0
        let data = [1, 0, 0, 0x00, 0x16, 0, 0x0B, 0];
        let mut r = Reader::new(&data);
        assert!(matches!(
            parse_taps(&mut r, BIOP_OBJECT_USE),
            Err(ParseError::TapUse { expected: BIOP_OBJECT_USE, actual: 0x0016, .. })
        ));

        let data = [2, 0, 0, 0x00, 0x17, 0, 0x0B, 0, 0, 1, 0x00, 0x16, 0, 0x0C, 0];
        let mut r = Reader::new(&data);
        let tap = parse_taps(&mut r, BIOP_OBJECT_USE).unwrap().unwrap();
        assert_eq!(tap.assoc_tag, 0x0B);
        assert!(r.is_empty());
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name(b"index.html\0", 0).unwrap(), "index.html");
        assert_eq!(validate_name(b"a", 0).unwrap(), "a");
        let bad: [&[u8]; 7] = [b"", b"\0", b".", b"..\0", b"a/b", b"..\\x", b"a\0b"];
        for bad in bad {
            assert!(matches!(
                validate_name(bad, 0),
                Err(ParseError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn test_directory_skips_bad_entries() {
        let bindings = vec![
            testing::binding(b"index.html\0", b"fil\0", BINDING_NOBJECT, &file_ior(0x10, &[2])),
            testing::binding(b"..\0", b"dir\0", BINDING_NCONTEXT, &testing::ior(b"dir\0", 7, 0x10, &[3], 0, 0, 0)),
            testing::binding(b"wrong\0", b"fil\0", BINDING_NCONTEXT, &file_ior(0x10, &[4])),
            testing::binding(b"what\0", b"xyz\0", BINDING_NOBJECT, &file_ior(0x10, &[5])),
            testing::binding(b"sub\0", b"dir\0", BINDING_NCONTEXT, &testing::ior(b"dir\0", 7, 0x11, &[6], 0, 0, 0)),
        ];
        let module = testing::directory(&[1], true, &bindings);
        let objects = parse_module(0x10, &module).unwrap();
        assert_eq!(objects.len(), 1);
        match &objects[0] {
            BiopObject::Directory { id, gateway, bindings } => {
                assert_eq!(*id, ObjectId::new(0x10, ObjectKey { value: 1, mask: 0xFF }));
                assert!(*gateway);
                let names: Vec<_> = bindings.iter().map(|b| b.name.as_str()).collect();
                assert_eq!(names, vec!["index.html", "sub"]);
                assert_eq!(bindings[1].object_id().module_id, 0x11);
            }
            other => panic!("unexpected object {:?}", other),
        }
    }

    #[test]
    fn test_module_with_several_messages() {
        let mut module = testing::file(&[1], b"hello");
        module.extend(testing::stream(&[2]));
        module.extend(testing::file(&[3], b""));
        let objects = parse_module(0x20, &module).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(
            objects[0],
            BiopObject::File {
                id: ObjectId::new(0x20, ObjectKey { value: 1, mask: 0xFF }),
                content: b"hello",
            }
        );
        assert_eq!(objects[1].id().key, 3);
    }

    #[test]
    fn test_bad_magic_fails_module() {
        let mut module = testing::file(&[1], b"x");
        module[0] = b'X';
        assert!(matches!(
            parse_module(1, &module),
            Err(ParseError::BadMagic { position: 0, .. })
        ));
    }

    #[test]
    fn test_message_size_underflow_is_an_error() {
        let mut module = testing::file(&[1, 2, 3, 4], b"abc");
        // message_size lives at offset 8; 6 covers the key but not the kind.
        module[8..12].copy_from_slice(&6u32.to_be_bytes());
        assert!(matches!(
            parse_module(1, &module),
            Err(ParseError::LengthUnderflow { value: 1, subtract: 8, .. })
        ));
    }

    #[test]
    fn test_truncated_body_drops_only_that_message() {
        let mut broken = testing::file(&[1], b"hello");
        // Claim a content of 200 bytes.
        let len = broken.len();
        broken[len - 9..len - 5].copy_from_slice(&200u32.to_be_bytes());
        let mut module = broken;
        module.extend(testing::file(&[2], b"ok"));
        let objects = parse_module(1, &module).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id().key, 2);
    }
}
