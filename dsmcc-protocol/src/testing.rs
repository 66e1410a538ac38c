//! Encoders for synthesising carousels in tests.
//!
//! They produce exactly the layouts the decoders read, with all lengths
//! filled in and a valid CRC. Nothing here validates its input.

use bytes::{BufMut, BytesMut};

use crate::biop::{
    BIOP_DELIVERY_PARA_USE, BIOP_MAGIC, BIOP_OBJECT_USE, TAG_BIOP, TAG_CONN_BINDER,
    TAG_OBJECT_LOCATION,
};
use crate::descriptors::tag;
use crate::message::{message_id, DSMCC_TYPE_DOWNLOAD, PROTOCOL_DISCRIMINATOR, SERVER_ID_SIZE};
use crate::section::{crc32_mpeg2, table_id};

/// Wrap a payload in a long-form private section with its CRC.
pub fn section(table_id: u8, extension: u16, version: u8, payload: &[u8]) -> Vec<u8> {
    let section_length = 5 + payload.len() + 4;
    let mut buf = BytesMut::with_capacity(3 + section_length);
    buf.put_u8(table_id);
    buf.put_u16(0xB000 | (section_length as u16 & 0x0FFF));
    buf.put_u16(extension);
    buf.put_u8(0xC0 | ((version & 0x1F) << 1) | 0x01);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_slice(payload);
    let crc = crc32_mpeg2(&buf);
    buf.put_u32(crc);
    buf.to_vec()
}

/// Prefix a message body with a DSM-CC message header.
pub fn message(message_id: u16, transaction_id: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12 + body.len());
    buf.put_u8(PROTOCOL_DISCRIMINATOR);
    buf.put_u8(DSMCC_TYPE_DOWNLOAD);
    buf.put_u16(message_id);
    buf.put_u32(transaction_id);
    buf.put_u8(0xFF);
    buf.put_u8(0);
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf.to_vec()
}

/// IOR with one BIOP profile body (ObjectLocation + ConnBinder).
pub fn ior(
    kind: &[u8],
    carousel_id: u32,
    module_id: u16,
    key: &[u8],
    assoc_tag: u16,
    transaction_id: u32,
    timeout_us: u32,
) -> Vec<u8> {
    let mut profile = BytesMut::new();
    profile.put_u8(0); // big endian
    profile.put_u8(2);
    profile.put_u32(TAG_OBJECT_LOCATION);
    profile.put_u8((4 + 2 + 2 + 1 + key.len()) as u8);
    profile.put_u32(carousel_id);
    profile.put_u16(module_id);
    profile.put_u8(1);
    profile.put_u8(0);
    profile.put_u8(key.len() as u8);
    profile.put_slice(key);
    profile.put_u32(TAG_CONN_BINDER);
    profile.put_u8(1 + 7 + 10);
    profile.put_u8(1);
    profile.put_u16(0);
    profile.put_u16(BIOP_DELIVERY_PARA_USE);
    profile.put_u16(assoc_tag);
    profile.put_u8(10);
    profile.put_u16(1);
    profile.put_u32(transaction_id);
    profile.put_u32(timeout_us);

    let mut buf = BytesMut::new();
    buf.put_u32(kind.len() as u32);
    buf.put_slice(kind);
    for _ in 0..(4 - kind.len() % 4) % 4 {
        buf.put_u8(0xFF);
    }
    buf.put_u32(1);
    buf.put_u32(TAG_BIOP);
    buf.put_u32(profile.len() as u32);
    buf.put_slice(&profile);
    buf.to_vec()
}

/// One directory binding with a single name component.
pub fn binding(name: &[u8], kind: &[u8], binding_type: u8, ior: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(1);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_u8(kind.len() as u8);
    buf.put_slice(kind);
    buf.put_u8(binding_type);
    buf.put_slice(ior);
    buf.put_u16(0);
    buf.to_vec()
}

/// BIOP message with an empty object info and no service contexts.
pub fn biop_message(key: &[u8], kind: &[u8], body: &[u8]) -> Vec<u8> {
    let message_size = 1 + key.len() + 4 + kind.len() + 2 + 1 + 4 + body.len();
    let mut buf = BytesMut::new();
    buf.put_u32(BIOP_MAGIC);
    buf.put_u8(1);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u32(message_size as u32);
    buf.put_u8(key.len() as u8);
    buf.put_slice(key);
    buf.put_u32(kind.len() as u32);
    buf.put_slice(kind);
    buf.put_u16(0);
    buf.put_u8(0);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.to_vec()
}

/// Directory ("dir") or service gateway ("srg") message.
pub fn directory(key: &[u8], gateway: bool, bindings: &[Vec<u8>]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(bindings.len() as u16);
    for b in bindings {
        body.put_slice(b);
    }
    let kind: &[u8] = if gateway { b"srg\0" } else { b"dir\0" };
    biop_message(key, kind, &body)
}

/// File ("fil") message.
pub fn file(key: &[u8], content: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(content.len() as u32);
    body.put_slice(content);
    biop_message(key, b"fil\0", &body)
}

/// Stream ("str") message without a body.
pub fn stream(key: &[u8]) -> Vec<u8> {
    biop_message(key, b"str\0", &[])
}

/// DSI section of an object carousel.
pub fn dsi_object_section(transaction_id: u32, gateway_ior: &[u8]) -> Vec<u8> {
    let mut private = BytesMut::new();
    private.put_slice(gateway_ior);
    private.put_u8(0);
    private.put_u8(0);
    private.put_u16(0);
    dsi_section(transaction_id, &private)
}

/// DSI section of a data carousel announcing `(group_id, group_size)`.
pub fn dsi_data_section(transaction_id: u32, groups: &[(u32, u32)]) -> Vec<u8> {
    let mut private = BytesMut::new();
    private.put_u16(groups.len() as u16);
    for (group_id, group_size) in groups {
        private.put_u32(*group_id);
        private.put_u32(*group_size);
        private.put_u16(0);
        private.put_u16(0);
    }
    private.put_u16(0);
    dsi_section(transaction_id, &private)
}

fn dsi_section(transaction_id: u32, private: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_slice(&[0xFF; SERVER_ID_SIZE]);
    body.put_u16(0);
    body.put_u16(private.len() as u16);
    body.put_slice(private);
    section(
        table_id::DSI_DII,
        transaction_id as u16,
        0,
        &message(message_id::DSI, transaction_id, &body),
    )
}

/// A module entry of [`dii_section`].
#[derive(Debug, Clone)]
pub struct TestModule {
    pub module_id: u16,
    pub size: u32,
    pub version: u8,
    /// Raw moduleInfo bytes.
    pub info: Vec<u8>,
}

/// DII section.
pub fn dii_section(
    transaction_id: u32,
    download_id: u32,
    block_size: u16,
    modules: &[TestModule],
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(download_id);
    body.put_u16(block_size);
    body.put_u8(0);
    body.put_u8(0);
    body.put_u32(0);
    body.put_u32(0);
    body.put_u16(0);
    body.put_u16(modules.len() as u16);
    for m in modules {
        body.put_u16(m.module_id);
        body.put_u32(m.size);
        body.put_u8(m.version);
        body.put_u8(m.info.len() as u8);
        body.put_slice(&m.info);
    }
    body.put_u16(0);
    section(
        table_id::DSI_DII,
        transaction_id as u16,
        0,
        &message(message_id::DII, transaction_id, &body),
    )
}

/// BIOP ModuleInfo with one object tap.
pub fn biop_module_info(
    module_timeout: u32,
    block_timeout: u32,
    assoc_tag: u16,
    descriptors: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(module_timeout);
    buf.put_u32(block_timeout);
    buf.put_u32(0);
    buf.put_u8(1);
    buf.put_u16(0);
    buf.put_u16(BIOP_OBJECT_USE);
    buf.put_u16(assoc_tag);
    buf.put_u8(0);
    buf.put_u8(descriptors.len() as u8);
    buf.put_slice(descriptors);
    buf.to_vec()
}

pub fn compressed_descriptor(method: u8, original_size: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(tag::COMPRESSED_MODULE);
    buf.put_u8(5);
    buf.put_u8(method);
    buf.put_u32(original_size);
    buf.to_vec()
}

pub fn name_descriptor(name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(tag::NAME);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    buf.to_vec()
}

/// DDB section.
pub fn ddb_section(
    download_id: u32,
    module_id: u16,
    module_version: u8,
    block_number: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(module_id);
    body.put_u8(module_version);
    body.put_u8(0xFF);
    body.put_u16(block_number);
    body.put_slice(data);
    section(
        table_id::DDB,
        module_id,
        module_version,
        &message(message_id::DDB, download_id, &body),
    )
}
