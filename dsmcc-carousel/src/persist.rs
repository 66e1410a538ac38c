//! State file encoding.
//!
//! ```text
//! u32 magic = 0xDDCC0002
//! { u8 1, carousel }* u8 0
//! carousel := u32 cid, u8 kind, u8 status, u16 pid, u32 transaction_id,
//!             { u8 1, module }* u8 0
//! module   := u32 download_id, u16 module_id, u8 version, u32 size, u8 state, body
//! ```
//!
//! Partial bodies carry the block layout and bitmap, complete bodies the
//! decoded directory and file entries. Invalid modules have no body.
//! Subscribers and timeouts are runtime state and are not written.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use dsmcc_protocol::{CarouselKind, Compressed, ObjectId};

use crate::carousel::{CarouselStatus, ObjectCarousel};
use crate::error::PersistError;
use crate::module::{block_count, ChildEntry, Module, ModuleEntry, ModuleKey, ModuleState, PartialModule};

pub const STATE_MAGIC: u32 = 0xDDCC_0002;

const MORE: u8 = 0x01;
const END: u8 = 0x00;

const STATE_PARTIAL: u8 = 0;
const STATE_COMPLETE: u8 = 1;
const STATE_INVALID: u8 = 2;

const ENTRY_DIRECTORY: u8 = 0x01;
const ENTRY_FILE: u8 = 0x02;

/// Encode every carousel.
pub fn encode<'a>(
    carousels: impl IntoIterator<Item = &'a ObjectCarousel>,
) -> Result<BytesMut, PersistError> {
    let mut buf = BytesMut::with_capacity(4096);
    buf.put_u32(STATE_MAGIC);
    for carousel in carousels {
        buf.put_u8(MORE);
        put_carousel(&mut buf, carousel)?;
    }
    buf.put_u8(END);
    Ok(buf)
}

/// Decode a state file image.
pub fn decode(mut buf: &[u8]) -> Result<Vec<ObjectCarousel>, PersistError> {
    let magic = get_u32(&mut buf, "magic")?;
    if magic != STATE_MAGIC {
        return Err(PersistError::BadMagic(magic));
    }
    let mut carousels = Vec::new();
    while more(&mut buf, "carousel marker")? {
        carousels.push(get_carousel(&mut buf)?);
    }
    Ok(carousels)
}

/// Write the state file, replacing the previous one atomically.
pub fn save<'a>(
    path: &Path,
    carousels: impl IntoIterator<Item = &'a ObjectCarousel>,
) -> Result<(), PersistError> {
    let buf = encode(carousels)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Vec<ObjectCarousel>, PersistError> {
    decode(&fs::read(path)?)
}

fn put_carousel(buf: &mut BytesMut, c: &ObjectCarousel) -> Result<(), PersistError> {
    buf.put_u32(c.carousel_id);
    buf.put_u8(match c.kind {
        CarouselKind::Object => 0,
        CarouselKind::Data => 1,
    });
    buf.put_u8(c.status.as_u8());
    buf.put_u16(c.pid);
    buf.put_u32(c.transaction_id);
    for module in c.modules.values() {
        buf.put_u8(MORE);
        put_module(buf, module)?;
    }
    buf.put_u8(END);
    Ok(())
}

fn put_module(buf: &mut BytesMut, m: &Module) -> Result<(), PersistError> {
    buf.put_u32(m.download_id);
    buf.put_u16(m.module_id);
    buf.put_u8(m.version);
    buf.put_u32(m.size);
    match &m.state {
        ModuleState::Partial(p) => {
            buf.put_u8(STATE_PARTIAL);
            buf.put_u16(p.block_size);
            match p.compressed {
                Some(c) => {
                    buf.put_u8(1);
                    buf.put_u8(c.method);
                    buf.put_u32(c.original_size);
                }
                None => buf.put_u8(0),
            }
            put_path(buf, &p.temp_path)?;
            buf.put_u16(p.bitmap.len() as u16);
            buf.put_slice(&p.bitmap);
            buf.put_u32(p.downloaded);
        }
        ModuleState::Complete(entries) => {
            buf.put_u8(STATE_COMPLETE);
            for entry in entries {
                put_entry(buf, entry)?;
            }
            buf.put_u8(END);
        }
        ModuleState::Invalid => buf.put_u8(STATE_INVALID),
    }
    Ok(())
}

fn put_entry(buf: &mut BytesMut, entry: &ModuleEntry) -> Result<(), PersistError> {
    match entry {
        ModuleEntry::Directory {
            id,
            gateway,
            children,
        } => {
            buf.put_u8(ENTRY_DIRECTORY);
            put_oid(buf, id);
            buf.put_u8(*gateway as u8);
            buf.put_u16(children.len() as u16);
            for child in children {
                put_str(buf, &child.name)?;
                put_oid(buf, &child.id);
                buf.put_u8(child.is_dir as u8);
            }
        }
        ModuleEntry::File {
            id,
            data_path,
            size,
        } => {
            buf.put_u8(ENTRY_FILE);
            put_oid(buf, id);
            put_path(buf, data_path)?;
            buf.put_u64(*size);
        }
    }
    Ok(())
}

fn put_oid(buf: &mut BytesMut, id: &ObjectId) {
    buf.put_u16(id.module_id);
    buf.put_u32(id.key);
    buf.put_u32(id.key_mask);
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), PersistError> {
    let len = u16::try_from(s.len()).map_err(|_| PersistError::InvalidValue {
        field: "string length",
        value: s.len() as u32,
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_path(buf: &mut BytesMut, path: &Path) -> Result<(), PersistError> {
    put_str(buf, path.to_str().ok_or(PersistError::InvalidString)?)
}

fn need(buf: &[u8], n: usize, what: &'static str) -> Result<(), PersistError> {
    if buf.len() < n {
        Err(PersistError::Truncated(what))
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, PersistError> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], what: &'static str) -> Result<u16, PersistError> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, PersistError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], what: &'static str) -> Result<u64, PersistError> {
    need(buf, 8, what)?;
    Ok(buf.get_u64())
}

fn get_bool(buf: &mut &[u8], what: &'static str) -> Result<bool, PersistError> {
    match get_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(PersistError::InvalidValue {
            field: what,
            value: v as u32,
        }),
    }
}

fn more(buf: &mut &[u8], what: &'static str) -> Result<bool, PersistError> {
    get_bool(buf, what)
}

fn get_bytes(buf: &mut &[u8], n: usize, what: &'static str) -> Result<Vec<u8>, PersistError> {
    need(buf, n, what)?;
    let bytes = buf[..n].to_vec();
    buf.advance(n);
    Ok(bytes)
}

fn get_str(buf: &mut &[u8], what: &'static str) -> Result<String, PersistError> {
    let len = get_u16(buf, what)? as usize;
    String::from_utf8(get_bytes(buf, len, what)?).map_err(|_| PersistError::InvalidString)
}

fn get_oid(buf: &mut &[u8]) -> Result<ObjectId, PersistError> {
    Ok(ObjectId {
        module_id: get_u16(buf, "object module id")?,
        key: get_u32(buf, "object key")?,
        key_mask: get_u32(buf, "object key mask")?,
    })
}

fn get_carousel(buf: &mut &[u8]) -> Result<ObjectCarousel, PersistError> {
    let carousel_id = get_u32(buf, "carousel id")?;
    let kind = match get_u8(buf, "carousel kind")? {
        0 => CarouselKind::Object,
        1 => CarouselKind::Data,
        v => {
            return Err(PersistError::InvalidValue {
                field: "carousel kind",
                value: v as u32,
            })
        }
    };
    let raw_status = get_u8(buf, "carousel status")?;
    let status = CarouselStatus::from_u8(raw_status).ok_or(PersistError::InvalidValue {
        field: "carousel status",
        value: raw_status as u32,
    })?;
    let pid = get_u16(buf, "pid")?;
    let transaction_id = get_u32(buf, "transaction id")?;

    let mut modules = BTreeMap::new();
    while more(buf, "module marker")? {
        let module = get_module(buf)?;
        modules.insert(module.key(), module);
    }

    Ok(ObjectCarousel {
        carousel_id,
        kind,
        status,
        modules,
        ..ObjectCarousel::new(pid, transaction_id)
    })
}

fn get_module(buf: &mut &[u8]) -> Result<Module, PersistError> {
    let download_id = get_u32(buf, "download id")?;
    let module_id = get_u16(buf, "module id")?;
    let version = get_u8(buf, "module version")?;
    let size = get_u32(buf, "module size")?;
    let state = match get_u8(buf, "module state")? {
        STATE_PARTIAL => ModuleState::Partial(get_partial(buf, size)?),
        STATE_COMPLETE => {
            let mut entries = Vec::new();
            loop {
                match get_u8(buf, "entry tag")? {
                    END => break,
                    ENTRY_DIRECTORY => entries.push(get_directory(buf)?),
                    ENTRY_FILE => entries.push(ModuleEntry::File {
                        id: get_oid(buf)?,
                        data_path: PathBuf::from(get_str(buf, "data path")?),
                        size: get_u64(buf, "file size")?,
                    }),
                    v => {
                        return Err(PersistError::InvalidValue {
                            field: "entry tag",
                            value: v as u32,
                        })
                    }
                }
            }
            ModuleState::Complete(entries)
        }
        STATE_INVALID => ModuleState::Invalid,
        v => {
            return Err(PersistError::InvalidValue {
                field: "module state",
                value: v as u32,
            })
        }
    };
    Ok(Module {
        download_id,
        module_id,
        version,
        size,
        state,
        name: None,
        ddb_pid: None,
        module_timeout_us: 0,
        block_timeout_us: 0,
    })
}

fn get_partial(buf: &mut &[u8], size: u32) -> Result<PartialModule, PersistError> {
    let block_size = get_u16(buf, "block size")?;
    let compressed = if get_bool(buf, "compressed flag")? {
        Some(Compressed {
            method: get_u8(buf, "compression method")?,
            original_size: get_u32(buf, "original size")?,
        })
    } else {
        None
    };
    let temp_path = PathBuf::from(get_str(buf, "temp path")?);
    let bitmap_len = get_u16(buf, "bitmap length")? as usize;
    let expected = ((block_count(size, block_size) + 7) / 8) as usize;
    if bitmap_len != expected || (size > 0 && block_size == 0) {
        return Err(PersistError::InvalidValue {
            field: "bitmap length",
            value: bitmap_len as u32,
        });
    }
    let bitmap = get_bytes(buf, bitmap_len, "bitmap")?;
    let downloaded = get_u32(buf, "downloaded bytes")?;
    if downloaded > size {
        return Err(PersistError::InvalidValue {
            field: "downloaded bytes",
            value: downloaded,
        });
    }
    Ok(PartialModule {
        block_size,
        compressed,
        temp_path,
        bitmap,
        downloaded,
    })
}

fn get_directory(buf: &mut &[u8]) -> Result<ModuleEntry, PersistError> {
    let id = get_oid(buf)?;
    let gateway = get_bool(buf, "gateway flag")?;
    let count = get_u16(buf, "child count")?;
    let mut children = Vec::with_capacity(count as usize);
    for _ in 0..count {
        children.push(ChildEntry {
            name: get_str(buf, "child name")?,
            id: get_oid(buf)?,
            is_dir: get_bool(buf, "child kind")?,
        });
    }
    Ok(ModuleEntry::Directory {
        id,
        gateway,
        children,
    })
}

/// Check loaded modules against the files they refer to.
///
/// A partial module whose temp file is gone restarts from nothing; a
/// complete module with a missing blob is invalidated so the next DII
/// fetches it again.
pub fn reconcile(carousel: &mut ObjectCarousel) -> HashMap<ModuleKey, &'static str> {
    let mut changes = HashMap::new();
    for module in carousel.modules.values_mut() {
        let missing = match &module.state {
            ModuleState::Partial(p) => p.downloaded > 0 && !p.temp_path.exists(),
            ModuleState::Complete(entries) => entries.iter().any(|e| match e {
                ModuleEntry::File { data_path, .. } => !data_path.exists(),
                ModuleEntry::Directory { .. } => false,
            }),
            ModuleState::Invalid => false,
        };
        if !missing {
            continue;
        }
        if module.is_partial() {
            module.reset_blocks();
            changes.insert(module.key(), "temp file missing, restarting");
        } else {
            module.state = ModuleState::Invalid;
            changes.insert(module.key(), "object data missing, invalidated");
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> ObjectCarousel {
        let mut c = ObjectCarousel::new(0x0100, 0x8000_0002);
        c.carousel_id = 1;
        c.kind = CarouselKind::Object;
        c.status = CarouselStatus::Done;

        let mut partial = Module::new(
            ModuleKey {
                download_id: 1,
                module_id: 0x11,
            },
            2,
            120,
            50,
            Some(Compressed {
                method: 0x08,
                original_size: 400,
            }),
            dir.join("p.part"),
        )
        .unwrap();
        partial.add_block(1, &[0; 50]).unwrap();

        let gateway = ObjectId {
            module_id: 0x10,
            key: 1,
            key_mask: 0xFF,
        };
        let file = ObjectId {
            module_id: 0x10,
            key: 2,
            key_mask: 0xFF,
        };
        let mut complete = Module::new(
            ModuleKey {
                download_id: 1,
                module_id: 0x10,
            },
            1,
            0,
            50,
            None,
            dir.join("c.part"),
        )
        .unwrap();
        complete.state = ModuleState::Complete(vec![
            ModuleEntry::Directory {
                id: gateway,
                gateway: true,
                children: vec![ChildEntry {
                    name: "index.html".to_string(),
                    id: file,
                    is_dir: false,
                }],
            },
            ModuleEntry::File {
                id: file,
                data_path: dir.join("blob.bin"),
                size: 5,
            },
        ]);

        let mut invalid = complete.clone();
        invalid.module_id = 0x12;
        invalid.state = ModuleState::Invalid;

        for m in [partial, complete, invalid] {
            c.modules.insert(m.key(), m);
        }
        c
    }

    fn observable(c: &ObjectCarousel) -> Vec<(ModuleKey, u8, u32, ModuleState)> {
        c.modules
            .values()
            .map(|m| (m.key(), m.version, m.size, m.state.clone()))
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = sample(dir.path());
        let mut b = ObjectCarousel::new(0x0200, u32::MAX);
        b.kind = CarouselKind::Data;
        b.status = CarouselStatus::TimedOut;

        let path = dir.path().join("state.bin");
        save(&path, [&a, &b]).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].carousel_id, 1);
        assert_eq!(loaded[0].pid, 0x0100);
        assert_eq!(loaded[0].transaction_id, 0x8000_0002);
        assert_eq!(loaded[0].status, CarouselStatus::Done);
        assert_eq!(observable(&loaded[0]), observable(&a));
        assert_eq!(loaded[1].kind, CarouselKind::Data);
        assert_eq!(loaded[1].status, CarouselStatus::TimedOut);
        assert!(loaded[1].modules.is_empty());
    }

    #[test]
    fn test_layout_header() {
        let buf = encode(Vec::<&ObjectCarousel>::new()).unwrap();
        assert_eq!(&buf[..], &[0xDD, 0xCC, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_corrupt_files_rejected() {
        assert!(matches!(decode(&[0, 0, 0, 1, 0]), Err(PersistError::BadMagic(1))));
        assert!(matches!(
            decode(&[0xDD, 0xCC, 0x00, 0x02, 0x01, 0x00]),
            Err(PersistError::Truncated("carousel id"))
        ));
        assert!(matches!(
            decode(&[0xDD, 0xCC, 0x00, 0x02, 0x07]),
            Err(PersistError::InvalidValue { field: "carousel marker", value: 7 })
        ));

        let dir = tempfile::tempdir().unwrap();
        let mut buf = encode([&sample(dir.path())]).unwrap();
        let len = buf.len();
        buf.truncate(len - 3);
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_reconcile_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = sample(dir.path());
        fs::remove_file(dir.path().join("p.part")).unwrap();
        let changes = reconcile(&mut c);
        assert_eq!(changes.len(), 2);

        let partial = &c.modules[&ModuleKey {
            download_id: 1,
            module_id: 0x11,
        }];
        assert_eq!(partial.downloaded(), 0);
        let complete = &c.modules[&ModuleKey {
            download_id: 1,
            module_id: 0x10,
        }];
        assert_eq!(complete.state, ModuleState::Invalid);
    }
}
