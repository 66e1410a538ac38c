//! Per-module download state.
//!
//! A module is announced by a DII and filled block by block from DDBs into
//! a temporary file. Once every block is present its bytes are inflated if
//! needed and decoded into [`ModuleEntry`] records, the only form in which
//! a complete module is kept.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use log::{debug, warn};

use dsmcc_protocol::biop::validate_name;
use dsmcc_protocol::{parse_module, BiopObject, CarouselKind, Compressed, ObjectId};

use crate::error::ModuleError;
use crate::storage::Storage;

/// Identity of a module within a carousel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    pub download_id: u32,
    pub module_id: u16,
}

/// Child of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub id: ObjectId,
    pub is_dir: bool,
}

/// Decoded content of a complete module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEntry {
    Directory {
        id: ObjectId,
        gateway: bool,
        children: Vec<ChildEntry>,
    },
    File {
        id: ObjectId,
        data_path: PathBuf,
        size: u64,
    },
}

/// Download progress of an incomplete module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialModule {
    pub block_size: u16,
    pub compressed: Option<Compressed>,
    pub temp_path: PathBuf,
    /// One bit per block, most significant bit first.
    pub bitmap: Vec<u8>,
    pub downloaded: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    Partial(PartialModule),
    Complete(Vec<ModuleEntry>),
    Invalid,
}

/// Result of storing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block already present, nothing changed.
    Duplicate,
    Stored,
    /// Last missing block; the module is ready to be finished.
    Completed,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub download_id: u32,
    pub module_id: u16,
    pub version: u8,
    pub size: u32,
    pub state: ModuleState,

    // Refreshed from every DII, not persisted.
    /// Data carousel file name.
    pub name: Option<String>,
    /// PID carrying the DDBs.
    pub ddb_pid: Option<u16>,
    pub module_timeout_us: u32,
    pub block_timeout_us: u32,
}

/// Number of blocks of a module.
pub fn block_count(size: u32, block_size: u16) -> u32 {
    if block_size == 0 {
        return 0;
    }
    ((size as u64 + block_size as u64 - 1) / block_size as u64) as u32
}

impl Module {
    pub fn new(
        key: ModuleKey,
        version: u8,
        size: u32,
        block_size: u16,
        compressed: Option<Compressed>,
        temp_path: PathBuf,
    ) -> Result<Self, ModuleError> {
        if size > 0 && block_size == 0 {
            return Err(ModuleError::ZeroBlockSize {
                module_id: key.module_id,
            });
        }
        let blocks = block_count(size, block_size);
        Ok(Self {
            download_id: key.download_id,
            module_id: key.module_id,
            version,
            size,
            state: ModuleState::Partial(PartialModule {
                block_size,
                compressed,
                temp_path,
                bitmap: vec![0; ((blocks + 7) / 8) as usize],
                downloaded: 0,
            }),
            name: None,
            ddb_pid: None,
            module_timeout_us: 0,
            block_timeout_us: 0,
        })
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey {
            download_id: self.download_id,
            module_id: self.module_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ModuleState::Complete(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.state, ModuleState::Partial(_))
    }

    /// Bytes counted towards progress.
    pub fn downloaded(&self) -> u64 {
        match &self.state {
            ModuleState::Partial(p) => p.downloaded as u64,
            ModuleState::Complete(_) => self.size as u64,
            ModuleState::Invalid => 0,
        }
    }

    /// Whether all blocks are present (also true for an empty module).
    pub fn all_blocks_present(&self) -> bool {
        match &self.state {
            ModuleState::Partial(p) => p.downloaded >= self.size,
            _ => false,
        }
    }

    /// Store one DDB block.
    pub fn add_block(&mut self, block: u16, data: &[u8]) -> Result<BlockOutcome, ModuleError> {
        let size = self.size;
        let module_id = self.module_id;
        let ModuleState::Partial(p) = &mut self.state else {
            return Ok(BlockOutcome::Duplicate);
        };

        let count = block_count(size, p.block_size);
        if block as u32 >= count {
            return Err(ModuleError::BlockOutOfRange {
                module_id,
                block,
                count,
            });
        }
        let byte = block as usize / 8;
        let bit = 0x80u8 >> (block % 8);
        if p.bitmap[byte] & bit != 0 {
            return Ok(BlockOutcome::Duplicate);
        }

        let offset = block as u64 * p.block_size as u64;
        let expected = (p.block_size as u64).min(size as u64 - offset) as usize;
        if data.len() < expected {
            return Err(ModuleError::ShortBlock {
                module_id,
                block,
                expected,
                actual: data.len(),
            });
        }
        if data.len() > expected {
            warn!(
                "Module 0x{:04X} block {}: truncating {} bytes to {}",
                module_id,
                block,
                data.len(),
                expected
            );
        }

        write_at(&p.temp_path, offset, &data[..expected])
            .map_err(|e| ModuleError::io(&p.temp_path, e))?;
        p.bitmap[byte] |= bit;
        p.downloaded += expected as u32;

        if p.downloaded >= size {
            Ok(BlockOutcome::Completed)
        } else {
            Ok(BlockOutcome::Stored)
        }
    }

    /// Forget received blocks, keeping the block layout.
    pub fn reset_blocks(&mut self) {
        if let ModuleState::Partial(p) = &mut self.state {
            p.bitmap.iter_mut().for_each(|b| *b = 0);
            p.downloaded = 0;
        }
    }

    /// Read the downloaded bytes back, inflated if the module is compressed.
    pub fn read_data(&self) -> Result<Vec<u8>, ModuleError> {
        let ModuleState::Partial(p) = &self.state else {
            return Ok(Vec::new());
        };
        let mut raw = if self.size == 0 {
            Vec::new()
        } else {
            fs::read(&p.temp_path).map_err(|e| ModuleError::io(&p.temp_path, e))?
        };
        raw.truncate(self.size as usize);
        match p.compressed {
            Some(c) => inflate(&raw, c, &p.temp_path),
            None => Ok(raw),
        }
    }

    /// Decode complete module data into entries, writing file contents to
    /// the object store.
    pub fn build_entries(
        &self,
        kind: CarouselKind,
        data: &[u8],
        storage: &Storage,
        pid: u16,
    ) -> Result<Vec<ModuleEntry>, ModuleError> {
        match kind {
            CarouselKind::Object => object_entries(self.module_id, self.version, data, storage, pid),
            CarouselKind::Data => {
                let name = self
                    .name
                    .as_deref()
                    .and_then(|n| match validate_name(n.as_bytes(), 0) {
                        Ok(n) => Some(n),
                        Err(e) => {
                            warn!("Module 0x{:04X}: ignoring name {:?}: {}", self.module_id, n, e);
                            None
                        }
                    })
                    .unwrap_or_else(|| format!("module-{:04X}.bin", self.module_id));
                let id = ObjectId {
                    module_id: self.module_id,
                    key: 0,
                    key_mask: 0,
                };
                let data_path = storage.object_blob(pid, id, self.version);
                Storage::write(&data_path, data).map_err(|e| ModuleError::io(&data_path, e))?;
                Ok(vec![
                    ModuleEntry::Directory {
                        id: ObjectId::DATA_ROOT,
                        gateway: true,
                        children: vec![ChildEntry {
                            name,
                            id,
                            is_dir: false,
                        }],
                    },
                    ModuleEntry::File {
                        id,
                        data_path,
                        size: data.len() as u64,
                    },
                ])
            }
        }
    }
}

fn object_entries(
    module_id: u16,
    version: u8,
    data: &[u8],
    storage: &Storage,
    pid: u16,
) -> Result<Vec<ModuleEntry>, ModuleError> {
    let objects = parse_module(module_id, data)?;
    let mut entries = Vec::with_capacity(objects.len());
    for object in objects {
        match object {
            BiopObject::File { id, content } => {
                let data_path = storage.object_blob(pid, id, version);
                Storage::write(&data_path, content).map_err(|e| ModuleError::io(&data_path, e))?;
                entries.push(ModuleEntry::File {
                    id,
                    data_path,
                    size: content.len() as u64,
                });
            }
            BiopObject::Directory {
                id,
                gateway,
                bindings,
            } => {
                let children = bindings
                    .into_iter()
                    .filter_map(|b| {
                        if !b.kind.is_directory() && b.kind != dsmcc_protocol::ObjectKind::File {
                            debug!("Ignoring stream binding {:?} in {}", b.name, id);
                            return None;
                        }
                        Some(ChildEntry {
                            id: b.object_id(),
                            is_dir: b.kind.is_directory(),
                            name: b.name,
                        })
                    })
                    .collect();
                entries.push(ModuleEntry::Directory {
                    id,
                    gateway,
                    children,
                });
            }
        }
    }
    Ok(entries)
}

fn inflate(raw: &[u8], c: Compressed, path: &Path) -> Result<Vec<u8>, ModuleError> {
    if !c.is_zlib() {
        return Err(ModuleError::UnsupportedCompression(c.method));
    }
    let limit = c.original_size as u64;
    let mut out = Vec::with_capacity((c.original_size as usize).min(raw.len().saturating_mul(8)));
    ZlibDecoder::new(raw)
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| ModuleError::io(path, e))?;
    if out.len() as u64 != limit {
        return Err(ModuleError::InflatedSize {
            expected: c.original_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
    let open = || OpenOptions::new().write(true).create(true).open(path);
    let mut file = match open() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            open()?
        }
        other => other?,
    };
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}
