//! On-disk layout of the engine cache.
//!
//! ```text
//! <cache_dir>/
//!   state.bin
//!   pid-XXXX/
//!     modules/<download_id>-<module_id>-<version>.part   block data
//!     objects/<module_id>-<key>-<mask>-<version>.bin     file contents
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dsmcc_protocol::ObjectId;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn carousel_dir(&self, pid: u16) -> PathBuf {
        self.root.join(format!("pid-{:04x}", pid))
    }

    pub fn module_temp(&self, pid: u16, download_id: u32, module_id: u16, version: u8) -> PathBuf {
        self.carousel_dir(pid)
            .join("modules")
            .join(format!("{:08x}-{:04x}-{:02x}.part", download_id, module_id, version))
    }

    /// Content of one object as delivered by one module version.
    pub fn object_blob(&self, pid: u16, id: ObjectId, version: u8) -> PathBuf {
        self.carousel_dir(pid).join("objects").join(format!(
            "{:04x}-{:08x}-{:08x}-{:02x}.bin",
            id.module_id, id.key, id.key_mask, version
        ))
    }

    /// Write a file through a temp file and rename, creating its directory
    /// first. Existing hard links to `path` keep their old content.
    pub fn write(path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, path)
    }

    /// Remove a file; a missing file is not an error.
    pub fn remove_file(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove everything stored for one carousel.
    pub fn remove_carousel(&self, pid: u16) -> io::Result<()> {
        match fs::remove_dir_all(self.carousel_dir(pid)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
