//! Error types for the carousel engine.

use std::io;
use std::path::PathBuf;

use dsmcc_protocol::ParseError;
use thiserror::Error;

/// Failures while storing or finishing a module.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// A DII announced a non-empty module with a zero block size.
    #[error("Module 0x{module_id:04X} has block size 0")]
    ZeroBlockSize { module_id: u16 },

    /// Block number beyond the last block of the module.
    #[error("Block {block} out of range for module 0x{module_id:04X} ({count} blocks)")]
    BlockOutOfRange { module_id: u16, block: u16, count: u32 },

    /// A block shorter than the announced block size.
    #[error("Block {block} of module 0x{module_id:04X} is {actual} bytes, expected {expected}")]
    ShortBlock {
        module_id: u16,
        block: u16,
        expected: usize,
        actual: usize,
    },

    /// Compression method other than zlib.
    #[error("Unsupported compression method 0x{0:02X}")]
    UnsupportedCompression(u8),

    /// Inflated size does not match the compressed module descriptor.
    #[error("Inflated {actual} bytes, descriptor announced {expected}")]
    InflatedSize { expected: u32, actual: u64 },

    /// BIOP decoding of the complete module failed.
    #[error("BIOP decode failed: {0}")]
    Decode(#[from] ParseError),

    /// Module data could not be read or written.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ModuleError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ModuleError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures while saving or loading the state file.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("State file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad state file magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("State file truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid {field} value {value} in state file")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("Invalid UTF-8 string in state file")]
    InvalidString,
}

/// Engine-level failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// The worker has stopped accepting actions.
    #[error("Engine is closed")]
    Closed,

    /// The worker task ended abnormally.
    #[error("Worker task failed: {0}")]
    Worker(String),
}
