//! Error types for the DSM-CC wire decoders.

use thiserror::Error;

/// Decode failures.
///
/// Every variant that originates inside a message body carries the byte
/// offset (relative to the buffer handed to the decoder) where the problem
/// was detected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A field extends past the end of the buffer.
    #[error("{field} truncated at offset {position}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        position: usize,
        needed: usize,
        remaining: usize,
    },

    /// A magic number did not match.
    #[error("Invalid magic at offset {position}: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadMagic {
        position: usize,
        expected: u32,
        actual: u32,
    },

    /// Protocol version is not 1.0.
    #[error("Unsupported {what} version {major}.{minor} at offset {position}")]
    UnsupportedVersion {
        what: &'static str,
        position: usize,
        major: u8,
        minor: u8,
    },

    /// Only big-endian (byte order 0) payloads are supported.
    #[error("Unsupported byte order {value} at offset {position}")]
    ByteOrder { position: usize, value: u8 },

    /// A field holds a value the decoder does not accept.
    #[error("Unexpected {field} value 0x{value:X} at offset {position}")]
    UnexpectedValue {
        field: &'static str,
        position: usize,
        value: u32,
    },

    /// Subtracting consumed bytes from a declared length would wrap.
    #[error("{field} underflows at offset {position}: {value} - {subtract}")]
    LengthUnderflow {
        field: &'static str,
        position: usize,
        value: u32,
        subtract: u32,
    },

    /// A declared length exceeds what is left in the enclosing structure.
    #[error("{field} of {declared} bytes exceeds {available} available at offset {position}")]
    LengthOverflow {
        field: &'static str,
        position: usize,
        declared: usize,
        available: usize,
    },

    /// A binding name that cannot be used as a path component.
    #[error("Invalid name at offset {position}: {reason}")]
    InvalidName {
        position: usize,
        reason: &'static str,
    },

    /// Binding type and object kind disagree.
    #[error("Binding type {binding_type} does not match kind {kind:?} at offset {position}")]
    BindingMismatch {
        position: usize,
        binding_type: u8,
        kind: String,
    },

    /// An object kind tag other than dir, fil, srg, str or ste.
    #[error("Unknown object kind {kind:?} at offset {position}")]
    UnknownKind { position: usize, kind: String },

    /// The first tap of a list does not have the required use.
    #[error("Tap use 0x{actual:04X} at offset {position}, expected 0x{expected:04X}")]
    TapUse {
        position: usize,
        expected: u16,
        actual: u16,
    },

    /// CRC32 over the whole section did not leave a zero residue.
    #[error("CRC32 mismatch (residue 0x{0:08X})")]
    Crc(u32),

    /// The private section header is malformed.
    #[error("Invalid section header: {0}")]
    SectionHeader(&'static str),
}

impl ParseError {
    /// Byte offset of the failure, if the error carries one.
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::Truncated { position, .. }
            | ParseError::BadMagic { position, .. }
            | ParseError::UnsupportedVersion { position, .. }
            | ParseError::ByteOrder { position, .. }
            | ParseError::UnexpectedValue { position, .. }
            | ParseError::LengthUnderflow { position, .. }
            | ParseError::LengthOverflow { position, .. }
            | ParseError::InvalidName { position, .. }
            | ParseError::BindingMismatch { position, .. }
            | ParseError::UnknownKind { position, .. }
            | ParseError::TapUse { position, .. } => Some(*position),
            ParseError::Crc(_) | ParseError::SectionHeader(_) => None,
        }
    }

    /// Whether the failure only concerns one entry and decoding of its
    /// siblings may continue.
    pub fn is_entry_local(&self) -> bool {
        matches!(
            self,
            ParseError::InvalidName { .. }
                | ParseError::BindingMismatch { .. }
                | ParseError::UnknownKind { .. }
        )
    }
}
