//! Interfaces between the engine and the application embedding it.
//!
//! [`DvbStack`] is implemented by whatever delivers sections (a hardware
//! demux, or the software one in `dsmcc-recv`). [`CarouselListener`] is
//! supplied per subscription and hears about files and progress.

use std::fmt;
use std::path::{Path, PathBuf};

use dsmcc_protocol::SectionFilter;

use crate::carousel::CarouselStatus;

/// Handle returned by `queue_carousel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Section source.
pub trait DvbStack: Send + Sync {
    /// Start delivering sections of `pid` matching `filter` via
    /// `add_section`.
    fn add_section_filter(&self, pid: u16, filter: &SectionFilter);

    /// Stop delivering sections for a filter previously added.
    fn remove_section_filter(&self, _pid: u16, _filter: &SectionFilter) {}

    /// Resolve an association tag to the PID carrying it.
    fn get_pid_for_assoc_tag(&self, assoc_tag: u16) -> Option<u16>;
}

/// Per-subscription notifications.
///
/// All methods run on the engine worker and must not block for long.
pub trait CarouselListener: Send + Sync {
    /// Called before a directory is created or a file is written. `fs_path`
    /// may be changed to redirect the entry; returning `false` skips it and
    /// everything below it.
    fn dentry_check(
        &self,
        _subscription: SubscriptionId,
        _carousel_id: u32,
        _is_dir: bool,
        _logical_path: &str,
        _fs_path: &mut PathBuf,
    ) -> bool {
        true
    }

    /// Called once an entry exists on disk.
    fn dentry_saved(
        &self,
        _subscription: SubscriptionId,
        _carousel_id: u32,
        _is_dir: bool,
        _logical_path: &str,
        _fs_path: &Path,
    ) {
    }

    /// Bytes downloaded so far over all modules of the carousel.
    fn download_progression(
        &self,
        _subscription: SubscriptionId,
        _carousel_id: u32,
        _downloaded: u64,
        _total: u64,
    ) {
    }

    fn carousel_status_changed(
        &self,
        _subscription: SubscriptionId,
        _carousel_id: u32,
        _status: CarouselStatus,
    ) {
    }
}
