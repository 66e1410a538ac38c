//! Collaborator implementations for the engine.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use dsmcc_carousel::{CarouselListener, CarouselStatus, DvbStack, SubscriptionId};
use dsmcc_protocol::SectionFilter;

/// Section filters applied in software to the demultiplexed stream.
#[derive(Debug, Default)]
pub struct SoftwareDvb {
    filters: Mutex<HashMap<u16, Vec<SectionFilter>>>,
    /// Association tag to PID, per program.
    assoc_tags: Mutex<HashMap<u16, HashMap<u16, u16>>>,
}

impl SoftwareDvb {
    pub fn new() -> Self {
        Self::default()
    }

    /// PIDs with at least one filter.
    pub fn filtered_pids(&self) -> Vec<u16> {
        self.filters.lock().keys().copied().collect()
    }

    /// Whether a section on `pid` passes any installed filter.
    pub fn wants(&self, pid: u16, section: &[u8]) -> bool {
        self.filters
            .lock()
            .get(&pid)
            .map_or(false, |filters| filters.iter().any(|f| f.matches(section)))
    }

    pub fn set_assoc_tags(&self, program: u16, tags: HashMap<u16, u16>) {
        self.assoc_tags.lock().insert(program, tags);
    }
}

impl DvbStack for SoftwareDvb {
    fn add_section_filter(&self, pid: u16, filter: &SectionFilter) {
        let mut filters = self.filters.lock();
        let list = filters.entry(pid).or_default();
        // The engine re-adds a filter to restart reception; one copy is
        // enough for a software demux.
        if !list.contains(filter) {
            debug!("PID 0x{:04X}: filter added", pid);
            list.push(*filter);
        }
    }

    fn remove_section_filter(&self, pid: u16, filter: &SectionFilter) {
        let mut filters = self.filters.lock();
        if let Some(list) = filters.get_mut(&pid) {
            list.retain(|f| f != filter);
            if list.is_empty() {
                debug!("PID 0x{:04X}: last filter removed", pid);
                filters.remove(&pid);
            }
        }
    }

    fn get_pid_for_assoc_tag(&self, assoc_tag: u16) -> Option<u16> {
        self.assoc_tags
            .lock()
            .values()
            .find_map(|tags| tags.get(&assoc_tag).copied())
    }
}

/// Logs what the engine reports and publishes the carousel status.
pub struct ReportingListener {
    status: watch::Sender<CarouselStatus>,
    files: Mutex<u64>,
}

impl ReportingListener {
    pub fn new() -> (Self, watch::Receiver<CarouselStatus>) {
        let (status, rx) = watch::channel(CarouselStatus::Partial);
        let listener = Self {
            status,
            files: Mutex::new(0),
        };
        (listener, rx)
    }

    pub fn files(&self) -> u64 {
        *self.files.lock()
    }
}

impl CarouselListener for ReportingListener {
    fn dentry_saved(
        &self,
        subscription: SubscriptionId,
        _carousel_id: u32,
        is_dir: bool,
        logical_path: &str,
        fs_path: &Path,
    ) {
        if is_dir {
            debug!("[{}] {}/ -> {:?}", subscription, logical_path, fs_path);
        } else {
            *self.files.lock() += 1;
            info!("[{}] {} -> {:?}", subscription, logical_path, fs_path);
        }
    }

    fn download_progression(
        &self,
        subscription: SubscriptionId,
        carousel_id: u32,
        downloaded: u64,
        total: u64,
    ) {
        debug!(
            "[{}] carousel 0x{:08X}: {}/{} bytes",
            subscription, carousel_id, downloaded, total
        );
    }

    fn carousel_status_changed(
        &self,
        subscription: SubscriptionId,
        carousel_id: u32,
        status: CarouselStatus,
    ) {
        match status {
            CarouselStatus::TimedOut => warn!("[{}] carousel 0x{:08X} timed out", subscription, carousel_id),
            _ => info!("[{}] carousel 0x{:08X} {}", subscription, carousel_id, status),
        }
        self.status.send_replace(status);
    }
}
