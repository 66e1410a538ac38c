//! Carousel records.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::info;

use dsmcc_protocol::CarouselKind;

use crate::file_cache::FileCache;
use crate::module::{Module, ModuleEntry, ModuleKey, ModuleState};

/// Download status reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarouselStatus {
    /// Not downloading; whatever was received is kept.
    Partial,
    Downloading,
    /// A DSI, DII or module did not arrive in time.
    TimedOut,
    /// Every announced module is complete.
    Done,
}

impl CarouselStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            CarouselStatus::Partial => 0,
            CarouselStatus::Downloading => 1,
            CarouselStatus::TimedOut => 2,
            CarouselStatus::Done => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CarouselStatus::Partial),
            1 => Some(CarouselStatus::Downloading),
            2 => Some(CarouselStatus::TimedOut),
            3 => Some(CarouselStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for CarouselStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CarouselStatus::Partial => "partial",
            CarouselStatus::Downloading => "downloading",
            CarouselStatus::TimedOut => "timed out",
            CarouselStatus::Done => "done",
        };
        f.write_str(s)
    }
}

/// A DII the carousel waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiiState {
    /// PID carrying the DII.
    pub pid: u16,
    /// Full transaction id of the last DII accepted.
    pub seen: Option<u32>,
    /// Timeout from the ConnBinder, microseconds.
    pub timeout_us: u32,
}

/// One carousel, keyed by the PID it was requested on.
pub struct ObjectCarousel {
    pub pid: u16,
    /// Transaction id requested by the first subscriber.
    pub transaction_id: u32,
    /// 0 until the first DSI.
    pub carousel_id: u32,
    pub kind: CarouselKind,
    pub status: CarouselStatus,
    /// Transaction id of the DSI in use.
    pub dsi_transaction: Option<u32>,
    /// DIIs announced by the DSI, keyed by transaction id.
    pub diis: BTreeMap<u32, DiiState>,
    pub modules: BTreeMap<ModuleKey, Module>,
    pub subscribers: Vec<FileCache>,
    /// Module timeouts seen per module.
    pub retries: HashMap<ModuleKey, u32>,
}

impl ObjectCarousel {
    pub fn new(pid: u16, transaction_id: u32) -> Self {
        Self {
            pid,
            transaction_id,
            carousel_id: 0,
            kind: CarouselKind::Object,
            status: CarouselStatus::Partial,
            dsi_transaction: None,
            diis: BTreeMap::new(),
            modules: BTreeMap::new(),
            subscribers: Vec::new(),
            retries: HashMap::new(),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Bytes downloaded and announced over all modules.
    pub fn progress(&self) -> (u64, u64) {
        self.modules.values().fold((0, 0), |(done, total), m| {
            (done + m.downloaded(), total + m.size as u64)
        })
    }

    /// DSI and every DII seen and every module complete.
    pub fn is_complete(&self) -> bool {
        self.dsi_transaction.is_some()
            && !self.diis.is_empty()
            && self.diis.values().all(|d| d.seen.is_some())
            && !self.modules.is_empty()
            && self.modules.values().all(Module::is_complete)
    }

    pub fn set_status(&mut self, status: CarouselStatus) {
        if self.status == status {
            return;
        }
        info!(
            "PID 0x{:04X}: carousel 0x{:08X} {} -> {}",
            self.pid, self.carousel_id, self.status, status
        );
        self.status = status;
        for cache in &self.subscribers {
            cache
                .listener()
                .carousel_status_changed(cache.subscription(), self.carousel_id, status);
        }
    }

    pub fn report_progress(&self) {
        let (downloaded, total) = self.progress();
        for cache in &self.subscribers {
            cache.listener().download_progression(
                cache.subscription(),
                self.carousel_id,
                downloaded,
                total,
            );
        }
    }

    pub fn set_carousel_id(&mut self, carousel_id: u32) {
        self.carousel_id = carousel_id;
        for cache in &mut self.subscribers {
            cache.set_carousel_id(carousel_id);
        }
    }

    /// Hand the entries of a complete module to every subscriber.
    pub fn publish(&mut self, entries: &[ModuleEntry]) {
        for cache in &mut self.subscribers {
            feed(cache, entries);
        }
    }

    /// Bring a new subscriber up to date with the complete modules.
    pub fn replay(&self, cache: &mut FileCache) {
        for module in self.modules.values() {
            if let ModuleState::Complete(entries) = &module.state {
                feed(cache, entries);
            }
        }
    }
}

pub(crate) fn feed(cache: &mut FileCache, entries: &[ModuleEntry]) {
    for entry in entries {
        match entry {
            ModuleEntry::Directory {
                id,
                gateway,
                children,
            } => {
                if *gateway {
                    cache.cache_gateway(*id);
                }
                for child in children {
                    if child.is_dir {
                        cache.cache_dir(*id, child.id, &child.name);
                    } else {
                        cache.cache_file(*id, child.id, &child.name);
                    }
                }
            }
            ModuleEntry::File {
                id,
                data_path,
                size,
            } => cache.cache_data(*id, data_path, *size),
        }
    }
}
