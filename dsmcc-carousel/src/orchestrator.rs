//! Carousel state machine.
//!
//! [`Context`] owns every carousel, module, stream and timeout. It is
//! driven by [`Action`]s and by the passage of time and never blocks
//! except on disk I/O. The engine worker is its only user.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};

use dsmcc_protocol::descriptors::{find_compressed, find_name};
use dsmcc_protocol::{
    message_id, table_id, transaction_matches, Ddb, Dii, Dsi, DsiBody, MessageHeader, ModuleInfo,
    Section, TRANSACTION_ID_ANY,
};

use crate::callbacks::{CarouselListener, DvbStack, SubscriptionId};
use crate::carousel::{CarouselStatus, DiiState, ObjectCarousel};
use crate::config::EngineConfig;
use crate::error::PersistError;
use crate::file_cache::FileCache;
use crate::module::{BlockOutcome, Module, ModuleEntry, ModuleKey, ModuleState};
use crate::persist;
use crate::storage::Storage;
use crate::stream::{Answer, Stream, StreamRequest};
use crate::timeout::{Timeout, TimeoutKind, TimeoutList};

/// Work item for the engine worker.
pub enum Action {
    QueueCarousel {
        subscription: SubscriptionId,
        pid: u16,
        transaction_id: u32,
        download_path: PathBuf,
        listener: Arc<dyn CarouselListener>,
    },
    DequeueCarousel(SubscriptionId),
    AddSection {
        pid: u16,
        data: Bytes,
    },
    CacheClear,
    CacheClearCarousel(u32),
}

pub struct Context {
    config: EngineConfig,
    storage: Storage,
    dvb: Arc<dyn DvbStack>,
    carousels: BTreeMap<u16, ObjectCarousel>,
    streams: BTreeMap<u16, Stream>,
    timeouts: TimeoutList,
    dirty: bool,
}

impl Context {
    pub fn new(config: EngineConfig, dvb: Arc<dyn DvbStack>) -> Self {
        Self {
            storage: Storage::new(&config.cache_dir),
            config,
            dvb,
            carousels: BTreeMap::new(),
            streams: BTreeMap::new(),
            timeouts: TimeoutList::new(),
            dirty: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn carousel(&self, pid: u16) -> Option<&ObjectCarousel> {
        self.carousels.get(&pid)
    }

    pub fn carousels(&self) -> impl Iterator<Item = &ObjectCarousel> {
        self.carousels.values()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    /// Restore persisted carousels as idle records.
    pub fn load(&mut self) {
        if !self.config.keep_cache {
            return;
        }
        let path = self.config.state_path();
        if !path.exists() {
            debug!("No state file at {:?}", path);
            return;
        }
        let carousels = match persist::load(&path) {
            Ok(carousels) => carousels,
            Err(e) => {
                warn!("Ignoring state file {:?}: {}", path, e);
                return;
            }
        };
        for mut carousel in carousels {
            if carousel.status == CarouselStatus::Downloading {
                carousel.status = CarouselStatus::Partial;
            }
            for (key, change) in persist::reconcile(&mut carousel) {
                warn!(
                    "PID 0x{:04X}: module 0x{:04X}: {}",
                    carousel.pid, key.module_id, change
                );
            }
            info!(
                "Restored carousel 0x{:08X} on PID 0x{:04X} ({} modules, {})",
                carousel.carousel_id,
                carousel.pid,
                carousel.modules.len(),
                carousel.status
            );
            self.carousels.insert(carousel.pid, carousel);
        }
    }

    /// Write the state file when caching across restarts.
    pub fn persist(&mut self) -> Result<(), PersistError> {
        self.dirty = false;
        if !self.config.keep_cache {
            return Ok(());
        }
        persist::save(&self.config.state_path(), self.carousels.values())?;
        debug!("State saved ({} carousels)", self.carousels.len());
        Ok(())
    }

    pub fn apply(&mut self, action: Action, now: Instant) {
        match action {
            Action::QueueCarousel {
                subscription,
                pid,
                transaction_id,
                download_path,
                listener,
            } => self.queue_carousel(subscription, pid, transaction_id, download_path, listener, now),
            Action::DequeueCarousel(subscription) => self.dequeue_carousel(subscription),
            Action::AddSection { pid, data } => self.add_section(pid, &data, now),
            Action::CacheClear => self.cache_clear(),
            Action::CacheClearCarousel(carousel_id) => self.cache_clear_carousel(carousel_id, now),
        }
    }

    /// Fire every timeout due at `now`.
    pub fn expire(&mut self, now: Instant) {
        for timeout in self.timeouts.pop_expired(now) {
            self.fire(timeout, now);
        }
    }

    /// Stop every download and release all filters.
    pub fn shutdown(&mut self) {
        let pids: Vec<u16> = self.carousels.keys().copied().collect();
        for pid in &pids {
            self.stop(*pid);
        }
        if self.config.keep_cache {
            if let Err(e) = self.persist() {
                error!("Failed to save state: {}", e);
            }
        } else {
            for pid in pids {
                if let Err(e) = self.storage.remove_carousel(pid) {
                    warn!("PID 0x{:04X}: cannot remove cached data: {}", pid, e);
                }
            }
        }
        self.carousels.clear();
        self.streams.clear();
        self.timeouts = TimeoutList::new();
        self.dirty = false;
    }

    fn queue_carousel(
        &mut self,
        subscription: SubscriptionId,
        pid: u16,
        transaction_id: u32,
        download_path: PathBuf,
        listener: Arc<dyn CarouselListener>,
        now: Instant,
    ) {
        let carousel = self
            .carousels
            .entry(pid)
            .or_insert_with(|| ObjectCarousel::new(pid, transaction_id));
        let first = !carousel.is_subscribed();
        if first {
            carousel.transaction_id = transaction_id;
        } else if carousel.transaction_id != transaction_id {
            warn!(
                "PID 0x{:04X}: subscription {} asks for transaction 0x{:08X}, sharing 0x{:08X}",
                pid, subscription, transaction_id, carousel.transaction_id
            );
        }

        info!(
            "Subscription {} on PID 0x{:04X} -> {:?}",
            subscription, pid, download_path
        );
        let mut cache = FileCache::new(download_path, subscription, listener);
        cache.set_carousel_id(carousel.carousel_id);
        carousel.replay(&mut cache);
        if !first {
            let listener = cache.listener();
            listener.carousel_status_changed(subscription, carousel.carousel_id, carousel.status);
            let (downloaded, total) = carousel.progress();
            listener.download_progression(subscription, carousel.carousel_id, downloaded, total);
        }
        carousel.subscribers.push(cache);

        if first {
            self.start(pid, now);
        }
        self.dirty = true;
    }

    fn dequeue_carousel(&mut self, subscription: SubscriptionId) {
        let Some(pid) = self
            .carousels
            .values()
            .find(|c| c.subscribers.iter().any(|s| s.subscription() == subscription))
            .map(|c| c.pid)
        else {
            warn!("Unknown subscription {}", subscription);
            return;
        };

        let last = self
            .carousels
            .get(&pid)
            .map_or(false, |c| c.subscribers.len() == 1);
        if last {
            self.stop(pid);
        }
        if let Some(carousel) = self.carousels.get_mut(&pid) {
            carousel.subscribers.retain(|s| s.subscription() != subscription);
        }
        info!("Subscription {} on PID 0x{:04X} removed", subscription, pid);

        if last && !self.config.keep_cache {
            self.carousels.remove(&pid);
            if let Err(e) = self.storage.remove_carousel(pid) {
                warn!("PID 0x{:04X}: cannot remove cached data: {}", pid, e);
            }
        }
        self.dirty = true;
    }

    /// Begin (or restart) downloading: wait for a DSI.
    fn start(&mut self, pid: u16, now: Instant) {
        let Some(carousel) = self.carousels.get_mut(&pid) else {
            return;
        };
        carousel.dsi_transaction = None;
        carousel.diis.clear();
        carousel.retries.clear();
        carousel.set_status(CarouselStatus::Downloading);
        subscribe(&mut self.streams, &*self.dvb, pid, pid, StreamRequest::Dsi, None);
        self.timeouts.arm(
            Timeout {
                pid,
                kind: TimeoutKind::Dsi,
            },
            now + self.config.dsi_timeout(),
        );
    }

    /// Drop every request and timeout of a carousel.
    fn stop(&mut self, pid: u16) {
        release_owner(&mut self.streams, &*self.dvb, pid);
        self.timeouts.cancel_carousel(pid);
        if let Some(carousel) = self.carousels.get_mut(&pid) {
            if carousel.status == CarouselStatus::Downloading {
                carousel.set_status(CarouselStatus::Partial);
            }
        }
    }

    fn add_section(&mut self, pid: u16, data: &[u8], now: Instant) {
        let section = match Section::parse(data) {
            Ok(section) => section,
            Err(e) => {
                debug!("PID 0x{:04X}: dropping section: {}", pid, e);
                return;
            }
        };
        let Some(stream) = self.streams.get(&pid) else {
            trace!("PID 0x{:04X}: no stream", pid);
            return;
        };

        match section.header.table_id {
            table_id::DSI_DII => {
                let header = match MessageHeader::parse(&section) {
                    Ok((header, _)) => header,
                    Err(e) => {
                        error!("PID 0x{:04X}: bad DSM-CC message header: {}", pid, e);
                        return;
                    }
                };
                match header.message_id {
                    message_id::DSI => {
                        let owners = stream.owners_for(&Answer::Dsi);
                        if owners.is_empty() {
                            return;
                        }
                        match Dsi::parse(&section) {
                            Ok(dsi) => {
                                for owner in owners {
                                    self.handle_dsi(owner, &dsi, now);
                                }
                            }
                            Err(e) => error!("PID 0x{:04X}: bad DSI: {}", pid, e),
                        }
                    }
                    message_id::DII => {
                        let owners = stream.owners_for(&Answer::Dii {
                            transaction_id: header.transaction_id,
                        });
                        for owner in owners {
                            let Some(kind) = self.carousels.get(&owner).map(|c| c.kind) else {
                                continue;
                            };
                            match Dii::parse(&section, kind) {
                                Ok(dii) => self.handle_dii(owner, &dii, now),
                                Err(e) => error!("PID 0x{:04X}: bad DII: {}", pid, e),
                            }
                        }
                    }
                    other => trace!("PID 0x{:04X}: ignoring message 0x{:04X}", pid, other),
                }
            }
            table_id::DDB => {
                let ddb = match Ddb::parse(&section) {
                    Ok(ddb) => ddb,
                    Err(e) => {
                        error!("PID 0x{:04X}: bad DDB: {}", pid, e);
                        return;
                    }
                };
                let key = ModuleKey {
                    download_id: ddb.download_id,
                    module_id: ddb.module_id,
                };
                for owner in stream.owners_for(&Answer::Ddb { key }) {
                    self.handle_ddb(owner, &ddb, now);
                }
            }
            other => trace!("PID 0x{:04X}: ignoring table 0x{:02X}", pid, other),
        }
    }

    fn handle_dsi(&mut self, owner: u16, dsi: &Dsi, now: Instant) {
        let dvb = self.dvb.clone();
        let Some(carousel) = self.carousels.get_mut(&owner) else {
            return;
        };
        if carousel.dsi_transaction == Some(dsi.transaction_id) {
            return;
        }
        if carousel.transaction_id != TRANSACTION_ID_ANY
            && !transaction_matches(carousel.transaction_id, dsi.transaction_id)
        {
            debug!(
                "PID 0x{:04X}: DSI 0x{:08X} is not the requested 0x{:08X}",
                owner, dsi.transaction_id, carousel.transaction_id
            );
            return;
        }
        self.timeouts.cancel(&Timeout {
            pid: owner,
            kind: TimeoutKind::Dsi,
        });

        let (carousel_id, wanted): (u32, Vec<(u32, DiiState)>) = match &dsi.body {
            DsiBody::ObjectCarousel(info) => {
                let tap = info.ior.conn_binder;
                let state = DiiState {
                    pid: resolve(&*dvb, tap.assoc_tag, owner),
                    seen: None,
                    timeout_us: tap.timeout_us,
                };
                (info.ior.location.carousel_id, vec![(tap.transaction_id, state)])
            }
            DsiBody::DataCarousel(groups) => (
                dsi.transaction_id,
                groups
                    .groups
                    .iter()
                    .map(|g| {
                        let state = DiiState {
                            pid: owner,
                            seen: None,
                            timeout_us: 0,
                        };
                        (g.group_id, state)
                    })
                    .collect(),
            ),
        };

        if carousel.carousel_id != 0 && carousel.carousel_id != carousel_id {
            warn!(
                "PID 0x{:04X}: carousel id changed 0x{:08X} -> 0x{:08X}, dropping modules",
                owner, carousel.carousel_id, carousel_id
            );
            for (_, module) in std::mem::take(&mut carousel.modules) {
                discard(&mut self.streams, &*dvb, &mut self.timeouts, owner, &module);
            }
            for cache in &mut carousel.subscribers {
                cache.reset();
            }
        }
        carousel.kind = dsi.kind();
        carousel.set_carousel_id(carousel_id);
        carousel.dsi_transaction = Some(dsi.transaction_id);
        info!(
            "PID 0x{:04X}: DSI 0x{:08X}, {:?} carousel 0x{:08X}, {} DII(s)",
            owner,
            dsi.transaction_id,
            carousel.kind,
            carousel_id,
            wanted.len()
        );

        let stale: Vec<u32> = carousel
            .diis
            .keys()
            .filter(|tid| !wanted.iter().any(|(w, _)| w == *tid))
            .copied()
            .collect();
        for tid in stale {
            if let Some(state) = carousel.diis.remove(&tid) {
                let request = StreamRequest::Dii {
                    transaction_id: tid,
                };
                unsubscribe(&mut self.streams, &*dvb, state.pid, owner, &request);
                self.timeouts.cancel(&Timeout {
                    pid: owner,
                    kind: TimeoutKind::Dii(tid),
                });
            }
        }
        for (tid, state) in wanted {
            if carousel.diis.contains_key(&tid) {
                continue;
            }
            carousel.diis.insert(tid, state);
            let assoc_tag = match &dsi.body {
                DsiBody::ObjectCarousel(info) => Some(info.ior.conn_binder.assoc_tag),
                DsiBody::DataCarousel(_) => None,
            };
            subscribe(
                &mut self.streams,
                &*dvb,
                state.pid,
                owner,
                StreamRequest::Dii {
                    transaction_id: tid,
                },
                assoc_tag,
            );
            self.timeouts.arm(
                Timeout {
                    pid: owner,
                    kind: TimeoutKind::Dii(tid),
                },
                now + self.config.dii_timeout(state.timeout_us),
            );
        }
        self.dirty = true;
    }

    fn handle_dii(&mut self, owner: u16, dii: &Dii, now: Instant) {
        let dvb = self.dvb.clone();
        let Some(carousel) = self.carousels.get_mut(&owner) else {
            return;
        };
        let Some((&group, state)) = carousel
            .diis
            .iter_mut()
            .find(|(tid, _)| transaction_matches(**tid, dii.transaction_id))
        else {
            return;
        };
        if state.seen == Some(dii.transaction_id) {
            return;
        }
        state.seen = Some(dii.transaction_id);
        let dii_pid = state.pid;
        self.timeouts.cancel(&Timeout {
            pid: owner,
            kind: TimeoutKind::Dii(group),
        });
        info!(
            "PID 0x{:04X}: DII 0x{:08X}, download 0x{:08X}, {} modules, block size {}",
            owner,
            dii.transaction_id,
            dii.download_id,
            dii.modules.len(),
            dii.block_size
        );

        let mut announced = BTreeSet::new();
        let mut ready = Vec::new();
        let mut restarted = false;
        for md in &dii.modules {
            let key = ModuleKey {
                download_id: dii.download_id,
                module_id: md.module_id,
            };
            announced.insert(key);
            let descriptors = md.info.descriptors();
            let (ddb_pid, assoc_tag, module_timeout_us, block_timeout_us) = match &md.info {
                ModuleInfo::Biop(info) => (
                    info.assoc_tag
                        .map_or(dii_pid, |tag| resolve(&*dvb, tag, dii_pid)),
                    info.assoc_tag,
                    info.module_timeout,
                    info.block_timeout,
                ),
                ModuleInfo::Data(_) => (dii_pid, None, 0, 0),
            };

            let up_to_date = carousel.modules.get(&key).map_or(false, |m| {
                m.version == md.module_version
                    && m.size == md.module_size
                    && m.state != ModuleState::Invalid
            });
            if !up_to_date {
                if let Some(old) = carousel.modules.remove(&key) {
                    debug!(
                        "PID 0x{:04X}: module 0x{:04X} version {} -> {}",
                        owner, key.module_id, old.version, md.module_version
                    );
                    discard(&mut self.streams, &*dvb, &mut self.timeouts, owner, &old);
                }
                let temp = self.storage.module_temp(
                    owner,
                    key.download_id,
                    key.module_id,
                    md.module_version,
                );
                match Module::new(
                    key,
                    md.module_version,
                    md.module_size,
                    dii.block_size,
                    find_compressed(descriptors),
                    temp,
                ) {
                    Ok(module) => {
                        carousel.modules.insert(key, module);
                        restarted = true;
                    }
                    Err(e) => {
                        warn!("PID 0x{:04X}: {}", owner, e);
                        continue;
                    }
                }
            }

            let Some(module) = carousel.modules.get_mut(&key) else {
                continue;
            };
            module.name = find_name(descriptors).map(str::to_string);
            module.ddb_pid = Some(ddb_pid);
            module.module_timeout_us = module_timeout_us;
            module.block_timeout_us = block_timeout_us;
            if !module.is_partial() {
                continue;
            }
            if module.all_blocks_present() {
                ready.push(key);
                continue;
            }
            subscribe(
                &mut self.streams,
                &*dvb,
                ddb_pid,
                owner,
                StreamRequest::Ddb { key },
                assoc_tag,
            );
            self.timeouts.arm(
                Timeout {
                    pid: owner,
                    kind: TimeoutKind::Module(key),
                },
                now + self.config.module_timeout(module_timeout_us),
            );
            self.timeouts.arm(
                Timeout {
                    pid: owner,
                    kind: TimeoutKind::Block(key),
                },
                now + self.config.block_timeout(block_timeout_us),
            );
        }

        let dropped: Vec<ModuleKey> = carousel
            .modules
            .keys()
            .filter(|k| k.download_id == dii.download_id && !announced.contains(k))
            .copied()
            .collect();
        for key in dropped {
            if let Some(module) = carousel.modules.remove(&key) {
                debug!("PID 0x{:04X}: module 0x{:04X} withdrawn", owner, key.module_id);
                discard(&mut self.streams, &*dvb, &mut self.timeouts, owner, &module);
            }
        }
        if restarted && carousel.status == CarouselStatus::Done {
            carousel.set_status(CarouselStatus::Downloading);
        }
        self.dirty = true;

        for key in ready {
            self.complete_module(owner, key);
        }
        if let Some(carousel) = self.carousels.get(&owner) {
            carousel.report_progress();
        }
        self.check_done(owner);
    }

    fn handle_ddb(&mut self, owner: u16, ddb: &Ddb<'_>, now: Instant) {
        let key = ModuleKey {
            download_id: ddb.download_id,
            module_id: ddb.module_id,
        };
        let Some(carousel) = self.carousels.get_mut(&owner) else {
            return;
        };
        let Some(module) = carousel.modules.get_mut(&key) else {
            return;
        };
        if module.version != ddb.module_version {
            trace!(
                "PID 0x{:04X}: DDB for module 0x{:04X} version {}, expecting {}",
                owner,
                key.module_id,
                ddb.module_version,
                module.version
            );
            return;
        }

        match module.add_block(ddb.block_number, ddb.data) {
            Ok(BlockOutcome::Duplicate) => {}
            Ok(BlockOutcome::Stored) => {
                self.timeouts.arm(
                    Timeout {
                        pid: owner,
                        kind: TimeoutKind::Block(key),
                    },
                    now + self.config.block_timeout(module.block_timeout_us),
                );
                self.dirty = true;
                carousel.report_progress();
            }
            Ok(BlockOutcome::Completed) => {
                self.complete_module(owner, key);
                if let Some(carousel) = self.carousels.get(&owner) {
                    carousel.report_progress();
                }
                self.check_done(owner);
            }
            Err(e) => warn!("PID 0x{:04X}: {}", owner, e),
        }
    }

    /// Decode a module whose blocks are all present and publish it.
    fn complete_module(&mut self, owner: u16, key: ModuleKey) {
        let dvb = self.dvb.clone();
        let Some(carousel) = self.carousels.get_mut(&owner) else {
            return;
        };
        let kind = carousel.kind;
        let Some(module) = carousel.modules.get_mut(&key) else {
            return;
        };
        self.timeouts.cancel_module(owner, key);
        carousel.retries.remove(&key);
        if let Some(ddb_pid) = module.ddb_pid {
            unsubscribe(&mut self.streams, &*dvb, ddb_pid, owner, &StreamRequest::Ddb { key });
        }

        let temp = match &module.state {
            ModuleState::Partial(p) => Some(p.temp_path.clone()),
            _ => None,
        };
        let result = module
            .read_data()
            .and_then(|data| module.build_entries(kind, &data, &self.storage, owner));
        if let Some(temp) = temp {
            if let Err(e) = Storage::remove_file(&temp) {
                warn!("Cannot remove {:?}: {}", temp, e);
            }
        }
        self.dirty = true;

        match result {
            Ok(entries) => {
                info!(
                    "PID 0x{:04X}: module 0x{:04X} v{} complete ({} bytes, {} entries)",
                    owner,
                    key.module_id,
                    module.version,
                    module.size,
                    entries.len()
                );
                module.state = ModuleState::Complete(entries.clone());
                carousel.publish(&entries);
            }
            Err(e) => {
                error!(
                    "PID 0x{:04X}: module 0x{:04X} v{} invalidated: {}",
                    owner, key.module_id, module.version, e
                );
                module.state = ModuleState::Invalid;
                // Let the next DII bring it back.
                for state in carousel.diis.values_mut() {
                    state.seen = None;
                }
            }
        }
    }

    fn check_done(&mut self, pid: u16) {
        let Some(carousel) = self.carousels.get_mut(&pid) else {
            return;
        };
        if carousel.is_subscribed()
            && carousel.status != CarouselStatus::Done
            && carousel.is_complete()
        {
            carousel.set_status(CarouselStatus::Done);
            self.timeouts.cancel_carousel(pid);
            self.dirty = true;
        }
    }

    fn fire(&mut self, timeout: Timeout, now: Instant) {
        let pid = timeout.pid;
        let Some(carousel) = self.carousels.get_mut(&pid) else {
            return;
        };
        match timeout.kind {
            TimeoutKind::Dsi => {
                if carousel.dsi_transaction.is_none() {
                    warn!("PID 0x{:04X}: no DSI received", pid);
                    carousel.set_status(CarouselStatus::TimedOut);
                }
            }
            TimeoutKind::Dii(tid) => {
                if carousel.diis.get(&tid).map_or(false, |d| d.seen.is_none()) {
                    warn!("PID 0x{:04X}: no DII 0x{:08X} received", pid, tid);
                    carousel.set_status(CarouselStatus::TimedOut);
                }
            }
            TimeoutKind::Module(key) => {
                let Some(module) = carousel.modules.get(&key).filter(|m| m.is_partial()) else {
                    return;
                };
                let retries = carousel.retries.entry(key).or_insert(0);
                *retries += 1;
                if *retries > self.config.max_module_retries {
                    warn!(
                        "PID 0x{:04X}: module 0x{:04X} timed out {} times, giving up",
                        pid, key.module_id, *retries
                    );
                    self.timeouts.cancel(&Timeout {
                        pid,
                        kind: TimeoutKind::Block(key),
                    });
                    carousel.set_status(CarouselStatus::TimedOut);
                    self.dirty = true;
                    return;
                }
                warn!(
                    "PID 0x{:04X}: module 0x{:04X} timed out, retry {}/{}",
                    pid, key.module_id, *retries, self.config.max_module_retries
                );
                refresh(&self.streams, &*self.dvb, module, key);
                self.timeouts.arm(
                    timeout,
                    now + self.config.module_timeout(module.module_timeout_us),
                );
                self.timeouts.arm(
                    Timeout {
                        pid,
                        kind: TimeoutKind::Block(key),
                    },
                    now + self.config.block_timeout(module.block_timeout_us),
                );
            }
            TimeoutKind::Block(key) => {
                let Some(module) = carousel.modules.get(&key).filter(|m| m.is_partial()) else {
                    return;
                };
                debug!("PID 0x{:04X}: block gap on module 0x{:04X}", pid, key.module_id);
                refresh(&self.streams, &*self.dvb, module, key);
                self.timeouts
                    .arm(timeout, now + self.config.block_timeout(module.block_timeout_us));
            }
        }
    }

    /// Drop idle carousels and their files.
    fn cache_clear(&mut self) {
        let idle: Vec<u16> = self
            .carousels
            .values()
            .filter(|c| !c.is_subscribed())
            .map(|c| c.pid)
            .collect();
        for pid in &idle {
            self.carousels.remove(pid);
            if let Err(e) = self.storage.remove_carousel(*pid) {
                warn!("PID 0x{:04X}: cannot remove cached data: {}", pid, e);
            }
        }
        info!("Cache cleared ({} idle carousels dropped)", idle.len());
        self.dirty = true;
    }

    /// Drop the modules of one carousel, restarting it if subscribed.
    fn cache_clear_carousel(&mut self, carousel_id: u32, now: Instant) {
        let pids: Vec<u16> = self
            .carousels
            .values()
            .filter(|c| c.carousel_id == carousel_id)
            .map(|c| c.pid)
            .collect();
        if pids.is_empty() {
            warn!("Cache clear: unknown carousel 0x{:08X}", carousel_id);
            return;
        }
        for pid in pids {
            let subscribed = self.carousels.get(&pid).map_or(false, |c| c.is_subscribed());
            self.stop(pid);
            if let Err(e) = self.storage.remove_carousel(pid) {
                warn!("PID 0x{:04X}: cannot remove cached data: {}", pid, e);
            }
            if !subscribed {
                self.carousels.remove(&pid);
                continue;
            }
            if let Some(carousel) = self.carousels.get_mut(&pid) {
                carousel.modules.clear();
                for cache in &mut carousel.subscribers {
                    cache.reset();
                }
            }
            info!("PID 0x{:04X}: carousel 0x{:08X} cleared, restarting", pid, carousel_id);
            self.start(pid, now);
        }
        self.dirty = true;
    }
}

fn resolve(dvb: &dyn DvbStack, assoc_tag: u16, fallback: u16) -> u16 {
    dvb.get_pid_for_assoc_tag(assoc_tag).unwrap_or(fallback)
}

fn subscribe(
    streams: &mut BTreeMap<u16, Stream>,
    dvb: &dyn DvbStack,
    pid: u16,
    owner: u16,
    request: StreamRequest,
    assoc_tag: Option<u16>,
) {
    let stream = streams.entry(pid).or_insert_with(|| Stream::new(pid));
    if let Some(tag) = assoc_tag {
        stream.assoc_tags.insert(tag);
    }
    stream.subscribe(owner, request, dvb);
}

fn unsubscribe(
    streams: &mut BTreeMap<u16, Stream>,
    dvb: &dyn DvbStack,
    pid: u16,
    owner: u16,
    request: &StreamRequest,
) {
    if let Some(stream) = streams.get_mut(&pid) {
        stream.unsubscribe(owner, request, dvb);
        if stream.is_idle() {
            streams.remove(&pid);
        }
    }
}

fn release_owner(streams: &mut BTreeMap<u16, Stream>, dvb: &dyn DvbStack, owner: u16) {
    for stream in streams.values_mut() {
        stream.remove_owner(owner, dvb);
    }
    streams.retain(|_, s| !s.is_idle());
}

/// Install the DDB filter of a stalled module again.
fn refresh(streams: &BTreeMap<u16, Stream>, dvb: &dyn DvbStack, module: &Module, key: ModuleKey) {
    if let Some(stream) = module.ddb_pid.and_then(|pid| streams.get(&pid)) {
        stream.refresh(&StreamRequest::Ddb { key }, dvb);
    }
}

/// Forget a module that is being replaced or withdrawn.
fn discard(
    streams: &mut BTreeMap<u16, Stream>,
    dvb: &dyn DvbStack,
    timeouts: &mut TimeoutList,
    owner: u16,
    module: &Module,
) {
    let key = module.key();
    timeouts.cancel_module(owner, key);
    if let Some(pid) = module.ddb_pid {
        unsubscribe(streams, dvb, pid, owner, &StreamRequest::Ddb { key });
    }
    let stale: Vec<&Path> = match &module.state {
        ModuleState::Partial(p) => vec![p.temp_path.as_path()],
        // Placed files are separate links or copies of these blobs.
        ModuleState::Complete(entries) => entries
            .iter()
            .filter_map(|e| match e {
                ModuleEntry::File { data_path, .. } => Some(data_path.as_path()),
                ModuleEntry::Directory { .. } => None,
            })
            .collect(),
        ModuleState::Invalid => Vec::new(),
    };
    for path in stale {
        if let Err(e) = Storage::remove_file(path) {
            warn!("Cannot remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;
    use std::time::Duration;

    use dsmcc_protocol::testing::{self, TestModule};
    use dsmcc_protocol::SectionFilter;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use parking_lot::Mutex;

    const PID: u16 = 0x0100;
    const DSI_TID: u32 = 0x8000_0000;
    const DII_TID: u32 = 0x8000_0002;
    const CAROUSEL_ID: u32 = 1;
    const MODULE: u16 = 0x10;

    #[derive(Default)]
    struct Dvb {
        filters: Mutex<Vec<(u16, SectionFilter)>>,
        tags: HashMap<u16, u16>,
    }

    impl DvbStack for Dvb {
        fn add_section_filter(&self, pid: u16, filter: &SectionFilter) {
            self.filters.lock().push((pid, *filter));
        }

        fn get_pid_for_assoc_tag(&self, assoc_tag: u16) -> Option<u16> {
            self.tags.get(&assoc_tag).copied()
        }
    }

    #[derive(Default)]
    struct Listener {
        statuses: Mutex<Vec<CarouselStatus>>,
        progress: Mutex<Vec<(u64, u64)>>,
        saved: Mutex<Vec<String>>,
    }

    impl CarouselListener for Listener {
        fn dentry_saved(
            &self,
            _subscription: SubscriptionId,
            _carousel_id: u32,
            _is_dir: bool,
            logical_path: &str,
            _fs_path: &Path,
        ) {
            self.saved.lock().push(logical_path.to_string());
        }

        fn download_progression(
            &self,
            _subscription: SubscriptionId,
            _carousel_id: u32,
            downloaded: u64,
            total: u64,
        ) {
            self.progress.lock().push((downloaded, total));
        }

        fn carousel_status_changed(
            &self,
            _subscription: SubscriptionId,
            _carousel_id: u32,
            status: CarouselStatus,
        ) {
            self.statuses.lock().push(status);
        }
    }

    struct Harness {
        ctx: Context,
        dvb: Arc<Dvb>,
        now: Instant,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Harness {
        fn new(keep_cache: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self::in_dir(dir, keep_cache)
        }

        fn in_dir(dir: tempfile::TempDir, keep_cache: bool) -> Self {
            let root = dir.path().to_path_buf();
            let dvb = Arc::new(Dvb::default());
            let config = EngineConfig::new(root.join("cache"), keep_cache);
            let mut ctx = Context::new(config, dvb.clone());
            ctx.load();
            Self {
                ctx,
                dvb,
                now: Instant::now(),
                _dir: dir,
                root,
            }
        }

        fn queue(&mut self, id: u64, pid: u16, out: &str) -> Arc<Listener> {
            let listener = Arc::new(Listener::default());
            let action = Action::QueueCarousel {
                subscription: SubscriptionId(id),
                pid,
                transaction_id: TRANSACTION_ID_ANY,
                download_path: self.root.join(out),
                listener: listener.clone(),
            };
            self.ctx.apply(action, self.now);
            listener
        }

        fn feed(&mut self, pid: u16, section: Vec<u8>) {
            let action = Action::AddSection {
                pid,
                data: Bytes::from(section),
            };
            self.ctx.apply(action, self.now);
        }

        fn downloaded(&self, pid: u16) -> u64 {
            self.ctx.carousel(pid).unwrap().progress().0
        }
    }

    fn key(n: u8) -> [u8; 4] {
        [0, 0, 0, n]
    }

    /// Gateway with `index.html`, both in module 0x10.
    fn object_module(content: &[u8]) -> Vec<u8> {
        let file_ior = testing::ior(b"fil\0", CAROUSEL_ID, MODULE, &key(2), 0x0B, DII_TID, 0);
        let mut module = testing::directory(
            &key(1),
            true,
            &[testing::binding(b"index.html\0", b"fil\0", 1, &file_ior)],
        );
        module.extend(testing::file(&key(2), content));
        module
    }

    fn dsi() -> Vec<u8> {
        let gateway = testing::ior(b"srg\0", CAROUSEL_ID, MODULE, &key(1), 0x0B, DII_TID, 0);
        testing::dsi_object_section(DSI_TID, &gateway)
    }

    fn dii(tid: u32, version: u8, size: u32, block_size: u16, descriptors: &[u8]) -> Vec<u8> {
        testing::dii_section(
            tid,
            CAROUSEL_ID,
            block_size,
            &[TestModule {
                module_id: MODULE,
                size,
                version,
                info: testing::biop_module_info(0, 0, 0x0B, descriptors),
            }],
        )
    }

    fn blocks(data: &[u8], block_size: usize) -> Vec<&[u8]> {
        data.chunks(block_size).collect()
    }

    #[test]
    fn test_object_carousel_download() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        assert_eq!(*listener.statuses.lock(), vec![CarouselStatus::Downloading]);
        assert_eq!(h.dvb.filters.lock()[0], (PID, SectionFilter::dsi()));

        h.feed(PID, dsi());
        assert_eq!(h.ctx.carousel(PID).unwrap().carousel_id, CAROUSEL_ID);

        let data = object_module(b"hello");
        let block_size = (data.len() + 1) / 2;
        h.feed(PID, dii(DII_TID, 1, data.len() as u32, block_size as u16, &[]));
        assert!(h
            .dvb
            .filters
            .lock()
            .contains(&(PID, SectionFilter::ddb(MODULE))));

        let parts = blocks(&data, block_size);
        assert_eq!(parts.len(), 2);
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 1, parts[1]));
        assert_eq!(h.downloaded(PID), parts[1].len() as u64);
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, parts[0]));

        let out = h.root.join("out");
        assert_eq!(fs::read(out.join("index.html")).unwrap(), b"hello");
        assert_eq!(*listener.saved.lock(), vec!["/index.html".to_string()]);
        assert_eq!(
            *listener.statuses.lock(),
            vec![CarouselStatus::Downloading, CarouselStatus::Done]
        );
        let total = data.len() as u64;
        assert_eq!(listener.progress.lock().last(), Some(&(total, total)));
        assert!(h.ctx.next_deadline().is_none());
    }

    #[test]
    fn test_compressed_module_is_inflated() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "out");
        h.feed(PID, dsi());

        let plain = object_module(&[0x5A; 2000]);
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&plain).unwrap();
        let packed = enc.finish().unwrap();

        let descriptor = testing::compressed_descriptor(0x08, plain.len() as u32);
        h.feed(PID, dii(DII_TID, 1, packed.len() as u32, 64, &descriptor));
        for (n, block) in blocks(&packed, 64).into_iter().enumerate() {
            h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, n as u16, block));
        }
        let written = fs::read(h.root.join("out/index.html")).unwrap();
        assert_eq!(written, vec![0x5A; 2000]);
    }

    #[test]
    fn test_corrupt_section_is_dropped() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "out");
        let mut section = dsi();
        let last = section.len() - 1;
        section[last] ^= 0x01;
        h.feed(PID, section);
        assert_eq!(h.ctx.carousel(PID).unwrap().dsi_transaction, None);
    }

    #[test]
    fn test_version_bump_restarts_module() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 100, 50, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &[0; 50]));
        assert_eq!(h.downloaded(PID), 50);

        // Same version under the toggled transaction id keeps the data.
        h.feed(PID, dii(DII_TID | 1, 1, 100, 50, &[]));
        assert_eq!(h.downloaded(PID), 50);
        // Duplicate block.
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &[0; 50]));
        assert_eq!(h.downloaded(PID), 50);

        h.feed(PID, dii(DII_TID, 2, 100, 50, &[]));
        assert_eq!(h.downloaded(PID), 0);
        let module = h.ctx.carousel(PID).unwrap().modules.values().next().unwrap();
        assert_eq!(module.version, 2);
        // Blocks of the old version are ignored.
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 1, &[0; 50]));
        assert_eq!(h.downloaded(PID), 0);
    }

    #[test]
    fn test_new_module_version_replaces_placed_file() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        h.feed(PID, dsi());

        let v1 = object_module(b"hello");
        h.feed(PID, dii(DII_TID, 1, v1.len() as u32, 4066, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &v1));
        let placed = h.root.join("out/index.html");
        assert_eq!(fs::read(&placed).unwrap(), b"hello");
        let reader_copy = h.root.join("held.html");
        fs::hard_link(&placed, &reader_copy).unwrap();

        let v2 = object_module(b"WORLD");
        h.feed(PID, dii(DII_TID | 1, 2, v2.len() as u32, 4066, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 2, 0, &v2));

        assert_eq!(fs::read(&placed).unwrap(), b"WORLD");
        // The old file was replaced, not rewritten in place.
        assert_eq!(fs::read(&reader_copy).unwrap(), b"hello");
        assert_eq!(
            *listener.saved.lock(),
            vec!["/index.html".to_string(), "/index.html".to_string()]
        );
        assert_eq!(
            *listener.statuses.lock(),
            vec![
                CarouselStatus::Downloading,
                CarouselStatus::Done,
                CarouselStatus::Downloading,
                CarouselStatus::Done,
            ]
        );

        // Only the current version's blob is kept.
        let objects = h.root.join("cache/pid-0100/objects");
        let blobs: Vec<String> = fs::read_dir(objects)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(blobs.len(), 1);
        assert!(blobs[0].ends_with("-02.bin"), "{:?}", blobs);
    }

    #[test]
    fn test_undecodable_module_is_invalidated() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 8, 8, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, b"notbiop!"));
        let carousel = h.ctx.carousel(PID).unwrap();
        let module = carousel.modules.values().next().unwrap();
        assert_eq!(module.state, ModuleState::Invalid);
        assert!(carousel.diis.values().all(|d| d.seen.is_none()));
        assert_eq!(*listener.statuses.lock(), vec![CarouselStatus::Downloading]);

        // The next DII announces it again.
        h.feed(PID, dii(DII_TID, 1, 8, 8, &[]));
        let module = h.ctx.carousel(PID).unwrap().modules.values().next().unwrap();
        assert!(module.is_partial());
    }

    #[test]
    fn test_dsi_timeout() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        h.ctx.expire(h.now + Duration::from_secs(29));
        assert_eq!(h.ctx.carousel(PID).unwrap().status, CarouselStatus::Downloading);
        h.ctx.expire(h.now + Duration::from_secs(31));
        assert_eq!(
            *listener.statuses.lock(),
            vec![CarouselStatus::Downloading, CarouselStatus::TimedOut]
        );
    }

    #[test]
    fn test_module_retries_then_timeout() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 100, 50, &[]));
        let filters_before = h.dvb.filters.lock().len();

        for round in 1..=3u64 {
            h.ctx.expire(h.now + Duration::from_secs(61 * round));
            assert_eq!(h.ctx.carousel(PID).unwrap().status, CarouselStatus::Downloading);
        }
        assert!(h.dvb.filters.lock().len() > filters_before);
        h.ctx.expire(h.now + Duration::from_secs(61 * 4));
        assert_eq!(
            listener.statuses.lock().last(),
            Some(&CarouselStatus::TimedOut)
        );
    }

    #[test]
    fn test_two_pids_are_independent() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "a");
        h.queue(2, PID + 1, "b");
        for pid in [PID, PID + 1] {
            h.feed(pid, dsi());
            h.feed(pid, dii(DII_TID, 1, 100, 50, &[]));
            h.feed(pid, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &[0; 50]));
        }
        assert_eq!(h.ctx.carousels().count(), 2);

        h.ctx.apply(Action::DequeueCarousel(SubscriptionId(1)), h.now);
        assert!(h.ctx.carousel(PID).is_none());
        assert_eq!(h.downloaded(PID + 1), 50);
        assert!(h.root.join("cache/pid-0101").exists());
        assert!(!h.root.join("cache/pid-0100").exists());
    }

    #[test]
    fn test_late_subscriber_gets_replay() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "first");
        h.feed(PID, dsi());
        let data = object_module(b"shared");
        h.feed(PID, dii(DII_TID, 1, data.len() as u32, 4066, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &data));

        let late = h.queue(2, PID, "second");
        assert_eq!(fs::read(h.root.join("second/index.html")).unwrap(), b"shared");
        assert_eq!(*late.statuses.lock(), vec![CarouselStatus::Done]);

        // Leaving does not disturb the remaining subscriber.
        h.ctx.apply(Action::DequeueCarousel(SubscriptionId(2)), h.now);
        assert_eq!(h.ctx.carousel(PID).unwrap().status, CarouselStatus::Done);
    }

    #[test]
    fn test_data_carousel() {
        let mut h = Harness::new(false);
        h.queue(1, PID, "out");
        h.feed(PID, testing::dsi_data_section(DSI_TID, &[(DII_TID, 5)]));
        assert_eq!(h.ctx.carousel(PID).unwrap().kind, dsmcc_protocol::CarouselKind::Data);

        let dii = testing::dii_section(
            DII_TID,
            7,
            4066,
            &[TestModule {
                module_id: 3,
                size: 5,
                version: 0,
                info: testing::name_descriptor("logo.png"),
            }],
        );
        h.feed(PID, dii);
        h.feed(PID, testing::ddb_section(7, 3, 0, 0, b"image"));
        assert_eq!(fs::read(h.root.join("out/logo.png")).unwrap(), b"image");
        assert_eq!(h.ctx.carousel(PID).unwrap().status, CarouselStatus::Done);
    }

    #[test]
    fn test_cache_clear_carousel_restarts() {
        let mut h = Harness::new(false);
        let listener = h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 100, 50, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &[0; 50]));

        h.ctx.apply(Action::CacheClearCarousel(CAROUSEL_ID), h.now);
        let carousel = h.ctx.carousel(PID).unwrap();
        assert!(carousel.modules.is_empty());
        assert_eq!(carousel.status, CarouselStatus::Downloading);
        assert_eq!(
            *listener.statuses.lock(),
            vec![
                CarouselStatus::Downloading,
                CarouselStatus::Partial,
                CarouselStatus::Downloading
            ]
        );
    }

    #[test]
    fn test_resume_from_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let mut h = Harness::in_dir(dir, true);
        h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 100, 50, &[]));
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 1, &[9; 50]));
        h.ctx.shutdown();
        assert!(path.join("cache/state.bin").exists());

        let dir = h._dir;
        let mut h = Harness::in_dir(dir, true);
        let carousel = h.ctx.carousel(PID).unwrap();
        assert_eq!(carousel.status, CarouselStatus::Partial);
        assert_eq!(carousel.carousel_id, CAROUSEL_ID);
        assert_eq!(h.downloaded(PID), 50);

        // Resubscribing picks up where it left off.
        h.queue(1, PID, "out");
        h.feed(PID, dsi());
        h.feed(PID, dii(DII_TID, 1, 100, 50, &[]));
        assert_eq!(h.downloaded(PID), 50);
        h.feed(PID, testing::ddb_section(CAROUSEL_ID, MODULE, 1, 0, &[9; 50]));
        let module = h.ctx.carousel(PID).unwrap().modules.values().next().unwrap();
        // 100 bytes of filler do not decode as BIOP.
        assert_eq!(module.state, ModuleState::Invalid);
    }

    #[test]
    fn test_cache_clear_drops_idle_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::in_dir(dir, true);
        h.queue(1, PID, "a");
        h.queue(2, PID + 1, "b");
        h.ctx.apply(Action::DequeueCarousel(SubscriptionId(1)), h.now);
        assert!(h.ctx.carousel(PID).is_some());
        h.ctx.apply(Action::CacheClear, h.now);
        assert!(h.ctx.carousel(PID).is_none());
        assert!(h.ctx.carousel(PID + 1).is_some());
    }
}
