//! Directory tree of one subscription.
//!
//! Directory and file records arrive in any order: a binding may name a
//! directory whose own message is not there yet, file data may precede the
//! binding that names it. Nodes wait in orphan lists until their parent is
//! known and are written to disk exactly once, as soon as their whole
//! parent chain is placed and, for files, their data is present. A file
//! whose data changes later, from a new module version, is placed again.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use dsmcc_protocol::ObjectId;

use crate::callbacks::{CarouselListener, SubscriptionId};
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Pending,
    Placed { fs_path: PathBuf, logical: String },
    /// Vetoed by the listener or failed to write; never retried.
    Dropped,
}

#[derive(Debug)]
struct Node {
    name: String,
    is_dir: bool,
    /// File content in the object store.
    data: Option<(PathBuf, u64)>,
    placement: Placement,
}

pub struct FileCache {
    root: PathBuf,
    subscription: SubscriptionId,
    carousel_id: u32,
    listener: Arc<dyn CarouselListener>,

    gateway: Option<ObjectId>,
    nodes: HashMap<ObjectId, Node>,
    children: HashMap<ObjectId, Vec<ObjectId>>,
    parents: HashMap<ObjectId, ObjectId>,
    /// Directories whose parent is not known yet, keyed by parent.
    orphan_dirs: HashMap<ObjectId, Vec<ObjectId>>,
    orphan_files: HashMap<ObjectId, Vec<ObjectId>>,
    /// File data whose binding has not been seen.
    nameless: HashMap<ObjectId, (PathBuf, u64)>,
}

impl FileCache {
    pub fn new(
        root: impl Into<PathBuf>,
        subscription: SubscriptionId,
        listener: Arc<dyn CarouselListener>,
    ) -> Self {
        Self {
            root: root.into(),
            subscription,
            carousel_id: 0,
            listener,
            gateway: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
            orphan_dirs: HashMap::new(),
            orphan_files: HashMap::new(),
            nameless: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn listener(&self) -> &Arc<dyn CarouselListener> {
        &self.listener
    }

    pub fn set_carousel_id(&mut self, carousel_id: u32) {
        self.carousel_id = carousel_id;
    }

    /// Forget every node. Files already written stay on disk.
    pub fn reset(&mut self) {
        self.gateway = None;
        self.nodes.clear();
        self.children.clear();
        self.parents.clear();
        self.orphan_dirs.clear();
        self.orphan_files.clear();
        self.nameless.clear();
    }

    /// Filesystem path of a placed node.
    pub fn path_of(&self, id: ObjectId) -> Option<&Path> {
        match &self.nodes.get(&id)?.placement {
            Placement::Placed { fs_path, .. } => Some(fs_path),
            _ => None,
        }
    }

    pub fn placed_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n.placement, Placement::Placed { .. }))
            .count()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_dirs.values().map(Vec::len).sum::<usize>()
            + self.orphan_files.values().map(Vec::len).sum::<usize>()
    }

    /// Root of the tree.
    pub fn cache_gateway(&mut self, id: ObjectId) {
        if let Some(gateway) = self.gateway {
            if gateway != id {
                warn!("Carousel 0x{:08X}: ignoring second gateway {}", self.carousel_id, id);
            }
            return;
        }
        self.gateway = Some(id);
        self.nodes.entry(id).or_insert(Node {
            name: String::new(),
            is_dir: true,
            data: None,
            placement: Placement::Pending,
        });
        self.adopt(id);
        self.materialize(id);
    }

    pub fn cache_dir(&mut self, parent: ObjectId, id: ObjectId, name: &str) {
        self.insert(parent, id, name, true, None);
    }

    pub fn cache_file(&mut self, parent: ObjectId, id: ObjectId, name: &str) {
        let data = self.nameless.remove(&id);
        self.insert(parent, id, name, false, data);
    }

    /// File content became available. New content for a file already on
    /// disk goes through `dentry_check` and `dentry_saved` again.
    pub fn cache_data(&mut self, id: ObjectId, data_path: &Path, size: u64) {
        match self.nodes.get_mut(&id) {
            Some(node) if node.is_dir => {
                warn!("Carousel 0x{:08X}: file data for directory {}", self.carousel_id, id);
            }
            Some(node) => {
                if node.data.as_ref().map(|(p, _)| p.as_path()) == Some(data_path) {
                    return;
                }
                let update = node.data.is_some();
                node.data = Some((data_path.to_path_buf(), size));
                if update {
                    debug!("Carousel 0x{:08X}: new content for {}", self.carousel_id, id);
                    node.placement = Placement::Pending;
                }
                self.materialize(id);
            }
            None => {
                self.nameless.insert(id, (data_path.to_path_buf(), size));
            }
        }
    }

    fn insert(
        &mut self,
        parent: ObjectId,
        id: ObjectId,
        name: &str,
        is_dir: bool,
        data: Option<(PathBuf, u64)>,
    ) {
        if self.nodes.contains_key(&id) {
            return;
        }
        self.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                is_dir,
                data,
                placement: Placement::Pending,
            },
        );
        if self.nodes.contains_key(&parent) {
            self.children.entry(parent).or_default().push(id);
            self.parents.insert(id, parent);
        } else {
            let orphans = if is_dir {
                &mut self.orphan_dirs
            } else {
                &mut self.orphan_files
            };
            orphans.entry(parent).or_default().push(id);
        }
        if is_dir {
            self.adopt(id);
        }
        self.materialize(id);
    }

    /// Attach children that were waiting for `parent`.
    fn adopt(&mut self, parent: ObjectId) {
        let mut adopted = self.orphan_dirs.remove(&parent).unwrap_or_default();
        adopted.extend(self.orphan_files.remove(&parent).unwrap_or_default());
        if !adopted.is_empty() {
            debug!(
                "Carousel 0x{:08X}: {} orphans attached to {}",
                self.carousel_id,
                adopted.len(),
                parent
            );
            for &child in &adopted {
                self.parents.insert(child, parent);
            }
            self.children.entry(parent).or_default().extend(adopted);
        }
    }

    /// Parent placement of a node, if it has one.
    fn parent_placement(&self, id: ObjectId) -> Option<(PathBuf, String)> {
        if self.gateway == Some(id) {
            return Some((self.root.clone(), String::new()));
        }
        let parent = self.parents.get(&id)?;
        match &self.nodes.get(parent)?.placement {
            Placement::Placed { fs_path, logical } => Some((fs_path.clone(), logical.clone())),
            _ => None,
        }
    }

    fn materialize(&mut self, id: ObjectId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some((parent_fs, parent_logical)) = self.parent_placement(id) else {
                continue;
            };
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.placement != Placement::Pending {
                continue;
            }
            if !node.is_dir && node.data.is_none() {
                continue;
            }

            let placement = if self.gateway == Some(id) {
                match fs::create_dir_all(&parent_fs) {
                    Ok(()) => Placement::Placed {
                        fs_path: parent_fs,
                        logical: String::new(),
                    },
                    Err(e) => {
                        warn!("Cannot create download directory {:?}: {}", parent_fs, e);
                        Placement::Dropped
                    }
                }
            } else {
                self.place(node, &parent_fs, &parent_logical)
            };

            let placed = matches!(placement, Placement::Placed { .. });
            if let Some(node) = self.nodes.get_mut(&id) {
                node.placement = placement;
            }
            if placed {
                if let Some(kids) = self.children.get(&id) {
                    stack.extend(kids.iter().rev().copied());
                }
            }
        }
    }

    fn place(&self, node: &Node, parent_fs: &Path, parent_logical: &str) -> Placement {
        let logical = format!("{}/{}", parent_logical, node.name);
        let mut fs_path = parent_fs.join(&node.name);
        if !self.listener.dentry_check(
            self.subscription,
            self.carousel_id,
            node.is_dir,
            &logical,
            &mut fs_path,
        ) {
            debug!("Subscription {}: {} refused", self.subscription, logical);
            return Placement::Dropped;
        }

        let result = match &node.data {
            _ if node.is_dir => fs::create_dir_all(&fs_path),
            Some((data_path, _)) => link_file(data_path, &fs_path),
            None => return Placement::Pending,
        };
        if let Err(e) = result {
            warn!("Subscription {}: cannot write {:?}: {}", self.subscription, fs_path, e);
            return Placement::Dropped;
        }

        self.listener.dentry_saved(
            self.subscription,
            self.carousel_id,
            node.is_dir,
            &logical,
            &fs_path,
        );
        Placement::Placed { fs_path, logical }
    }
}

/// Hard link a blob into place, copying when linking is impossible.
fn link_file(data_path: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Storage::remove_file(target)?;
    if fs::hard_link(data_path, target).is_err() {
        fs::copy(data_path, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events {
        saved: Mutex<Vec<(bool, String)>>,
        refuse: Option<&'static str>,
    }

    impl CarouselListener for Events {
        fn dentry_check(
            &self,
            _subscription: SubscriptionId,
            _carousel_id: u32,
            _is_dir: bool,
            logical_path: &str,
            _fs_path: &mut PathBuf,
        ) -> bool {
            self.refuse != Some(logical_path)
        }

        fn dentry_saved(
            &self,
            _subscription: SubscriptionId,
            _carousel_id: u32,
            is_dir: bool,
            logical_path: &str,
            _fs_path: &Path,
        ) {
            self.saved.lock().push((is_dir, logical_path.to_string()));
        }
    }

    fn oid(module_id: u16, key: u32) -> ObjectId {
        ObjectId {
            module_id,
            key,
            key_mask: 0xFF,
        }
    }

    fn blob(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join("blobs").join(name);
        Storage::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_file_before_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let events = Arc::new(Events::default());
        let mut cache = FileCache::new(&root, SubscriptionId(1), events.clone());

        let (gw, dir, file) = (oid(1, 0), oid(1, 1), oid(2, 1));
        // Subdirectory message first: its file is an orphan under `dir`.
        cache.cache_file(dir, file, "a.txt");
        cache.cache_data(file, &blob(scratch.path(), "a", b"hello"), 5);
        assert_eq!(cache.orphan_count(), 1);
        assert_eq!(cache.placed_count(), 0);

        cache.cache_gateway(gw);
        cache.cache_dir(gw, dir, "sub");
        assert_eq!(cache.orphan_count(), 0);
        assert_eq!(fs::read(root.join("sub/a.txt")).unwrap(), b"hello");
        assert_eq!(
            *events.saved.lock(),
            vec![(true, "/sub".to_string()), (false, "/sub/a.txt".to_string())]
        );
    }

    #[test]
    fn test_directory_chain_in_reverse() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let events = Arc::new(Events::default());
        let mut cache = FileCache::new(&root, SubscriptionId(1), events.clone());

        let (gw, a, b, file) = (oid(1, 0), oid(1, 1), oid(1, 2), oid(2, 1));
        cache.cache_data(file, &blob(scratch.path(), "f", b"deep"), 4);
        cache.cache_file(b, file, "f.txt");
        assert_eq!(cache.orphan_count(), 1);
        cache.cache_dir(a, b, "b");
        assert_eq!(cache.orphan_count(), 1);
        cache.cache_dir(gw, a, "a");
        assert_eq!(cache.orphan_count(), 1);
        assert_eq!(cache.placed_count(), 0);
        assert!(events.saved.lock().is_empty());

        cache.cache_gateway(gw);
        assert_eq!(cache.orphan_count(), 0);
        assert_eq!(cache.placed_count(), 4);
        assert_eq!(fs::read(root.join("a/b/f.txt")).unwrap(), b"deep");
        assert_eq!(
            *events.saved.lock(),
            vec![
                (true, "/a".to_string()),
                (true, "/a/b".to_string()),
                (false, "/a/b/f.txt".to_string()),
            ]
        );

        // Repeated records place nothing twice.
        cache.cache_gateway(gw);
        cache.cache_dir(gw, a, "a");
        cache.cache_dir(a, b, "b");
        cache.cache_file(b, file, "f.txt");
        assert_eq!(events.saved.lock().len(), 3);
    }

    #[test]
    fn test_new_content_is_placed_again() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let events = Arc::new(Events::default());
        let mut cache = FileCache::new(&root, SubscriptionId(1), events.clone());
        let (gw, file) = (oid(1, 0), oid(2, 7));
        cache.cache_gateway(gw);
        cache.cache_file(gw, file, "index.html");
        cache.cache_data(file, &blob(scratch.path(), "v1", b"hello"), 5);
        assert_eq!(fs::read(root.join("index.html")).unwrap(), b"hello");

        cache.cache_data(file, &blob(scratch.path(), "v2", b"WORLD"), 5);
        assert_eq!(fs::read(root.join("index.html")).unwrap(), b"WORLD");
        assert_eq!(
            *events.saved.lock(),
            vec![
                (false, "/index.html".to_string()),
                (false, "/index.html".to_string()),
            ]
        );
        assert_eq!(cache.placed_count(), 2);
    }

    #[test]
    fn test_directory_before_file_data() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let mut cache = FileCache::new(&root, SubscriptionId(1), Arc::new(Events::default()));
        let (gw, file) = (oid(1, 0), oid(2, 7));
        cache.cache_gateway(gw);
        cache.cache_file(gw, file, "index.html");
        assert!(cache.path_of(file).is_none());

        let data = blob(scratch.path(), "i", b"<html/>");
        cache.cache_data(file, &data, 7);
        assert_eq!(cache.path_of(file), Some(root.join("index.html").as_path()));
        assert_eq!(fs::read(root.join("index.html")).unwrap(), b"<html/>");

        // Same data again is not written twice.
        cache.cache_data(file, &data, 7);
        assert_eq!(cache.placed_count(), 2);
    }

    #[test]
    fn test_nameless_data_waits_for_binding() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let mut cache = FileCache::new(&root, SubscriptionId(1), Arc::new(Events::default()));
        let (gw, file) = (oid(1, 0), oid(3, 3));
        cache.cache_data(file, &blob(scratch.path(), "x", b"x"), 1);
        cache.cache_gateway(gw);
        assert!(!root.join("x.bin").exists());
        cache.cache_file(gw, file, "x.bin");
        assert!(root.join("x.bin").exists());
    }

    #[test]
    fn test_refused_directory_skips_subtree() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("out");
        let events = Arc::new(Events {
            refuse: Some("/private"),
            ..Default::default()
        });
        let mut cache = FileCache::new(&root, SubscriptionId(1), events);
        let (gw, dir, file) = (oid(1, 0), oid(1, 1), oid(2, 1));
        cache.cache_gateway(gw);
        cache.cache_dir(gw, dir, "private");
        cache.cache_file(dir, file, "secret");
        cache.cache_data(file, &blob(scratch.path(), "s", b"s"), 1);
        assert!(!root.join("private").exists());
        assert_eq!(cache.placed_count(), 1);
    }

    #[test]
    fn test_reset_forgets_nodes() {
        let scratch = tempfile::tempdir().unwrap();
        let mut cache = FileCache::new(scratch.path(), SubscriptionId(1), Arc::new(Events::default()));
        cache.cache_gateway(oid(1, 0));
        cache.cache_dir(oid(1, 0), oid(1, 1), "d");
        cache.reset();
        assert_eq!(cache.placed_count(), 0);
        cache.cache_gateway(oid(1, 0));
        assert_eq!(cache.placed_count(), 1);
    }
}
