//! Time-ordered timeout list.
//!
//! At most one timeout exists per `(pid, kind)`; arming an existing one
//! moves it.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::module::ModuleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Waiting for the first DSI.
    Dsi,
    /// Waiting for the DII of a transaction id.
    Dii(u32),
    /// Whole-module download deadline.
    Module(ModuleKey),
    /// Gap between two blocks of a module.
    Block(ModuleKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout {
    pub pid: u16,
    pub kind: TimeoutKind,
}

#[derive(Debug, Default)]
pub struct TimeoutList {
    ordered: BTreeMap<(Instant, u64), Timeout>,
    index: HashMap<Timeout, (Instant, u64)>,
    seq: u64,
}

impl TimeoutList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_armed(&self, timeout: &Timeout) -> bool {
        self.index.contains_key(timeout)
    }

    pub fn arm(&mut self, timeout: Timeout, at: Instant) {
        self.cancel(&timeout);
        self.seq += 1;
        let slot = (at, self.seq);
        self.ordered.insert(slot, timeout);
        self.index.insert(timeout, slot);
    }

    pub fn cancel(&mut self, timeout: &Timeout) -> bool {
        match self.index.remove(timeout) {
            Some(slot) => {
                self.ordered.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Drop every timeout of a carousel.
    pub fn cancel_carousel(&mut self, pid: u16) {
        self.retain(|t| t.pid != pid);
    }

    /// Drop the module and block timeouts of one module.
    pub fn cancel_module(&mut self, pid: u16, key: ModuleKey) {
        self.cancel(&Timeout {
            pid,
            kind: TimeoutKind::Module(key),
        });
        self.cancel(&Timeout {
            pid,
            kind: TimeoutKind::Block(key),
        });
    }

    fn retain(&mut self, mut keep: impl FnMut(&Timeout) -> bool) {
        let index = &mut self.index;
        self.ordered.retain(|_, t| {
            let kept = keep(t);
            if !kept {
                index.remove(t);
            }
            kept
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.ordered.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every timeout due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Timeout> {
        let mut expired = Vec::new();
        while let Some(entry) = self.ordered.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timeout = entry.remove();
            self.index.remove(&timeout);
            expired.push(timeout);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dii(pid: u16, tid: u32) -> Timeout {
        Timeout {
            pid,
            kind: TimeoutKind::Dii(tid),
        }
    }

    #[test]
    fn test_expiry_order() {
        let now = Instant::now();
        let mut list = TimeoutList::new();
        list.arm(dii(1, 2), now + Duration::from_secs(2));
        list.arm(dii(1, 1), now + Duration::from_secs(1));
        list.arm(dii(2, 3), now + Duration::from_secs(5));
        assert_eq!(list.next_deadline(), Some(now + Duration::from_secs(1)));

        let expired = list.pop_expired(now + Duration::from_secs(3));
        assert_eq!(expired, vec![dii(1, 1), dii(1, 2)]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_rearm_moves_timeout() {
        let now = Instant::now();
        let mut list = TimeoutList::new();
        list.arm(dii(1, 1), now + Duration::from_secs(1));
        list.arm(dii(1, 1), now + Duration::from_secs(10));
        assert_eq!(list.len(), 1);
        assert!(list.pop_expired(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_cancel_carousel() {
        let now = Instant::now();
        let mut list = TimeoutList::new();
        let key = ModuleKey {
            download_id: 1,
            module_id: 2,
        };
        list.arm(dii(1, 1), now);
        list.arm(
            Timeout {
                pid: 1,
                kind: TimeoutKind::Block(key),
            },
            now,
        );
        list.arm(dii(2, 1), now);
        list.cancel_carousel(1);
        assert_eq!(list.len(), 1);
        assert!(list.is_armed(&dii(2, 1)));
        assert_eq!(list.pop_expired(now), vec![dii(2, 1)]);
        assert!(list.is_empty());
    }
}
