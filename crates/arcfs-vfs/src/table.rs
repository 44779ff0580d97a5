//! The virtual descriptor table.
//!
//! Maps every descriptor the dispatcher hands out to the real
//! descriptor it shadows and, for archive-owned files, the mount that
//! services it. Virtual descriptors start at 10 and count up; the
//! counter wraps back to 10 rather than descending into the range a
//! process's own stdio lives in.

use arcfs_mount::ArchiveMount;
use arcfs_types::FIRST_VIRTUAL_FD;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a virtual descriptor resolves to.
#[derive(Debug, Clone)]
pub struct Source {
    pub real_fd: i64,
    /// `None` routes to the real filesystem.
    pub mount: Option<Arc<ArchiveMount>>,
}

#[derive(Debug)]
pub struct DescriptorTable {
    counter: i64,
    known: BTreeMap<i64, Source>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: FIRST_VIRTUAL_FD,
            known: BTreeMap::new(),
        }
    }

    fn next_fd(&mut self) -> i64 {
        let fd = self.counter;
        self.counter = self.counter.wrapping_add(1);
        if self.counter < FIRST_VIRTUAL_FD {
            self.counter = FIRST_VIRTUAL_FD;
        }
        fd
    }

    /// Mint a virtual descriptor for `real_fd`.
    pub fn insert(&mut self, real_fd: i64, mount: Option<Arc<ArchiveMount>>) -> i64 {
        let fd = self.next_fd();
        self.known.insert(fd, Source { real_fd, mount });
        fd
    }

    #[must_use]
    pub fn get(&self, fd: i64) -> Option<Source> {
        self.known.get(&fd).cloned()
    }

    pub fn remove(&mut self, fd: i64) -> Option<Source> {
        self.known.remove(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn clear(&mut self) {
        self.known.clear();
    }

    #[cfg(test)]
    fn with_counter(counter: i64) -> Self {
        Self {
            counter,
            known: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_start_at_ten_and_climb() {
        let mut table = DescriptorTable::new();
        assert_eq!(table.insert(100, None), 10);
        assert_eq!(table.insert(101, None), 11);
        assert_eq!(table.insert(102, None), 12);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn lookup_and_remove() {
        let mut table = DescriptorTable::new();
        let fd = table.insert(55, None);
        assert_eq!(table.get(fd).expect("present").real_fd, 55);

        table.remove(fd);
        assert!(table.get(fd).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn freed_descriptors_are_not_reused() {
        let mut table = DescriptorTable::new();
        let first = table.insert(1, None);
        table.remove(first);
        let second = table.insert(2, None);
        assert_ne!(first, second);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn counter_wraps_back_to_ten() {
        let mut table = DescriptorTable::with_counter(i64::MAX);
        assert_eq!(table.insert(1, None), i64::MAX);
        assert_eq!(table.insert(2, None), 10);
        assert_eq!(table.insert(3, None), 11);
    }
}
