//! In-memory directory tree of one archive.
//!
//! The tree is an arena of nodes addressed by index; directories hold
//! two ordered maps of child names (subdirectories and files), which is
//! also the order scandir reports. Building the index guarantees that
//! every prefix of an inserted entry path exists as a directory node.

use arcfs_types::{dos_to_unix, split_path, EntryId};
use arcfs_zip::CentralRecord;
use std::collections::BTreeMap;
use tracing::warn;

/// Index of a node inside one archive's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

/// Extraction lifecycle of a file entry's cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    NotExtracted,
    Extracting,
    Extracted,
}

#[derive(Debug, Default)]
pub struct DirNode {
    pub mtime: i64,
    pub dirs: BTreeMap<String, NodeId>,
    pub files: BTreeMap<String, NodeId>,
}

#[derive(Debug)]
pub struct FileNode {
    /// Archive-local entry number; names the cache file.
    pub id: EntryId,
    pub size: u64,
    /// Local header offset inside the ZIP.
    pub offset: u64,
    pub method: u16,
    pub compressed_size: u64,
    pub mtime: i64,
    pub state: ExtractState,
}

#[derive(Debug)]
pub enum Node {
    Dir(DirNode),
    File(FileNode),
}

impl Node {
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

/// Arena-backed tree rooted at a synthetic directory.
#[derive(Debug)]
pub struct ArchiveIndex {
    arena: Vec<Node>,
    root: NodeId,
}

impl Default for ArchiveIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: vec![Node::Dir(DirNode::default())],
            root: NodeId(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.arena[id.0]
    }

    #[must_use]
    pub fn file(&self, id: NodeId) -> Option<&FileNode> {
        match &self.arena[id.0] {
            Node::File(file) => Some(file),
            Node::Dir(_) => None,
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut FileNode> {
        match &mut self.arena[id.0] {
            Node::File(file) => Some(file),
            Node::Dir(_) => None,
        }
    }

    /// All file nodes, in arena order.
    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.arena.iter().filter_map(|node| match node {
            Node::File(file) => Some(file),
            Node::Dir(_) => None,
        })
    }

    /// Insert one central-directory record, creating missing prefix
    /// directories. Returns the new node for file entries; directory
    /// markers and duplicates return `None`.
    pub fn insert(&mut self, record: &CentralRecord) -> Option<NodeId> {
        let (parts, ends_with_separator) = split_path(&record.name);
        let is_dir = record.is_dir || ends_with_separator;
        let mtime = dos_to_unix(record.dos_date, record.dos_time);

        if parts.is_empty() {
            return None;
        }

        let last = parts.len() - 1;
        let mut node = self.root;
        for (i, name) in parts.iter().enumerate() {
            if i == last && !is_dir {
                let Node::Dir(dir) = &self.arena[node.0] else {
                    return None;
                };
                if dir.files.contains_key(name) || dir.dirs.contains_key(name) {
                    warn!(target: "arcfs::index", entry = %record.name, "duplicate entry ignored");
                    return None;
                }
                let file_id = NodeId(self.arena.len());
                self.arena.push(Node::File(FileNode {
                    id: EntryId(record.index),
                    size: record.uncompressed_size,
                    offset: record.local_header_offset,
                    method: record.method,
                    compressed_size: record.compressed_size,
                    mtime,
                    state: ExtractState::NotExtracted,
                }));
                if let Node::Dir(dir) = &mut self.arena[node.0] {
                    dir.files.insert(name.clone(), file_id);
                }
                return Some(file_id);
            }

            let existing = match &self.arena[node.0] {
                Node::Dir(dir) => dir.dirs.get(name).copied(),
                Node::File(_) => return None,
            };
            node = match existing {
                Some(child) => {
                    if i == last {
                        // Directory marker for a dir we already created as
                        // a prefix: adopt the marker's timestamp.
                        if let Node::Dir(dir) = &mut self.arena[child.0] {
                            dir.mtime = mtime;
                        }
                    }
                    child
                }
                None => {
                    let child = NodeId(self.arena.len());
                    self.arena.push(Node::Dir(DirNode {
                        mtime,
                        ..DirNode::default()
                    }));
                    if let Node::Dir(dir) = &mut self.arena[node.0] {
                        dir.dirs.insert(name.clone(), child);
                    }
                    child
                }
            };
        }

        None
    }

    /// Resolve a mount-relative path. Empty input addresses the root.
    #[must_use]
    pub fn resolve(&self, parts: &[String]) -> Option<NodeId> {
        if parts.is_empty() {
            return Some(self.root);
        }

        let mut current = Some(self.root);
        let mut found = None;
        for name in parts {
            let dir_id = current?;
            let Node::Dir(dir) = &self.arena[dir_id.0] else {
                return None;
            };
            if let Some(&sub) = dir.dirs.get(name) {
                found = Some(sub);
                current = Some(sub);
            } else if let Some(&file) = dir.files.get(name) {
                found = Some(file);
                current = None;
            } else {
                return None;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u32, name: &str, size: u64) -> CentralRecord {
        CentralRecord {
            index,
            name: name.to_owned(),
            flags: 0,
            method: 0,
            dos_time: 0,
            // 1995-03-07
            dos_date: (15 << 9) | (3 << 5) | 7,
            compressed_size: size,
            uncompressed_size: size,
            local_header_offset: 0,
            is_dir: name.ends_with('/'),
        }
    }

    fn parts(path: &str) -> Vec<String> {
        path.split('/').map(str::to_owned).collect()
    }

    #[test]
    fn prefixes_materialize_as_dirs() {
        let mut index = ArchiveIndex::new();
        let file = index.insert(&record(0, "a/b/c.txt", 3)).expect("file node");

        assert!(index.file(file).is_some());
        assert!(index.resolve(&parts("a")).is_some());
        assert!(index.resolve(&parts("a/b")).is_some());
        assert_eq!(index.resolve(&parts("a/b/c.txt")), Some(file));
        assert!(!index.node(index.resolve(&parts("a")).unwrap()).is_file());
    }

    #[test]
    fn duplicate_entries_ignored() {
        let mut index = ArchiveIndex::new();
        let first = index.insert(&record(0, "x.txt", 1)).expect("first");
        assert!(index.insert(&record(1, "x.txt", 99)).is_none());

        let resolved = index.resolve(&parts("x.txt")).expect("resolved");
        assert_eq!(resolved, first);
        assert_eq!(index.file(resolved).unwrap().size, 1);
    }

    #[test]
    fn dir_marker_sets_timestamp() {
        let mut index = ArchiveIndex::new();
        index.insert(&record(0, "sub/file", 1));
        let before = match index.node(index.resolve(&parts("sub")).unwrap()) {
            Node::Dir(d) => d.mtime,
            Node::File(_) => panic!("expected dir"),
        };

        let mut marker = record(1, "sub/", 0);
        marker.dos_date = (20 << 9) | (6 << 5) | 1;
        index.insert(&marker);

        let after = match index.node(index.resolve(&parts("sub")).unwrap()) {
            Node::Dir(d) => d.mtime,
            Node::File(_) => panic!("expected dir"),
        };
        assert_ne!(before, after);
    }

    #[test]
    fn resolve_missing_and_through_file() {
        let mut index = ArchiveIndex::new();
        index.insert(&record(0, "a/file", 1));

        assert!(index.resolve(&parts("missing")).is_none());
        assert!(index.resolve(&parts("a/missing")).is_none());
        // A file cannot be traversed like a directory.
        assert!(index.resolve(&parts("a/file/deeper")).is_none());
    }

    #[test]
    fn empty_parts_resolve_to_root() {
        let index = ArchiveIndex::new();
        assert_eq!(index.resolve(&[]), Some(index.root()));
    }

    #[test]
    fn files_iterates_every_entry() {
        let mut index = ArchiveIndex::new();
        index.insert(&record(0, "one", 1));
        index.insert(&record(1, "two", 2));
        index.insert(&record(2, "d/three", 3));
        assert_eq!(index.files().count(), 3);
    }
}
