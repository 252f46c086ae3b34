//! Entry records stored in the namespace

use serde::{Deserialize, Serialize};

/// Stable identifier of an entry slot
///
/// Ids stay valid for as long as the entry is live. A removed entry's slot
/// may be handed to a later entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl EntryKind {
    /// Kind flag as written to an image record
    pub fn to_flag(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Directory => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(EntryKind::File),
            1 => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// A contiguous range of blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Starting block
    pub start: usize,
    /// Number of blocks
    pub count: usize,
}

impl Extent {
    pub fn new(start: usize, count: usize) -> Self {
        Extent { start, count }
    }

    /// One past the last block
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if this extent contains a block
    pub fn contains(&self, block: usize) -> bool {
        block >= self.start && block < self.end()
    }

    /// Check if two extents share at least one block
    pub fn overlaps(&self, other: &Extent) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }
}

/// A file or directory
///
/// Holds everything about an entry except its content, which lives in the
/// volume's arena under `extent`. The parent path is not stored: it is
/// derived from `parent` by the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    pub extent: Extent,
    /// Containing directory, `None` for the root
    pub parent: Option<EntryId>,
}

impl Entry {
    pub fn file(name: impl Into<String>, size: u64, extent: Extent) -> Self {
        Entry {
            name: name.into(),
            kind: EntryKind::File,
            size,
            extent,
            parent: None,
        }
    }

    pub fn directory(name: impl Into<String>, extent: Extent) -> Self {
        Entry {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            extent,
            parent: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let file = Entry::file("a.txt", 2500, Extent::new(4, 3));
        assert!(file.is_file());
        assert_eq!(file.size, 2500);
        assert_eq!(file.extent.end(), 7);

        let dir = Entry::directory("docs", Extent::new(0, 1));
        assert!(dir.is_directory());
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_kind_flags() {
        assert_eq!(EntryKind::from_flag(EntryKind::File.to_flag()), Some(EntryKind::File));
        assert_eq!(
            EntryKind::from_flag(EntryKind::Directory.to_flag()),
            Some(EntryKind::Directory)
        );
        assert_eq!(EntryKind::from_flag(7), None);
    }

    #[test]
    fn test_extent_overlap() {
        let a = Extent::new(0, 3);
        assert!(a.overlaps(&Extent::new(2, 2)));
        assert!(!a.overlaps(&Extent::new(3, 2)));
        assert!(!a.overlaps(&Extent::new(1, 0)));
        assert!(a.contains(2));
        assert!(!a.contains(3));
    }

    #[test]
    fn test_serialization() {
        let entry = Entry::file("report", 10, Extent::new(1, 1));
        let json = serde_json::to_string(&entry).unwrap();
        let restored: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, entry);
    }
}
