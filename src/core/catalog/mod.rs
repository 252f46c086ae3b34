//! Namespace of files and directories
//!
//! Entries live in a flat slot table addressed by [`EntryId`]. Hierarchy is a
//! parent link per entry; the path of a directory is computed by walking those
//! links, never stored. The authoritative naming rule is sibling uniqueness:
//! no two live entries share a name under the same parent.
//!
//! Deleting an entry tombstones its slot and pushes it on a free list. The
//! next created entry reuses the most recently freed slot, so ids of live
//! entries never move.

pub mod entry;

pub use entry::{Entry, EntryId, EntryKind, Extent};

use crate::error::{Result, VolumeError};
use crate::validation::{EntryName, MAX_PATH_LEN};
use std::collections::{HashMap, HashSet};

/// Compose a child path from its parent path and name
///
/// `"/" + name` under the root, `parent + "/" + name` everywhere else.
pub fn child_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent_path, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Namespace {
    /// Entry slots, `None` for tombstones
    slots: Vec<Option<Entry>>,

    /// Tombstoned slots available for reuse (LIFO)
    free_slots: Vec<u32>,

    /// Current directory, `None` for the root
    cwd: Option<EntryId>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry by id
    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.slots.get(id.index()).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.slots.get_mut(id.index()).and_then(|slot| slot.as_mut())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &Entry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|e| (EntryId(idx as u32), e)))
    }

    /// Find a live entry by name directly under `parent`
    pub fn find_child(&self, parent: Option<EntryId>, name: &str) -> Option<EntryId> {
        self.iter()
            .find(|(_, e)| e.parent == parent && e.name == name)
            .map(|(id, _)| id)
    }

    /// Resolve a single path component against the current directory
    ///
    /// Case-sensitive exact match; files and directories alike.
    pub fn resolve(&self, token: &str) -> Option<EntryId> {
        self.find_child(self.cwd, token)
    }

    /// Live entries directly under `parent`, in slot order
    pub fn children(&self, parent: Option<EntryId>) -> Vec<(EntryId, &Entry)> {
        self.iter().filter(|(_, e)| e.parent == parent).collect()
    }

    /// Whether any live entry has `dir` as its parent
    pub fn has_children(&self, dir: EntryId) -> bool {
        self.iter().any(|(_, e)| e.parent == Some(dir))
    }

    /// Full path of a live entry
    pub fn path_of(&self, id: EntryId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(entry) = self.get(current) else {
                break;
            };
            names.push(entry.name.as_str());
            cursor = entry.parent;
            if names.len() > self.slots.len() {
                break;
            }
        }

        if names.is_empty() {
            return "/".to_string();
        }

        let mut path = String::new();
        for name in names.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        path
    }

    /// Path of a directory, `"/"` for the root
    pub fn dir_path(&self, dir: Option<EntryId>) -> String {
        match dir {
            Some(id) => self.path_of(id),
            None => "/".to_string(),
        }
    }

    /// Path of the directory containing a live entry
    pub fn parent_path(&self, id: EntryId) -> String {
        self.dir_path(self.get(id).and_then(|e| e.parent))
    }

    pub fn current_dir(&self) -> Option<EntryId> {
        self.cwd
    }

    pub fn current_path(&self) -> String {
        self.dir_path(self.cwd)
    }

    /// Move the current directory to a live directory (or the root)
    pub fn set_current_dir(&mut self, dir: Option<EntryId>) -> Result<()> {
        self.check_directory(dir)?;
        self.cwd = dir;
        Ok(())
    }

    /// Change the current directory by one component
    ///
    /// `".."` pops one segment and is a no-op at the root. Any other token
    /// must name a live directory under the current path.
    pub fn change_directory(&mut self, token: &str) -> Result<()> {
        if token == ".." {
            let parent = self.cwd.and_then(|id| self.get(id)).and_then(|e| e.parent);
            self.cwd = parent;
            return Ok(());
        }

        let id = self.resolve(token).ok_or_else(|| {
            VolumeError::NotFound(child_path(&self.current_path(), token))
        })?;

        let path = self.path_of(id);
        if !self.get(id).is_some_and(Entry::is_directory) {
            return Err(VolumeError::NotADirectory(path));
        }
        if path.len() > MAX_PATH_LEN {
            return Err(VolumeError::PathTooLong {
                len: path.len(),
                limit: MAX_PATH_LEN,
            });
        }

        self.cwd = Some(id);
        Ok(())
    }

    /// Resolve an absolute directory path such as `/a/b`
    pub fn resolve_dir_path(&self, path: &str) -> Result<Option<EntryId>> {
        if path == "/" {
            return Ok(None);
        }

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| VolumeError::NotFound(path.to_string()))?;

        let mut cursor = None;
        for token in rest.split('/') {
            let id = self
                .find_child(cursor, token)
                .ok_or_else(|| VolumeError::NotFound(path.to_string()))?;
            if !self.get(id).is_some_and(Entry::is_directory) {
                return Err(VolumeError::NotADirectory(path.to_string()));
            }
            cursor = Some(id);
        }
        Ok(cursor)
    }

    /// Insert an entry under `parent`
    ///
    /// Fails with `AlreadyExists` when a live sibling has the same name. The
    /// entry's own `parent` field is overwritten.
    pub fn create_entry(&mut self, parent: Option<EntryId>, mut entry: Entry) -> Result<EntryId> {
        EntryName::new(entry.name.as_str())?;
        self.check_directory(parent)?;

        let parent_path = self.dir_path(parent);
        if self.find_child(parent, &entry.name).is_some() {
            return Err(VolumeError::AlreadyExists(child_path(&parent_path, &entry.name)));
        }

        if entry.is_directory() {
            let path = child_path(&parent_path, &entry.name);
            if path.len() > MAX_PATH_LEN {
                return Err(VolumeError::PathTooLong {
                    len: path.len(),
                    limit: MAX_PATH_LEN,
                });
            }
        }

        entry.parent = parent;
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(entry);
                EntryId(slot)
            }
            None => {
                let slot = u32::try_from(self.slots.len()).map_err(|_| {
                    VolumeError::AllocationInconsistency("entry table is full".to_string())
                })?;
                self.slots.push(Some(entry));
                EntryId(slot)
            }
        };
        Ok(id)
    }

    /// Remove the entry named `name` under `parent`
    ///
    /// Directories must be empty (`NotEmpty` otherwise); files are removed
    /// unconditionally. Returns the removed entry so the caller can release
    /// its blocks.
    pub fn remove_entry(&mut self, parent: Option<EntryId>, name: &str) -> Result<(EntryId, Entry)> {
        let id = self
            .find_child(parent, name)
            .ok_or_else(|| VolumeError::NotFound(child_path(&self.dir_path(parent), name)))?;

        if self.get(id).is_some_and(Entry::is_directory) && self.has_children(id) {
            return Err(VolumeError::NotEmpty(self.path_of(id)));
        }

        let entry = self.slots[id.index()].take().ok_or_else(|| {
            VolumeError::AllocationInconsistency(format!("slot {} vanished during removal", id))
        })?;
        self.free_slots.push(id.0);

        // Never leave the cursor on a removed directory
        if self.cwd == Some(id) {
            self.cwd = entry.parent;
        }

        Ok((id, entry))
    }

    /// Rename an entry within `parent`
    pub fn rename(&mut self, parent: Option<EntryId>, old: &str, new: &str) -> Result<EntryId> {
        let new_name = EntryName::new(new)?;
        let id = self
            .find_child(parent, old)
            .ok_or_else(|| VolumeError::NotFound(child_path(&self.dir_path(parent), old)))?;

        if old == new {
            return Ok(id);
        }
        if self.find_child(parent, new).is_some() {
            return Err(VolumeError::AlreadyExists(child_path(&self.dir_path(parent), new)));
        }

        // Every directory path in the renamed subtree changes length
        if self.get(id).is_some_and(Entry::is_directory) && new.len() > old.len() {
            let longest = self
                .iter()
                .filter(|(d, e)| e.is_directory() && self.is_within(*d, id))
                .map(|(d, _)| self.path_of(d).len())
                .max()
                .unwrap_or(0);
            let len = longest - old.len() + new.len();
            if len > MAX_PATH_LEN {
                return Err(VolumeError::PathTooLong {
                    len,
                    limit: MAX_PATH_LEN,
                });
            }
        }

        if let Some(entry) = self.get_mut(id) {
            entry.name = new_name.into_string();
        }
        Ok(id)
    }

    /// Whether `id` is `ancestor` or lies somewhere below it
    pub fn is_within(&self, id: EntryId, ancestor: EntryId) -> bool {
        let mut cursor = Some(id);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|e| e.parent);
            steps += 1;
            if steps > self.slots.len() {
                return false;
            }
        }
        false
    }

    /// Rebuild a namespace from flat records carrying parent path strings
    ///
    /// Records become slots `0..n` in the given order. Each parent path must
    /// name a directory among the records (or be `"/"`), and the rebuilt
    /// namespace must satisfy sibling uniqueness.
    pub fn from_records(records: Vec<(Entry, String)>) -> Result<Self> {
        let mut dirs: HashMap<String, EntryId> = HashMap::new();
        for (idx, (entry, parent_path)) in records.iter().enumerate() {
            EntryName::new(entry.name.as_str())
                .map_err(|e| VolumeError::CorruptImage(format!("entry {}: {}", idx, e)))?;

            if entry.is_directory() {
                let path = child_path(parent_path, &entry.name);
                if path.len() > MAX_PATH_LEN {
                    return Err(VolumeError::CorruptImage(format!(
                        "directory path '{}' exceeds {} bytes",
                        path, MAX_PATH_LEN
                    )));
                }
                if dirs.insert(path.clone(), EntryId(idx as u32)).is_some() {
                    return Err(VolumeError::CorruptImage(format!(
                        "directory '{}' appears twice",
                        path
                    )));
                }
            }
        }

        let mut slots = Vec::with_capacity(records.len());
        for (mut entry, parent_path) in records {
            entry.parent = if parent_path == "/" {
                None
            } else {
                let parent = dirs.get(&parent_path).ok_or_else(|| {
                    VolumeError::CorruptImage(format!(
                        "entry '{}' refers to missing directory '{}'",
                        entry.name, parent_path
                    ))
                })?;
                Some(*parent)
            };
            slots.push(Some(entry));
        }

        let namespace = Namespace {
            slots,
            free_slots: Vec::new(),
            cwd: None,
        };

        let mut seen = HashSet::new();
        for (_, entry) in namespace.iter() {
            if !seen.insert((entry.parent, entry.name.as_str())) {
                return Err(VolumeError::CorruptImage(format!(
                    "duplicate entry '{}'",
                    child_path(&namespace.dir_path(entry.parent), &entry.name)
                )));
            }
        }

        for (path, id) in &dirs {
            if namespace.path_of(*id) != *path {
                return Err(VolumeError::CorruptImage(format!(
                    "directory '{}' does not resolve to itself",
                    path
                )));
            }
        }

        Ok(namespace)
    }

    fn check_directory(&self, dir: Option<EntryId>) -> Result<()> {
        match dir {
            None => Ok(()),
            Some(id) => match self.get(id) {
                Some(entry) if entry.is_directory() => Ok(()),
                Some(_) => Err(VolumeError::NotADirectory(self.path_of(id))),
                None => Err(VolumeError::NotFound(format!("directory {}", id))),
            },
        }
    }
}
