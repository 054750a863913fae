/// Arena-backed in-memory registry tree.
///
/// All keys live in a single `Vec<MemoryKey>`. Relationships use
/// `KeyIndex` (a thin `u32` wrapper) rather than heap pointers. Children
/// form a `first_child` / `next_sibling` list that is appended at the tail
/// so enumeration order matches insertion order, like `RegEnumKeyEx` on a
/// freshly built hive.
use super::{RegValue, RegistryTree};
use chrono::{DateTime, Utc};

/// Lightweight index into the arena `Vec<MemoryKey>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIndex(pub u32);

impl KeyIndex {
    #[inline]
    pub fn new(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize, "KeyIndex overflow");
        Self(index as u32)
    }

    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A single key in the arena.
#[derive(Debug, Clone)]
pub struct MemoryKey {
    pub name: String,
    pub last_written: Option<DateTime<Utc>>,
    pub parent: Option<KeyIndex>,
    pub first_child: Option<KeyIndex>,
    /// Tail of the child list, kept so appends are O(1).
    pub last_child: Option<KeyIndex>,
    pub next_sibling: Option<KeyIndex>,
    pub values: Vec<RegValue>,
}

impl MemoryKey {
    fn new(name: &str, parent: Option<KeyIndex>) -> Self {
        Self {
            name: name.to_string(),
            last_written: None,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            values: Vec::new(),
        }
    }
}

/// A registry tree assembled in code. Index 0 is always the root.
#[derive(Debug, Clone)]
pub struct MemoryHive {
    pub keys: Vec<MemoryKey>,
}

impl MemoryHive {
    pub fn new(root_name: &str) -> Self {
        Self {
            keys: vec![MemoryKey::new(root_name, None)],
        }
    }

    pub fn root_index(&self) -> KeyIndex {
        KeyIndex::new(0)
    }

    /// Append a new child key under `parent`. Duplicate names are allowed;
    /// use [`add_path`](Self::add_path) to reuse existing keys.
    pub fn add_key(&mut self, parent: KeyIndex, name: &str) -> KeyIndex {
        let child = KeyIndex::new(self.keys.len());
        self.keys.push(MemoryKey::new(name, Some(parent)));

        match self.keys[parent.idx()].last_child {
            Some(tail) => self.keys[tail.idx()].next_sibling = Some(child),
            None => self.keys[parent.idx()].first_child = Some(child),
        }
        self.keys[parent.idx()].last_child = Some(child);
        child
    }

    /// Walk a backslash-separated path from the root, creating any missing
    /// keys. Existing keys are matched case-insensitively.
    pub fn add_path(&mut self, path: &str) -> KeyIndex {
        let root = self.root_index();
        self.add_path_from(root, path)
    }

    pub fn add_path_from(&mut self, start: KeyIndex, path: &str) -> KeyIndex {
        let mut current = start;
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            current = match self.find_child(current, component) {
                Some(existing) => existing,
                None => self.add_key(current, component),
            };
        }
        current
    }

    pub fn set_timestamp(&mut self, key: KeyIndex, when: DateTime<Utc>) {
        self.keys[key.idx()].last_written = Some(when);
    }

    /// Insert or replace a value by name.
    pub fn set_value(&mut self, key: KeyIndex, value: RegValue) {
        let values = &mut self.keys[key.idx()].values;
        match values
            .iter_mut()
            .find(|v| v.name.eq_ignore_ascii_case(&value.name))
        {
            Some(slot) => *slot = value,
            None => values.push(value),
        }
    }

    pub fn children(&self, parent: KeyIndex) -> ChildIter<'_> {
        ChildIter {
            hive: self,
            next: self.keys[parent.idx()].first_child,
        }
    }

    fn find_child(&self, parent: KeyIndex, name: &str) -> Option<KeyIndex> {
        self.children(parent)
            .find(|&c| self.keys[c.idx()].name.eq_ignore_ascii_case(name))
    }

    /// Full backslash path of a key, excluding the root name.
    pub fn path(&self, key: KeyIndex) -> String {
        let mut parts = Vec::new();
        let mut current = Some(key);
        while let Some(idx) = current {
            let node = &self.keys[idx.idx()];
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        parts.join("\\")
    }
}

/// Iterator over the direct children of a key.
pub struct ChildIter<'a> {
    hive: &'a MemoryHive,
    next: Option<KeyIndex>,
}

impl Iterator for ChildIter<'_> {
    type Item = KeyIndex;

    fn next(&mut self) -> Option<KeyIndex> {
        let current = self.next?;
        self.next = self.hive.keys[current.idx()].next_sibling;
        Some(current)
    }
}

impl RegistryTree for MemoryHive {
    type Key = KeyIndex;

    fn root(&self) -> KeyIndex {
        self.root_index()
    }

    fn subkeys(&self, key: &KeyIndex) -> Vec<KeyIndex> {
        self.children(*key).collect()
    }

    fn values(&self, key: &KeyIndex) -> Vec<RegValue> {
        self.keys[key.idx()].values.clone()
    }

    fn key_name(&self, key: &KeyIndex) -> String {
        self.keys[key.idx()].name.clone()
    }

    fn timestamp(&self, key: &KeyIndex) -> Option<DateTime<Utc>> {
        self.keys[key.idx()].last_written
    }
}
