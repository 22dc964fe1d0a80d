//! The Tree object represents one directory level of the repository: an
//! ordered mapping from entry name to (mode, object id). In ChronDB a
//! collection is one tree directory and each document revision is a blob
//! entry named `<encoded-id>.json` inside it.
//!
//! The byte encoding is the Git tree format: `mode SP name NUL rawid`
//! entries concatenated, sorted by name with directory names compared as if
//! they carried a trailing `/`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ChronError;
use crate::hash::{ObjectHash, get_hash_kind};
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

/// Entry mode. Documents only ever need regular files and directories.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeItemMode {
    Blob,
    Tree,
}

impl TreeItemMode {
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::Tree => b"40000",
        }
    }

    pub fn from_bytes(mode: &[u8]) -> Result<TreeItemMode, ChronError> {
        match mode {
            b"100644" | b"100755" | b"120000" => Ok(TreeItemMode::Blob),
            b"40000" | b"040000" => Ok(TreeItemMode::Tree),
            _ => Err(ChronError::InvalidObject(
                String::from_utf8_lossy(mode).into_owned(),
                "tree item mode",
            )),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, TreeItemMode::Tree)
    }
}

/// One entry of a tree.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub id: ObjectHash,
    pub name: String,
}

impl TreeItem {
    pub fn new(mode: TreeItemMode, id: ObjectHash, name: String) -> TreeItem {
        TreeItem { mode, id, name }
    }

    /// Git sorts tree entries as raw bytes, with directory names compared as
    /// if they ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }

    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.name.len() + self.id.size() + 8);
        data.extend(self.mode.to_bytes());
        data.push(b' ');
        data.extend(self.name.as_bytes());
        data.push(b'\x00');
        data.extend(self.id.as_ref());
        data
    }
}

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectHash,
    pub tree_items: Vec<TreeItem>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for item in &self.tree_items {
            writeln!(
                f,
                "{} {} {}",
                String::from_utf8_lossy(item.mode.to_bytes()),
                item.id,
                item.name
            )?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries, sorting them into canonical order and
    /// computing the content address. An empty entry list is valid and
    /// produces the well-known empty tree.
    pub fn from_items(mut tree_items: Vec<TreeItem>) -> Result<Tree, ChronError> {
        tree_items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut tree = Tree {
            id: ObjectHash::default(),
            tree_items,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }

    /// Look up a direct child entry by name.
    pub fn entry(&self, name: &str) -> Option<&TreeItem> {
        self.tree_items.iter().find(|i| i.name == name)
    }

    /// Return the entries with `name` replaced, inserted, or removed.
    /// `entry = None` removes; the caller rebuilds via [`Tree::from_items`].
    pub fn with_entry(&self, name: &str, entry: Option<TreeItem>) -> Vec<TreeItem> {
        let mut items: Vec<TreeItem> = self
            .tree_items
            .iter()
            .filter(|i| i.name != name)
            .cloned()
            .collect();
        if let Some(item) = entry {
            items.push(item);
        }
        items
    }
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ChronError> {
        let hash_len = get_hash_kind().size();
        let mut tree_items = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let mode_end = rest
                .find_byte(b' ')
                .ok_or(ChronError::InvalidObject(hash.to_string(), "tree"))?;
            let mode = TreeItemMode::from_bytes(&rest[..mode_end])?;
            let name_end = rest
                .find_byte(b'\x00')
                .ok_or(ChronError::InvalidObject(hash.to_string(), "tree"))?;
            if name_end <= mode_end {
                return Err(ChronError::InvalidObject(hash.to_string(), "tree"));
            }
            let name = rest[mode_end + 1..name_end]
                .to_str()
                .map_err(|_| ChronError::InvalidObject(hash.to_string(), "tree"))?
                .to_string();
            if rest.len() < name_end + 1 + hash_len {
                return Err(ChronError::InvalidObject(hash.to_string(), "tree"));
            }
            let id = ObjectHash::from_bytes(&rest[name_end + 1..name_end + 1 + hash_len])
                .map_err(ChronError::InvalidHashValue)?;
            tree_items.push(TreeItem { mode, id, name });
            rest = &rest[name_end + 1 + hash_len..];
        }
        Ok(Tree { id: hash, tree_items })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn get_size(&self) -> usize {
        self.tree_items.iter().map(|i| i.to_data().len()).sum()
    }

    fn to_data(&self) -> Result<Vec<u8>, ChronError> {
        let mut data = Vec::new();
        for item in &self.tree_items {
            data.extend(item.to_data());
        }
        Ok(data)
    }
}
