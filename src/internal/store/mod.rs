//! The content-addressable store interface and its two physical layouts:
//! an on-disk bare repository directory and an in-memory map for tests.
//! Both satisfy the same trait; higher layers only see `dyn ObjectStore`.
pub mod file;
pub mod memory;

use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::object::blob::Blob;
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use crate::internal::object::types::ObjectType;
use crate::internal::object::ObjectTrait;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Outcome of a compare-and-set ref update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTransition {
    /// The ref did not exist and was created.
    Created,
    /// The observed old id matched and the ref moved forward.
    FastForwarded,
    /// The observed old id did not match but the caller forced the update.
    Forced,
    /// The observed old id did not match; nothing was written.
    Rejected,
}

impl RefTransition {
    /// Whether the ref now points at the requested id.
    pub fn updated(&self) -> bool {
        !matches!(self, RefTransition::Rejected)
    }
}

/// Content-addressed object storage plus a CAS ref namespace.
///
/// Multiple readers are always permitted; writers serialize on a per-ref
/// lock inside each implementation.
pub trait ObjectStore: Send + Sync {
    /// Insert an object, returning its content address. Inserting the same
    /// bytes twice is a no-op.
    fn put_raw(&self, object_type: ObjectType, data: &[u8]) -> Result<ObjectHash>;

    /// Read an object's type and payload, or `None` when absent.
    fn get_raw(&self, id: &ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>>;

    fn has_object(&self, id: &ObjectHash) -> Result<bool>;

    /// Resolve a ref name to a commit id, or `None` when the ref is absent.
    fn resolve_ref(&self, name: &str) -> Result<Option<ObjectHash>>;

    /// Compare-and-set a ref. `expected_old` of `None` (or the zero id)
    /// asserts the ref does not exist yet. `force` turns a mismatch into a
    /// `Forced` overwrite instead of a rejection.
    fn update_ref(
        &self,
        name: &str,
        expected_old: Option<&ObjectHash>,
        new: &ObjectHash,
        force: bool,
    ) -> Result<RefTransition>;

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectHash)>>;

    fn delete_ref(&self, name: &str) -> Result<bool>;

    /// Branch name HEAD points at.
    fn read_head(&self) -> Result<String>;

    fn set_head(&self, branch: &str) -> Result<()>;

    // Typed helpers over the raw byte interface.

    fn put_blob(&self, blob: &Blob) -> Result<ObjectHash> {
        self.put_raw(ObjectType::Blob, &blob.data)
    }

    fn put_tree(&self, tree: &Tree) -> Result<ObjectHash> {
        self.put_raw(ObjectType::Tree, &tree.to_data()?)
    }

    fn put_commit(&self, commit: &Commit) -> Result<ObjectHash> {
        self.put_raw(ObjectType::Commit, &commit.to_data()?)
    }

    fn get_blob(&self, id: &ObjectHash) -> Result<Blob> {
        match self.get_raw(id)? {
            Some((ObjectType::Blob, data)) => Blob::from_bytes(&data, *id),
            Some((ty, _)) => Err(ChronError::InvalidObject(
                format!("{id} has type {ty}"),
                "blob",
            )),
            None => Err(ChronError::NotFound(format!("object {id}"))),
        }
    }

    fn get_tree(&self, id: &ObjectHash) -> Result<Tree> {
        match self.get_raw(id)? {
            Some((ObjectType::Tree, data)) => Tree::from_bytes(&data, *id),
            Some((ty, _)) => Err(ChronError::InvalidObject(
                format!("{id} has type {ty}"),
                "tree",
            )),
            None => Err(ChronError::NotFound(format!("object {id}"))),
        }
    }

    fn get_commit(&self, id: &ObjectHash) -> Result<Commit> {
        match self.get_raw(id)? {
            Some((ObjectType::Commit, data)) => Commit::from_bytes(&data, *id),
            Some((ty, _)) => Err(ChronError::InvalidObject(
                format!("{id} has type {ty}"),
                "commit",
            )),
            None => Err(ChronError::NotFound(format!("object {id}"))),
        }
    }
}

pub(crate) fn normalize_expected(expected: Option<&ObjectHash>) -> Option<ObjectHash> {
    expected.filter(|h| !h.is_zero()).copied()
}

/// Iterator over a commit's first-parent ancestry, newest first.
pub struct CommitWalk<'a> {
    store: &'a dyn ObjectStore,
    next: Option<ObjectHash>,
}

pub fn walk_commits(store: &dyn ObjectStore, from: ObjectHash) -> CommitWalk<'_> {
    CommitWalk {
        store,
        next: Some(from),
    }
}

impl Iterator for CommitWalk<'_> {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.store.get_commit(&id) {
            Ok(commit) => {
                self.next = commit.first_parent().copied();
                Some(Ok(commit))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Resolve `path` (slash-separated) inside the tree rooted at `root`.
pub fn read_path(
    store: &dyn ObjectStore,
    root: &ObjectHash,
    path: &str,
) -> Result<Option<TreeItem>> {
    let mut tree = store.get_tree(root)?;
    let mut components = path.split('/').peekable();
    while let Some(component) = components.next() {
        let Some(item) = tree.entry(component).cloned() else {
            return Ok(None);
        };
        if components.peek().is_none() {
            return Ok(Some(item));
        }
        if !item.mode.is_tree() {
            return Ok(None);
        }
        tree = store.get_tree(&item.id)?;
    }
    Ok(None)
}

/// Collect every blob under `root` whose full path starts with `prefix`,
/// as `(path, blob id)` pairs. Traversal prunes subtrees that cannot match.
pub fn collect_files(
    store: &dyn ObjectStore,
    root: &ObjectHash,
    prefix: &str,
) -> Result<Vec<(String, ObjectHash)>> {
    let mut files = Vec::new();
    let mut stack = vec![(String::new(), *root)];
    while let Some((base, tree_id)) = stack.pop() {
        let tree = store.get_tree(&tree_id)?;
        for item in &tree.tree_items {
            let path = if base.is_empty() {
                item.name.clone()
            } else {
                format!("{}/{}", base, item.name)
            };
            if item.mode.is_tree() {
                // A subtree can still match when the prefix extends the
                // directory path or the directory path extends the prefix.
                if path.starts_with(prefix) || prefix.starts_with(&format!("{path}/")) {
                    stack.push((path, item.id));
                }
            } else if path.starts_with(prefix) {
                files.push((path, item.id));
            }
        }
    }
    Ok(files)
}

/// Rebuild the spine of `root` so that `path` maps to `entry` (insert or
/// replace), or is absent (`entry = None`). Every untouched sibling keeps its
/// object id. Returns `None` when the resulting tree is empty, which prunes
/// the directory at the level above — a collection disappears with its last
/// document.
pub fn upsert_path(
    store: &dyn ObjectStore,
    root: Option<&ObjectHash>,
    path: &str,
    entry: Option<(TreeItemMode, ObjectHash)>,
) -> Result<Option<ObjectHash>> {
    let (head, rest) = match path.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    let current = match root {
        Some(id) => store.get_tree(id)?,
        None => Tree::from_items(vec![])?,
    };

    let new_entry = match rest {
        None => entry.map(|(mode, id)| TreeItem::new(mode, id, head.to_string())),
        Some(rest) => {
            let child_root = current
                .entry(head)
                .filter(|i| i.mode.is_tree())
                .map(|i| i.id);
            upsert_path(store, child_root.as_ref(), rest, entry)?
                .map(|id| TreeItem::new(TreeItemMode::Tree, id, head.to_string()))
        }
    };

    let items = current.with_entry(head, new_entry);
    if items.is_empty() {
        return Ok(None);
    }
    let tree = Tree::from_items(items)?;
    store.put_tree(&tree)?;
    Ok(Some(tree.id))
}

/// Write the empty tree and return its id; the root of an empty branch.
pub fn empty_tree(store: &dyn ObjectStore) -> Result<ObjectHash> {
    let tree = Tree::from_items(vec![])?;
    store.put_tree(&tree)?;
    Ok(tree.id)
}
