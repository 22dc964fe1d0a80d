//! Administrative operations: branch management, best-effort three-way
//! merge, and bundle-based backup/restore. All of it is expressed over the
//! same store walkers the engine uses.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use ahash::AHashSet;
use bincode::{Decode, Encode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::info;

use crate::config::DbConfig;
use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::commit::Commit;
use crate::internal::object::signature::Signature;
use crate::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use crate::internal::object::types::ObjectType;
use crate::internal::store::{ObjectStore, RefTransition, collect_files};

/// Branch names under the heads namespace.
pub fn list_branches(store: &dyn ObjectStore) -> Result<Vec<String>> {
    Ok(store
        .list_refs("refs/heads/")?
        .into_iter()
        .filter_map(|(name, _)| name.strip_prefix("refs/heads/").map(|b| b.to_string()))
        .collect())
}

/// Create `name` pointing at `from`'s head.
pub fn create_branch(store: &dyn ObjectStore, name: &str, from: &str) -> Result<()> {
    let head = store
        .resolve_ref(&DbConfig::branch_ref(from))?
        .ok_or_else(|| ChronError::NotFound(format!("branch {from}")))?;
    match store.update_ref(&DbConfig::branch_ref(name), None, &head, false)? {
        RefTransition::Rejected => Err(ChronError::Conflict {
            subject: name.to_string(),
            branch: name.to_string(),
            detail: "branch already exists".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Point HEAD at an existing branch.
pub fn checkout(store: &dyn ObjectStore, name: &str) -> Result<()> {
    store
        .resolve_ref(&DbConfig::branch_ref(name))?
        .ok_or_else(|| ChronError::NotFound(format!("branch {name}")))?;
    store.set_head(name)
}

/// Every commit reachable from `tip` through all parents.
fn ancestor_set(store: &dyn ObjectStore, tip: ObjectHash) -> Result<AHashSet<ObjectHash>> {
    let mut seen = AHashSet::new();
    let mut stack = vec![tip];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let commit = store.get_commit(&id)?;
        stack.extend(commit.parent_commit_ids.iter().copied());
    }
    Ok(seen)
}

/// First commit reachable from `tip` that is also an ancestor of the other
/// side; breadth-first so the nearest base wins.
fn merge_base(
    store: &dyn ObjectStore,
    ours: &AHashSet<ObjectHash>,
    tip: ObjectHash,
) -> Result<Option<ObjectHash>> {
    let mut seen = AHashSet::new();
    let mut queue = std::collections::VecDeque::from([tip]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if ours.contains(&id) {
            return Ok(Some(id));
        }
        let commit = store.get_commit(&id)?;
        queue.extend(commit.parent_commit_ids.iter().copied());
    }
    Ok(None)
}

fn path_map(
    store: &dyn ObjectStore,
    commit: Option<&ObjectHash>,
) -> Result<BTreeMap<String, ObjectHash>> {
    let Some(commit) = commit else {
        return Ok(BTreeMap::new());
    };
    let tree = store.get_commit(commit)?.tree_id;
    Ok(collect_files(store, &tree, "")?.into_iter().collect())
}

/// Build a nested tree out of a flat `path -> blob` map.
fn build_tree_from_paths(
    store: &dyn ObjectStore,
    paths: &BTreeMap<String, ObjectHash>,
) -> Result<ObjectHash> {
    let mut blobs: Vec<TreeItem> = Vec::new();
    let mut subdirs: BTreeMap<String, BTreeMap<String, ObjectHash>> = BTreeMap::new();
    for (path, blob) in paths {
        match path.split_once('/') {
            None => blobs.push(TreeItem::new(TreeItemMode::Blob, *blob, path.clone())),
            Some((dir, rest)) => {
                subdirs
                    .entry(dir.to_string())
                    .or_default()
                    .insert(rest.to_string(), *blob);
            }
        }
    }
    for (dir, entries) in &subdirs {
        let sub = build_tree_from_paths(store, entries)?;
        blobs.push(TreeItem::new(TreeItemMode::Tree, sub, dir.clone()));
    }
    let tree = Tree::from_items(blobs)?;
    store.put_tree(&tree)?;
    Ok(tree.id)
}

/// Best-effort three-way merge of `theirs` into `ours` on tree paths.
/// Fast-forwards when possible; otherwise paths changed on both sides to
/// different contents surface as a `Conflict` carrying the offending paths.
pub fn merge(
    store: &dyn ObjectStore,
    ours: &str,
    theirs: &str,
    committer: &Signature,
) -> Result<ObjectHash> {
    let ours_ref = DbConfig::branch_ref(ours);
    let ours_head = store
        .resolve_ref(&ours_ref)?
        .ok_or_else(|| ChronError::NotFound(format!("branch {ours}")))?;
    let theirs_head = store
        .resolve_ref(&DbConfig::branch_ref(theirs))?
        .ok_or_else(|| ChronError::NotFound(format!("branch {theirs}")))?;

    let ours_ancestors = ancestor_set(store, ours_head)?;
    if ours_ancestors.contains(&theirs_head) {
        // Already merged.
        return Ok(ours_head);
    }
    let base = merge_base(store, &ours_ancestors, theirs_head)?;
    if base == Some(ours_head) {
        // Fast-forward.
        if !store
            .update_ref(&ours_ref, Some(&ours_head), &theirs_head, false)?
            .updated()
        {
            return Err(ChronError::Conflict {
                subject: ours.to_string(),
                branch: ours.to_string(),
                detail: "branch head moved during merge".to_string(),
            });
        }
        return Ok(theirs_head);
    }

    let base_paths = path_map(store, base.as_ref())?;
    let our_paths = path_map(store, Some(&ours_head))?;
    let their_paths = path_map(store, Some(&theirs_head))?;

    let mut merged = BTreeMap::new();
    let mut conflicts = Vec::new();
    let mut all_paths: AHashSet<&String> = our_paths.keys().collect();
    all_paths.extend(their_paths.keys());
    all_paths.extend(base_paths.keys());

    for path in all_paths {
        let b = base_paths.get(path);
        let o = our_paths.get(path);
        let t = their_paths.get(path);
        let winner = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else {
            conflicts.push(path.clone());
            continue;
        };
        if let Some(blob) = winner {
            merged.insert(path.clone(), *blob);
        }
    }
    if !conflicts.is_empty() {
        conflicts.sort();
        return Err(ChronError::Conflict {
            subject: conflicts.join(", "),
            branch: ours.to_string(),
            detail: "merge has unresolved paths".to_string(),
        });
    }

    let tree = build_tree_from_paths(store, &merged)?;
    let commit = Commit::new(
        committer.clone(),
        committer.clone(),
        tree,
        vec![ours_head, theirs_head],
        &format!("merge {theirs} into {ours}"),
    );
    store.put_commit(&commit)?;
    if !store
        .update_ref(&ours_ref, Some(&ours_head), &commit.id, false)?
        .updated()
    {
        return Err(ChronError::Conflict {
            subject: ours.to_string(),
            branch: ours.to_string(),
            detail: "branch head moved during merge".to_string(),
        });
    }
    info!(ours, theirs, commit = %commit.id, "merged");
    Ok(commit.id)
}

const BUNDLE_MAGIC: &[u8; 8] = b"CHRONBDL";

#[derive(Encode, Decode)]
struct Bundle {
    refs: Vec<(String, String)>,
    objects: Vec<(u8, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleStats {
    pub refs: usize,
    pub objects: usize,
}

/// Every object reachable from the given tips, in insertion order.
fn reachable_objects(
    store: &dyn ObjectStore,
    tips: &[ObjectHash],
) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut seen = AHashSet::new();
    let mut objects = Vec::new();
    let mut stack: Vec<ObjectHash> = tips.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let (ty, data) = store
            .get_raw(&id)?
            .ok_or_else(|| ChronError::NotFound(format!("object {id}")))?;
        match ty {
            ObjectType::Commit => {
                let commit = Commit::from_bytes(&data, id)?;
                stack.push(commit.tree_id);
                stack.extend(commit.parent_commit_ids.iter().copied());
            }
            ObjectType::Tree => {
                let tree = Tree::from_bytes(&data, id)?;
                stack.extend(tree.tree_items.iter().map(|i| i.id));
            }
            ObjectType::Blob => {}
        }
        objects.push((ty.to_u8(), data));
    }
    Ok(objects)
}

/// Write every ref and every reachable object into a single bundle file.
pub fn export_bundle(store: &dyn ObjectStore, path: &Path) -> Result<BundleStats> {
    let refs = store.list_refs("refs/")?;
    let tips: Vec<ObjectHash> = refs.iter().map(|(_, id)| *id).collect();
    let bundle = Bundle {
        refs: refs
            .iter()
            .map(|(name, id)| (name.clone(), id.to_string()))
            .collect(),
        objects: reachable_objects(store, &tips)?,
    };
    let stats = BundleStats {
        refs: bundle.refs.len(),
        objects: bundle.objects.len(),
    };

    let body = bincode::encode_to_vec(&bundle, bincode::config::standard())
        .map_err(|e| ChronError::Serialization(e.to_string()))?;
    let mut file = fs::File::create(path)?;
    file.write_all(BUNDLE_MAGIC)?;
    file.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
    file.write_u64::<LittleEndian>(body.len() as u64)?;
    file.write_all(&body)?;
    file.sync_data()?;
    info!(path = %path.display(), ?stats, "bundle exported");
    Ok(stats)
}

/// Read a bundle and replay it into the store. Refs are force-set to the
/// bundled values; content addressing makes object import idempotent.
pub fn import_bundle(store: &dyn ObjectStore, path: &Path) -> Result<BundleStats> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != BUNDLE_MAGIC {
        return Err(ChronError::corrupt(
            format!("bundle {}", path.display()),
            "bad magic",
        ));
    }
    let checksum = file.read_u32::<LittleEndian>()?;
    let len = file.read_u64::<LittleEndian>()?;
    let mut body = vec![0u8; len as usize];
    file.read_exact(&mut body)?;
    if crc32fast::hash(&body) != checksum {
        return Err(ChronError::corrupt(
            format!("bundle {}", path.display()),
            "checksum mismatch",
        ));
    }
    let (bundle, _): (Bundle, usize) =
        bincode::decode_from_slice(&body, bincode::config::standard())
            .map_err(|e| ChronError::corrupt(format!("bundle {}", path.display()), e.to_string()))?;

    for (ty, data) in &bundle.objects {
        store.put_raw(ObjectType::from_u8(*ty)?, data)?;
    }
    for (name, id) in &bundle.refs {
        let id = ObjectHash::from_str(id).map_err(ChronError::InvalidHashValue)?;
        store.update_ref(name, None, &id, true)?;
    }
    Ok(BundleStats {
        refs: bundle.refs.len(),
        objects: bundle.objects.len(),
    })
}
