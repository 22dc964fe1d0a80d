//! On-disk object store: a bare repository directory with zlib loose objects
//! under `objects/`, one-line ref files under `refs/`, and a `HEAD` file
//! naming the default branch. The layout is byte-compatible with Git, so a
//! database directory can be inspected with stock tooling.
//!
//! Writers serialize per ref through `<ref>.lock` files; object files are
//! immutable once written, so readers never need a lock. Decompressed object
//! payloads are kept in a bounded concurrent read cache.

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use bstr::ByteSlice;
use dashmap::DashMap;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::object::types::ObjectType;
use crate::internal::store::{ObjectStore, RefTransition, normalize_expected};
use crate::utils::{LockFile, fsync_dir, reclaim_stale_locks};

/// Decompressed payload bytes kept in memory before the cache is reset.
const CACHE_LIMIT_BYTES: usize = 64 << 20;

pub struct FileStore {
    root: PathBuf,
    cache: DashMap<ObjectHash, (ObjectType, Vec<u8>)>,
    cache_bytes: AtomicUsize,
}

impl FileStore {
    /// Open a bare repository directory, creating the layout on first use.
    /// Stale lock files left by a crashed process are reclaimed here, when
    /// no writer can be live.
    pub fn open(root: impl Into<PathBuf>, default_branch: &str) -> Result<FileStore> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs/heads"))?;
        fs::create_dir_all(root.join("refs/notes"))?;
        let head = root.join("HEAD");
        if !head.exists() {
            fs::write(&head, format!("ref: refs/heads/{default_branch}\n"))?;
        }
        let reclaimed = reclaim_stale_locks(&root)?;
        if reclaimed > 0 {
            debug!(reclaimed, root = %root.display(), "reclaimed stale locks at startup");
        }
        Ok(FileStore {
            root,
            cache: DashMap::new(),
            cache_bytes: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectHash) -> PathBuf {
        let hex = id.to_string();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn cache_insert(&self, id: ObjectHash, object_type: ObjectType, data: Vec<u8>) {
        let added = data.len();
        if self.cache_bytes.fetch_add(added, Ordering::Relaxed) + added > CACHE_LIMIT_BYTES {
            self.cache.clear();
            self.cache_bytes.store(added, Ordering::Relaxed);
        }
        self.cache.insert(id, (object_type, data));
    }

    fn read_ref_file(&self, name: &str) -> Result<Option<ObjectHash>> {
        let path = self.ref_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = contents.trim();
        ObjectHash::from_str(trimmed)
            .map(Some)
            .map_err(|e| ChronError::InvalidRef(name.to_string(), e))
    }
}

impl ObjectStore for FileStore {
    fn put_raw(&self, object_type: ObjectType, data: &[u8]) -> Result<ObjectHash> {
        let id = ObjectHash::from_type_and_data(object_type, data);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        let dir = path.parent().expect("object path has a fan-out directory");
        fs::create_dir_all(dir)?;

        let mut header = Vec::with_capacity(data.len() + 16);
        header.extend(object_type.to_bytes());
        header.push(b' ');
        header.extend(data.len().to_string().as_bytes());
        header.push(b'\x00');
        header.extend(data);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&header)?;
        let compressed = encoder.finish()?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_data()?;
        match tmp.persist(&path) {
            Ok(_) => {}
            // A concurrent writer produced the identical object first.
            Err(e) if path.exists() => drop(e),
            Err(e) => return Err(e.error.into()),
        }
        fsync_dir(dir)?;
        self.cache_insert(id, object_type, data.to_vec());
        Ok(id)
    }

    fn get_raw(&self, id: &ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(Some(hit.value().clone()));
        }
        let path = self.object_path(id);
        let compressed = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut raw = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(|e| ChronError::corrupt(format!("object {id}"), e.to_string()))?;

        let header_end = raw
            .find_byte(b'\x00')
            .ok_or_else(|| ChronError::corrupt(format!("object {id}"), "missing header"))?;
        let header = raw[..header_end]
            .to_str()
            .map_err(|_| ChronError::corrupt(format!("object {id}"), "non-UTF-8 header"))?;
        let (type_name, len) = header
            .split_once(' ')
            .ok_or_else(|| ChronError::corrupt(format!("object {id}"), "malformed header"))?;
        let object_type = ObjectType::from_string(type_name)?;
        let declared: usize = len
            .parse()
            .map_err(|_| ChronError::corrupt(format!("object {id}"), "bad length"))?;
        let data = raw[header_end + 1..].to_vec();
        if data.len() != declared {
            return Err(ChronError::corrupt(
                format!("object {id}"),
                format!("length mismatch: header {declared}, payload {}", data.len()),
            ));
        }
        self.cache_insert(*id, object_type, data.clone());
        Ok(Some((object_type, data)))
    }

    fn has_object(&self, id: &ObjectHash) -> Result<bool> {
        Ok(self.cache.contains_key(id) || self.object_path(id).exists())
    }

    fn resolve_ref(&self, name: &str) -> Result<Option<ObjectHash>> {
        self.read_ref_file(name)
    }

    fn update_ref(
        &self,
        name: &str,
        expected_old: Option<&ObjectHash>,
        new: &ObjectHash,
        force: bool,
    ) -> Result<RefTransition> {
        let target = self.ref_path(name);
        let lock = LockFile::acquire(&target)?;
        // Re-read under the lock; the value may have moved since the caller
        // observed it.
        let current = self.read_ref_file(name)?;
        let expected = normalize_expected(expected_old);

        let transition = match (&current, &expected) {
            (None, None) => RefTransition::Created,
            (Some(cur), Some(exp)) if cur == exp => RefTransition::FastForwarded,
            _ if force => RefTransition::Forced,
            _ => RefTransition::Rejected,
        };
        if transition.updated() {
            lock.commit(&target, format!("{new}\n").as_bytes())?;
        }
        Ok(transition)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectHash)>> {
        let base = self.root.join("refs");
        let mut refs = Vec::new();
        if !base.exists() {
            return Ok(refs);
        }
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().is_some_and(|e| e == "lock") {
                    continue;
                }
                let name = path
                    .strip_prefix(&self.root)
                    .map_err(|_| {
                        ChronError::InvalidRef(
                            path.display().to_string(),
                            "outside repository".to_string(),
                        )
                    })?
                    .to_string_lossy()
                    .replace('\\', "/");
                if !name.starts_with(prefix) {
                    continue;
                }
                if let Some(id) = self.read_ref_file(&name)? {
                    refs.push((name, id));
                }
            }
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    fn delete_ref(&self, name: &str) -> Result<bool> {
        let target = self.ref_path(name);
        let _lock = LockFile::acquire(&target)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_head(&self) -> Result<String> {
        let contents = fs::read_to_string(self.root.join("HEAD"))?;
        contents
            .trim()
            .strip_prefix("ref: refs/heads/")
            .map(|b| b.to_string())
            .ok_or_else(|| {
                ChronError::InvalidRef("HEAD".to_string(), contents.trim().to_string())
            })
    }

    fn set_head(&self, branch: &str) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(format!("ref: refs/heads/{branch}\n").as_bytes())?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.root.join("HEAD"))
            .map_err(|e| ChronError::Io(e.error))?;
        Ok(())
    }
}
