//! In-memory object store used by tests and ephemeral databases. Objects and
//! refs live in concurrent maps; ref updates are atomic through the map's
//! entry API, which gives the same CAS discipline as the on-disk layout.

use std::sync::Mutex;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::internal::object::types::ObjectType;
use crate::internal::store::{ObjectStore, RefTransition, normalize_expected};

pub struct MemoryStore {
    objects: DashMap<ObjectHash, (ObjectType, Vec<u8>)>,
    refs: DashMap<String, ObjectHash>,
    head: Mutex<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            objects: DashMap::new(),
            refs: DashMap::new(),
            head: Mutex::new("main".to_string()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn put_raw(&self, object_type: ObjectType, data: &[u8]) -> Result<ObjectHash> {
        let id = ObjectHash::from_type_and_data(object_type, data);
        self.objects
            .entry(id)
            .or_insert_with(|| (object_type, data.to_vec()));
        Ok(id)
    }

    fn get_raw(&self, id: &ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>> {
        Ok(self.objects.get(id).map(|e| e.value().clone()))
    }

    fn has_object(&self, id: &ObjectHash) -> Result<bool> {
        Ok(self.objects.contains_key(id))
    }

    fn resolve_ref(&self, name: &str) -> Result<Option<ObjectHash>> {
        Ok(self.refs.get(name).map(|e| *e.value()))
    }

    fn update_ref(
        &self,
        name: &str,
        expected_old: Option<&ObjectHash>,
        new: &ObjectHash,
        force: bool,
    ) -> Result<RefTransition> {
        let expected = normalize_expected(expected_old);
        match self.refs.entry(name.to_string()) {
            Entry::Vacant(vacant) => match expected {
                None => {
                    vacant.insert(*new);
                    Ok(RefTransition::Created)
                }
                Some(_) if force => {
                    vacant.insert(*new);
                    Ok(RefTransition::Forced)
                }
                Some(_) => Ok(RefTransition::Rejected),
            },
            Entry::Occupied(mut occupied) => {
                let matches = expected.as_ref() == Some(occupied.get());
                if matches {
                    occupied.insert(*new);
                    Ok(RefTransition::FastForwarded)
                } else if force {
                    occupied.insert(*new);
                    Ok(RefTransition::Forced)
                } else {
                    Ok(RefTransition::Rejected)
                }
            }
        }
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectHash)>> {
        let mut refs: Vec<(String, ObjectHash)> = self
            .refs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    fn delete_ref(&self, name: &str) -> Result<bool> {
        Ok(self.refs.remove(name).is_some())
    }

    fn read_head(&self) -> Result<String> {
        Ok(self.head.lock().unwrap().clone())
    }

    fn set_head(&self, branch: &str) -> Result<()> {
        *self.head.lock().unwrap() = branch.to_string();
        Ok(())
    }
}
