use std::collections::HashMap;
use std::sync::Mutex;

use crate::allocation::ManagedAllocation;
use crate::error::VmmError;

struct Entry {
    allocation: ManagedAllocation,
    tag: String,
}

struct Inner {
    primary: HashMap<u64, Entry>,
    by_tag: HashMap<String, Vec<u64>>,
    bad_handles: Vec<u64>,
}

/// Owns a set of `ManagedAllocation`s, indexed both by a caller-chosen handle
/// key and by a tag shared across related allocations, so a whole cohort can
/// be released or materialized as one logical operation.
///
/// A single mutex guards both indices and the quarantine list; control-path
/// operations here aren't performance sensitive enough to warrant splitting
/// the lock.
pub struct CohortManager {
    inner: Mutex<Inner>,
}

impl Default for CohortManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CohortManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                primary: HashMap::new(),
                by_tag: HashMap::new(),
                bad_handles: Vec::new(),
            }),
        }
    }

    /// Registers an already-constructed allocation under `handle_key` and `tag`.
    pub fn add(
        &self,
        handle_key: u64,
        tag: impl Into<String>,
        allocation: ManagedAllocation,
    ) -> Result<(), VmmError> {
        let tag = tag.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.primary.contains_key(&handle_key) {
            return Err(VmmError::DuplicateHandle(handle_key));
        }
        inner.by_tag.entry(tag.clone()).or_default().push(handle_key);
        inner.primary.insert(handle_key, Entry { allocation, tag });
        Ok(())
    }

    /// Builds a `ManagedAllocation` from `producer`/`stages`, materializes it,
    /// and only registers it under `handle_key`/`tag` if that succeeds.
    ///
    /// If materialization fails the allocation is simply dropped — its own
    /// destructor performs the best-effort rollback — and nothing is added to
    /// either index.
    pub fn add_and_materialize(
        &self,
        handle_key: u64,
        tag: impl Into<String>,
        producer: Box<dyn crate::capability::Producer>,
        stages: Vec<Box<dyn crate::capability::Stage>>,
    ) -> Result<(), VmmError> {
        let tag = tag.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.primary.contains_key(&handle_key) {
            return Err(VmmError::DuplicateHandle(handle_key));
        }
        let mut allocation = ManagedAllocation::new(producer, stages);
        allocation.materialize()?;
        inner.by_tag.entry(tag.clone()).or_default().push(handle_key);
        inner.primary.insert(handle_key, Entry { allocation, tag });
        Ok(())
    }

    /// Removes and returns the allocation registered under `handle_key`, or
    /// an empty (already-released) allocation if there is none. Never fails:
    /// an unknown key is not an error here, since callers that only track
    /// handle keys can't distinguish "already removed" from "never existed."
    pub fn remove(&self, handle_key: u64) -> ManagedAllocation {
        let mut inner = self.inner.lock().unwrap();
        match inner.primary.remove(&handle_key) {
            Some(entry) => {
                if let Some(keys) = inner.by_tag.get_mut(&entry.tag) {
                    keys.retain(|&key| key != handle_key);
                }
                entry.allocation
            }
            None => ManagedAllocation::empty(),
        }
    }

    /// Releases every allocation registered under `tag`, continuing past
    /// individual failures. Any entry whose release fails is quarantined:
    /// removed from both indices and appended to the bad-handle list, since
    /// it can no longer be trusted to behave like the others.
    ///
    /// Returns the number of entries attempted. The most recent error
    /// observed, if any, is returned after every entry has been attempted.
    pub fn release_by_tag(&self, tag: &str) -> Result<usize, VmmError> {
        let mut inner = self.inner.lock().unwrap();
        let handle_keys = inner.by_tag.get(tag).cloned().unwrap_or_default();
        let count = handle_keys.len();
        let mut last_error = None;
        let mut quarantine = Vec::new();

        for key in &handle_keys {
            if let Some(entry) = inner.primary.get_mut(key) {
                if let Err(error) = entry.allocation.release() {
                    tracing::warn!(handle_key = %key, tag, %error, "release_by_tag: entry failed; quarantining");
                    last_error = Some(error);
                    quarantine.push(*key);
                }
            }
        }

        for key in quarantine {
            inner.primary.remove(&key);
            if let Some(keys) = inner.by_tag.get_mut(tag) {
                keys.retain(|&k| k != key);
            }
            inner.bad_handles.push(key);
        }

        match last_error {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }

    /// Materializes every allocation registered under `tag`, all-or-nothing:
    /// the first failure rolls back every entry materialized so far in this
    /// call, in reverse order, and the whole operation reports that failure.
    ///
    /// The entry that failed to materialize, and any entry whose rollback
    /// release itself fails, are quarantined the same way `release_by_tag`
    /// quarantines failures. Entries that roll back cleanly remain registered
    /// in `Released` state.
    pub fn materialize_by_tag(&self, tag: &str) -> Result<usize, VmmError> {
        let mut inner = self.inner.lock().unwrap();
        let handle_keys = inner.by_tag.get(tag).cloned().unwrap_or_default();
        let count = handle_keys.len();
        let mut materialized = Vec::new();
        let mut failure = None;

        for key in &handle_keys {
            if let Some(entry) = inner.primary.get_mut(key) {
                match entry.allocation.materialize() {
                    Ok(()) => materialized.push(*key),
                    Err(error) => {
                        failure = Some((*key, error));
                        break;
                    }
                }
            }
        }

        let (failed_key, original_error) = match failure {
            Some(failure) => failure,
            None => return Ok(count),
        };

        let mut quarantine = vec![failed_key];
        for key in materialized.iter().rev() {
            if let Some(entry) = inner.primary.get_mut(key) {
                if let Err(error) = entry.allocation.release() {
                    tracing::warn!(handle_key = %key, tag, %error, "materialize_by_tag: rollback failed; quarantining");
                    quarantine.push(*key);
                }
            }
        }

        for key in quarantine {
            inner.primary.remove(&key);
            if let Some(keys) = inner.by_tag.get_mut(tag) {
                keys.retain(|&k| k != key);
            }
            inner.bad_handles.push(key);
        }

        Err(original_error)
    }

    /// Atomically drains and returns the list of handle keys quarantined
    /// since the last call. Calling this repeatedly never returns the same
    /// key twice.
    pub fn take_bad_handles(&self) -> Vec<u64> {
        std::mem::take(&mut self.inner.lock().unwrap().bad_handles)
    }

    pub fn contains(&self, handle_key: u64) -> bool {
        self.inner.lock().unwrap().primary.contains_key(&handle_key)
    }

    pub fn tag_len(&self, tag: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .by_tag
            .get(tag)
            .map_or(0, |keys| keys.len())
    }
}
