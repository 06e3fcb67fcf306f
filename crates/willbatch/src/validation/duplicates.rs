//! Duplicate detection layered over another validator.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{RecordContext, RecordValidator, Validation};
use crate::error::ProcessingError;
use crate::job::Record;

type KeyFn = Box<dyn Fn(&Record) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct KeyIndex {
    /// Key to the job that registered it; `None` for keys on file before any job.
    registered: HashMap<String, Option<String>>,
    /// Keys accepted by each running job whose batch is not stored yet.
    pending: HashMap<String, HashSet<String>>,
}

/// Rejects records whose key was already registered, by an earlier job or
/// earlier in the same job.
///
/// A key stays pending until [`commit`](RecordValidator::commit) stores the
/// batch that accepted it; from then on every later job sees it as
/// registered. Pending keys of a batch that never commits are dropped by
/// `finish`. Records without a key are passed through unchanged.
pub struct DuplicateGuard<V> {
    inner: V,
    key: KeyFn,
    index: Mutex<KeyIndex>,
}

impl<V: RecordValidator> DuplicateGuard<V> {
    pub fn new<F>(inner: V, key: F) -> Self
    where
        F: Fn(&Record) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            inner,
            key: Box::new(key),
            index: Mutex::new(KeyIndex::default()),
        }
    }

    /// Keys already on file outside of any job.
    pub fn with_existing<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut index) = self.index.lock() {
            for key in keys {
                index.registered.entry(key.into()).or_insert(None);
            }
        }
        self
    }

    /// Registers the key of each record that has one.
    pub fn with_existing_records<'a, I>(self, records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let keys: Vec<String> = records.into_iter().filter_map(|r| (self.key)(r)).collect();
        self.with_existing(keys)
    }

    pub fn registered_count(&self) -> usize {
        self.index.lock().map(|i| i.registered.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, KeyIndex>, ProcessingError> {
        self.index
            .lock()
            .map_err(|_| ProcessingError::ValidatorUnavailable("duplicate index poisoned".into()))
    }
}

impl<V: RecordValidator> RecordValidator for DuplicateGuard<V> {
    fn validate(
        &self,
        ctx: &RecordContext<'_>,
        record: &Record,
    ) -> Result<Validation, ProcessingError> {
        let outcome = self.inner.validate(ctx, record)?;
        if !outcome.is_accepted() {
            return Ok(outcome);
        }

        let Some(key) = (self.key)(record) else {
            return Ok(outcome);
        };

        let mut index = self.lock()?;
        let same_job = match index.registered.get(&key) {
            Some(owner) => Some(owner.as_deref() == Some(ctx.job_id)),
            None => index
                .pending
                .iter()
                .find(|(_, keys)| keys.contains(&key))
                .map(|(job_id, _)| job_id == ctx.job_id),
        };

        match same_job {
            Some(true) => Ok(Validation::rejected(format!(
                "Duplicate record: '{}' appears earlier in this upload",
                key
            ))),
            Some(false) => Ok(Validation::rejected(format!(
                "Duplicate record: '{}' is already registered",
                key
            ))),
            None => {
                index
                    .pending
                    .entry(ctx.job_id.to_string())
                    .or_default()
                    .insert(key);
                Ok(Validation::Accepted)
            }
        }
    }

    fn commit(&self, job_id: &str) {
        if let Ok(mut index) = self.index.lock() {
            if let Some(keys) = index.pending.remove(job_id) {
                for key in keys {
                    index.registered.insert(key, Some(job_id.to_string()));
                }
            }
        }
        self.inner.commit(job_id);
    }

    fn finish(&self, job_id: &str) {
        if let Ok(mut index) = self.index.lock() {
            index.pending.remove(job_id);
        }
        self.inner.finish(job_id);
    }
}
