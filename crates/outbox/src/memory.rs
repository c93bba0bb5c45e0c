//! In-memory backend.
//!
//! A service's whole database is one [`Tables`] value behind one lock. A
//! transaction writes the live tables in place while every table keeps an
//! undo log of what it changed. Commit forgets the log; dropping the handle
//! without committing replays it, discarding every write including outbox
//! rows and idempotency claims, exactly like a database rollback.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::idempotency::record_duplicate;
use crate::{EventKey, IdempotencyGuard, OutboxId, OutboxRecord, OutboxStore, Result};

/// Business tables that can take back the writes of an open transaction.
pub trait Journaled {
    /// Undoes every write since the last commit, newest first.
    fn rollback(&mut self);

    /// Forgets the undo log, keeping the writes.
    fn commit(&mut self);
}

impl Journaled for () {
    fn rollback(&mut self) {}

    fn commit(&mut self) {}
}

/// Keyed rows with an undo log.
///
/// Each write records the row it replaced, so a rollback costs as much as
/// the transaction wrote, not as much as the table holds.
#[derive(Debug, Clone)]
pub struct Table<K, V> {
    rows: HashMap<K, V>,
    undo: Vec<(K, Option<V>)>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            undo: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Table<K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.rows.get(key)
    }

    /// Mutable access to one row; its prior value is logged first.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let prior = self.rows.get(key)?.clone();
        self.undo.push((key.clone(), Some(prior)));
        self.rows.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let prior = self.rows.insert(key.clone(), value);
        self.undo.push((key, prior.clone()));
        prior
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<K: Eq + Hash, V> Journaled for Table<K, V> {
    fn rollback(&mut self) {
        while let Some((key, prior)) = self.undo.pop() {
            match prior {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }

    fn commit(&mut self) {
        self.undo.clear();
    }
}

/// Outbox rows of one service, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    records: Vec<OutboxRecord>,
    /// Rows appended by the open transaction, all at the tail.
    staged: usize,
}

impl OutboxTable {
    /// Appends a row. Only reachable through a transaction handle.
    pub fn enqueue(&mut self, record: OutboxRecord) {
        self.records.push(record);
        self.staged += 1;
    }

    pub fn enqueue_all(&mut self, records: impl IntoIterator<Item = OutboxRecord>) {
        for record in records {
            self.enqueue(record);
        }
    }

    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    /// Rows with the given routing key, oldest first.
    pub fn with_event_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> impl Iterator<Item = &'a OutboxRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.event_type == event_type)
    }

    fn claim(&mut self, batch_size: usize, lease: Duration, now: DateTime<Utc>) -> Vec<OutboxRecord> {
        let mut candidates: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        // Stable: rows written in the same instant keep insertion order.
        candidates.sort_by_key(|&i| self.records[i].created_at);

        candidates
            .into_iter()
            .take(batch_size)
            .map(|i| {
                let record = &mut self.records[i];
                record.claimed_until = Some(now + lease);
                record.clone()
            })
            .collect()
    }

    fn mark_published(&mut self, id: OutboxId, now: DateTime<Utc>) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if !record.published => {
                record.published = true;
                record.published_at = Some(now);
                record.claimed_until = None;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, id: OutboxId) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.id == id && !r.published)
        {
            record.claimed_until = None;
        }
    }

    fn purge(&mut self, older_than: DateTime<Utc>, batch_size: usize) -> u64 {
        let mut removed = 0usize;
        self.records.retain(|r| {
            let expired = r.published && r.published_at.is_some_and(|at| at < older_than);
            if expired && removed < batch_size {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed as u64
    }

    fn pending_count(&self) -> u64 {
        self.records.iter().filter(|r| !r.published).count() as u64
    }
}

impl Journaled for OutboxTable {
    fn rollback(&mut self) {
        let kept = self.records.len() - self.staged;
        self.records.truncate(kept);
        self.staged = 0;
    }

    fn commit(&mut self) {
        self.staged = 0;
    }
}

/// Processed event keys of one service.
#[derive(Debug, Clone, Default)]
pub struct ProcessedKeys {
    keys: HashMap<EventKey, DateTime<Utc>>,
    /// Keys claimed by the open transaction.
    staged: Vec<EventKey>,
}

impl ProcessedKeys {
    /// Inserts `key` as part of the open transaction; returns false if it
    /// was already present.
    pub fn claim(&mut self, key: &EventKey) -> bool {
        let claimed = self.insert(key);
        if claimed {
            self.staged.push(key.clone());
        }
        claimed
    }

    /// Inserts `key` outside any transaction.
    fn insert(&mut self, key: &EventKey) -> bool {
        if self.keys.contains_key(key) {
            record_duplicate(key);
            return false;
        }
        self.keys.insert(key.clone(), Utc::now());
        true
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn purge(&mut self, older_than: DateTime<Utc>) -> u64 {
        let before = self.keys.len();
        self.keys.retain(|_, claimed_at| *claimed_at >= older_than);
        (before - self.keys.len()) as u64
    }
}

impl Journaled for ProcessedKeys {
    fn rollback(&mut self) {
        for key in self.staged.drain(..) {
            self.keys.remove(&key);
        }
    }

    fn commit(&mut self) {
        self.staged.clear();
    }
}

/// Every table of one service: outbox, processed keys, and business data.
#[derive(Debug, Clone, Default)]
pub struct Tables<T> {
    pub outbox: OutboxTable,
    pub processed: ProcessedKeys,
    pub data: T,
}

impl<T: Journaled> Journaled for Tables<T> {
    fn rollback(&mut self) {
        self.outbox.rollback();
        self.processed.rollback();
        self.data.rollback();
    }

    fn commit(&mut self) {
        self.outbox.commit();
        self.processed.commit();
        self.data.commit();
    }
}

/// In-memory database shared by a service's repository and its publisher.
#[derive(Debug)]
pub struct InMemoryDatabase<T> {
    tables: Arc<Mutex<Tables<T>>>,
}

impl<T> Clone for InMemoryDatabase<T> {
    fn clone(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
        }
    }
}

impl<T: Default> Default for InMemoryDatabase<T> {
    fn default() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }
}

impl<T: Journaled + Send> InMemoryDatabase<T> {
    /// Creates an empty database.
    pub fn new() -> Self
    where
        T: Default,
    {
        Self::default()
    }

    /// Opens a transaction. Writers are serialized for its whole lifetime.
    pub async fn begin(&self) -> InMemoryTransaction<'_, T> {
        InMemoryTransaction {
            guard: self.tables.lock().await,
            committed: false,
        }
    }

    /// Runs a read-only closure against committed state.
    pub async fn read<R>(&self, f: impl FnOnce(&Tables<T>) -> R) -> R {
        let guard = self.tables.lock().await;
        f(&guard)
    }
}

/// Open transaction on an [`InMemoryDatabase`].
///
/// Dereferences to the live tables; the lock keeps other callers out until
/// the handle is committed or dropped.
pub struct InMemoryTransaction<'a, T: Journaled> {
    guard: MutexGuard<'a, Tables<T>>,
    committed: bool,
}

impl<T: Journaled> InMemoryTransaction<'_, T> {
    /// Keeps every write made through this handle.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<T: Journaled> Drop for InMemoryTransaction<'_, T> {
    fn drop(&mut self) {
        if self.committed {
            self.guard.commit();
        } else {
            self.guard.rollback();
        }
    }
}

impl<T: Journaled> Deref for InMemoryTransaction<'_, T> {
    type Target = Tables<T>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T: Journaled> DerefMut for InMemoryTransaction<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[async_trait]
impl<T: Send + 'static> OutboxStore for InMemoryDatabase<T> {
    async fn claim_pending(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.claim(batch_size, lease, Utc::now()))
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.mark_published(id, Utc::now()))
    }

    async fn release_claim(&self, id: OutboxId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.outbox.release(id);
        Ok(())
    }

    async fn purge_published(&self, older_than: DateTime<Utc>, batch_size: usize) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.purge(older_than, batch_size))
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.tables.lock().await.outbox.pending_count())
    }
}

#[async_trait]
impl<T: Send + 'static> IdempotencyGuard for InMemoryDatabase<T> {
    async fn try_claim(&self, key: &EventKey) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        Ok(tables.processed.insert(key))
    }

    async fn purge_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        Ok(tables.processed.purge(older_than))
    }
}
