//! Mashup test history as seen by the UI: an in-memory index, grouped by
//! mashup and sorted newest first, kept consistent with the durable store.
//!
//! Mutations write through to the store and then patch the index from the
//! mutation's known effect. Only `get_tests_for_mashup` re-reads. Mutations
//! issued before `start()` reaches `Ready` are validated, queued in order, and
//! flushed once the index is loaded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::client::transport::Transport;
use crate::error::{StatusError, require_id};
use crate::services::{MashupService, TestExecution};
use crate::store::{TestRecord, TestResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// Store open attempted (successfully or not); index not loaded yet.
    Initialized,
    Ready,
}

#[derive(Debug, Clone)]
enum Mutation {
    Add {
        mashup_id: String,
        test_id: String,
        results: Value,
    },
    Delete {
        mashup_id: String,
        test_id: String,
    },
    ClearAll,
    ClearMashup {
        mashup_id: String,
    },
}

struct HookState {
    phase: Phase,
    /// False once the store failed to open: the index is all there is.
    durable: bool,
    index: HashMap<String, Vec<TestRecord>>,
    pending: Vec<Mutation>,
}

pub struct MashupTests {
    store: Arc<TestResultStore>,
    state: Mutex<HookState>,
    /// Serializes store writes with their index patch.
    mutations: tokio::sync::Mutex<()>,
}

impl MashupTests {
    pub fn new(store: Arc<TestResultStore>) -> Self {
        Self {
            store,
            state: Mutex::new(HookState {
                phase: Phase::Uninitialized,
                durable: false,
                index: HashMap::new(),
                pending: Vec::new(),
            }),
            mutations: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<TestResultStore> {
        &self.store
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Whether mutations reach the durable store.
    pub fn is_durable(&self) -> bool {
        self.state().durable
    }

    /// Open the store, load every record into the index, then flush queued
    /// mutations. A store that cannot open leaves the hook usable in memory.
    /// Calling this again once ready does nothing.
    pub async fn start(&self) {
        let _writer = self.mutations.lock().await;
        if self.phase() == Phase::Ready {
            return;
        }

        let durable = match self.store.initialize().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("test history will not persist: {e}");
                false
            }
        };
        {
            let mut state = self.state();
            state.durable = durable;
            state.phase = Phase::Initialized;
        }

        let loaded = if durable {
            match self.store.get_all_tests().await {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!("failed to load test history: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let pending = {
            let mut state = self.state();
            state.index = group_by_mashup(loaded);
            state.phase = Phase::Ready;
            std::mem::take(&mut state.pending)
        };
        tracing::info!(
            mashups = self.mashup_ids().len(),
            queued = pending.len(),
            durable,
            "test history ready"
        );

        for mutation in pending {
            if let Err(e) = self.apply(mutation).await {
                tracing::error!("queued test history change failed: {e}");
            }
        }
    }

    pub async fn add_test(
        &self,
        mashup_id: &str,
        test_id: &str,
        results: Value,
    ) -> Result<(), StatusError> {
        require_id("mashup id", mashup_id)?;
        require_id("test id", test_id)?;
        self.submit(Mutation::Add {
            mashup_id: mashup_id.to_string(),
            test_id: test_id.to_string(),
            results,
        })
        .await
    }

    pub async fn delete_test(&self, mashup_id: &str, test_id: &str) -> Result<(), StatusError> {
        require_id("mashup id", mashup_id)?;
        require_id("test id", test_id)?;
        self.submit(Mutation::Delete {
            mashup_id: mashup_id.to_string(),
            test_id: test_id.to_string(),
        })
        .await
    }

    pub async fn clear_all_tests(&self) -> Result<(), StatusError> {
        self.submit(Mutation::ClearAll).await
    }

    pub async fn clear_tests_for_mashup(&self, mashup_id: &str) -> Result<(), StatusError> {
        require_id("mashup id", mashup_id)?;
        self.submit(Mutation::ClearMashup {
            mashup_id: mashup_id.to_string(),
        })
        .await
    }

    /// Re-read one mashup from the store and replace its group in the index.
    /// Falls back to the in-memory group when the store cannot answer.
    pub async fn get_tests_for_mashup(&self, mashup_id: &str) -> Vec<TestRecord> {
        let _writer = self.mutations.lock().await;
        if !self.reads_durable() {
            return self.get_tests_for_mashup_sync(mashup_id);
        }

        match self.store.get_tests_for_mashup(mashup_id).await {
            Ok(fresh) => {
                let mut state = self.state();
                if fresh.is_empty() {
                    state.index.remove(mashup_id);
                } else {
                    state.index.insert(mashup_id.to_string(), fresh.clone());
                }
                fresh
            }
            Err(e) => {
                tracing::error!(mashup_id, "failed to reload tests, serving cached: {e}");
                self.get_tests_for_mashup_sync(mashup_id)
            }
        }
    }

    /// Current in-memory group, without touching the store.
    pub fn get_tests_for_mashup_sync(&self, mashup_id: &str) -> Vec<TestRecord> {
        self.state()
            .index
            .get(mashup_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mashup_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a mashup test on the flow backend and record its outcome.
    ///
    /// The execution is returned even if recording it fails; the failure is logged.
    pub async fn run_test<T: Transport>(
        &self,
        service: &MashupService<'_, T>,
        mashup_id: &str,
        input: &Value,
    ) -> Result<TestExecution, StatusError> {
        require_id("mashup id", mashup_id)?;
        let execution = service.execute_test(mashup_id, input).await?;
        if let Err(e) = self
            .add_test(
                mashup_id,
                &execution.computation_group_id,
                execution.results.clone(),
            )
            .await
        {
            tracing::warn!(mashup_id, "test ran but was not recorded: {e}");
        }
        Ok(execution)
    }

    async fn submit(&self, mutation: Mutation) -> Result<(), StatusError> {
        let _writer = self.mutations.lock().await;
        {
            let mut state = self.state();
            if state.phase != Phase::Ready {
                tracing::debug!(?mutation, "test history not ready, queueing change");
                state.pending.push(mutation);
                return Ok(());
            }
        }
        self.apply(mutation).await
    }

    /// Write through to the store, then patch the index. A failed write leaves
    /// the index untouched.
    async fn apply(&self, mutation: Mutation) -> Result<(), StatusError> {
        let durable = self.state().durable;
        match mutation {
            Mutation::Add {
                mashup_id,
                test_id,
                results,
            } => {
                let record = if durable {
                    self.store
                        .put_test(&mashup_id, &test_id, results)
                        .await
                        .inspect_err(|e| {
                            tracing::error!(%mashup_id, %test_id, "failed to save test: {e}")
                        })?
                } else {
                    TestRecord::stamped(mashup_id, test_id, results)
                };
                insert_newest(&mut self.state().index, record);
            }
            Mutation::Delete { mashup_id, test_id } => {
                if durable {
                    self.store.delete_test(&test_id).await.inspect_err(|e| {
                        tracing::error!(%mashup_id, %test_id, "failed to delete test: {e}")
                    })?;
                }
                // The store deletes by id alone, so the index does too.
                remove_test(&mut self.state().index, &test_id);
            }
            Mutation::ClearAll => {
                if durable {
                    self.store
                        .clear_all()
                        .await
                        .inspect_err(|e| tracing::error!("failed to clear test history: {e}"))?;
                }
                self.state().index.clear();
            }
            Mutation::ClearMashup { mashup_id } => {
                if durable {
                    let deleted = self
                        .store
                        .delete_all_for_mashup(&mashup_id)
                        .await
                        .inspect_err(|e| {
                            tracing::error!(%mashup_id, "failed to clear mashup tests: {e}")
                        })?;
                    tracing::debug!(%mashup_id, deleted, "mashup tests cleared");
                }
                self.state().index.remove(&mashup_id);
            }
        }
        Ok(())
    }

    fn reads_durable(&self) -> bool {
        let state = self.state();
        state.durable && state.phase == Phase::Ready
    }

    fn state(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Group records by mashup, each group newest first. Equal timestamps keep
/// their incoming order.
fn group_by_mashup(records: Vec<TestRecord>) -> HashMap<String, Vec<TestRecord>> {
    let mut index: HashMap<String, Vec<TestRecord>> = HashMap::new();
    for record in records {
        index.entry(record.mashup_id.clone()).or_default().push(record);
    }
    for group in index.values_mut() {
        group.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
    index
}

/// Drop every copy of `test_id`, removing groups left empty.
fn remove_test(index: &mut HashMap<String, Vec<TestRecord>>, test_id: &str) {
    index.retain(|_, group| {
        group.retain(|existing| existing.id != test_id);
        !group.is_empty()
    });
}

/// Place `record` in its group at its newest-first position, after dropping
/// any older copy of the same test id from every group (ids are unique across
/// the store). It goes ahead of records with an equal timestamp, as a later
/// write does on reload.
fn insert_newest(index: &mut HashMap<String, Vec<TestRecord>>, record: TestRecord) {
    remove_test(index, &record.id);
    let group = index.entry(record.mashup_id.clone()).or_default();
    let position = group
        .iter()
        .position(|existing| existing.timestamp <= record.timestamp)
        .unwrap_or(group.len());
    group.insert(position, record);
}
