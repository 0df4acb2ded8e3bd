use super::agv::{Agv, AgvId};
use crate::common::{ApplicationError, ApplicationResult, DomainError, DomainResult, StateStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Live state of every AGV, one lock per AGV.
///
/// The set of AGVs is fixed at provisioning; AGVs are never removed, only
/// faulted. Mutations go through [`AgvRegistry::commit`] so that a change is
/// stored before it becomes visible.
pub struct AgvRegistry {
    entries: BTreeMap<AgvId, Arc<Mutex<Agv>>>,
}

impl AgvRegistry {
    pub fn new(agvs: Vec<Agv>) -> Self {
        let entries = agvs
            .into_iter()
            .map(|agv| (agv.id.clone(), Arc::new(Mutex::new(agv))))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &AgvId) -> bool {
        self.entries.contains_key(id)
    }

    pub async fn get(&self, id: &AgvId) -> Option<Agv> {
        match self.entries.get(id) {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    /// Consistent-per-AGV copies in id order.
    pub async fn snapshot(&self) -> Vec<Agv> {
        let mut agvs = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            agvs.push(entry.lock().await.clone());
        }
        agvs
    }

    /// Lock a single AGV. Callers that also lock the task queue must take the
    /// queue first.
    pub async fn lock(&self, id: &AgvId) -> DomainResult<OwnedMutexGuard<Agv>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| DomainError::AgvNotFound { agv_id: id.clone() })?;
        Ok(entry.clone().lock_owned().await)
    }

    /// Apply `mutate` to a copy, persist it, then publish it in memory.
    /// A failed precondition or store write leaves the AGV unchanged.
    pub async fn commit<F>(
        &self,
        id: &AgvId,
        store: &dyn StateStore,
        mutate: F,
    ) -> ApplicationResult<(Agv, Agv)>
    where
        F: FnOnce(&mut Agv) -> DomainResult<()>,
    {
        let mut guard = self.lock(id).await?;
        let before = guard.clone();
        let mut next = before.clone();
        mutate(&mut next)?;
        next.version = before.version + 1;
        next.updated_at = Utc::now();
        store
            .save_agv(&next)
            .await
            .map_err(ApplicationError::StateStore)?;
        *guard = next.clone();
        Ok((before, next))
    }

    /// [`AgvRegistry::commit`] guarded by the version the caller last observed.
    pub async fn compare_and_set<F>(
        &self,
        id: &AgvId,
        expected_version: u64,
        store: &dyn StateStore,
        mutate: F,
    ) -> ApplicationResult<(Agv, Agv)>
    where
        F: FnOnce(&mut Agv) -> DomainResult<()>,
    {
        self.commit(id, store, |agv| {
            if agv.version != expected_version {
                return Err(DomainError::ConcurrencyConflict {
                    entity: format!("agv {}", agv.id),
                    expected: expected_version,
                    actual: agv.version,
                });
            }
            mutate(agv)
        })
        .await
    }
}
