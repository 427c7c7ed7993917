//! In-memory server fixture.
//!
//! Behaves like the HTTP API (server clock, precondition checks, optional
//! server-assigned ids) and can be switched offline or told to fail, which
//! makes it the remote used by tests and demos.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{RecordId, RemoteRecord};

use super::{ApiError, RemoteClient, RemoteError, RemoteResult};

#[derive(Debug)]
struct ServerState<T> {
    records: BTreeMap<RecordId, RemoteRecord<T>>,
    clock: i64,
    next_server_id: u64,
    offline: bool,
    assign_ids: bool,
    delta: bool,
    failures: VecDeque<ApiError>,
    calls: Vec<String>,
}

/// Shared in-memory remote; clones see the same server state
#[derive(Debug)]
pub struct InMemoryRemote<T> {
    state: Arc<Mutex<ServerState<T>>>,
}

impl<T> Clone for InMemoryRemote<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for InMemoryRemote<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryRemote<T> {
    /// Empty server whose clock starts at 1000 ms
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                records: BTreeMap::new(),
                clock: 1_000,
                next_server_id: 1,
                offline: false,
                assign_ids: false,
                delta: false,
                failures: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Simulate losing (or regaining) connectivity
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Make the server assign its own ids (`srv-1`, `srv-2`, ...) on create
    #[must_use]
    pub fn with_server_ids(self) -> Self {
        self.state.lock().assign_ids = true;
        self
    }

    /// Honor `since` in `list`
    #[must_use]
    pub fn with_delta(self) -> Self {
        self.state.lock().delta = true;
        self
    }

    /// Fail the next call (of any kind) with `error`
    pub fn fail_next(&self, error: ApiError) {
        self.state.lock().failures.push_back(error);
    }

    /// Server-side edit made by someone else; returns the new version
    pub fn put(&self, id: impl Into<RecordId>, payload: T) -> i64 {
        let mut state = self.state.lock();
        let updated_at = state.tick();
        let id = id.into();
        state.records.insert(
            id.clone(),
            RemoteRecord {
                id,
                payload,
                updated_at,
            },
        );
        updated_at
    }

    /// Server-side delete made by someone else
    pub fn remove(&self, id: &RecordId) {
        self.state.lock().records.remove(id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls received so far, e.g. `["create:abc", "list"]`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

impl<T: Clone> InMemoryRemote<T> {
    pub fn get(&self, id: &RecordId) -> Option<RemoteRecord<T>> {
        self.state.lock().records.get(id).cloned()
    }
}

impl<T> ServerState<T> {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    /// Connectivity and injected-failure checks shared by every call
    fn admit(&mut self, call: String) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::Transport("network unreachable".to_string()));
        }
        self.calls.push(call);
        if let Some(error) = self.failures.pop_front() {
            return Err(RemoteError::Api(error));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> RemoteClient<T> for InMemoryRemote<T> {
    async fn create(&self, client_id: &RecordId, payload: &T) -> RemoteResult<RemoteRecord<T>> {
        let mut state = self.state.lock();
        state.admit(format!("create:{client_id}"))?;

        let id = if state.assign_ids {
            let id = RecordId::from(format!("srv-{}", state.next_server_id));
            state.next_server_id += 1;
            id
        } else {
            client_id.clone()
        };
        let updated_at = state.tick();
        let record = RemoteRecord {
            id: id.clone(),
            payload: payload.clone(),
            updated_at,
        };
        state.records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        id: &RecordId,
        payload: &T,
        base_version: Option<i64>,
    ) -> RemoteResult<RemoteRecord<T>> {
        let mut state = self.state.lock();
        state.admit(format!("update:{id}"))?;

        let current = state
            .records
            .get(id)
            .map(|record| record.updated_at)
            .ok_or_else(|| ApiError::new(404, "not_found", format!("{id} does not exist")))?;
        if base_version.is_some_and(|base| base < current) {
            return Err(ApiError::new(
                412,
                "stale_version",
                format!("{id} was modified at {current}"),
            )
            .into());
        }

        let updated_at = state.tick();
        let record = RemoteRecord {
            id: id.clone(),
            payload: payload.clone(),
            updated_at,
        };
        state.records.insert(id.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &RecordId) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.admit(format!("delete:{id}"))?;
        if state.records.remove(id).is_none() {
            return Err(ApiError::new(404, "not_found", format!("{id} does not exist")).into());
        }
        state.tick();
        Ok(())
    }

    async fn list(&self, since: Option<i64>) -> RemoteResult<Vec<RemoteRecord<T>>> {
        let mut state = self.state.lock();
        state.admit("list".to_string())?;
        let since = if state.delta { since } else { None };
        Ok(state
            .records
            .values()
            .filter(|record| since.is_none_or(|since| record.updated_at > since))
            .cloned()
            .collect())
    }

    fn supports_delta(&self) -> bool {
        self.state.lock().delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_honors_client_id_by_default() {
        let remote = InMemoryRemote::<String>::new();
        let created = remote
            .create(&RecordId::from("c1"), &"hello".to_string())
            .await
            .unwrap();
        assert_eq!(created.id.as_str(), "c1");
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn server_ids_are_assigned_when_enabled() {
        let remote = InMemoryRemote::<String>::new().with_server_ids();
        let created = remote
            .create(&RecordId::from("c1"), &"hello".to_string())
            .await
            .unwrap();
        assert_eq!(created.id.as_str(), "srv-1");
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let remote = InMemoryRemote::<String>::new();
        let base = remote.put("r1", "v1".to_string());
        remote.put("r1", "v2".to_string());

        let error = remote
            .update(&RecordId::from("r1"), &"mine".to_string(), Some(base))
            .await
            .unwrap_err();
        assert!(error.api().unwrap().is_precondition_failed());
    }

    #[tokio::test]
    async fn offline_calls_fail_with_transport_error() {
        let remote = InMemoryRemote::<String>::new();
        remote.set_offline(true);
        assert!(remote.list(None).await.unwrap_err().is_transport());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn list_filters_only_with_delta() {
        let full = InMemoryRemote::<String>::new();
        let first = full.put("a", "1".to_string());
        full.put("b", "2".to_string());
        assert_eq!(full.list(Some(first)).await.unwrap().len(), 2);

        let delta = InMemoryRemote::<String>::new().with_delta();
        let first = delta.put("a", "1".to_string());
        delta.put("b", "2".to_string());
        assert_eq!(delta.list(Some(first)).await.unwrap().len(), 1);
    }
}
