//! Simulated REST polling service backed by JSON fixtures.

use async_trait::async_trait;
use cargotrack_env::{EntityId, EnvError, TrackingService};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default, Clone)]
struct Fixture {
    detail: Option<Vec<u8>>,
    progress: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ServiceState {
    fixtures: HashMap<EntityId, Fixture>,

    /// Entities whose requests wait for `release`
    held: HashSet<EntityId>,

    /// Entities the viewer may not read
    forbidden: HashSet<EntityId>,

    /// Requests left to fail with a transient error
    fail_next: u32,

    requests: u64,
}

/// Fixture-driven implementation of the tracking endpoints.
///
/// An entity without fixtures answers `NotFound`. Held entities park every
/// request until released, which is how scenarios force a poll to land
/// after the selection moved on.
#[derive(Default)]
pub struct SimTrackingService {
    state: Mutex<ServiceState>,
    released: Notify,
}

impl SimTrackingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_detail(&self, entity: &EntityId, body: Vec<u8>) {
        self.lock().fixtures.entry(entity.clone()).or_default().detail = Some(body);
    }

    pub fn set_progress(&self, entity: &EntityId, body: Vec<u8>) {
        self.lock().fixtures.entry(entity.clone()).or_default().progress = Some(body);
    }

    /// Removes every fixture for `entity`; further requests answer `NotFound`.
    pub fn remove(&self, entity: &EntityId) {
        self.lock().fixtures.remove(entity);
    }

    pub fn forbid(&self, entity: &EntityId) {
        self.lock().forbidden.insert(entity.clone());
    }

    pub fn hold(&self, entity: &EntityId) {
        self.lock().held.insert(entity.clone());
    }

    pub fn release(&self, entity: &EntityId) {
        self.lock().held.remove(entity);
        self.released.notify_waiters();
    }

    pub fn is_held(&self, entity: &EntityId) -> bool {
        self.lock().held.contains(entity)
    }

    /// Makes the next `count` requests fail with a transient network error.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn requests(&self) -> u64 {
        self.lock().requests
    }

    async fn wait_released(&self, entity: &EntityId) {
        loop {
            let notified = self.released.notified();
            if !self.is_held(entity) {
                return;
            }
            notified.await;
        }
    }

    async fn respond(&self, entity: &EntityId, pick: fn(&Fixture) -> Option<Vec<u8>>) -> Result<Vec<u8>, EnvError> {
        self.wait_released(entity).await;

        let mut state = self.lock();
        state.requests += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EnvError::network("connection reset"));
        }
        if state.forbidden.contains(entity) {
            return Err(EnvError::Forbidden(entity.to_string()));
        }
        state
            .fixtures
            .get(entity)
            .and_then(pick)
            .ok_or_else(|| EnvError::not_found(entity))
    }
}

#[async_trait]
impl TrackingService for SimTrackingService {
    async fn fetch_tracking_detail(&self, entity: &EntityId) -> Result<Vec<u8>, EnvError> {
        self.respond(entity, |f| f.detail.clone()).await
    }

    async fn fetch_route_progress(&self, entity: &EntityId) -> Result<Vec<u8>, EnvError> {
        self.respond(entity, |f| f.progress.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> EntityId {
        EntityId::from(s)
    }

    #[tokio::test]
    async fn test_fixtures_and_not_found() {
        let service = SimTrackingService::new();
        service.set_detail(&id("A"), b"{}".to_vec());

        assert_eq!(service.fetch_tracking_detail(&id("A")).await.unwrap(), b"{}".to_vec());
        assert!(service.fetch_route_progress(&id("A")).await.unwrap_err().is_unrecoverable());
        assert_eq!(
            service.fetch_tracking_detail(&id("B")).await,
            Err(EnvError::not_found("B"))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_then_recovery() {
        let service = SimTrackingService::new();
        service.set_detail(&id("A"), b"{}".to_vec());
        service.fail_next(1);

        let err = service.fetch_tracking_detail(&id("A")).await.unwrap_err();
        assert!(!err.is_unrecoverable());
        assert!(service.fetch_tracking_detail(&id("A")).await.is_ok());
        assert_eq!(service.requests(), 2);
    }

    #[tokio::test]
    async fn test_held_request_completes_after_release() {
        let service = Arc::new(SimTrackingService::new());
        service.set_detail(&id("A"), b"{}".to_vec());
        service.hold(&id("A"));

        let pending = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.fetch_tracking_detail(&id("A")).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        service.release(&id("A"));
        assert!(pending.await.unwrap().is_ok());
    }
}
