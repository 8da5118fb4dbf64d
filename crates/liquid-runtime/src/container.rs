//! Pooled container handle.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Idle,
    Busy,
    Terminating,
}

/// A running container owned by the pool.
///
/// The pool hands containers out in the `Busy` state; callers give them
/// back with `ContainerPool::release`.
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    endpoint_id: String,
    state: ContainerState,
    created_at: Instant,
    last_used_at: Instant,
    faulty: bool,
}

impl Container {
    pub(crate) fn new(id: String, endpoint_id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint_id,
            state: ContainerState::Idle,
            created_at: now,
            last_used_at: now,
            faulty: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub fn is_faulty(&self) -> bool {
        self.faulty
    }

    /// Destroy this container on release instead of pooling it.
    pub fn mark_faulty(&mut self) {
        self.faulty = true;
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        self.state = state;
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}
