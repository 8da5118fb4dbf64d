//! liquid-scheduler: where new containers go.
//!
//! Keeps one [`EndpointState`] per Docker endpoint (the implicit `local`
//! daemon plus configured remotes), tracks capacity, health, and
//! latency, and picks an endpoint for each new container.
//!
//! ```text
//! Scheduler
//!   ├── RwLock<HashMap<id, EndpointState>>
//!   ├── filter: placement kind, enabled, healthy, capacity, affinity
//!   └── weighted pick (cumulative weights + one draw)
//! ```

pub mod endpoint;
pub mod error;
pub mod scheduler;
pub mod selector;

pub use endpoint::{EndpointState, LATENCY_EMA_ALPHA, UNHEALTHY_THRESHOLD};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerMetrics};
pub use selector::{pick_weighted, placement_weights};
