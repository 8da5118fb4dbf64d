//! liquidd: the Liquid container daemon.
//!
//! The binary loads configuration, builds the container subsystem, keeps
//! the pool warm, and serves `/metrics`, `/healthz` and `/endpoints`.

pub mod server;

pub use server::{AppState, HealthReport, build_router};
