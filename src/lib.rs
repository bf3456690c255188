//! Dockroute - keeps a reverse proxy's routing table in sync with Docker
//!
//! This library:
//! - Resolves each container's environment (`VHOST`, `VHOST_PORT`,
//!   `VHOST_PREFIX` and their indexed/custom variants) into virtual hosts
//! - Publishes those routes to a Hipache-style routing store when a
//!   container starts, and retracts them when it dies
//! - Caches published routes so they can be removed after the container
//!   is gone
//! - Reconciles all running containers on demand

pub mod admin;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod docker;
pub mod error;
pub mod redis;
pub mod resolver;
pub mod store;
pub mod sync;
