//! Replica clients, per-store connection management and the store registry.

mod builder;
mod client;
mod factory;
mod manager;

pub use builder::{normalize_endpoint, ConnectionString};
pub use client::{ReplicaClient, ReplicaError};
pub use factory::ReplicaClientFactory;
pub use manager::ConnectionManager;
