//! Service registry and resolver
//!
//! Liveness-based discovery of agent instances over the shared store.

pub mod cache;
pub mod resolver;
pub mod service;

pub use cache::TtlCache;
pub use resolver::{Endpoint, Resolution, Resolver, SERVICE_ID_TAG};
pub use service::{parse_address, service_key, Registry, RegistryConfig, RegistryEntry};
