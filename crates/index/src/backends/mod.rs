//! Concrete [`IndexBackend`](crate::backend::IndexBackend) implementations.

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
