//! Clustering, fingerprinting and deduplication for map-pinned photo notes.

pub mod config;
pub mod core;
pub mod models;
