//! Template snapshot storage engine.
//!
//! Stores microVM template artifacts as a base object plus a chain of
//! block-level diffs, resolves byte ranges against that chain without
//! materializing full artifacts, and caches hydrated templates with TTL
//! eviction and fetch deduplication.
//!
//! Layout:
//! - [`storage`]: object store trait, in-tree backends, retrying client
//! - [`build`]: diff artifacts, the per-build diff registry, build publishing
//! - [`template`]: templates, overlay readers, the template cache
//! - [`config`]: environment-driven configuration

pub mod build;
pub mod config;
pub mod storage;
pub mod template;

pub use config::StoreConfig;
