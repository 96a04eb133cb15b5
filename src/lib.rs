//! Background declaration index and module graph core for a Kotlin language server.
//!
//! [`session::IndexSession`] ties the pieces together: the module graph is
//! resolved from the project's build system, a scanner feeds the three-lane
//! work queue, and a single worker keeps the SQLite-backed index in step with
//! disk and editor changes while [`query::QueryEngine`] reads concurrently.

pub mod config;
pub mod index;
pub mod indexer;
pub mod project;
pub mod query;
pub mod session;

pub use config::Config;
pub use session::IndexSession;
