//! Dispatcher - merges status batches and fans callbacks out to subscribers
//!
//! Producers publish through a [`DispatchHandle`]; a single [`Dispatcher`]
//! task consumes the inbound queue in arrival order, updates the
//! [`StatusStore`](crate::store::StatusStore) and posts one callback per
//! affected subscription to the owning context.

mod config;
mod core;
mod handle;
mod messages;
mod source;

pub use config::DispatchConfig;
pub use self::core::Dispatcher;
pub use handle::DispatchHandle;
pub use messages::{DispatchMetrics, Inbound};
pub use source::{StaticSource, StatusSource};
