//! StatMon - status monitor dispatch core
//!
//! Status batches from an upstream monitor are merged into a shared
//! [`StatusStore`](store::StatusStore). Each subscriber registers an interest
//! set of keys; when a batch touches any of them the subscriber gets one
//! callback carrying its projection of the store. Every callback runs on a
//! single owning context, so subscriber code never needs its own locking.
//!
//! Free-form events on named channels take a parallel path to channel
//! subscribers.

pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod feed;
pub mod registry;
pub mod store;
pub mod value;
pub mod watch;

pub use config::Config;
pub use context::{ContextError, ContextHandle, ContextQueue};
pub use dispatch::{DispatchConfig, DispatchHandle, DispatchMetrics, Dispatcher, StaticSource, StatusSource};
pub use registry::{SubscriptionRegistry, parse_channel_list};
pub use store::StatusStore;
pub use value::{ChannelEvent, Payload, StatusBatch, StatusKey, StatusMap, StatusValue};
