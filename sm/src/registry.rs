//! SubscriptionRegistry - who wants to hear about which keys and channels
//!
//! Subscriptions are kept in registration order so that fan-out order is
//! reproducible. The registry has its own lock, independent of the store's,
//! so registration never contends with a merge.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::value::{ChannelEvent, StatusKey, StatusMap};

/// Callback receiving a subscriber's projection of the store
pub type StatusCallback = Arc<dyn Fn(&StatusMap) -> eyre::Result<()> + Send + Sync>;

/// Callback receiving one channel event
pub type ChannelCallback = Arc<dyn Fn(&ChannelEvent) -> eyre::Result<()> + Send + Sync>;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Subscription '{0}' has an empty interest set")]
    EmptyInterest(String),

    #[error("Channel subscription '{0}' names no channels")]
    EmptyChannels(String),

    #[error("Subscription registry lock poisoned")]
    Poisoned,
}

/// Interest in a fixed set of status keys
#[derive(Clone)]
pub struct StatusSubscription {
    pub id: String,
    pub keys: BTreeSet<StatusKey>,
    pub callback: StatusCallback,
}

impl fmt::Debug for StatusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSubscription")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Interest in a set of named channels
#[derive(Clone)]
pub struct ChannelSubscription {
    pub id: String,
    pub channels: BTreeSet<String>,
    pub callback: ChannelCallback,
}

impl fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("id", &self.id)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    status: Vec<StatusSubscription>,
    channel: Vec<ChannelSubscription>,
}

/// Shared, cloneable registry of status and channel subscriptions
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// Split a comma-separated channel list, dropping blanks
pub fn parse_channel_list(channels: &str) -> BTreeSet<String> {
    channels
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in `keys` under `id`
    ///
    /// An existing subscription with the same id is replaced in place and
    /// keeps its position in registration order.
    pub fn register<I, K>(
        &self,
        id: &str,
        keys: I,
        callback: StatusCallback,
    ) -> Result<BTreeSet<StatusKey>, RegistryError>
    where
        I: IntoIterator<Item = K>,
        K: Into<StatusKey>,
    {
        let keys: BTreeSet<StatusKey> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(RegistryError::EmptyInterest(id.to_string()));
        }

        let sub = StatusSubscription {
            id: id.to_string(),
            keys: keys.clone(),
            callback,
        };

        let mut inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        match inner.status.iter_mut().find(|s| s.id == id) {
            Some(existing) => {
                debug!(subscriber = %id, keys = keys.len(), "SubscriptionRegistry::register: replacing");
                *existing = sub;
            }
            None => {
                debug!(subscriber = %id, keys = keys.len(), "SubscriptionRegistry::register: adding");
                inner.status.push(sub);
            }
        }
        Ok(keys)
    }

    /// Record interest in `channels` under `id`
    pub fn register_channel<I, C>(&self, id: &str, channels: I, callback: ChannelCallback) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let channels: BTreeSet<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            return Err(RegistryError::EmptyChannels(id.to_string()));
        }

        let sub = ChannelSubscription {
            id: id.to_string(),
            channels,
            callback,
        };

        let mut inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        match inner.channel.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = sub,
            None => inner.channel.push(sub),
        }
        debug!(subscriber = %id, "SubscriptionRegistry::register_channel: done");
        Ok(())
    }

    /// Drop every subscription held under `id`; true if anything was removed
    pub fn unregister(&self, id: &str) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        let before = inner.status.len() + inner.channel.len();
        inner.status.retain(|s| s.id != id);
        inner.channel.retain(|s| s.id != id);
        let removed = before != inner.status.len() + inner.channel.len();
        debug!(subscriber = %id, removed, "SubscriptionRegistry::unregister");
        Ok(removed)
    }

    /// Status subscriptions whose interest set overlaps `batch_keys`, in
    /// registration order
    pub fn affected<I>(&self, batch_keys: I) -> Result<Vec<StatusSubscription>, RegistryError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let batch_keys: HashSet<String> = batch_keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        let inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner
            .status
            .iter()
            .filter(|s| s.keys.iter().any(|k| batch_keys.contains(k)))
            .cloned()
            .collect())
    }

    /// Channel subscriptions naming `channel`, in registration order
    pub fn affected_channels(&self, channel: &str) -> Result<Vec<ChannelSubscription>, RegistryError> {
        let inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner
            .channel
            .iter()
            .filter(|s| s.channels.contains(channel))
            .cloned()
            .collect())
    }

    /// Union of every registered channel name
    pub fn channels(&self) -> Result<BTreeSet<String>, RegistryError> {
        let inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner.channel.iter().flat_map(|s| s.channels.iter().cloned()).collect())
    }

    /// Ids of status subscriptions in registration order
    pub fn ids(&self) -> Result<Vec<String>, RegistryError> {
        let inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner.status.iter().map(|s| s.id.clone()).collect())
    }

    /// Number of status plus channel subscriptions
    pub fn len(&self) -> Result<usize, RegistryError> {
        let inner = self.inner.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(inner.status.len() + inner.channel.len())
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len()? == 0)
    }

    /// Poison the lock the way a panicking callback holder would
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let inner = self.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.lock();
            panic!("thread panicked while holding the registry lock");
        })
        .join();
    }
}
