//! Client configuration.
//!
//! Values come from [`ClientConfig::default`], from the environment via
//! [`ClientConfig::from_env`], or are set explicitly through
//! [`SyncClientBuilder`](crate::SyncClientBuilder).

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::DEFAULT_USER_ID;

pub const ENV_RELAY_URL: &str = "TASKSYNC_RELAY_URL";
pub const ENV_DEVICE_ID: &str = "TASKSYNC_DEVICE_ID";
pub const ENV_USER_ID: &str = "TASKSYNC_USER_ID";
pub const ENV_RECONNECT_SECS: &str = "TASKSYNC_RECONNECT_SECS";

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8082/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub relay_url: String,
    /// Identifies this device on every task it authors.
    pub device_id: String,
    pub user_id: String,
    /// Fixed pause between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            device_id: Uuid::new_v4().to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientConfig {
    /// Read `TASKSYNC_*` variables, falling back to the defaults for anything
    /// unset. An unparsable reconnect delay is logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_RELAY_URL) {
            config.relay_url = url;
        }
        if let Some(device_id) = lookup(ENV_DEVICE_ID) {
            config.device_id = device_id;
        }
        if let Some(user_id) = lookup(ENV_USER_ID) {
            config.user_id = user_id;
        }
        if let Some(secs) = lookup(ENV_RECONNECT_SECS) {
            match secs.parse::<u64>() {
                Ok(secs) => config.reconnect_delay = Duration::from_secs(secs),
                Err(e) => log::warn!("Ignoring {ENV_RECONNECT_SECS}={secs:?}: {e}"),
            }
        }
        config
    }
}
