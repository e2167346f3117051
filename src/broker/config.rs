//! Broker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a channel waits for its camera to start sending
pub const STREAM_SOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a pending fetch waits for the upstream answer
pub const VIDEO_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the finished-fetch sweep
pub const GARB_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest a single chunk write to one viewer may take
pub const VIEWER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the dead-client sweep
pub const CLIENT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Client id of the internal relay agent, always present in the roster
pub const DEFAULT_RELAY_CLIENT_ID: &str = "relay";

/// When a stream request for an unknown camera may query the roster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RosterRefresh {
    /// Query on every miss
    #[default]
    EveryMiss,
    /// Query at most once per interval; misses in between are dropped
    AtMostEvery {
        #[serde(with = "duration_ms", rename = "interval_ms")]
        interval: Duration,
    },
}

/// Configuration shared by the brokers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Wait for a stream source before giving up on the viewers
    #[serde(with = "duration_ms", rename = "stream_source_timeout_ms")]
    pub stream_source_timeout: Duration,

    /// A viewer that takes longer to accept one chunk is dropped
    #[serde(with = "duration_ms", rename = "viewer_write_timeout_ms")]
    pub viewer_write_timeout: Duration,

    /// Wait for an upstream fetch result before answering `timeout_error`
    #[serde(with = "duration_ms", rename = "video_request_timeout_ms")]
    pub video_request_timeout: Duration,

    /// Sweep interval for finished fetches
    #[serde(with = "duration_ms", rename = "gc_interval_ms")]
    pub gc_interval: Duration,

    /// Sweep interval for clients flagged dead
    #[serde(with = "duration_ms", rename = "client_sweep_interval_ms")]
    pub client_sweep_interval: Duration,

    /// Roster query policy on a camera cache miss
    pub roster_refresh: RosterRefresh,

    /// Client id that receives signals with no better address
    pub relay_client_id: String,

    /// Client ids seeded into the signal roster at startup
    pub known_clients: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stream_source_timeout: STREAM_SOURCE_TIMEOUT,
            viewer_write_timeout: VIEWER_WRITE_TIMEOUT,
            video_request_timeout: VIDEO_REQUEST_TIMEOUT,
            gc_interval: GARB_COLLECTOR_TIMEOUT,
            client_sweep_interval: CLIENT_SWEEP_INTERVAL,
            roster_refresh: RosterRefresh::default(),
            relay_client_id: DEFAULT_RELAY_CLIENT_ID.to_string(),
            known_clients: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Set the stream source timeout
    pub fn stream_source_timeout(mut self, timeout: Duration) -> Self {
        self.stream_source_timeout = timeout;
        self
    }

    /// Set the per-chunk viewer write timeout
    pub fn viewer_write_timeout(mut self, timeout: Duration) -> Self {
        self.viewer_write_timeout = timeout;
        self
    }

    /// Set the fetch timeout
    pub fn video_request_timeout(mut self, timeout: Duration) -> Self {
        self.video_request_timeout = timeout;
        self
    }

    /// Set the finished-fetch sweep interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the dead-client sweep interval
    pub fn client_sweep_interval(mut self, interval: Duration) -> Self {
        self.client_sweep_interval = interval;
        self
    }

    /// Set the roster refresh policy
    pub fn roster_refresh(mut self, policy: RosterRefresh) -> Self {
        self.roster_refresh = policy;
        self
    }

    /// Set the relay client id
    pub fn relay_client_id(mut self, id: impl Into<String>) -> Self {
        self.relay_client_id = id.into();
        self
    }

    /// Add a client id to the startup roster
    pub fn known_client(mut self, id: impl Into<String>) -> Self {
        self.known_clients.push(id.into());
        self
    }

    /// Every client id to seed, relay first, without duplicates
    pub fn seeded_clients(&self) -> Vec<String> {
        let mut ids = vec![self.relay_client_id.clone()];
        for id in &self.known_clients {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// Durations as integer milliseconds in config files
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
