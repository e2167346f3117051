//! External collaborators
//!
//! The brokers never touch durable storage themselves. They ask three narrow
//! questions of the outside world:
//!
//! - [`CameraRoster`]: which cameras are currently active (only on a cache miss)
//! - [`ClientDirectory`]: which client id owns a camera (to address signals)
//! - [`RecordSink`]: store new camera / video records reported by agents
//!
//! [`MemoryDirectory`] implements all three in memory for tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::BrokerError;

/// Source of the active camera list
#[async_trait]
pub trait CameraRoster: Send + Sync {
    async fn active_cameras(&self) -> Result<Vec<String>, BrokerError>;
}

/// Maps a camera to the client id of the agent that owns it
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn client_for_camera(&self, camera_name: &str) -> Result<Option<String>, BrokerError>;
}

/// Receives records announced by camera agents
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn camera_added(
        &self,
        camera_name: &str,
        client_id: Option<&str>,
    ) -> Result<(), BrokerError>;

    async fn video_added(
        &self,
        camera_name: &str,
        video_name: &str,
        video_size: Option<u64>,
    ) -> Result<(), BrokerError>;
}

/// A stored video record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
    pub camera_name: String,
    pub video_name: String,
    pub video_size: Option<u64>,
}

#[derive(Debug, Default)]
struct CameraRecord {
    client_id: Option<String>,
    active: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    cameras: HashMap<String, CameraRecord>,
    videos: Vec<VideoRecord>,
    roster_queries: usize,
}

/// In-memory roster, directory and record store
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    inner: RwLock<MemoryInner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or reactivate a camera owned by `client_id`
    pub async fn add_camera(&self, camera_name: impl Into<String>, client_id: Option<String>) {
        let mut inner = self.inner.write().await;
        let record = inner.cameras.entry(camera_name.into()).or_default();
        record.active = true;
        if client_id.is_some() {
            record.client_id = client_id;
        }
    }

    /// Mark a camera inactive; it keeps its owner
    pub async fn deactivate_camera(&self, camera_name: &str) {
        if let Some(record) = self.inner.write().await.cameras.get_mut(camera_name) {
            record.active = false;
        }
    }

    /// Recorded videos, oldest first
    pub async fn videos(&self) -> Vec<VideoRecord> {
        self.inner.read().await.videos.clone()
    }

    /// How many times the roster was queried
    pub async fn roster_queries(&self) -> usize {
        self.inner.read().await.roster_queries
    }
}

#[async_trait]
impl CameraRoster for MemoryDirectory {
    async fn active_cameras(&self) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.write().await;
        inner.roster_queries += 1;

        let mut names: Vec<String> = inner
            .cameras
            .iter()
            .filter(|(_, record)| record.active)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl ClientDirectory for MemoryDirectory {
    async fn client_for_camera(&self, camera_name: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .inner
            .read()
            .await
            .cameras
            .get(camera_name)
            .and_then(|record| record.client_id.clone()))
    }
}

#[async_trait]
impl RecordSink for MemoryDirectory {
    async fn camera_added(
        &self,
        camera_name: &str,
        client_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.add_camera(camera_name, client_id.map(str::to_owned))
            .await;
        Ok(())
    }

    async fn video_added(
        &self,
        camera_name: &str,
        video_name: &str,
        video_size: Option<u64>,
    ) -> Result<(), BrokerError> {
        self.inner.write().await.videos.push(VideoRecord {
            camera_name: camera_name.to_owned(),
            video_name: video_name.to_owned(),
            video_size,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roster_lists_active_cameras() {
        let directory = MemoryDirectory::new();
        directory.add_camera("cam2", None).await;
        directory.add_camera("cam1", Some("agent-1".into())).await;
        directory.deactivate_camera("cam2").await;

        assert_eq!(directory.active_cameras().await.unwrap(), vec!["cam1"]);
        assert_eq!(directory.roster_queries().await, 1);
    }

    #[tokio::test]
    async fn test_client_for_camera() {
        let directory = MemoryDirectory::new();
        directory.add_camera("cam1", Some("agent-1".into())).await;
        // re-adding without an owner keeps the known owner
        directory.add_camera("cam1", None).await;

        assert_eq!(
            directory.client_for_camera("cam1").await.unwrap(),
            Some("agent-1".to_string())
        );
        assert_eq!(directory.client_for_camera("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_sink() {
        let directory = MemoryDirectory::new();
        directory
            .camera_added("cam9", Some("agent-9"))
            .await
            .unwrap();
        directory
            .video_added("cam9", "V1", Some(1024))
            .await
            .unwrap();

        assert_eq!(directory.active_cameras().await.unwrap(), vec!["cam9"]);
        assert_eq!(
            directory.videos().await,
            vec![VideoRecord {
                camera_name: "cam9".into(),
                video_name: "V1".into(),
                video_size: Some(1024),
            }]
        );
    }
}
