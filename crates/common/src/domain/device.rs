use crate::domain::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Shared secret a device signs its submissions with.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCredential {
    pub device_id: String,
    pub shared_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Offline,
    Online,
}

/// Registry view of a device, without its secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub state: DeviceState,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Collaborator owning device credentials.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Shared secret for `device_id`, or `None` when the device is unknown.
    async fn resolve_secret(&self, device_id: &str) -> DomainResult<Option<String>>;

    /// Record that the device just delivered telemetry.
    async fn mark_seen(&self, device_id: &str) -> DomainResult<()>;

    async fn list_devices(&self) -> DomainResult<Vec<DeviceStatus>>;
}
