use crate::domain::{
    DeviceCredential, DeviceRegistry, DeviceState, DeviceStatus, DomainError, DomainResult,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

struct DeviceRecord {
    shared_secret: String,
    status: DeviceStatus,
}

/// Device registry held in process memory, seeded at startup.
pub struct InMemoryDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl InMemoryDeviceRegistry {
    pub fn new(credentials: Vec<DeviceCredential>) -> Self {
        let devices = credentials
            .into_iter()
            .map(|credential| {
                let status = DeviceStatus {
                    device_id: credential.device_id.clone(),
                    state: DeviceState::Offline,
                    last_seen: None,
                };
                (
                    credential.device_id,
                    DeviceRecord {
                        shared_secret: credential.shared_secret,
                        status,
                    },
                )
            })
            .collect();

        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Parse `device_id:secret` pairs separated by commas.
    pub fn parse_credentials(spec: &str) -> DomainResult<Vec<DeviceCredential>> {
        spec.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once(':') {
                Some((device_id, secret)) if !device_id.is_empty() && !secret.is_empty() => {
                    Ok(DeviceCredential {
                        device_id: device_id.trim().to_string(),
                        shared_secret: secret.trim().to_string(),
                    })
                }
                _ => Err(DomainError::RepositoryError(anyhow::anyhow!(
                    "invalid device credential entry: {}",
                    pair.split(':').next().unwrap_or_default()
                ))),
            })
            .collect()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn resolve_secret(&self, device_id: &str) -> DomainResult<Option<String>> {
        let devices = self.devices.read().await;
        Ok(devices
            .get(device_id)
            .map(|record| record.shared_secret.clone()))
    }

    async fn mark_seen(&self, device_id: &str) -> DomainResult<()> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(device_id) {
            record.status.last_seen = Some(Utc::now());
            record.status.state = DeviceState::Online;
            debug!(device_id = %device_id, "device marked as seen");
        }
        Ok(())
    }

    async fn list_devices(&self) -> DomainResult<Vec<DeviceStatus>> {
        let devices = self.devices.read().await;
        let mut statuses: Vec<DeviceStatus> =
            devices.values().map(|record| record.status.clone()).collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryDeviceRegistry {
        InMemoryDeviceRegistry::new(vec![
            DeviceCredential {
                device_id: "dev-001".to_string(),
                shared_secret: "secret-001".to_string(),
            },
            DeviceCredential {
                device_id: "dev-002".to_string(),
                shared_secret: "secret-002".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn test_resolve_known_and_unknown() {
        let registry = registry();

        assert_eq!(
            registry.resolve_secret("dev-001").await.unwrap(),
            Some("secret-001".to_string())
        );
        assert_eq!(registry.resolve_secret("dev-999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_seen_updates_status() {
        let registry = registry();

        registry.mark_seen("dev-002").await.unwrap();
        registry.mark_seen("dev-999").await.unwrap();

        let devices = registry.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].state, DeviceState::Offline);
        assert!(devices[0].last_seen.is_none());
        assert_eq!(devices[1].device_id, "dev-002");
        assert_eq!(devices[1].state, DeviceState::Online);
        assert!(devices[1].last_seen.is_some());
    }

    #[test]
    fn test_parse_credentials() {
        let credentials =
            InMemoryDeviceRegistry::parse_credentials(" dev-001:abc , dev-002:def,").unwrap();

        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].device_id, "dev-001");
        assert_eq!(credentials[1].shared_secret, "def");
    }

    #[test]
    fn test_parse_credentials_rejects_missing_secret() {
        let result = InMemoryDeviceRegistry::parse_credentials("dev-001:abc,dev-002");
        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }
}
