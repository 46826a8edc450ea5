use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::{Device, DeviceRepository};
use crate::error::{AppError, RegistryError};

/// Lookup and deletion of a recipient's device records.
#[async_trait]
pub trait DeviceRegistry: Send + Sync + 'static {
    /// All devices of `recipient_id`, keyed by device id. Fails with
    /// `NotFound` when the recipient is unknown.
    async fn get_devices(&self, recipient_id: &str) -> Result<HashMap<String, Device>, RegistryError>;

    /// Remove one device. Deleting a device that is already gone succeeds.
    async fn delete_device(&self, recipient_id: &str, device_id: &str) -> Result<(), RegistryError>;
}

/// Device registry backed by the service's SQLite database.
#[derive(Clone)]
pub struct SqliteDeviceRegistry {
    pool: SqlitePool,
}

impl SqliteDeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: AppError) -> RegistryError {
    match e {
        AppError::Database(db) => RegistryError::from(db),
        other => RegistryError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl DeviceRegistry for SqliteDeviceRegistry {
    async fn get_devices(&self, recipient_id: &str) -> Result<HashMap<String, Device>, RegistryError> {
        let devices = DeviceRepository::list_for_recipient(&self.pool, recipient_id)
            .await
            .map_err(unavailable)?;

        if devices.is_empty()
            && !DeviceRepository::recipient_exists(&self.pool, recipient_id)
                .await
                .map_err(unavailable)?
        {
            return Err(RegistryError::NotFound(recipient_id.to_string()));
        }

        Ok(devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect())
    }

    async fn delete_device(&self, recipient_id: &str, device_id: &str) -> Result<(), RegistryError> {
        let removed = DeviceRepository::delete(&self.pool, recipient_id, device_id)
            .await
            .map_err(unavailable)?;

        if !removed {
            tracing::debug!(
                "Device {} of recipient {} was already deleted",
                device_id,
                recipient_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RegisterDevice;
    use crate::test_utils::memory_pool;

    #[tokio::test]
    async fn unknown_recipient_is_not_found_but_empty_recipient_is_not() {
        let pool = memory_pool().await;
        let registry = SqliteDeviceRegistry::new(pool.clone());

        assert!(matches!(
            registry.get_devices("ghost").await,
            Err(RegistryError::NotFound(id)) if id == "ghost"
        ));

        DeviceRepository::upsert(
            &pool,
            "alice",
            "phone",
            RegisterDevice {
                provider_user_id: Some("tok".into()),
                display_name: "Phone".into(),
            },
        )
        .await
        .unwrap();
        registry.delete_device("alice", "phone").await.unwrap();

        let devices = registry.get_devices("alice").await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn devices_are_keyed_by_device_id() {
        let pool = memory_pool().await;
        let registry = SqliteDeviceRegistry::new(pool.clone());

        for (id, token) in [("phone", Some("t1")), ("laptop", None)] {
            DeviceRepository::upsert(
                &pool,
                "alice",
                id,
                RegisterDevice {
                    provider_user_id: token.map(str::to_string),
                    display_name: id.to_uppercase(),
                },
            )
            .await
            .unwrap();
        }

        let devices = registry.get_devices("alice").await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices["phone"].provider_user_id.as_deref(), Some("t1"));
        assert_eq!(devices["laptop"].display_name, "LAPTOP");
    }

    #[tokio::test]
    async fn repeated_delete_does_not_raise() {
        let pool = memory_pool().await;
        let registry = SqliteDeviceRegistry::new(pool);

        registry.delete_device("alice", "phone").await.unwrap();
        registry.delete_device("alice", "phone").await.unwrap();
    }

    #[tokio::test]
    async fn closed_pool_reports_unavailable() {
        let pool = memory_pool().await;
        let registry = SqliteDeviceRegistry::new(pool.clone());
        pool.close().await;

        assert!(matches!(
            registry.get_devices("alice").await,
            Err(RegistryError::Unavailable(_))
        ));
    }
}
