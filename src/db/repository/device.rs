use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{Device, RegisterDevice};
use crate::error::{AppError, AppResult};

// ============================================================================
// Device Repository
// ============================================================================

pub struct DeviceRepository;

impl DeviceRepository {
    pub async fn recipient_exists(pool: &SqlitePool, recipient_id: &str) -> AppResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM recipients WHERE id = ?")
            .bind(recipient_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row.is_some())
    }

    pub async fn list_for_recipient(pool: &SqlitePool, recipient_id: &str) -> AppResult<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT
                device_id, recipient_id, provider_user_id, display_name,
                created_at, updated_at
            FROM devices
            WHERE recipient_id = ?
            ORDER BY created_at ASC, device_id ASC
            "#,
        )
        .bind(recipient_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(devices)
    }

    /// Register a device, or refresh its routing handle and name if it already
    /// exists. The recipient row is created on first registration.
    pub async fn upsert(
        pool: &SqlitePool,
        recipient_id: &str,
        device_id: &str,
        device: RegisterDevice,
    ) -> AppResult<Device> {
        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        sqlx::query("INSERT INTO recipients (id, created_at) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(recipient_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        let row = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (
                recipient_id, device_id, provider_user_id, display_name, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(recipient_id, device_id) DO UPDATE SET
                provider_user_id = excluded.provider_user_id,
                display_name = excluded.display_name,
                updated_at = excluded.updated_at
            RETURNING
                device_id, recipient_id, provider_user_id, display_name,
                created_at, updated_at
            "#,
        )
        .bind(recipient_id)
        .bind(device_id)
        .bind(device.provider_user_id)
        .bind(device.display_name)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        Ok(row)
    }

    /// Delete a single device. Returns whether a row was removed; deleting a
    /// device that is already gone is not an error.
    pub async fn delete(pool: &SqlitePool, recipient_id: &str, device_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE recipient_id = ? AND device_id = ?")
            .bind(recipient_id)
            .bind(device_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
