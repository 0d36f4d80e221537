//! User resource accessors (spec 3 UserResource, spec 4.1).

use sqlx::Row;

use crate::types::UserResource;

use super::{Store, StoreError};

fn resource_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UserResource, StoreError> {
    let extras_raw: String = row.try_get("extras")?;
    let extras: serde_json::Value = serde_json::from_str(&extras_raw)?;
    Ok(UserResource {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        resource_type: row.try_get("resource_type")?,
        name: row.try_get("name")?,
        path_or_url: row.try_get("path_or_url")?,
        permissions: row.try_get("permissions")?,
        extras,
    })
}

/// Fields accepted by [`Store::upsert_resource`].
#[derive(Debug, Clone)]
pub struct NewResource {
    /// Owning user.
    pub user_id: i64,
    /// Resource kind (e.g. "calendar", "folder", "reminders").
    pub resource_type: String,
    /// Display name, unique per (user, resource_type).
    pub name: String,
    /// Filesystem path or URL.
    pub path_or_url: String,
    /// Permission string (e.g. "read", "read_write").
    pub permissions: String,
    /// Arbitrary key-value extras.
    pub extras: serde_json::Value,
}

impl Store {
    /// Insert or replace a user resource, keyed by (user_id, resource_type, name).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    pub async fn upsert_resource(&self, resource: NewResource) -> Result<i64, StoreError> {
        let extras = serde_json::to_string(&resource.extras)?;
        let id: i64 = sqlx::query(
            r"
            INSERT INTO user_resources (user_id, resource_type, name, path_or_url, permissions, extras)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, resource_type, name)
            DO UPDATE SET path_or_url = excluded.path_or_url,
                          permissions = excluded.permissions,
                          extras = excluded.extras
            RETURNING id
            ",
        )
        .bind(resource.user_id)
        .bind(&resource.resource_type)
        .bind(&resource.name)
        .bind(&resource.path_or_url)
        .bind(&resource.permissions)
        .bind(extras)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("id")?;
        Ok(id)
    }

    /// List resources for a user, optionally filtered by type.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn list_resources(
        &self,
        user_id: i64,
        resource_type: Option<&str>,
    ) -> Result<Vec<UserResource>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM user_resources
            WHERE user_id = ?1 AND (?2 IS NULL OR resource_type = ?2)
            ORDER BY resource_type, name
            ",
        )
        .bind(user_id)
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(resource_from_row).collect()
    }
}
