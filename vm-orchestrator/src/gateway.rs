//! Remote-access gateway connection table.
//!
//! Connections are provisioned by the gateway itself and named
//! `{machine_id}_{protocol}`. This side only rewrites the `port` parameter and
//! reads who is connected.

use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

const PORT_PARAMETER: &str = "port";

pub fn connection_name(machine_id: Uuid, protocol: &str) -> String {
    format!("{}_{}", machine_id, protocol)
}

#[derive(Debug, Clone)]
pub struct GatewayStore {
    pool: SqlitePool,
    datasource: String,
    base_url: String,
}

impl GatewayStore {
    pub fn new(
        pool: SqlitePool,
        datasource: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            datasource: datasource.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn connection_id(&self, machine_id: Uuid, protocol: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar(
            "SELECT connection_id FROM gateway_connection WHERE connection_name = ?",
        )
        .bind(connection_name(machine_id, protocol))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Writes the port parameter in its own transaction. Returns whether a
    /// connection was updated; a machine without a gateway connection is not
    /// an error.
    pub async fn set_port(&self, machine_id: Uuid, protocol: &str, port: u16) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE gateway_connection_parameter SET parameter_value = ?
             WHERE parameter_name = ?
               AND connection_id IN (
                   SELECT connection_id FROM gateway_connection WHERE connection_name = ?
               )",
        )
        .bind(port.to_string())
        .bind(PORT_PARAMETER)
        .bind(connection_name(machine_id, protocol))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if updated == 0 {
            warn!(machine_id = %machine_id, protocol, "No gateway connection to update");
        } else {
            debug!(machine_id = %machine_id, protocol, port, "Updated gateway port");
        }
        Ok(updated > 0)
    }

    pub async fn port(&self, machine_id: Uuid, protocol: &str) -> Result<Option<u16>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT p.parameter_value FROM gateway_connection_parameter p
             JOIN gateway_connection c ON c.connection_id = p.connection_id
             WHERE c.connection_name = ? AND p.parameter_name = ?",
        )
        .bind(connection_name(machine_id, protocol))
        .bind(PORT_PARAMETER)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Client URL of the machine's connection, if the gateway has one.
    pub async fn connection_url(&self, machine_id: Uuid, protocol: &str) -> Result<Option<String>> {
        Ok(self
            .connection_id(machine_id, protocol)
            .await?
            .map(|id| self.client_url(id)))
    }

    pub fn client_url(&self, connection_id: i64) -> String {
        let identifier = format!("{}\0c\0{}", connection_id, self.datasource);
        format!("{}/#/client/{}", self.base_url, STANDARD.encode(identifier))
    }

    pub async fn active_users(&self, machine_id: Uuid, protocol: &str) -> Result<Vec<String>> {
        let users = sqlx::query_scalar(
            "SELECT DISTINCT a.username FROM gateway_active_connection a
             JOIN gateway_connection c ON c.connection_id = a.connection_id
             WHERE c.connection_name = ?
             ORDER BY a.username",
        )
        .bind(connection_name(machine_id, protocol))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_url_encodes_identifier_and_datasource() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let gateway = GatewayStore::new(pool, "postgresql", "https://gw.example/guacamole/");

        let url = gateway.client_url(42);

        assert_eq!(
            url,
            format!(
                "https://gw.example/guacamole/#/client/{}",
                STANDARD.encode("42\0c\0postgresql")
            )
        );
    }

    #[test]
    fn connection_names_join_machine_and_protocol() {
        let id = Uuid::nil();
        assert_eq!(connection_name(id, "vnc"), "00000000-0000-0000-0000-000000000000_vnc");
    }
}
