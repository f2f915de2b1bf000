//! ClickHouse health checks.

use crate::client::ClickHouseClient;
use engine_core::{Error, Result};
use tracing::{debug, error};

/// Check ClickHouse connection health.
pub async fn check_connection(client: &ClickHouseClient) -> bool {
    match client.inner().query("SELECT 1").fetch_one::<u8>().await {
        Ok(_) => {
            debug!("ClickHouse connection healthy");
            true
        }
        Err(e) => {
            error!("ClickHouse health check failed: {}", e);
            false
        }
    }
}

/// Initialize database schema.
pub async fn init_schema(client: &ClickHouseClient) -> Result<()> {
    use crate::schema::all_tables;

    // The database may not exist yet, so DDL runs without a default database.
    let admin = client.inner().clone().with_database("default");
    for ddl in all_tables(client.database()) {
        admin
            .query(&ddl)
            .execute()
            .await
            .map_err(|e| Error::store(format!("Failed to execute DDL: {}", e)))?;
    }

    debug!(database = %client.database(), "ClickHouse schema initialized");
    Ok(())
}
