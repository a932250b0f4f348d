use std::sync::Arc;

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};

use showroom_core::domain::inventory::{
    ensure_read_only, inventory_columns, CarListing, InventoryRow,
};

use super::{InventoryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInventoryRepository {
    pool: DbPool,
    // shared by reads, exclusive for replace_all
    gate: Arc<RwLock<()>>,
}

impl SqlInventoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, gate: Arc::new(RwLock::new(())) }
    }

    pub async fn count(&self) -> Result<i64, RepositoryError> {
        let _shared = self.gate.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM cars").fetch_one(&self.pool).await?;
        row.try_get::<i64, _>("count").map_err(|e| RepositoryError::Decode(e.to_string()))
    }
}

/// Runs `query` on a dedicated connection switched to `query_only` for the
/// duration of the statement. No keyword screening happens here.
///
/// The work runs on its own task that owns the connection and the read guard,
/// so a caller that stops waiting cannot return the connection to the pool
/// while it is still read-only.
async fn run_query_only(
    pool: DbPool,
    shared: OwnedRwLockReadGuard<()>,
    query: String,
) -> Result<Vec<InventoryRow>, RepositoryError> {
    let task = tokio::spawn(async move {
        let _shared = shared;
        let mut conn = pool.acquire().await?;

        sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;
        let result = sqlx::query(&query).fetch_all(&mut *conn).await;
        if sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await.is_err() {
            // never hand a read-only connection back to writers
            conn.close_on_drop();
        }

        let rows = result?;
        debug!(
            event_name = "db.inventory.query_executed",
            row_count = rows.len(),
            "read-only inventory query executed"
        );
        rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()
    });

    task.await.map_err(|e| RepositoryError::Task(e.to_string()))?
}

fn row_to_json(row: &SqliteRow) -> Result<InventoryRow, RepositoryError> {
    let mut object = InventoryRow::new();
    for column in row.columns() {
        let value = column_value(row, column.ordinal())?;
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value, RepositoryError> {
    let raw = row.try_get_raw(index).map_err(|e| RepositoryError::Decode(e.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    // storage class of the value itself, not the declared column type
    let storage = raw.type_info().name().to_ascii_uppercase();
    let decoded = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).map(Value::from),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(Value::from),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| Value::String(format!("<{} bytes>", bytes.len()))),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::String),
    };
    decoded.map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn insert_statement() -> String {
    let columns = inventory_columns();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO cars ({}) VALUES ({placeholders})", columns.join(", "))
}

#[async_trait::async_trait]
impl InventoryRepository for SqlInventoryRepository {
    async fn sample(&self, limit: u32) -> Result<Vec<InventoryRow>, RepositoryError> {
        let _shared = self.gate.read().await;
        let rows = sqlx::query("SELECT * FROM cars ORDER BY RANDOM() LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_json).collect()
    }

    async fn execute_readonly(&self, query: &str) -> Result<Vec<InventoryRow>, RepositoryError> {
        ensure_read_only(query)?;

        let shared = self.gate.clone().read_owned().await;
        run_query_only(self.pool.clone(), shared, query.to_string()).await
    }

    async fn replace_all(&self, listings: Vec<CarListing>) -> Result<(), RepositoryError> {
        let _exclusive = self.gate.write().await;
        let statement = insert_statement();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cars").execute(&mut *tx).await?;

        for listing in &listings {
            let option_codes = serde_json::to_string(&listing.option_codes)
                .map_err(|e| RepositoryError::Decode(e.to_string()))?;

            sqlx::query(&statement)
                .bind(&listing.uuid)
                .bind(&listing.vin)
                .bind(&listing.stock_number)
                .bind(&listing.make)
                .bind(&listing.model)
                .bind(&listing.trim)
                .bind(&listing.model_code)
                .bind(listing.year)
                .bind(listing.model_year)
                .bind(&listing.body_style)
                .bind(&listing.classification)
                .bind(&listing.doors)
                .bind(&listing.drive_line)
                .bind(&listing.transmission)
                .bind(&listing.fuel_type)
                .bind(&listing.normal_fuel_type)
                .bind(&listing.exterior_color)
                .bind(&listing.interior_color)
                .bind(listing.odometer)
                .bind(&listing.new_or_used)
                .bind(listing.certified)
                .bind(&listing.inventory_type)
                .bind(&listing.inventory_date)
                .bind(option_codes)
                .bind(&listing.asking_price)
                .bind(&listing.sale_price)
                .bind(&listing.pricing_internet_price)
                .bind(&listing.pricing_final_price)
                .bind(&listing.link)
                .bind(&listing.account_id)
                .bind(&listing.address_account_name)
                .bind(&listing.address_city)
                .bind(&listing.address_state)
                .bind(&listing.address_country)
                .bind(&listing.address_postal_code)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            event_name = "db.inventory.replaced",
            listing_count = listings.len(),
            "inventory replaced"
        );
        Ok(())
    }
}
