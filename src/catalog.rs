//! Catalog store (component C): `__Indexes` and `__Keys` tables plus the
//! per-index row tables the indexer populates. Grounded on the MySQL pool
//! idiom used for the UCSC track service, generalized from a read-only
//! reference database to a read-write catalog with schema evolution.

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::config::Config;
use crate::err::{BioIndexError, Result};
use crate::schema::Schema;

/// Catalog record for one registered index. Arity (key segments + optional
/// locus) plus `name` are jointly unique, so the same name may cover several
/// arities.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Index {
    pub id: i64,
    pub name: String,
    pub table: String,
    pub prefix: String,
    pub schema: String,
    pub built: bool,
    pub compressed: bool,
}

impl Index {
    pub fn parsed_schema(&self) -> Result<Schema> {
        Schema::parse(&self.schema)
    }

    pub fn arity(&self) -> usize {
        self.parsed_schema().map(|s| s.arity()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Key {
    pub id: i64,
    pub index_id: i64,
    pub key: String,
    pub version: String,
    pub built: Option<bool>,
}

/// Opens a `MySqlPool` against the bio schema, reading connection settings
/// from the environment the way `Config::load` does for the server.
pub async fn pool_from_env() -> Result<MySqlPool> {
    let config = Config::load(&crate::config::NoopSecretsBootstrap)
        .await
        .map_err(BioIndexError::Other)?;
    connect(&config.catalog_url()).await
}

pub async fn connect(url: &str) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Ensures `__Indexes` and `__Keys` exist with the unique constraints the
/// catalog relies on. Idempotent; safe to run on every startup.
pub async fn ensure_schema(pool: &MySqlPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS __Indexes (
            id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            name VARCHAR(200) NOT NULL,
            `table` VARCHAR(200) NOT NULL,
            prefix VARCHAR(500) NOT NULL,
            schema_str VARCHAR(500) NOT NULL,
            arity INT NOT NULL,
            built BOOLEAN NOT NULL DEFAULT FALSE,
            compressed BOOLEAN NOT NULL DEFAULT FALSE,
            UNIQUE KEY name_arity (name, arity)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS __Keys (
            id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            index_id BIGINT NOT NULL,
            `key` VARCHAR(1000) NOT NULL,
            version VARCHAR(64) NOT NULL,
            built BOOLEAN DEFAULT NULL,
            UNIQUE KEY index_key (index_id, `key`)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Upserts by `(name, arity)`, clearing `built` so the next `index` run
/// knows to (re)populate from scratch.
pub async fn create_index(
    pool: &MySqlPool,
    name: &str,
    table: &str,
    prefix: &str,
    schema: &str,
) -> Result<()> {
    let arity = Schema::parse(schema)?.arity() as i64;

    sqlx::query(
        r#"
        INSERT INTO __Indexes (name, `table`, prefix, schema_str, arity, built, compressed)
        VALUES (?, ?, ?, ?, ?, FALSE, FALSE)
        ON DUPLICATE KEY UPDATE
            `table` = VALUES(`table`),
            prefix = VALUES(prefix),
            schema_str = VALUES(schema_str),
            built = FALSE
        "#,
    )
    .bind(name)
    .bind(table)
    .bind(prefix)
    .bind(schema)
    .bind(arity)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn lookup_by_arity(pool: &MySqlPool, name: &str, arity: usize) -> Result<Option<Index>> {
    let row = sqlx::query_as::<_, IndexRow>(
        "SELECT id, name, `table` AS table_, prefix, schema_str, built, compressed \
         FROM __Indexes WHERE name = ? AND arity = ?",
    )
    .bind(name)
    .bind(arity as i64)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(IndexRow::into_index))
}

/// Returns any index matching `name`, preferring the lowest arity when
/// several are registered (matches the CLI's unqualified `all`/`match`).
pub async fn lookup_any(pool: &MySqlPool, name: &str) -> Result<Option<Index>> {
    let row = sqlx::query_as::<_, IndexRow>(
        "SELECT id, name, `table` AS table_, prefix, schema_str, built, compressed \
         FROM __Indexes WHERE name = ? ORDER BY arity ASC LIMIT 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(IndexRow::into_index))
}

pub async fn list_indexes(pool: &MySqlPool, built_only: bool) -> Result<Vec<Index>> {
    let rows = if built_only {
        sqlx::query_as::<_, IndexRow>(
            "SELECT id, name, `table` AS table_, prefix, schema_str, built, compressed \
             FROM __Indexes WHERE built = TRUE ORDER BY name",
        )
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, IndexRow>(
            "SELECT id, name, `table` AS table_, prefix, schema_str, built, compressed \
             FROM __Indexes ORDER BY name",
        )
        .fetch_all(pool)
        .await?
    };

    Ok(rows.into_iter().map(IndexRow::into_index).collect())
}

pub async fn set_built(pool: &MySqlPool, index_id: i64, built: bool) -> Result<()> {
    sqlx::query("UPDATE __Indexes SET built = ? WHERE id = ?")
        .bind(built)
        .bind(index_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_compressed(pool: &MySqlPool, name: &str, prefix: &str, compressed: bool) -> Result<()> {
    sqlx::query("UPDATE __Indexes SET compressed = ? WHERE name = ? AND prefix = ?")
        .bind(compressed)
        .bind(name)
        .bind(prefix)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_keys(pool: &MySqlPool, index_id: i64) -> Result<Vec<Key>> {
    let rows = sqlx::query_as::<_, Key>(
        "SELECT id, index_id, `key`, version, built FROM __Keys WHERE index_id = ?",
    )
    .bind(index_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn upsert_key(pool: &MySqlPool, index_id: i64, key: &str, version: &str) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO __Keys (index_id, `key`, version, built)
        VALUES (?, ?, ?, NULL)
        ON DUPLICATE KEY UPDATE version = VALUES(version), built = NULL
        "#,
    )
    .bind(index_id)
    .bind(key)
    .bind(version)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id FROM __Keys WHERE index_id = ? AND `key` = ?")
        .bind(index_id)
        .bind(key)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<i64, _>("id")?)
}

pub async fn set_key_built(pool: &MySqlPool, key_id: i64, built: bool) -> Result<()> {
    sqlx::query("UPDATE __Keys SET built = ? WHERE id = ?")
        .bind(built)
        .bind(key_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_keys(pool: &MySqlPool, key_ids: &[i64]) -> Result<()> {
    for id in key_ids {
        sqlx::query("DELETE FROM __Keys WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Deletes every IndexRow referencing `key_ids` from an index's own row
/// table. Must run before `delete_keys` drops the `__Keys` rows they
/// foreign-key against, or stale rows are left orphaned in `table`.
pub async fn delete_index_rows(pool: &MySqlPool, table: &str, key_ids: &[i64]) -> Result<()> {
    for id in key_ids {
        sqlx::query(&format!("DELETE FROM {table} WHERE `key` = ?"))
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Raw row shape before the `table_` rename is folded back into `Index`'s
/// `table` field (sqlx's derive can't bind to the reserved word directly).
#[derive(sqlx::FromRow)]
struct IndexRow {
    id: i64,
    name: String,
    table_: String,
    prefix: String,
    schema_str: String,
    built: bool,
    compressed: bool,
}

impl IndexRow {
    fn into_index(self) -> Index {
        Index {
            id: self.id,
            name: self.name,
            table: self.table_,
            prefix: self.prefix,
            schema: self.schema_str,
            built: self.built,
            compressed: self.compressed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arity_from_schema() {
        let index = Index {
            id: 1,
            name: "phenotypes".into(),
            table: "phenotypes_t".into(),
            prefix: "phenotypes/".into(),
            schema: "phenotype,chr:start-end".into(),
            built: true,
            compressed: false,
        };
        assert_eq!(index.arity(), 2);
    }
}
