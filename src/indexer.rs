//! Indexer (component D): discovers blobs under an index's prefix,
//! classifies them against the Keys table, ingests new/stale/in-progress
//! keys with bounded concurrency, and finalizes the build.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::MySqlPool;
use tokio::sync::Semaphore;

use crate::blobstore::BlobStore;
use crate::catalog::{self, Index, Key};
use crate::err::{BioIndexError, Result};
use crate::schema::Schema;

const BULK_BATCH: usize = 5000;
const DEADLOCK_RETRIES: u32 = 5;
const DEADLOCK_SLEEP: std::time::Duration = std::time::Duration::from_secs(1);
const MYSQL_DEADLOCK_CODE: &str = "1213";

/// Result of delegating one blob's ingestion to a remote worker.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub key: String,
    pub records_written: u64,
    pub size: u64,
}

/// Delegation hook for remote ingestion (serverless function or batch job).
/// `LocalDispatcher` runs ingestion in-process instead.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, index: &Index, blob_key: &str) -> Result<TaskResult>;
}

pub struct LocalDispatcher;

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, _index: &Index, _blob_key: &str) -> Result<TaskResult> {
        Err(BioIndexError::Other(anyhow::anyhow!(
            "LocalDispatcher does not delegate; use build_index's in-process path"
        )))
    }
}

enum Classification {
    Stale { key: Key },
    Deleted { key: Key },
    New { blob_key: String },
    InProgress { key: Key },
}

/// Runs the indexer algorithm against `name`: discover, classify, prepare,
/// ingest, finalize.
pub async fn build_index(
    pool: &MySqlPool,
    store: &Arc<dyn BlobStore>,
    _dispatcher: &dyn Dispatcher,
    name: &str,
    rebuild: bool,
    workers: usize,
) -> Result<()> {
    let index = catalog::lookup_any(pool, name)
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("no index named {name:?}")))?;

    let objects = discover(store, &index.prefix).await?;
    let existing_keys = catalog::list_keys(pool, index.id).await?;

    let plan = classify(&objects, &existing_keys, rebuild);

    let mut stale_ids = Vec::new();
    let mut to_ingest = Vec::new();
    for item in plan {
        match item {
            Classification::Stale { key } | Classification::Deleted { key } => {
                stale_ids.push(key.id);
            }
            Classification::InProgress { key } => to_ingest.push(key.key),
            Classification::New { blob_key } => to_ingest.push(blob_key),
        }
    }
    if !stale_ids.is_empty() {
        catalog::delete_index_rows(pool, &index.table, &stale_ids).await?;
        catalog::delete_keys(pool, &stale_ids).await?;
    }

    prepare(pool, &index).await?;

    let schema = index.parsed_schema()?;
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = FuturesUnordered::new();

    for blob_key in to_ingest {
        let semaphore = semaphore.clone();
        let pool = pool.clone();
        let store = store.clone();
        let index = index.clone();
        let schema = schema.clone();
        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            ingest_blob(&pool, &store, &index, &schema, &blob_key).await
        });
    }

    while let Some(result) = tasks.next().await {
        result?;
    }

    finalize(pool, &index).await?;
    Ok(())
}

async fn discover(store: &Arc<dyn BlobStore>, prefix: &str) -> Result<Vec<crate::blobstore::ListedObject>> {
    let objects = store.list(prefix).await?;
    let has_json = objects.iter().any(|o| o.key.ends_with(".json"));
    let has_gz = objects.iter().any(|o| o.key.ends_with(".json.gz"));
    if has_json && has_gz {
        return Err(BioIndexError::MixedCompression {
            prefix: prefix.to_string(),
        });
    }
    Ok(objects
        .into_iter()
        .filter(|o| o.key.ends_with(".json") || o.key.ends_with(".json.gz"))
        .collect())
}

fn classify(
    objects: &[crate::blobstore::ListedObject],
    existing_keys: &[Key],
    rebuild: bool,
) -> Vec<Classification> {
    let mut by_key: std::collections::HashMap<&str, &Key> =
        existing_keys.iter().map(|k| (k.key.as_str(), k)).collect();
    let mut plan = Vec::new();

    for object in objects {
        let version = content_hash(&object.etag);
        match by_key.remove(object.key.as_str()) {
            Some(key) if rebuild => plan.push(Classification::Stale { key: key.clone() }),
            Some(key) if key.version != version => plan.push(Classification::Stale { key: key.clone() }),
            Some(key) if key.built.is_none() => plan.push(Classification::InProgress { key: key.clone() }),
            Some(_) => {}
            None => plan.push(Classification::New {
                blob_key: object.key.clone(),
            }),
        }
    }

    for (_, key) in by_key {
        plan.push(Classification::Deleted { key: key.clone() });
    }

    plan
}

/// First 32 characters of the ETag, BioIndex's content-hash convention.
fn content_hash(etag: &str) -> String {
    etag.chars().take(32).collect()
}

async fn prepare(pool: &MySqlPool, index: &Index) -> Result<()> {
    let _ = sqlx::query(&format!("DROP INDEX schema_idx ON {}", index.table))
        .execute(pool)
        .await;
    catalog::set_built(pool, index.id, false).await
}

async fn finalize(pool: &MySqlPool, index: &Index) -> Result<()> {
    let schema = index.parsed_schema()?;
    let mut columns: Vec<String> = schema
        .key_segments
        .iter()
        .enumerate()
        .map(|(i, seg)| seg.sql_column(i))
        .collect();
    if schema.locus.is_some() {
        columns.push("chromosome".to_string());
        columns.push("position".to_string());
    }
    let ddl = format!(
        "CREATE INDEX schema_idx ON {} ({})",
        index.table,
        columns.join(", ")
    );
    sqlx::query(&ddl).execute(pool).await?;
    catalog::set_built(pool, index.id, true).await
}

struct PendingRow {
    keys: Vec<String>,
    chromosome: Option<String>,
    position: Option<i64>,
    start_offset: u64,
    end_offset: u64,
}

async fn ingest_blob(
    pool: &MySqlPool,
    store: &Arc<dyn BlobStore>,
    index: &Index,
    schema: &Schema,
    blob_key: &str,
) -> Result<()> {
    let current_etag = store.head(blob_key).await?.etag;
    let version = content_hash(&current_etag);
    let key_id = catalog::upsert_key(pool, index.id, blob_key, &version).await?;

    let body = store.get(blob_key).await?;
    let mut rows: Vec<PendingRow> = Vec::new();
    let mut offset = 0u64;

    for line in String::from_utf8_lossy(&body).lines() {
        let line_len = line.len() as u64 + 1;
        let start_offset = offset;
        let end_offset = offset + line_len;
        offset = end_offset;

        if line.is_empty() {
            continue;
        }

        let record: serde_json::Value = serde_json::from_str(line)?;
        let Some(record) = record.as_object() else {
            continue;
        };

        for generated in schema.generate_rows(record, None) {
            if let Some(last) = rows.last_mut() {
                if last.keys == generated.keys
                    && last.chromosome == generated.chromosome
                    && last.position == generated.position
                    && last.end_offset == start_offset
                {
                    last.end_offset = end_offset;
                    continue;
                }
            }
            rows.push(PendingRow {
                keys: generated.keys,
                chromosome: generated.chromosome,
                position: generated.position,
                start_offset,
                end_offset,
            });
        }
    }

    for batch in rows.chunks(BULK_BATCH) {
        bulk_load(pool, index, schema, key_id, batch).await?;
    }

    catalog::set_key_built(pool, key_id, true).await?;
    Ok(())
}

async fn bulk_load(
    pool: &MySqlPool,
    index: &Index,
    schema: &Schema,
    key_id: i64,
    batch: &[PendingRow],
) -> Result<()> {
    let mut attempts = 0;
    loop {
        match bulk_load_once(pool, index, schema, key_id, batch).await {
            Ok(()) => return Ok(()),
            Err(BioIndexError::Catalog(e))
                if attempts < DEADLOCK_RETRIES && e.to_string().contains(MYSQL_DEADLOCK_CODE) =>
            {
                attempts += 1;
                tokio::time::sleep(DEADLOCK_SLEEP).await;
            }
            Err(BioIndexError::Catalog(e)) if e.to_string().contains(MYSQL_DEADLOCK_CODE) => {
                return Err(BioIndexError::BulkLoadDeadlock {
                    key: index.table.clone(),
                    attempts,
                })
            }
            Err(e) => return Err(e),
        }
    }
}

async fn bulk_load_once(
    pool: &MySqlPool,
    index: &Index,
    schema: &Schema,
    key_id: i64,
    batch: &[PendingRow],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let key_columns: Vec<String> = (0..schema.key_segments.len())
        .map(|i| format!("key_{i}"))
        .collect();
    let mut columns = vec!["key".to_string(), "start_offset".to_string(), "end_offset".to_string()];
    columns.extend(key_columns.clone());
    if schema.locus.is_some() {
        columns.push("chromosome".to_string());
        columns.push("position".to_string());
    }

    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let values_sql = vec![placeholders; batch.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        index.table,
        columns.join(", "),
        values_sql
    );

    let mut query = sqlx::query(&sql);
    for row in batch {
        query = query.bind(key_id).bind(row.start_offset as i64).bind(row.end_offset as i64);
        for key_value in &row.keys {
            query = query.bind(key_value.clone());
        }
        if schema.locus.is_some() {
            query = query.bind(row.chromosome.clone()).bind(row.position);
        }
    }

    query.execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::ListedObject;

    fn key(id: i64, key: &str, version: &str, built: Option<bool>) -> Key {
        Key {
            id,
            index_id: 1,
            key: key.to_string(),
            version: version.to_string(),
            built,
        }
    }

    #[test]
    fn classifies_new_blob() {
        let objects = vec![ListedObject {
            key: "a.json".into(),
            size: 10,
            etag: "abc123".into(),
        }];
        let plan = classify(&objects, &[], false);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], Classification::New { .. }));
    }

    #[test]
    fn classifies_stale_blob_on_version_mismatch() {
        let objects = vec![ListedObject {
            key: "a.json".into(),
            size: 10,
            etag: "newversion0000000000000000000000".into(),
        }];
        let keys = vec![key(1, "a.json", "oldversion", Some(true))];
        let plan = classify(&objects, &keys, false);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], Classification::Stale { .. }));
    }

    #[test]
    fn classifies_deleted_blob() {
        let keys = vec![key(1, "gone.json", "v1", Some(true))];
        let plan = classify(&[], &keys, false);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], Classification::Deleted { .. }));
    }

    #[test]
    fn classifies_in_progress_blob() {
        let objects = vec![ListedObject {
            key: "a.json".into(),
            size: 10,
            etag: "v1 same hash here 000000000000000".into(),
        }];
        let version = content_hash("v1 same hash here 000000000000000");
        let keys = vec![key(1, "a.json", &version, None)];
        let plan = classify(&objects, &keys, false);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], Classification::InProgress { .. }));
    }

    #[test]
    fn rebuild_forces_stale_even_with_matching_version() {
        let version = content_hash("samehash0000000000000000000000000");
        let objects = vec![ListedObject {
            key: "a.json".into(),
            size: 10,
            etag: "samehash0000000000000000000000000".into(),
        }];
        let keys = vec![key(1, "a.json", &version, Some(true))];
        let plan = classify(&objects, &keys, true);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], Classification::Stale { .. }));
    }

    #[test]
    fn content_hash_truncates_to_32_chars() {
        let etag = "0123456789abcdef0123456789abcdef9999";
        assert_eq!(content_hash(etag).len(), 32);
    }
}
