//! Query planner (component E): turns a query tuple into a SQL lookup over
//! an index's row table, coalesces per-blob offset spans, and hands the
//! coalesced sources to a reader.

use sqlx::{MySqlPool, Row};

use crate::blobstore::BlobStore;
use crate::catalog::Index;
use crate::err::{BioIndexError, Result};
use crate::reader::{locus_post_filter, MultiReader, RecordReader, Source};
use crate::restrictions::Restrictions;
use crate::schema::Schema;

/// `fetch(index, q, restrictions?) -> Reader`. Requires `len(q) == arity`.
pub async fn fetch(
    pool: &MySqlPool,
    store: &std::sync::Arc<dyn BlobStore>,
    index: &Index,
    q: &[String],
    restrictions: Option<Restrictions>,
) -> Result<RecordReader> {
    let schema = index.parsed_schema()?;
    if q.len() != schema.arity() {
        return Err(BioIndexError::BadRequest(format!(
            "index {:?} expects {} query arguments, got {}",
            index.name,
            schema.arity(),
            q.len()
        )));
    }

    let mut query_locus = None;
    let sql = format!(
        "SELECT Keys.key AS blob_key, MIN({table}.start_offset) AS start_offset, \
         MAX({table}.end_offset) AS end_offset \
         FROM {table} JOIN __Keys AS Keys ON Keys.id = {table}.key \
         WHERE {filter} \
         GROUP BY Keys.id ORDER BY Keys.key ASC",
        table = index.table,
        filter = schema.sql_filter(&index.table),
    );

    let mut query = sqlx::query(&sql);
    for (i, _) in schema.key_segments.iter().enumerate() {
        query = query.bind(q[i].clone());
    }
    if schema.locus.is_some() {
        let (locus, chrom, start, stop) = schema.parse_query_locus(&q[q.len() - 1], None)?;
        query = query.bind(chrom).bind(start).bind(stop);
        query_locus = Some(locus);
    }

    let rows = query.fetch_all(pool).await?;
    let sources = rows
        .into_iter()
        .map(|row| -> Result<Source> {
            let blob_key: String = row.try_get("blob_key")?;
            let start: i64 = row.try_get("start_offset")?;
            let end: i64 = row.try_get("end_offset")?;
            Ok(Source {
                blob_path: blob_key.clone(),
                key: blob_key,
                start: start as u64,
                end: end as u64,
                compressed: index.compressed,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut reader = RecordReader::new(sources, store.clone());
    if let Some(locus) = query_locus {
        let locus_col = schema.locus.clone();
        reader = reader.with_post_filter(locus_post_filter(locus, move |record| {
            locus_col.as_ref().and_then(|spec| row_locus(spec, record))
        }));
    }
    if let Some(restrictions) = restrictions {
        reader = reader.with_restrictions(restrictions);
    }

    Ok(reader)
}

fn row_locus(
    spec: &crate::schema::LocusSpec,
    record: &serde_json::Value,
) -> Option<crate::locus::Locus> {
    use crate::schema::LocusColumns;
    let obj = record.as_object()?;
    match &spec.columns {
        LocusColumns::Snp { chrom_col, pos_col } => {
            let chrom = crate::locus::normalize_chromosome(obj.get(chrom_col)?.as_str()?).ok()?;
            let pos = obj.get(pos_col)?.as_i64()?;
            Some(crate::locus::Locus::Snp { chrom, pos })
        }
        LocusColumns::Region {
            chrom_col,
            start_col,
            stop_col,
        } => {
            let chrom = crate::locus::normalize_chromosome(obj.get(chrom_col)?.as_str()?).ok()?;
            let start = obj.get(start_col)?.as_i64()?;
            let stop = obj.get(stop_col)?.as_i64()?;
            Some(crate::locus::Locus::Region { chrom, start, stop })
        }
        LocusColumns::Template { col, template } => {
            let compiled = crate::locus::LocusTemplate::compile(template).ok()?;
            compiled.apply(obj.get(col)?.as_str()?)
        }
    }
}

/// `fetchAll(index, restrictions?) -> Reader`. Lists all blobs under
/// `prefix`, one Source per blob spanning `[0, size)`.
pub async fn fetch_all(
    store: &std::sync::Arc<dyn BlobStore>,
    index: &Index,
    restrictions: Option<Restrictions>,
) -> Result<RecordReader> {
    let objects = store.list(&index.prefix).await?;
    let sources = objects
        .into_iter()
        .map(|obj| Source {
            blob_path: obj.key.clone(),
            key: obj.key,
            start: 0,
            end: obj.size,
            compressed: index.compressed,
        })
        .collect();
    let mut reader = RecordReader::new(sources, store.clone());
    if let Some(restrictions) = restrictions {
        reader = reader.with_restrictions(restrictions);
    }
    Ok(reader)
}

/// Runs the reader for up to 500 records; extrapolates from bytes read if
/// it did not reach the end.
pub async fn count(
    pool: &MySqlPool,
    store: &std::sync::Arc<dyn BlobStore>,
    index: &Index,
    q: &[String],
) -> Result<u64> {
    const SAMPLE: usize = 500;
    let mut reader = fetch(pool, store, index, q, None).await?;
    let bytes_total = reader.bytes_total();
    let page = reader.next_page(SAMPLE).await?;

    if page.at_end {
        return Ok(page.records.len() as u64);
    }

    if page.bytes_read == 0 || bytes_total == 0 {
        return Ok(0);
    }

    Ok((page.records.len() as u64 * bytes_total) / page.bytes_read)
}

/// `match(index, q) -> lazy sequence of keys`. Requires
/// `0 < len(q) <= |keySegments|` and no locus in the final position.
///
/// Pages via `offset`; fetches one extra row past `limit` to detect whether
/// a continuation is needed without a second round-trip.
pub async fn r#match(
    pool: &MySqlPool,
    index: &Index,
    q: &[String],
    limit: usize,
    offset: usize,
) -> Result<(Vec<String>, bool)> {
    let schema: Schema = index.parsed_schema()?;
    if q.is_empty() || q.len() > schema.key_segments.len() {
        return Err(BioIndexError::BadRequest(format!(
            "match on {:?} requires between 1 and {} arguments, got {}",
            index.name,
            schema.key_segments.len(),
            q.len()
        )));
    }

    let target_column = format!("key_{}", q.len() - 1);
    let mut clauses: Vec<String> = (0..q.len() - 1)
        .map(|i| format!("{}.key_{i} = ?", index.table))
        .collect();
    let pattern = sql_like_pattern(&q[q.len() - 1]);
    clauses.push(format!("{}.{target_column} LIKE ?", index.table));

    let where_clause = clauses.join(" AND ");
    let sql = format!(
        "SELECT DISTINCT {table}.{target_column} AS value FROM {table} WHERE {where_clause} \
         ORDER BY value ASC LIMIT ? OFFSET ?",
        table = index.table,
    );

    let mut query = sqlx::query(&sql);
    for value in &q[..q.len() - 1] {
        query = query.bind(value.clone());
    }
    query = query
        .bind(pattern)
        .bind(limit as i64 + 1)
        .bind(offset as i64);

    let rows = query.fetch_all(pool).await?;
    let mut values = rows
        .into_iter()
        .map(|row| row.try_get::<String, _>("value").map_err(BioIndexError::from))
        .collect::<Result<Vec<_>>>()?;

    let has_more = values.len() > limit;
    values.truncate(limit);
    Ok((values, has_more))
}

/// Translates a `match` wildcard pattern (`*`, `_`) into a SQL `LIKE`
/// pattern, appending `%` when the input looks like a literal prefix.
fn sql_like_pattern(raw: &str) -> String {
    let translated: String = raw
        .chars()
        .map(|c| match c {
            '*' => '%',
            other => other,
        })
        .collect();
    if translated.contains('%') || translated.contains('_') {
        translated
    } else {
        format!("{translated}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_appends_percent_for_literal_prefix() {
        assert_eq!(sql_like_pattern("BRCA"), "BRCA%");
    }

    #[test]
    fn like_pattern_preserves_explicit_wildcards() {
        assert_eq!(sql_like_pattern("BRC*"), "BRC%");
        assert_eq!(sql_like_pattern("BR_A"), "BR_A");
    }
}
