//! Record reader (component F): streams NDJSON records out of coalesced
//! byte-range `Source`s, applying restrictions and an optional locus
//! post-filter, and tracking progress for `count`/pagination.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::err::{BioIndexError, Result};
use crate::locus::Locus;
use crate::restrictions::Restrictions;

/// Slices a byte range of uncompressed content out of a BGZF-compressed
/// blob. Both implementations fetch the compressed object through the
/// injected `BlobStore` rather than assuming local disk access, since
/// `S3BlobStore` is the only store this runs against in production.
/// `NativeSlicer` is the default.
#[async_trait]
pub trait BlockGzipSlicer: Send + Sync {
    async fn slice(&self, blob_path: &str, start: u64, len: u64) -> Result<Vec<u8>>;
}

/// Fetches the compressed object via the blob store, writes it to a temp
/// file, then shells out to `bgzip -b start -s length` against it,
/// preserving the exact argv contract so callers that only have a
/// `bgzip`-compatible binary installed still work.
pub struct SubprocessSlicer {
    store: Arc<dyn crate::blobstore::BlobStore>,
}

impl SubprocessSlicer {
    pub fn new(store: Arc<dyn crate::blobstore::BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockGzipSlicer for SubprocessSlicer {
    async fn slice(&self, blob_path: &str, start: u64, len: u64) -> Result<Vec<u8>> {
        let key = gz_key(blob_path);
        let compressed = self.store.get(&key).await?;
        read_compressed(&key, &compressed, start, len).await
    }
}

/// Fetches the compressed object via the blob store and decompresses
/// natively via `noodles_bgzf`, avoiding a child process. Preferred as the
/// default since its output is bit-exact with the uncompressed source.
pub struct NativeSlicer {
    store: Arc<dyn crate::blobstore::BlobStore>,
}

impl NativeSlicer {
    pub fn new(store: Arc<dyn crate::blobstore::BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockGzipSlicer for NativeSlicer {
    async fn slice(&self, blob_path: &str, start: u64, len: u64) -> Result<Vec<u8>> {
        let key = gz_key(blob_path);
        let compressed = self.store.get(&key).await?;
        crate::common::noodles::read_range(&compressed, start, len)
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key,
                message: e.to_string(),
            })
    }
}

/// The blob store key holding the compressed form of `blob_path`.
fn gz_key(blob_path: &str) -> String {
    if blob_path.ends_with(".gz") {
        blob_path.to_string()
    } else {
        format!("{blob_path}.gz")
    }
}

/// One coalesced byte range to read from a single blob.
#[derive(Debug, Clone)]
pub struct Source {
    pub blob_path: String,
    pub key: String,
    pub start: u64,
    pub end: u64,
    pub compressed: bool,
}

impl Source {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type PostFilter = std::sync::Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

pub struct Page {
    pub records: Vec<String>,
    pub bytes_read: u64,
    pub bytes_total: u64,
    pub at_end: bool,
    pub restricted_count: u64,
}

pub struct RecordReader {
    sources: Vec<Source>,
    cursor: usize,
    bytes_total: u64,
    bytes_read: u64,
    count: u64,
    restricted_count: u64,
    limit: Option<u64>,
    post_filter: Option<PostFilter>,
    restrictions: Option<Restrictions>,
    store: std::sync::Arc<dyn crate::blobstore::BlobStore>,
    slicer: Arc<dyn BlockGzipSlicer>,
    pending: std::collections::VecDeque<String>,
}

impl RecordReader {
    pub fn new(sources: Vec<Source>, store: std::sync::Arc<dyn crate::blobstore::BlobStore>) -> Self {
        let bytes_total = sources.iter().map(Source::len).sum();
        let slicer: Arc<dyn BlockGzipSlicer> = Arc::new(NativeSlicer::new(store.clone()));
        Self {
            sources,
            cursor: 0,
            bytes_total,
            bytes_read: 0,
            count: 0,
            restricted_count: 0,
            limit: None,
            post_filter: None,
            restrictions: None,
            store,
            slicer,
            pending: Default::default(),
        }
    }

    pub fn with_post_filter(mut self, filter: PostFilter) -> Self {
        self.post_filter = Some(filter);
        self
    }

    pub fn with_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = Some(restrictions);
        self
    }

    pub fn with_slicer(mut self, slicer: Arc<dyn BlockGzipSlicer>) -> Self {
        self.slicer = slicer;
        self
    }

    pub fn set_limit(&mut self, n: u64) {
        self.limit = Some(n);
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    fn at_end(&self) -> bool {
        let limit_reached = self.limit.map(|l| self.count >= l).unwrap_or(false);
        limit_reached || (self.cursor >= self.sources.len() && self.pending.is_empty())
    }

    /// Pulls up to `limit` accepted records (after restriction and
    /// post-filter rejection), advancing across Sources as needed.
    pub async fn next_page(&mut self, limit: usize) -> Result<Page> {
        self.limit = Some(self.count + limit as u64);
        let mut records = Vec::with_capacity(limit);

        while records.len() < limit && !self.at_end() {
            if self.pending.is_empty() {
                self.fill_from_next_source().await?;
                if self.pending.is_empty() && self.cursor >= self.sources.len() {
                    break;
                }
                continue;
            }

            let line = self.pending.pop_front().unwrap();
            self.bytes_read += line.len() as u64 + 1;

            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => return Err(BioIndexError::Json(e)),
            };

            if let Some(restrictions) = &self.restrictions {
                if !restrictions.allows(&value) {
                    self.restricted_count += 1;
                    continue;
                }
            }

            if let Some(filter) = &self.post_filter {
                if !filter(&value) {
                    continue;
                }
            }

            self.count += 1;
            records.push(line);
        }

        Ok(Page {
            records,
            bytes_read: self.bytes_read,
            bytes_total: self.bytes_total,
            at_end: self.at_end(),
            restricted_count: self.restricted_count,
        })
    }

    async fn fill_from_next_source(&mut self) -> Result<()> {
        while self.cursor < self.sources.len() {
            let source = self.sources[self.cursor].clone();
            self.cursor += 1;

            if source.is_empty() {
                tracing::warn!(blob = %source.blob_path, "skipping zero-length source, corrupt catalog entry");
                continue;
            }

            let body = if source.compressed {
                match self.slicer.slice(&source.blob_path, source.start, source.len()).await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(blob = %source.blob_path, error = %e, "abandoning source");
                        continue;
                    }
                }
            } else {
                match self
                    .store
                    .get_range(&source.blob_path, source.start, source.end)
                    .await
                {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(blob = %source.blob_path, error = %e, "abandoning source");
                        continue;
                    }
                }
            };

            for line in String::from_utf8_lossy(&body).lines() {
                if !line.is_empty() {
                    self.pending.push_back(line.to_string());
                }
            }

            if !self.pending.is_empty() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Writes an already-fetched compressed blob to a temp file, then shells out
/// to `bgzip -b start -s length` against it, preserving the exact argv
/// contract so a native slicer can be substituted transparently. `key` is
/// only used for error messages.
async fn read_compressed(key: &str, compressed: &[u8], start: u64, len: u64) -> Result<Vec<u8>> {
    let tmp = tempfile::Builder::new()
        .suffix(".gz")
        .tempfile()
        .map_err(|e| BioIndexError::SourceReadFailed {
            blob_path: key.to_string(),
            message: e.to_string(),
        })?;
    let path = tmp.path().to_path_buf();
    tokio::fs::write(&path, compressed)
        .await
        .map_err(|e| BioIndexError::SourceReadFailed {
            blob_path: key.to_string(),
            message: e.to_string(),
        })?;

    let mut child = Command::new("bgzip")
        .arg("-b")
        .arg(start.to_string())
        .arg("-s")
        .arg(len.to_string())
        .arg(&path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| BioIndexError::SourceReadFailed {
            blob_path: key.to_string(),
            message: e.to_string(),
        })?;

    let mut stdout = Vec::new();
    child
        .stdout
        .take()
        .expect("piped stdout")
        .read_to_end(&mut stdout)
        .await
        .map_err(|e| BioIndexError::SourceReadFailed {
            blob_path: key.to_string(),
            message: e.to_string(),
        })?;

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .expect("piped stderr")
        .read_to_string(&mut stderr)
        .await
        .ok();

    let status = child.wait().await.map_err(|e| BioIndexError::SourceReadFailed {
        blob_path: key.to_string(),
        message: e.to_string(),
    })?;

    // `tmp` is dropped (and deleted) once this function returns.
    if !status.success() {
        return Err(BioIndexError::SourceReadFailed {
            blob_path: key.to_string(),
            message: stderr,
        });
    }

    Ok(stdout)
}

/// Composes several readers, summing progress counters and propagating
/// `setLimit` to each member.
pub struct MultiReader {
    readers: Vec<RecordReader>,
}

impl MultiReader {
    pub fn new(readers: Vec<RecordReader>) -> Self {
        Self { readers }
    }

    pub fn set_limit(&mut self, n: u64) {
        for reader in &mut self.readers {
            reader.set_limit(n);
        }
    }

    pub fn bytes_total(&self) -> u64 {
        self.readers.iter().map(RecordReader::bytes_total).sum()
    }

    pub async fn next_page(&mut self, limit: usize) -> Result<Page> {
        let mut records = Vec::with_capacity(limit);
        let mut bytes_read = 0;
        let mut restricted_count = 0;
        let mut at_end = true;

        for reader in &mut self.readers {
            let remaining = limit.saturating_sub(records.len());
            if remaining == 0 {
                at_end &= reader.at_end();
                continue;
            }
            let page = reader.next_page(remaining).await?;
            bytes_read += page.bytes_read;
            restricted_count += page.restricted_count;
            at_end &= page.at_end;
            records.extend(page.records);
        }

        Ok(Page {
            records,
            bytes_read,
            bytes_total: self.bytes_total(),
            at_end,
            restricted_count,
        })
    }
}

/// Builds a post-filter closure that rejects bucket false positives by
/// re-testing the record's own locus against the query's exact range.
pub fn locus_post_filter(
    query_locus: Locus,
    locus_of_row: impl Fn(&serde_json::Value) -> Option<Locus> + Send + Sync + 'static,
) -> PostFilter {
    std::sync::Arc::new(move |record| match locus_of_row(record) {
        Some(row_locus) => {
            let (chrom, a, b) = match &query_locus {
                Locus::Snp { chrom, pos } => (chrom.clone(), *pos, *pos + 1),
                Locus::Region { chrom, start, stop } => (chrom.clone(), *start, *stop),
            };
            row_locus.overlaps(&chrom, a, b)
        }
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeStore(std::collections::HashMap<String, Vec<u8>>);

    #[async_trait::async_trait]
    impl crate::blobstore::BlobStore for FakeStore {
        async fn list(&self, _prefix: &str) -> Result<Vec<crate::blobstore::ListedObject>> {
            Ok(vec![])
        }
        async fn head(&self, key: &str) -> Result<crate::blobstore::ObjectMeta> {
            let body = self.0.get(key).cloned().unwrap_or_default();
            Ok(crate::blobstore::ObjectMeta {
                key: key.to_string(),
                size: body.len() as u64,
                etag: "fake".into(),
            })
        }
        async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>> {
            let body = self.0.get(key).cloned().unwrap_or_default();
            Ok(body[start as usize..end as usize].to_vec())
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            Ok(self.0.get(key).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn reads_uncompressed_lines() {
        let body = b"{\"a\":1}\n{\"a\":2}\n".to_vec();
        let len = body.len() as u64;
        let mut store_map = std::collections::HashMap::new();
        store_map.insert("blob".to_string(), body);
        let store = Arc::new(FakeStore(store_map));

        let source = Source {
            blob_path: "blob".into(),
            key: "blob".into(),
            start: 0,
            end: len,
            compressed: false,
        };
        let mut reader = RecordReader::new(vec![source], store);
        let page = reader.next_page(10).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.at_end);
    }

    struct FakeSlicer(Vec<u8>);

    #[async_trait::async_trait]
    impl BlockGzipSlicer for FakeSlicer {
        async fn slice(&self, _blob_path: &str, start: u64, len: u64) -> Result<Vec<u8>> {
            Ok(self.0[start as usize..(start + len) as usize].to_vec())
        }
    }

    #[tokio::test]
    async fn reads_compressed_lines_via_slicer() {
        let body = b"{\"a\":1}\n{\"a\":2}\n".to_vec();
        let len = body.len() as u64;
        let store = Arc::new(FakeStore(Default::default()));

        let source = Source {
            blob_path: "blob.json".into(),
            key: "blob.json".into(),
            start: 0,
            end: len,
            compressed: true,
        };
        let mut reader = RecordReader::new(vec![source], store)
            .with_slicer(Arc::new(FakeSlicer(body)));
        let page = reader.next_page(10).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.at_end);
    }

    #[tokio::test]
    async fn zero_length_source_skipped_with_warning() {
        let store = Arc::new(FakeStore(Default::default()));
        let source = Source {
            blob_path: "blob".into(),
            key: "blob".into(),
            start: 5,
            end: 5,
            compressed: false,
        };
        let mut reader = RecordReader::new(vec![source], store);
        let page = reader.next_page(10).await.unwrap();
        assert!(page.records.is_empty());
        assert!(page.at_end);
    }
}
