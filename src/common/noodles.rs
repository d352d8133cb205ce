//! BGZF random-access helpers built on `noodles_bgzf`'s async reader.
//!
//! This is the native half of the reader's block-gzip slicer: decompress
//! from the start of an already-fetched compressed buffer, discard `start`
//! uncompressed bytes, then read exactly `len`. No `.gzi`-style index is
//! required since the indexer only ever records uncompressed offsets. The
//! compressed bytes are fetched by the caller through the blob store, never
//! read off local disk, so this works the same whether the blob lives in S3
//! or a local fixture. The subprocess half (shelling out to `bgzip -b/-s`)
//! lives in `reader`.

use tokio::io::AsyncReadExt;

use noodles_bgzf as bgzf;

const DISCARD_CHUNK: usize = 64 * 1024;

/// Reads `len` uncompressed bytes starting at uncompressed offset `start`
/// from an in-memory BGZF buffer.
pub async fn read_range(compressed: &[u8], start: u64, len: u64) -> Result<Vec<u8>, anyhow::Error> {
    let cursor = std::io::Cursor::new(compressed.to_vec());
    let mut reader = bgzf::AsyncReader::new(cursor);

    let mut discard = vec![0u8; DISCARD_CHUNK];
    let mut remaining = start;
    while remaining > 0 {
        let chunk = remaining.min(discard.len() as u64) as usize;
        reader
            .read_exact(&mut discard[..chunk])
            .await
            .map_err(|e| anyhow::anyhow!("error skipping to offset {}: {}", start, e))?;
        remaining -= chunk as u64;
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| anyhow::anyhow!("error reading {} bytes at offset {}: {}", len, start, e))?;

    Ok(buf)
}
