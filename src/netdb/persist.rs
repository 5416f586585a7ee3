use crate::identity::IdentHash;
use crate::netdb::store::NetdbStore;
use crate::netdb::types::RouterRecord;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

const INTRODUCER_EXPIRATION_MS: u64 = 3600 * 1000;
const RECORD_EXPIRATION_MS: u64 = 72 * 3600 * 1000;
/// Age-based expiration only kicks in once the database is comfortably
/// populated.
const RECORD_EXPIRATION_MIN_ROUTERS: usize = 300;

#[derive(Debug, Default, Clone, Copy)]
pub struct SaveStats {
    pub saved: usize,
    pub deleted: usize,
}

pub fn record_path(dir: &Path, hash: &IdentHash) -> PathBuf {
    let b64 = hash.to_base64();
    dir.join(format!("r{}", hash.shard_char()))
        .join(format!("routerInfo-{b64}.dat"))
}

/// Create the netdb directory with its 64 shard subdirectories.
pub async fn ensure_shards(dir: &Path) -> Result<()> {
    for c in B64_ALPHABET {
        let shard = dir.join(format!("r{}", *c as char));
        tokio::fs::create_dir_all(&shard)
            .await
            .with_context(|| format!("creating shard {}", shard.display()))?;
    }
    Ok(())
}

/// Load all persisted router records into the store. Stale records (using
/// an introducer and older than one hour) and unparsable files are deleted
/// on the way.
pub async fn load(dir: &Path, store: &NetdbStore, now_ms: u64) -> Result<usize> {
    if !dir.exists() {
        ensure_shards(dir).await?;
        return Ok(0);
    }

    let mut loaded = 0usize;
    let mut shards = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading netdb dir {}", dir.display()))?;
    while let Some(shard) = shards.next_entry().await? {
        if !shard.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(shard.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            match load_one(&path, store, now_ms).await {
                Ok(true) => loaded += 1,
                Ok(false) => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "dropping bad router record");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
    tracing::info!(
        routers = loaded,
        floodfills = store.floodfill_count(),
        "netdb loaded"
    );
    Ok(loaded)
}

async fn load_one(path: &Path, store: &NetdbStore, now_ms: u64) -> Result<bool> {
    let buf = tokio::fs::read(path).await?;
    let record = RouterRecord::parse(&buf)?;
    if record.uses_introducer() && now_ms >= record.published_ms() + INTRODUCER_EXPIRATION_MS {
        return Ok(false);
    }
    let outcome = store.add_router(&buf)?;
    // Persisted records do not need a resident buffer; it is reloaded from
    // disk when a lookup reply has to serve it.
    outcome.record.set_updated(false);
    outcome.record.drop_buffer();
    Ok(true)
}

/// Write every record whose updated flag is set, then expire and delete
/// stale ones. Runs on the minute tick of the netdb engine.
pub async fn save_updated(dir: &Path, store: &NetdbStore, now_ms: u64) -> Result<SaveStats> {
    let mut stats = SaveStats::default();
    let records = store.routers_snapshot();
    let total = records.len();

    for record in records {
        if record.is_updated() {
            if let Some(buf) = record.buffer() {
                write_record(dir, &record.hash(), &buf).await?;
                stats.saved += 1;
            }
            record.set_updated(false);
            record.drop_buffer();
            continue;
        }

        let age_ms = now_ms.saturating_sub(record.published_ms());
        if (record.uses_introducer() && age_ms > INTRODUCER_EXPIRATION_MS)
            || (total > RECORD_EXPIRATION_MIN_ROUTERS && age_ms > RECORD_EXPIRATION_MS)
        {
            record.set_unreachable(true);
        }

        if record.is_unreachable() {
            let path = record_path(dir, &record.hash());
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("deleting {}", path.display()))?;
                stats.deleted += 1;
            }
            store.remove_router(&record.hash());
        }
    }

    if stats.saved > 0 || stats.deleted > 0 {
        tracing::debug!(saved = stats.saved, deleted = stats.deleted, "netdb saved");
    }
    Ok(stats)
}

async fn write_record(dir: &Path, hash: &IdentHash, buf: &[u8]) -> Result<()> {
    let path = record_path(dir, hash);
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("dat.tmp");
    tokio::fs::write(&tmp, buf)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Reload the raw bytes of a record whose in-memory buffer was dropped.
pub async fn load_record_buffer(dir: &Path, record: &Arc<RouterRecord>) -> Result<Vec<u8>> {
    if let Some(buf) = record.buffer() {
        return Ok(buf);
    }
    let path = record_path(dir, &record.hash());
    let buf = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    record.restore_buffer(buf.clone());
    Ok(buf)
}
