//! Durable per-peer bandwidth accounting
//!
//! All mutations hit an in-memory map; a dirty set tracks which peers
//! need persisting. Flushes batch dirty records into SQLite either
//! periodically (see `spawn_flusher`) or when the dirty set grows past a
//! limit. A failed flush is logged and the records stay dirty for the
//! next trigger; accounting is best-effort durable, not transactional.

use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate_core::{Error, PeerBandwidthStats, PeerId, Result};

/// Default dirty-set size that triggers an inline flush
const DEFAULT_MAX_DIRTY: usize = 64;

#[derive(Default)]
struct LedgerInner {
    stats: HashMap<String, PeerBandwidthStats>,
    dirty: HashSet<String>,
}

/// Write-coalescing bandwidth ledger backed by SQLite
pub struct BandwidthLedger {
    inner: Mutex<LedgerInner>,
    conn: Mutex<Connection>,
    max_dirty: usize,
}

impl BandwidthLedger {
    /// Open or create the ledger database and load existing counters
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Ephemeral ledger for tests and the loopback demo
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peer_stats (
                identity TEXT PRIMARY KEY,
                events_sent INTEGER NOT NULL DEFAULT 0,
                events_received INTEGER NOT NULL DEFAULT 0,
                blobs_sent INTEGER NOT NULL DEFAULT 0,
                blobs_received INTEGER NOT NULL DEFAULT 0,
                event_bytes_sent INTEGER NOT NULL DEFAULT 0,
                event_bytes_received INTEGER NOT NULL DEFAULT 0,
                blob_bytes_sent INTEGER NOT NULL DEFAULT 0,
                blob_bytes_received INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_peer_stats_last_seen
                ON peer_stats(last_seen);
            "#,
        )
        .map_err(db_err)?;

        let mut stats = HashMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT identity, events_sent, events_received, blobs_sent, blobs_received, event_bytes_sent, event_bytes_received, blob_bytes_sent, blob_bytes_received, last_seen FROM peer_stats")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PeerBandwidthStats {
                        identity: row.get(0)?,
                        events_sent: row.get::<_, i64>(1)? as u64,
                        events_received: row.get::<_, i64>(2)? as u64,
                        blobs_sent: row.get::<_, i64>(3)? as u64,
                        blobs_received: row.get::<_, i64>(4)? as u64,
                        event_bytes_sent: row.get::<_, i64>(5)? as u64,
                        event_bytes_received: row.get::<_, i64>(6)? as u64,
                        blob_bytes_sent: row.get::<_, i64>(7)? as u64,
                        blob_bytes_received: row.get::<_, i64>(8)? as u64,
                        last_seen: row.get::<_, i64>(9)? as u64,
                    })
                })
                .map_err(db_err)?;
            for row in rows {
                let row = row.map_err(db_err)?;
                stats.insert(row.identity.clone(), row);
            }
        }

        Ok(Self {
            inner: Mutex::new(LedgerInner {
                stats,
                dirty: HashSet::new(),
            }),
            conn: Mutex::new(conn),
            max_dirty: DEFAULT_MAX_DIRTY,
        })
    }

    pub fn record_event_sent(&self, peer: &PeerId, bytes: u64) {
        self.record(peer, |s| {
            s.events_sent += 1;
            s.event_bytes_sent += bytes;
        });
    }

    pub fn record_event_received(&self, peer: &PeerId, bytes: u64) {
        self.record(peer, |s| {
            s.events_received += 1;
            s.event_bytes_received += bytes;
        });
    }

    pub fn record_blob_sent(&self, peer: &PeerId, bytes: u64) {
        self.record(peer, |s| {
            s.blobs_sent += 1;
            s.blob_bytes_sent += bytes;
        });
    }

    pub fn record_blob_received(&self, peer: &PeerId, bytes: u64) {
        self.record(peer, |s| {
            s.blobs_received += 1;
            s.blob_bytes_received += bytes;
        });
    }

    /// Presence-only update: bumps last_seen without touching counters
    pub fn touch(&self, peer: &PeerId) {
        self.record(peer, |_| {});
    }

    /// Current counters for one peer
    pub fn get(&self, peer: &PeerId) -> Option<PeerBandwidthStats> {
        self.inner.lock().unwrap().stats.get(peer.as_str()).cloned()
    }

    /// Stats for up to `limit` peers, most recently seen first
    pub fn list(&self, limit: usize) -> Vec<PeerBandwidthStats> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<PeerBandwidthStats> = inner.stats.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all.truncate(limit);
        all
    }

    /// Drop every counter, in memory and on disk
    pub fn clear_all(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.clear();
            inner.dirty.clear();
        }
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM peer_stats", [])
            .map_err(db_err)?;
        Ok(())
    }

    /// Persist all dirty records. Returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let batch: Vec<PeerBandwidthStats> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<String> = inner.dirty.drain().collect();
            keys.iter()
                .filter_map(|k| inner.stats.get(k).cloned())
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let result = self.write_batch(&batch);
        if let Err(ref e) = result {
            // Keep the records dirty so the next trigger retries them
            let mut inner = self.inner.lock().unwrap();
            for row in &batch {
                inner.dirty.insert(row.identity.clone());
            }
            tracing::warn!("ledger flush failed, will retry: {}", e);
        }
        result.map(|_| batch.len())
    }

    fn write_batch(&self, batch: &[PeerBandwidthStats]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        for row in batch {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO peer_stats
                (identity, events_sent, events_received, blobs_sent, blobs_received,
                 event_bytes_sent, event_bytes_received, blob_bytes_sent, blob_bytes_received, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    row.identity,
                    row.events_sent as i64,
                    row.events_received as i64,
                    row.blobs_sent as i64,
                    row.blobs_received as i64,
                    row.event_bytes_sent as i64,
                    row.event_bytes_received as i64,
                    row.blob_bytes_sent as i64,
                    row.blob_bytes_received as i64,
                    row.last_seen as i64,
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    /// Spawn the periodic flush task. Errors are logged and retried on
    /// the next tick, never propagated.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match ledger.flush() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("flushed {} ledger records", n),
                    Err(e) => tracing::warn!("periodic ledger flush failed: {}", e),
                }
            }
        })
    }

    fn record(&self, peer: &PeerId, apply: impl FnOnce(&mut PeerBandwidthStats)) {
        let needs_flush = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .stats
                .entry(peer.as_str().to_string())
                .or_insert_with(|| PeerBandwidthStats {
                    identity: peer.as_str().to_string(),
                    ..Default::default()
                });
            apply(entry);
            entry.last_seen = now_secs();
            inner.dirty.insert(peer.as_str().to_string());
            inner.dirty.len() >= self.max_dirty
        };
        if needs_flush {
            if let Err(e) = self.flush() {
                tracing::warn!("inline ledger flush failed: {}", e);
            }
        }
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_counters_accumulate_monotonically() {
        let ledger = BandwidthLedger::open_in_memory().unwrap();
        let peer = PeerId::new("peer-a");

        let mut last = 0u64;
        for _ in 0..5 {
            ledger.record_blob_received(&peer, 1000);
            let stats = ledger.get(&peer).unwrap();
            assert!(stats.blob_bytes_received > last);
            last = stats.blob_bytes_received;
        }
        let stats = ledger.get(&peer).unwrap();
        assert_eq!(stats.blobs_received, 5);
        assert_eq!(stats.blob_bytes_received, 5000);
        assert_eq!(stats.blobs_sent, 0);
    }

    #[test]
    fn test_touch_creates_record_without_counters() {
        let ledger = BandwidthLedger::open_in_memory().unwrap();
        let peer = PeerId::new("peer-b");

        ledger.touch(&peer);
        let stats = ledger.get(&peer).unwrap();
        assert!(stats.last_seen > 0);
        assert_eq!(stats.events_sent, 0);
        assert_eq!(stats.blob_bytes_received, 0);
    }

    #[test]
    fn test_list_orders_by_recency_and_limits() {
        let ledger = BandwidthLedger::open_in_memory().unwrap();
        for name in ["p1", "p2", "p3"] {
            ledger.record_event_sent(&PeerId::new(name), 10);
        }
        // Force p1 to be the most recent
        {
            let mut inner = ledger.inner.lock().unwrap();
            inner.stats.get_mut("p1").unwrap().last_seen += 60;
        }

        let listed = ledger.list(2);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identity, "p1");
    }

    #[test]
    fn test_flush_and_reopen() {
        let file = NamedTempFile::new().unwrap();
        let peer = PeerId::new("durable-peer");

        {
            let ledger = BandwidthLedger::open(file.path()).unwrap();
            ledger.record_blob_sent(&peer, 50_000);
            ledger.record_event_received(&peer, 300);
            assert_eq!(ledger.flush().unwrap(), 1);
            // Nothing dirty after a successful flush
            assert_eq!(ledger.flush().unwrap(), 0);
        }

        let reopened = BandwidthLedger::open(file.path()).unwrap();
        let stats = reopened.get(&peer).unwrap();
        assert_eq!(stats.blobs_sent, 1);
        assert_eq!(stats.blob_bytes_sent, 50_000);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.event_bytes_received, 300);
    }

    #[test]
    fn test_clear_all() {
        let file = NamedTempFile::new().unwrap();
        let ledger = BandwidthLedger::open(file.path()).unwrap();
        ledger.record_blob_received(&PeerId::new("x"), 10);
        ledger.flush().unwrap();

        ledger.clear_all().unwrap();
        assert!(ledger.get(&PeerId::new("x")).is_none());

        let reopened = BandwidthLedger::open(file.path()).unwrap();
        assert!(reopened.list(10).is_empty());
    }
}
