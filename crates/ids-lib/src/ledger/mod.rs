//! Append-only detection ledger backed by SQLite
//!
//! Every verdict the monitor produces is written here, and all statistics
//! served to operators are derived from it. One connection is shared behind
//! a mutex: inserts serialize, readers may call from any thread.

use crate::error::{IdsError, Result};
use crate::models::{
    DetectionEntry, DetectionStats, Distribution, Prediction, ThreatCategory, ThreatSummary,
    TrafficRecord, Verdict,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of entries returned when a caller does not ask for a limit
pub const DEFAULT_RECENT_LIMIT: usize = 20;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS detection_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        prediction TEXT NOT NULL,
        confidence REAL NOT NULL,
        threat_type TEXT,
        features_json TEXT NOT NULL,
        src_bytes INTEGER NOT NULL DEFAULT 0,
        dst_bytes INTEGER NOT NULL DEFAULT 0,
        protocol_type TEXT NOT NULL DEFAULT '',
        service TEXT NOT NULL DEFAULT '',
        flag TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_detection_timestamp ON detection_logs(timestamp);
    CREATE INDEX IF NOT EXISTS idx_detection_prediction ON detection_logs(prediction);
"#;

const ENTRY_COLUMNS: &str = "id, timestamp, prediction, confidence, threat_type, features_json, \
     src_bytes, dst_bytes, protocol_type, service, flag";

/// Thread-safe handle to the ledger; clones share the connection
#[derive(Clone)]
pub struct DetectionLedger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DetectionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionLedger").finish_non_exhaustive()
    }
}

impl DetectionLedger {
    /// Open or create the ledger at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let ledger = Self::from_connection(conn)?;
        info!(path = %path.display(), "Detection ledger opened");
        Ok(ledger)
    }

    /// Open a private in-memory ledger
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one verdict. The threat type is only kept for attacks.
    pub fn insert(
        &self,
        verdict: &Verdict,
        record: &TrafficRecord,
        threat: Option<ThreatCategory>,
    ) -> Result<i64> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let threat_type = if verdict.is_attack() {
            threat.map(|t| t.as_str())
        } else {
            None
        };
        let features_json = serde_json::to_string(record)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO detection_logs
                (timestamp, prediction, confidence, threat_type, features_json,
                 src_bytes, dst_bytes, protocol_type, service, flag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                timestamp,
                verdict.prediction.as_str(),
                verdict.confidence,
                threat_type,
                features_json,
                record.numeric("src_bytes") as i64,
                record.numeric("dst_bytes") as i64,
                record.text("protocol_type"),
                record.text("service"),
                record.text("flag"),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, prediction = %verdict.prediction, "Detection stored");
        Ok(id)
    }

    /// Most recent entries first (timestamp, then id, descending)
    pub fn recent_entries(&self, limit: usize) -> Result<Vec<DetectionEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let raw: Vec<RawEntry> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM detection_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], RawEntry::from_row)?;
            let raw = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            raw
        };

        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Totals, attack percentage and the latest attack
    pub fn statistics(&self) -> Result<DetectionStats> {
        let conn = self.conn.lock();

        let (total, attacks): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN prediction = 'attack' THEN 1 ELSE 0 END), 0)
             FROM detection_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let last = conn
            .query_row(
                "SELECT timestamp, threat_type, confidence, protocol_type, service
                 FROM detection_logs
                 WHERE prediction = 'attack'
                 ORDER BY timestamp DESC, id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let last_threat = match last {
            Some((timestamp, threat_type, confidence, protocol, service)) => Some(ThreatSummary {
                timestamp: parse_timestamp(&timestamp)?,
                threat_type,
                confidence,
                protocol,
                service,
            }),
            None => None,
        };

        Ok(DetectionStats::new(total as u64, attacks as u64, last_threat))
    }

    /// Entry counts per prediction label; both keys are always present
    pub fn distribution(&self) -> Result<Distribution> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT prediction, COUNT(*) FROM detection_logs GROUP BY prediction")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut distribution = Distribution::default();
        for row in rows {
            let (prediction, count) = row?;
            match prediction.parse::<Prediction>() {
                Ok(Prediction::Normal) => distribution.normal += count as u64,
                Ok(Prediction::Attack) => distribution.attack += count as u64,
                Err(e) => return Err(IdsError::Persistence(e)),
            }
        }
        Ok(distribution)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM detection_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Row as stored, before timestamp and feature decoding
struct RawEntry {
    id: i64,
    timestamp: String,
    prediction: String,
    confidence: f64,
    threat_type: Option<String>,
    features_json: String,
    src_bytes: i64,
    dst_bytes: i64,
    protocol_type: String,
    service: String,
    flag: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            prediction: row.get(2)?,
            confidence: row.get(3)?,
            threat_type: row.get(4)?,
            features_json: row.get(5)?,
            src_bytes: row.get(6)?,
            dst_bytes: row.get(7)?,
            protocol_type: row.get(8)?,
            service: row.get(9)?,
            flag: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<DetectionEntry> {
        Ok(DetectionEntry {
            id: self.id,
            timestamp: parse_timestamp(&self.timestamp)?,
            prediction: self.prediction.parse().map_err(IdsError::Persistence)?,
            confidence: self.confidence,
            threat_type: self.threat_type,
            features: serde_json::from_str(&self.features_json)?,
            src_bytes: self.src_bytes,
            dst_bytes: self.dst_bytes,
            protocol_type: self.protocol_type,
            service: self.service,
            flag: self.flag,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IdsError::Persistence(format!("bad timestamp {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attack_record() -> TrafficRecord {
        TrafficRecord::new()
            .with("protocol_type", "tcp")
            .with("service", "http")
            .with("flag", "S0")
            .with("src_bytes", 0.0)
            .with("dst_bytes", 12.0)
            .with("count", 300.0)
    }

    fn normal_record() -> TrafficRecord {
        TrafficRecord::new()
            .with("protocol_type", "udp")
            .with("service", "domain_u")
            .with("flag", "SF")
            .with("src_bytes", 45.0)
    }

    #[test]
    fn test_empty_ledger() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let stats = ledger.statistics().unwrap();
        assert_eq!(stats, DetectionStats::default());
        assert_eq!(ledger.distribution().unwrap(), Distribution::default());
        assert!(ledger.recent_entries(DEFAULT_RECENT_LIMIT).unwrap().is_empty());
        assert!(ledger.is_empty().unwrap());
    }

    #[test]
    fn test_single_attack() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let verdict = Verdict::from_probabilities(0.08, 0.92);
        let id = ledger
            .insert(&verdict, &attack_record(), Some(ThreatCategory::DoS))
            .unwrap();

        let entries = ledger.recent_entries(1).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.prediction, Prediction::Attack);
        assert!((entry.confidence - 0.92).abs() < 1e-9);
        assert_eq!(entry.threat_type.as_deref(), Some("DoS"));
        assert_eq!(entry.features, attack_record());
        assert_eq!(entry.dst_bytes, 12);
        assert_eq!(entry.protocol_type, "tcp");
        assert_eq!(entry.flag, "S0");

        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.total_packets, 1);
        assert_eq!(stats.total_attacks, 1);
        assert_eq!(stats.detection_rate, 100.0);
        let last = stats.last_threat.unwrap();
        assert_eq!(last.threat_type.as_deref(), Some("DoS"));
        assert_eq!(last.protocol, "tcp");
        assert_eq!(last.service, "http");
    }

    #[test]
    fn test_threat_type_dropped_for_normal() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let verdict = Verdict::from_probabilities(0.9, 0.1);
        ledger
            .insert(&verdict, &normal_record(), Some(ThreatCategory::PortScan))
            .unwrap();

        let entry = &ledger.recent_entries(1).unwrap()[0];
        assert_eq!(entry.prediction, Prediction::Normal);
        assert!(entry.threat_type.is_none());
        assert!(ledger.statistics().unwrap().last_threat.is_none());
    }

    #[test]
    fn test_distribution_matches_totals() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        for i in 0..7 {
            let (verdict, record) = if i % 3 == 0 {
                (Verdict::from_probabilities(0.2, 0.8), attack_record())
            } else {
                (Verdict::from_probabilities(0.7, 0.3), normal_record())
            };
            ledger.insert(&verdict, &record, Some(ThreatCategory::Unknown)).unwrap();
        }

        let distribution = ledger.distribution().unwrap();
        let stats = ledger.statistics().unwrap();
        assert_eq!(distribution, Distribution { normal: 4, attack: 3 });
        assert_eq!(distribution.total(), stats.total_packets);
        assert_eq!(stats.total_attacks, 3);
        assert_eq!(stats.detection_rate, 42.86);
        assert_eq!(ledger.len().unwrap(), 7);
    }

    #[test]
    fn test_recent_entries_order_and_limit() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let verdict = Verdict::from_probabilities(0.6, 0.4);
        let ids: Vec<i64> = (0..5)
            .map(|_| ledger.insert(&verdict, &normal_record(), None).unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let recent = ledger.recent_entries(3).unwrap();
        let got: Vec<i64> = recent.iter().map(|e| e.id).collect();
        assert_eq!(got, vec![ids[4], ids[3], ids[2]]);
        assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        assert!(ledger.recent_entries(0).unwrap().is_empty());
        assert_eq!(ledger.recent_entries(100).unwrap().len(), 5);
    }

    #[test]
    fn test_last_threat_is_latest_attack() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let attack = Verdict::from_probabilities(0.3, 0.7);
        ledger.insert(&attack, &attack_record(), Some(ThreatCategory::DoS)).unwrap();
        ledger
            .insert(&attack, &normal_record(), Some(ThreatCategory::PortScan))
            .unwrap();
        ledger
            .insert(&Verdict::from_probabilities(0.9, 0.1), &normal_record(), None)
            .unwrap();

        let last = ledger.statistics().unwrap().last_threat.unwrap();
        assert_eq!(last.threat_type.as_deref(), Some("PortScan"));
        assert_eq!(last.protocol, "udp");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("ids_logs.db");

        {
            let ledger = DetectionLedger::open(&path).unwrap();
            ledger
                .insert(
                    &Verdict::from_probabilities(0.1, 0.9),
                    &attack_record(),
                    Some(ThreatCategory::DDoS),
                )
                .unwrap();
        }

        let reopened = DetectionLedger::open(&path).unwrap();
        let stats = reopened.statistics().unwrap();
        assert_eq!(stats.total_packets, 1);
        assert_eq!(
            stats.last_threat.and_then(|t| t.threat_type).as_deref(),
            Some("DDoS")
        );
    }

    #[test]
    fn test_concurrent_readers_with_writer() {
        let ledger = DetectionLedger::open_in_memory().unwrap();
        let writer = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let verdict = if i % 2 == 0 {
                        Verdict::from_probabilities(0.2, 0.8)
                    } else {
                        Verdict::from_probabilities(0.8, 0.2)
                    };
                    ledger.insert(&verdict, &normal_record(), None).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let stats = ledger.statistics().unwrap();
                        assert!(stats.total_attacks <= stats.total_packets);
                        assert!((0.0..=100.0).contains(&stats.detection_rate));
                        ledger.recent_entries(DEFAULT_RECENT_LIMIT).unwrap();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let distribution = ledger.distribution().unwrap();
        assert_eq!(distribution, Distribution { normal: 25, attack: 25 });
    }
}
