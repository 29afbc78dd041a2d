//! History store: persisted launch attempts with tolerant retrieval
//!
//! Records live in an SQLite table with a unique index on [`RecordKey`] and
//! lookup indices on model identity and on outcome. Rows without a VRAM
//! reading store `-1` so the unique index treats them as one key.

use crate::errors::{Result, TuneError};
use crate::history::types::{
    LaunchRecord, Outcome, OutcomeTag, RecordKey, RecordSummary, RememberedConfig, Upsert, UserAction,
};
use crate::models::ModelProfile;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// VRAM compared against when either side has no reading
const NEUTRAL_VRAM_MB: u64 = 8192;

/// Column value for "no VRAM reading"
const NO_READING: i64 = -1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS launch_history (
    id                  TEXT PRIMARY KEY,
    model_filepath      TEXT NOT NULL,
    model_size_b        REAL,
    quant               TEXT NOT NULL,
    is_moe              INTEGER NOT NULL,
    vram_at_decision_mb INTEGER NOT NULL,
    args_fingerprint    TEXT NOT NULL,
    launch_args         TEXT NOT NULL,
    attempt_level       INTEGER NOT NULL,
    outcome             TEXT NOT NULL,
    user_action         TEXT,
    approx_vram_used_mb INTEGER,
    timestamp           TEXT NOT NULL,
    UNIQUE (model_filepath, vram_at_decision_mb, args_fingerprint, attempt_level)
);
CREATE INDEX IF NOT EXISTS idx_history_model ON launch_history (model_filepath, quant, is_moe);
CREATE INDEX IF NOT EXISTS idx_history_outcome ON launch_history (outcome);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON launch_history (timestamp DESC);
";

const COLUMNS: &str = "id, model_filepath, model_size_b, quant, is_moe, vram_at_decision_mb, \
     args_fingerprint, launch_args, attempt_level, outcome, user_action, approx_vram_used_mb, timestamp";

const UPSERT: &str = "
INSERT INTO launch_history (
    id, model_filepath, model_size_b, quant, is_moe, vram_at_decision_mb,
    args_fingerprint, launch_args, attempt_level, outcome, user_action, approx_vram_used_mb, timestamp
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT (model_filepath, vram_at_decision_mb, args_fingerprint, attempt_level) DO UPDATE SET
    model_size_b        = excluded.model_size_b,
    quant               = excluded.quant,
    is_moe              = excluded.is_moe,
    launch_args         = excluded.launch_args,
    outcome             = excluded.outcome,
    user_action         = excluded.user_action,
    approx_vram_used_mb = excluded.approx_vram_used_mb,
    timestamp           = excluded.timestamp
";

const KEY_FILTER: &str =
    "model_filepath = ?1 AND vram_at_decision_mb = ?2 AND args_fingerprint = ?3 AND attempt_level = ?4";

/// Tolerances for `best_match`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    /// Absolute tolerance on model size, in billions of parameters
    pub size_tolerance_b: f64,
    /// Relative tolerance on available VRAM
    pub vram_tolerance: f64,
    /// Headroom required on top of a remembered VRAM usage
    pub safety_buffer_mb: u64,
    /// Relative margin used when excluding levels that failed recently
    pub failure_margin: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            size_tolerance_b: 0.5,
            vram_tolerance: 0.25,
            safety_buffer_mb: 768,
            failure_margin: 0.1,
        }
    }
}

/// Persistent attempt history
pub struct HistoryStore {
    path: Option<PathBuf>,
    options: MatchOptions,
    conn: Connection,
}

impl HistoryStore {
    /// Open (or create) a store backed by the database at `path`
    pub fn open(path: impl Into<PathBuf>, options: MatchOptions) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                TuneError::History(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(&path)?;
        let store = Self::with_connection(conn, Some(path.clone()), options)?;
        let records = store.len()?;
        info!(path = %path.display(), records, "history store opened");
        Ok(store)
    }

    /// Store that never touches the filesystem
    pub fn in_memory(options: MatchOptions) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None, options)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>, options: MatchOptions) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path, options, conn })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM launch_history", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Insert a record, or update the row that shares its key
    pub fn record(&mut self, record: LaunchRecord) -> Result<Upsert> {
        let key = record.key();
        let launch_args = serde_json::to_string(&record.launch_args)?;

        let tx = self.conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT 1 FROM launch_history WHERE {}", KEY_FILTER),
                params![
                    key.model_filepath,
                    vram_column(key.vram_at_decision_mb),
                    key.args_fingerprint,
                    key.attempt_level
                ],
                |_| Ok(()),
            )
            .optional()?;
        tx.execute(
            UPSERT,
            params![
                record.id.to_string(),
                record.model_filepath,
                record.model_size_b,
                record.quant,
                record.is_moe,
                vram_column(record.vram_at_decision_mb),
                record.args_fingerprint,
                launch_args,
                record.attempt_level,
                record.outcome.base.as_str(),
                record.outcome.user_action.map(|a| a.as_str()),
                record.approx_vram_used_mb.map(mb_column),
                timestamp_column(&record.timestamp),
            ],
        )?;
        tx.commit()?;

        let result = if existing.is_some() {
            Upsert::Updated
        } else {
            Upsert::Inserted
        };
        debug!(
            model = %key.model_filepath,
            level = key.attempt_level,
            fingerprint = %key.args_fingerprint,
            ?result,
            "history record written"
        );
        Ok(result)
    }

    /// Attach an operator action to an existing row
    pub fn annotate(&mut self, key: &RecordKey, action: UserAction) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE launch_history SET user_action = ?5, timestamp = ?6 WHERE {}",
                KEY_FILTER
            ),
            params![
                key.model_filepath,
                vram_column(key.vram_at_decision_mb),
                key.args_fingerprint,
                key.attempt_level,
                action.as_str(),
                timestamp_column(&Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Best remembered configuration for `profile` at `available_vram_mb`
    pub fn best_match(&self, profile: &ModelProfile, available_vram_mb: u64) -> Result<Option<RememberedConfig>> {
        let (low, high) = self.vram_window(available_vram_mb);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM launch_history
             WHERE model_filepath = ?1 AND quant = ?2 AND is_moe = ?3
               AND (?4 IS NULL OR model_size_b IS NULL OR ABS(model_size_b - ?4) <= ?5)
               AND (vram_at_decision_mb = ?6 OR vram_at_decision_mb BETWEEN ?7 AND ?8)",
            COLUMNS
        ))?;
        let candidates = stmt
            .query_map(
                params![
                    profile.path_key(),
                    profile.quant,
                    profile.is_moe,
                    profile.size_b,
                    self.options.size_tolerance_b,
                    NO_READING,
                    low,
                    high,
                ],
                read_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let failed_levels = self.failed_levels(profile, available_vram_mb)?;

        Ok(candidates
            .iter()
            .filter(|r| !failed_levels.contains(&r.attempt_level))
            .min_by_key(|r| {
                (
                    self.rank(&r.outcome, r.approx_vram_used_mb, available_vram_mb),
                    vram_distance(r.vram_at_decision_mb, available_vram_mb),
                    r.attempt_level,
                    Reverse(r.timestamp),
                )
            })
            .map(RememberedConfig::from))
    }

    /// Inclusive bounds a recorded VRAM reading must fall in to be comparable
    fn vram_window(&self, available: u64) -> (f64, f64) {
        let available = available as f64;
        let tol = self.options.vram_tolerance;
        (available * (1.0 - tol), available * (1.0 + tol))
    }

    /// Levels that hit memory pressure with at least as much VRAM as today
    fn failed_levels(&self, profile: &ModelProfile, available: u64) -> Result<Vec<i32>> {
        let margin = self.options.failure_margin;
        let pressure: Vec<String> = OutcomeTag::ALL
            .iter()
            .filter(|t| t.is_memory_pressure())
            .map(|t| format!("'{}'", t.as_str()))
            .collect();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT attempt_level, MAX(vram_at_decision_mb) FROM launch_history
             WHERE model_filepath = ?1 AND quant = ?2 AND is_moe = ?3
               AND outcome IN ({})
               AND vram_at_decision_mb >= ?4
             GROUP BY attempt_level",
            pressure.join(", ")
        ))?;
        let worst = stmt
            .query_map(
                params![
                    profile.path_key(),
                    profile.quant,
                    profile.is_moe,
                    available as f64 * (1.0 - margin),
                ],
                |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(worst
            .into_iter()
            .filter(|(_, max_failing)| available as f64 <= *max_failing as f64 * (1.0 + margin))
            .map(|(level, _)| level)
            .collect())
    }

    /// Preference class of an outcome, lower is better
    fn rank(&self, outcome: &Outcome, used_mb: Option<u64>, available: u64) -> u8 {
        let fits = used_mb
            .map(|u| u + self.options.safety_buffer_mb < available)
            .unwrap_or(false);

        match (outcome.user_action, outcome.base) {
            (Some(UserAction::MarkedAsBest), _) => 0,
            (_, OutcomeTag::SuccessUserConfirmed) => 1,
            (Some(UserAction::SavedGoodGpu), _) => 2,
            (_, OutcomeTag::SuccessLoadVramOk) if fits => 3,
            (_, base) if base.is_success() && fits => 4,
            (_, OutcomeTag::SuccessUserDirectLaunch) => 5,
            (Some(UserAction::AcceptedTuned), _) => 6,
            (_, base) if base.is_success() => 7,
            _ => 10,
        }
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<RecordSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM launch_history ORDER BY timestamp DESC LIMIT ?1",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit_column(limit)], read_record)?;
        summarize(rows)
    }

    /// Records of one model, newest first
    pub fn for_model(&self, model_filepath: &str, limit: usize) -> Result<Vec<RecordSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM launch_history WHERE model_filepath = ?1 ORDER BY timestamp DESC LIMIT ?2",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![model_filepath, limit_column(limit)], read_record)?;
        summarize(rows)
    }

    /// Row count per base outcome
    pub fn outcome_counts(&self) -> Result<BTreeMap<OutcomeTag, usize>> {
        let mut stmt = self
            .conn
            .prepare("SELECT outcome, COUNT(*) FROM launch_history GROUP BY outcome")?;
        let rows = stmt.query_map([], |row| {
            let outcome = parsed(row, 0, OutcomeTag::from_str)?;
            let count: i64 = row.get(1)?;
            Ok((outcome, usize::try_from(count).unwrap_or(0)))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }
}

fn summarize<F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<RecordSummary>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<LaunchRecord>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(RecordSummary::from(&row?));
    }
    Ok(out)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<LaunchRecord> {
    let user_action: Option<String> = row.get(10)?;
    let user_action = user_action
        .map(|a| UserAction::from_str(&a))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;

    Ok(LaunchRecord {
        id: parsed(row, 0, uuid::Uuid::parse_str)?,
        model_filepath: row.get(1)?,
        model_size_b: row.get(2)?,
        quant: row.get(3)?,
        is_moe: row.get(4)?,
        vram_at_decision_mb: mb_value(row.get(5)?),
        args_fingerprint: row.get(6)?,
        launch_args: parsed(row, 7, |s| serde_json::from_str::<Vec<String>>(s))?,
        attempt_level: row.get(8)?,
        outcome: Outcome {
            base: parsed(row, 9, OutcomeTag::from_str)?,
            user_action,
        },
        approx_vram_used_mb: row.get::<_, Option<i64>>(11)?.and_then(mb_value),
        timestamp: parsed(row, 12, |s| {
            DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
        })?,
    })
}

/// Read a text column and convert it
fn parsed<T, E>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    parse(&text).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn vram_column(vram: Option<u64>) -> i64 {
    vram.map(mb_column).unwrap_or(NO_READING)
}

fn mb_column(mb: u64) -> i64 {
    i64::try_from(mb).unwrap_or(i64::MAX)
}

fn mb_value(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

fn limit_column(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Fixed-width UTC text, so text order is time order
fn timestamp_column(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn vram_distance(recorded: Option<u64>, available: u64) -> u64 {
    let target = if available == 0 { NEUTRAL_VRAM_MB } else { available };
    recorded.unwrap_or(NEUTRAL_VRAM_MB).abs_diff(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn profile() -> ModelProfile {
        ModelProfile::new("/models/qwen-14b-Q4_K_M.gguf", Some(14.0), "Q4_K_M", false, 48)
    }

    fn rec(level: i32, vram: Option<u64>, outcome: Outcome, used: Option<u64>) -> LaunchRecord {
        LaunchRecord::new(
            &profile(),
            vram,
            vec!["--gpulayers".to_string(), level.to_string()],
            level,
            outcome,
            used,
        )
    }

    fn store() -> HistoryStore {
        HistoryStore::in_memory(MatchOptions::default()).unwrap()
    }

    #[test]
    fn test_upsert_keeps_one_row_with_latest_outcome() {
        let mut store = store();
        let first = rec(-3, Some(10_000), OutcomeTag::OomCrash.into(), None);
        let mut second = rec(-3, Some(10_000), OutcomeTag::SuccessLoadVramOk.into(), Some(6000));
        second.timestamp = first.timestamp + Duration::seconds(5);
        let expected_ts = second.timestamp;

        assert_eq!(store.record(first).unwrap(), Upsert::Inserted);
        assert_eq!(store.record(second).unwrap(), Upsert::Updated);
        assert_eq!(store.len().unwrap(), 1);

        let rows = store.recent(10).unwrap();
        assert_eq!(rows[0].outcome.base, OutcomeTag::SuccessLoadVramOk);
        assert_eq!(rows[0].timestamp, expected_ts);
    }

    #[test]
    fn test_rows_without_reading_share_a_key() {
        let mut store = store();
        assert_eq!(
            store.record(rec(-3, None, OutcomeTag::OomCrash.into(), None)).unwrap(),
            Upsert::Inserted
        );
        assert_eq!(
            store
                .record(rec(-3, None, OutcomeTag::SuccessLoadNoVramCheck.into(), None))
                .unwrap(),
            Upsert::Updated
        );
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.recent(1).unwrap()[0].vram_at_decision_mb, None);
    }

    #[test]
    fn test_no_rows_means_no_match() {
        let store = store();
        assert!(store.best_match(&profile(), 12_000).unwrap().is_none());
    }

    #[test]
    fn test_vram_outside_tolerance_is_ignored() {
        let mut store = store();
        store
            .record(rec(-5, Some(24_000), OutcomeTag::SuccessLoadVramOk.into(), Some(9000)))
            .unwrap();
        assert!(store.best_match(&profile(), 12_000).unwrap().is_none());

        store
            .record(rec(-1, None, OutcomeTag::SuccessLoadVramOk.into(), None))
            .unwrap();
        let found = store.best_match(&profile(), 12_000).unwrap().unwrap();
        assert_eq!(found.attempt_level, -1);
        assert_eq!(found.vram_at_decision_mb, None);
    }

    #[test]
    fn test_vram_window_is_relative_to_available() {
        // 8000 MB free allows recorded readings in 6000..=10000
        let mut store = store();
        store
            .record(rec(-7, Some(10_500), OutcomeTag::SuccessLoadVramOk.into(), None))
            .unwrap();
        store
            .record(rec(-6, Some(5_990), OutcomeTag::SuccessLoadVramOk.into(), None))
            .unwrap();
        assert!(store.best_match(&profile(), 8_000).unwrap().is_none());

        store
            .record(rec(-5, Some(10_000), OutcomeTag::SuccessLoadVramOk.into(), None))
            .unwrap();
        let found = store.best_match(&profile(), 8_000).unwrap().unwrap();
        assert_eq!(found.attempt_level, -5);
        assert_eq!(found.vram_at_decision_mb, Some(10_000));

        // Both edges qualify; at equal distance the lower level wins
        store
            .record(rec(-4, Some(6_000), OutcomeTag::SuccessLoadVramOk.into(), None))
            .unwrap();
        assert_eq!(store.best_match(&profile(), 8_000).unwrap().unwrap().attempt_level, -5);
    }

    #[test]
    fn test_identity_filters() {
        let mut store = store();
        let mut other_quant = rec(-5, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), None);
        other_quant.quant = "Q8_0".to_string();
        store.record(other_quant).unwrap();

        let mut other_size = rec(-4, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), None);
        other_size.model_size_b = Some(15.0);
        store.record(other_size).unwrap();

        assert!(store.best_match(&profile(), 12_000).unwrap().is_none());

        let mut unknown_size = rec(-2, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), None);
        unknown_size.model_size_b = None;
        store.record(unknown_size).unwrap();
        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, -2);
    }

    #[test]
    fn test_ranking_prefers_confirmed_outcomes() {
        let mut store = store();
        store
            .record(rec(-9, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), Some(9000)))
            .unwrap();
        store
            .record(rec(-3, Some(12_000), OutcomeTag::SuccessUserConfirmed.into(), None))
            .unwrap();
        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, -3);

        let best = Outcome::new(OutcomeTag::SuccessLoadNoVramCheck).with_action(UserAction::MarkedAsBest);
        store.record(rec(1, Some(12_000), best, None)).unwrap();
        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, 1);
    }

    #[test]
    fn test_ties_break_on_vram_then_level_then_recency() {
        let mut store = store();
        store
            .record(rec(-5, Some(13_000), OutcomeTag::SuccessLoadNoVramCheck.into(), None))
            .unwrap();
        store
            .record(rec(-3, Some(12_100), OutcomeTag::SuccessLoadNoVramCheck.into(), None))
            .unwrap();
        // Closer VRAM wins over the lower level
        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, -3);

        store
            .record(rec(-7, Some(12_100), OutcomeTag::SuccessLoadNoVramCheck.into(), None))
            .unwrap();
        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, -7);

        let mut older = rec(-7, Some(12_100), OutcomeTag::SuccessLoadNoVramCheck.into(), None);
        older.launch_args.push("--nommap".to_string());
        older.args_fingerprint = crate::history::types::args_fingerprint(&older.launch_args);
        older.timestamp = Utc::now() - Duration::hours(1);
        store.record(older).unwrap();
        let found = store.best_match(&profile(), 12_000).unwrap().unwrap();
        assert!(!found.launch_args.contains(&"--nommap".to_string()));
    }

    #[test]
    fn test_recently_failed_level_is_excluded() {
        let mut store = store();
        let mut ok = rec(-5, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), Some(8000));
        ok.timestamp = Utc::now() - Duration::hours(2);
        store.record(ok).unwrap();

        let mut oom = rec(-5, Some(12_500), OutcomeTag::OomCrash.into(), None);
        oom.launch_args.push("--flashattention".to_string());
        oom.args_fingerprint = crate::history::types::args_fingerprint(&oom.launch_args);
        store.record(oom).unwrap();

        store
            .record(rec(-3, Some(12_000), OutcomeTag::SuccessLoadNoVramCheck.into(), None))
            .unwrap();

        assert_eq!(store.best_match(&profile(), 12_000).unwrap().unwrap().attempt_level, -3);
    }

    #[test]
    fn test_only_memory_failures_exclude_a_level() {
        let mut store = store();
        store
            .record(rec(-5, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), Some(8000)))
            .unwrap();

        // Neither a premature exit nor a CPU-ward adjustment marks -5 as failed
        let mut exit = rec(-5, Some(12_400), OutcomeTag::PrematureExit.into(), None);
        exit.launch_args.push("--nommap".to_string());
        exit.args_fingerprint = crate::history::types::args_fingerprint(&exit.launch_args);
        store.record(exit).unwrap();

        let adjusted = Outcome::new(OutcomeTag::SuccessLoadNoVramCheck).with_action(UserAction::AutoAdjustCpu);
        let mut adjusted = rec(-5, Some(12_300), adjusted, None);
        adjusted.launch_args.push("--lowvram".to_string());
        adjusted.args_fingerprint = crate::history::types::args_fingerprint(&adjusted.launch_args);
        store.record(adjusted).unwrap();

        let found = store.best_match(&profile(), 12_000).unwrap().unwrap();
        assert_eq!(found.attempt_level, -5);
        assert_eq!(found.outcome.base, OutcomeTag::SuccessLoadVramOk);

        // More free VRAM than the failing run plus its margin lifts the exclusion
        let mut tight = rec(-5, Some(11_000), OutcomeTag::SuccessLoadVramTight.into(), None);
        tight.launch_args.push("--quantkv".to_string());
        tight.args_fingerprint = crate::history::types::args_fingerprint(&tight.launch_args);
        store.record(tight).unwrap();
        assert!(store.best_match(&profile(), 11_000).unwrap().is_none());
        assert_eq!(store.best_match(&profile(), 12_200).unwrap().unwrap().attempt_level, -5);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let mut store = HistoryStore::open(&path, MatchOptions::default()).unwrap();
            store
                .record(rec(-5, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), Some(7000)))
                .unwrap();
            store
                .record(rec(-3, Some(12_000), OutcomeTag::OomCrash.into(), None))
                .unwrap();
        }
        assert!(path.exists());

        let mut reopened = HistoryStore::open(&path, MatchOptions::default()).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        let rows = reopened.for_model(&profile().path_key(), 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.approx_vram_used_mb == Some(7000)));
        assert_eq!(
            reopened
                .record(rec(-3, Some(12_000), OutcomeTag::PrematureExit.into(), None))
                .unwrap(),
            Upsert::Updated
        );
        let found = reopened.best_match(&profile(), 12_000).unwrap().unwrap();
        assert_eq!(found.launch_args, vec!["--gpulayers".to_string(), "-5".to_string()]);
    }

    #[test]
    fn test_annotate_adds_user_action() {
        let mut store = store();
        let record = rec(-5, Some(12_000), OutcomeTag::SuccessLoadVramOk.into(), Some(7000));
        let key = record.key();
        store.record(record).unwrap();

        assert!(store.annotate(&key, UserAction::SavedGoodGpu).unwrap());
        let found = store.best_match(&profile(), 12_000).unwrap().unwrap();
        assert_eq!(found.outcome.user_action, Some(UserAction::SavedGoodGpu));
        assert_eq!(store.outcome_counts().unwrap()[&OutcomeTag::SuccessLoadVramOk], 1);

        let missing = RecordKey {
            attempt_level: 3,
            ..key
        };
        assert!(!store.annotate(&missing, UserAction::SavedGoodGpu).unwrap());
    }
}
