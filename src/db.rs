// Copyright 2024 the openwrt-imagegen authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SQLite persistence.
//!
//! The database is the single source of truth for entity state.  Every
//! method here is a short transaction; long-running work (downloads,
//! builds, flashes) happens outside, with state transitions flushed at
//! each boundary.  Records in a terminal state are never mutated again.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::errors::StoreError;
use crate::profile::Profile;
use crate::types::{ArtifactInfo, BuildStatus, FlashStatus, ImageBuilderState, VerificationResult};

type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id TEXT NOT NULL UNIQUE,
    device_id TEXT NOT NULL,
    openwrt_release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    imagebuilder_profile TEXT NOT NULL,
    spec TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS imagebuilders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    openwrt_release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    upstream_url TEXT,
    root_dir TEXT NOT NULL DEFAULT '',
    checksum TEXT,
    signature_verified INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'pending',
    first_used_at TEXT,
    last_used_at TEXT,
    UNIQUE (openwrt_release, target, subtarget)
);

CREATE TABLE IF NOT EXISTS build_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id INTEGER NOT NULL REFERENCES profiles (id),
    imagebuilder_id INTEGER NOT NULL REFERENCES imagebuilders (id),
    status TEXT NOT NULL DEFAULT 'pending',
    requested_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    cache_key TEXT NOT NULL,
    input_snapshot TEXT,
    build_dir TEXT,
    log_path TEXT,
    error_type TEXT,
    error_message TEXT,
    is_cache_hit INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS ix_build_records_cache_key ON build_records (cache_key);
CREATE INDEX IF NOT EXISTS ix_build_records_profile_status ON build_records (profile_id, status);

CREATE TABLE IF NOT EXISTS artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id INTEGER NOT NULL REFERENCES build_records (id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    filename TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    absolute_path TEXT,
    size_bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    labels TEXT,
    UNIQUE (build_id, relative_path)
);

CREATE TABLE IF NOT EXISTS flash_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    artifact_id INTEGER NOT NULL REFERENCES artifacts (id),
    build_id INTEGER NOT NULL REFERENCES build_records (id),
    device_path TEXT NOT NULL,
    device_model TEXT,
    device_serial TEXT,
    requested_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    wiped_before_flash INTEGER NOT NULL DEFAULT 0,
    verification_mode TEXT,
    verification_result TEXT,
    log_path TEXT,
    error_type TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS ix_flash_records_artifact_status ON flash_records (artifact_id, status);
";

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub id: i64,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuilderRow {
    pub id: i64,
    pub openwrt_release: String,
    pub target: String,
    pub subtarget: String,
    pub upstream_url: Option<String>,
    pub root_dir: String,
    pub checksum: Option<String>,
    pub signature_verified: bool,
    pub state: ImageBuilderState,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecordRow {
    pub id: i64,
    pub profile_id: i64,
    pub imagebuilder_id: i64,
    pub status: BuildStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cache_key: String,
    pub input_snapshot: Option<Value>,
    pub build_dir: Option<String>,
    pub log_path: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub is_cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRow {
    pub id: i64,
    pub build_id: i64,
    pub kind: String,
    pub filename: String,
    pub relative_path: String,
    pub absolute_path: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlashRecordRow {
    pub id: i64,
    pub artifact_id: i64,
    pub build_id: i64,
    pub device_path: String,
    pub device_model: Option<String>,
    pub device_serial: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: FlashStatus,
    pub wiped_before_flash: bool,
    pub verification_mode: Option<String>,
    pub verification_result: Option<String>,
    pub log_path: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// Filters for [`Db::list_flash_records`].
#[derive(Debug, Clone, Default)]
pub struct FlashQuery {
    pub artifact_id: Option<i64>,
    pub build_id: Option<i64>,
    pub device_path: Option<String>,
    pub status: Option<FlashStatus>,
    pub limit: Option<u32>,
}

/// Handle to the store.  Internally a mutex around one connection; every
/// method is a short lock hold so concurrent pipelines only serialize on
/// row access, never on their long-running work.
pub struct Db {
    conn: Mutex<Connection>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

impl Db {
    /// Open (and initialize) the store behind a connection string of the
    /// form `sqlite://<path>`, a bare path, or `:memory:`.
    pub fn open(db_url: &str) -> Result<Self> {
        let path = db_url
            .strip_prefix("sqlite://")
            .unwrap_or(db_url)
            .to_string();
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        if let Some(parent) = Path::new(&path).parent() {
            // Opening a database in a missing directory is an obscure
            // sqlite error; create it up front.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(&path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-call;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ----- profiles -----

    pub fn insert_profile(&self, profile: &Profile) -> Result<i64> {
        let conn = self.conn();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM profiles WHERE profile_id = ?1",
                [&profile.profile_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::ProfileExists(profile.profile_id.clone()));
        }
        let spec = serde_json::to_string(profile)?;
        let ts = now();
        conn.execute(
            "INSERT INTO profiles (profile_id, device_id, openwrt_release, target, subtarget,
                                   imagebuilder_profile, spec, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                profile.profile_id,
                profile.device_id,
                profile.openwrt_release,
                profile.target,
                profile.subtarget,
                profile.imagebuilder_profile,
                spec,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    }

    fn decode_profile_row(raw: (i64, String, String, String)) -> Result<ProfileRow> {
        let (id, spec, created_at, updated_at) = raw;
        Ok(ProfileRow {
            id,
            profile: serde_json::from_str(&spec)?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    pub fn get_profile_row(&self, profile_id: &str) -> Result<ProfileRow> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, spec, created_at, updated_at FROM profiles WHERE profile_id = ?1",
                [profile_id],
                Self::profile_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))?;
        Self::decode_profile_row(raw)
    }

    pub fn get_profile_row_by_id(&self, id: i64) -> Result<ProfileRow> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, spec, created_at, updated_at FROM profiles WHERE id = ?1",
                [id],
                Self::profile_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::ProfileNotFound(id.to_string()))?;
        Self::decode_profile_row(raw)
    }

    pub fn update_profile(&self, profile_id: &str, profile: &Profile) -> Result<()> {
        if profile.profile_id != profile_id {
            return Err(StoreError::ProfileIdMismatch {
                expected: profile_id.to_string(),
                got: profile.profile_id.clone(),
            });
        }
        let spec = serde_json::to_string(profile)?;
        let changed = self.conn().execute(
            "UPDATE profiles SET device_id = ?2, openwrt_release = ?3, target = ?4,
                                 subtarget = ?5, imagebuilder_profile = ?6, spec = ?7,
                                 updated_at = ?8
             WHERE profile_id = ?1",
            params![
                profile_id,
                profile.device_id,
                profile.openwrt_release,
                profile.target,
                profile.subtarget,
                profile.imagebuilder_profile,
                spec,
                now(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ProfileNotFound(profile_id.to_string()));
        }
        Ok(())
    }

    /// Delete a profile and its build/artifact/flash rows.  Returns the
    /// `build_dir` paths of the deleted builds so the caller can remove
    /// the owned subtrees.
    pub fn delete_profile(&self, profile_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row_id: i64 = tx
            .query_row(
                "SELECT id FROM profiles WHERE profile_id = ?1",
                [profile_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))?;
        let mut build_dirs = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT build_dir FROM build_records WHERE profile_id = ?1 AND build_dir IS NOT NULL",
            )?;
            let mut rows = stmt.query([row_id])?;
            while let Some(row) = rows.next()? {
                build_dirs.push(row.get::<_, String>(0)?);
            }
        }
        tx.execute(
            "DELETE FROM flash_records WHERE build_id IN
                 (SELECT id FROM build_records WHERE profile_id = ?1)",
            [row_id],
        )?;
        tx.execute("DELETE FROM build_records WHERE profile_id = ?1", [row_id])?;
        tx.execute("DELETE FROM profiles WHERE id = ?1", [row_id])?;
        tx.commit()?;
        Ok(build_dirs)
    }

    pub fn list_profile_rows(&self) -> Result<Vec<ProfileRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, spec, created_at, updated_at FROM profiles ORDER BY profile_id")?;
        let raw: Vec<_> = stmt
            .query_map([], Self::profile_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(Self::decode_profile_row).collect()
    }

    // ----- imagebuilders -----

    fn builder_from_row(row: &Row<'_>) -> rusqlite::Result<ImageBuilderRow> {
        let state: String = row.get(8)?;
        Ok(ImageBuilderRow {
            id: row.get(0)?,
            openwrt_release: row.get(1)?,
            target: row.get(2)?,
            subtarget: row.get(3)?,
            upstream_url: row.get(4)?,
            root_dir: row.get(5)?,
            checksum: row.get(6)?,
            signature_verified: row.get(7)?,
            state: state.parse().unwrap_or(ImageBuilderState::Broken),
            first_used_at: opt_ts(row.get(9)?),
            last_used_at: opt_ts(row.get(10)?),
        })
    }

    const BUILDER_COLS: &'static str = "id, openwrt_release, target, subtarget, upstream_url,
         root_dir, checksum, signature_verified, state, first_used_at, last_used_at";

    pub fn get_builder(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
    ) -> Result<Option<ImageBuilderRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM imagebuilders
                     WHERE openwrt_release = ?1 AND target = ?2 AND subtarget = ?3",
                    Self::BUILDER_COLS
                ),
                params![release, target, subtarget],
                Self::builder_from_row,
            )
            .optional()?)
    }

    pub fn get_builder_by_id(&self, id: i64) -> Result<Option<ImageBuilderRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM imagebuilders WHERE id = ?1",
                    Self::BUILDER_COLS
                ),
                [id],
                Self::builder_from_row,
            )
            .optional()?)
    }

    pub fn insert_builder(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        upstream_url: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO imagebuilders (openwrt_release, target, subtarget, upstream_url, state)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![release, target, subtarget, upstream_url],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_builder_state(&self, id: i64, state: ImageBuilderState) -> Result<()> {
        self.conn().execute(
            "UPDATE imagebuilders SET state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        Ok(())
    }

    /// Transition a builder to READY after successful extraction.
    pub fn set_builder_ready(&self, id: i64, root_dir: &str, checksum: Option<&str>) -> Result<()> {
        let ts = now();
        self.conn().execute(
            "UPDATE imagebuilders
             SET state = 'ready', root_dir = ?2, checksum = ?3,
                 first_used_at = COALESCE(first_used_at, ?4), last_used_at = ?4
             WHERE id = ?1",
            params![id, root_dir, checksum, ts],
        )?;
        Ok(())
    }

    pub fn touch_builder(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE imagebuilders SET last_used_at = ?2 WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn list_builders(
        &self,
        release: Option<&str>,
        target: Option<&str>,
        subtarget: Option<&str>,
        state: Option<ImageBuilderState>,
    ) -> Result<Vec<ImageBuilderRow>> {
        let conn = self.conn();
        let mut sql = format!("SELECT {} FROM imagebuilders WHERE 1=1", Self::BUILDER_COLS);
        let mut args: Vec<String> = Vec::new();
        for (clause, value) in [
            (" AND openwrt_release = ?", release),
            (" AND target = ?", target),
            (" AND subtarget = ?", subtarget),
            (" AND state = ?", state.map(|s| s.as_str())),
        ] {
            if let Some(v) = value {
                args.push(v.to_string());
                sql.push_str(clause);
            }
        }
        sql.push_str(" ORDER BY openwrt_release, target, subtarget");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::builder_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn builders_last_used_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ImageBuilderRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM imagebuilders
             WHERE last_used_at IS NULL OR last_used_at < ?1",
            Self::BUILDER_COLS
        ))?;
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        let rows = stmt.query_map([cutoff], Self::builder_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_builder(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM imagebuilders WHERE id = ?1", [id])?;
        Ok(())
    }

    // ----- builds -----

    fn build_from_row(row: &Row<'_>) -> rusqlite::Result<BuildRecordRow> {
        let status: String = row.get(3)?;
        let snapshot: Option<String> = row.get(8)?;
        Ok(BuildRecordRow {
            id: row.get(0)?,
            profile_id: row.get(1)?,
            imagebuilder_id: row.get(2)?,
            status: status.parse().unwrap_or(BuildStatus::Failed),
            requested_at: parse_ts(&row.get::<_, String>(4)?),
            started_at: opt_ts(row.get(5)?),
            finished_at: opt_ts(row.get(6)?),
            cache_key: row.get(7)?,
            input_snapshot: snapshot.and_then(|s| serde_json::from_str(&s).ok()),
            build_dir: row.get(9)?,
            log_path: row.get(10)?,
            error_type: row.get(11)?,
            error_message: row.get(12)?,
            is_cache_hit: row.get(13)?,
        })
    }

    const BUILD_COLS: &'static str = "id, profile_id, imagebuilder_id, status, requested_at,
         started_at, finished_at, cache_key, input_snapshot, build_dir, log_path,
         error_type, error_message, is_cache_hit";

    /// Create a build record in PENDING, storing the exact canonical input
    /// snapshot for later cache-drift diagnosis.
    pub fn insert_build(
        &self,
        profile_row_id: i64,
        imagebuilder_id: i64,
        cache_key: &str,
        input_snapshot: &Value,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO build_records (profile_id, imagebuilder_id, status, requested_at,
                                        cache_key, input_snapshot)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            params![
                profile_row_id,
                imagebuilder_id,
                now(),
                cache_key,
                serde_json::to_string(input_snapshot)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_build(&self, id: i64) -> Result<BuildRecordRow> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM build_records WHERE id = ?1", Self::BUILD_COLS),
                [id],
                Self::build_from_row,
            )
            .optional()?
            .ok_or(StoreError::BuildNotFound(id))
    }

    /// Most recent SUCCEEDED build for a cache key, if any.
    pub fn find_succeeded_build(&self, cache_key: &str) -> Result<Option<BuildRecordRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM build_records
                     WHERE cache_key = ?1 AND status = 'succeeded'
                     ORDER BY id DESC LIMIT 1",
                    Self::BUILD_COLS
                ),
                [cache_key],
                Self::build_from_row,
            )
            .optional()?)
    }

    pub fn mark_build_running(&self, id: i64, build_dir: &str) -> Result<()> {
        self.guarded_build_update(
            id,
            "UPDATE build_records SET status = 'running', started_at = ?2, build_dir = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, now(), build_dir],
        )
    }

    pub fn set_build_log_path(&self, id: i64, log_path: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE build_records SET log_path = ?2 WHERE id = ?1",
            params![id, log_path],
        )?;
        Ok(())
    }

    pub fn mark_build_succeeded(&self, id: i64) -> Result<()> {
        self.guarded_build_update(
            id,
            "UPDATE build_records SET status = 'succeeded', finished_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, now()],
        )
    }

    pub fn mark_build_failed(&self, id: i64, error_type: &str, message: &str) -> Result<()> {
        self.guarded_build_update(
            id,
            "UPDATE build_records
             SET status = 'failed', finished_at = ?2, error_type = ?3, error_message = ?4
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, now(), error_type, message],
        )
    }

    fn guarded_build_update(
        &self,
        id: i64,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<()> {
        let changed = self.conn().execute(sql, args)?;
        if changed == 0 {
            // Either the row is gone or it already reached a terminal
            // state; a terminal record must never transition backwards.
            let current = self.get_build(id)?;
            return Err(StoreError::InvalidTransition {
                id,
                status: current.status.as_str(),
            });
        }
        Ok(())
    }

    pub fn list_builds(
        &self,
        profile_row_id: Option<i64>,
        status: Option<BuildStatus>,
        limit: u32,
    ) -> Result<Vec<BuildRecordRow>> {
        let conn = self.conn();
        let mut sql = format!("SELECT {} FROM build_records WHERE 1=1", Self::BUILD_COLS);
        let mut args: Vec<String> = Vec::new();
        if let Some(pid) = profile_row_id {
            args.push(pid.to_string());
            sql.push_str(" AND profile_id = ?");
        }
        if let Some(status) = status {
            args.push(status.as_str().to_string());
            sql.push_str(" AND status = ?");
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::build_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ----- artifacts -----

    fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRow> {
        let labels: Option<String> = row.get(8)?;
        Ok(ArtifactRow {
            id: row.get(0)?,
            build_id: row.get(1)?,
            kind: row.get(2)?,
            filename: row.get(3)?,
            relative_path: row.get(4)?,
            absolute_path: row.get(5)?,
            size_bytes: row.get::<_, i64>(6)? as u64,
            sha256: row.get(7)?,
            labels: labels
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
        })
    }

    const ARTIFACT_COLS: &'static str =
        "id, build_id, kind, filename, relative_path, absolute_path, size_bytes, sha256, labels";

    pub fn insert_artifact(
        &self,
        build_id: i64,
        info: &ArtifactInfo,
        absolute_path: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO artifacts (build_id, kind, filename, relative_path, absolute_path,
                                    size_bytes, sha256, labels)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                build_id,
                info.kind.as_str(),
                info.filename,
                info.relative_path,
                absolute_path,
                info.size_bytes as i64,
                info.sha256,
                serde_json::to_string(&info.labels)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn artifacts_for_build(&self, build_id: i64) -> Result<Vec<ArtifactRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artifacts WHERE build_id = ?1 ORDER BY relative_path",
            Self::ARTIFACT_COLS
        ))?;
        let rows = stmt.query_map([build_id], Self::artifact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_artifact(&self, id: i64) -> Result<ArtifactRow> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM artifacts WHERE id = ?1", Self::ARTIFACT_COLS),
                [id],
                Self::artifact_from_row,
            )
            .optional()?
            .ok_or(StoreError::ArtifactNotFound(id))
    }

    // ----- flash records -----

    fn flash_from_row(row: &Row<'_>) -> rusqlite::Result<FlashRecordRow> {
        let status: String = row.get(9)?;
        Ok(FlashRecordRow {
            id: row.get(0)?,
            artifact_id: row.get(1)?,
            build_id: row.get(2)?,
            device_path: row.get(3)?,
            device_model: row.get(4)?,
            device_serial: row.get(5)?,
            requested_at: parse_ts(&row.get::<_, String>(6)?),
            started_at: opt_ts(row.get(7)?),
            finished_at: opt_ts(row.get(8)?),
            status: status.parse().unwrap_or(FlashStatus::Failed),
            wiped_before_flash: row.get(10)?,
            verification_mode: row.get(11)?,
            verification_result: row.get(12)?,
            log_path: row.get(13)?,
            error_type: row.get(14)?,
            error_message: row.get(15)?,
        })
    }

    const FLASH_COLS: &'static str = "id, artifact_id, build_id, device_path, device_model,
         device_serial, requested_at, started_at, finished_at, status, wiped_before_flash,
         verification_mode, verification_result, log_path, error_type, error_message";

    #[allow(clippy::too_many_arguments)]
    pub fn insert_flash(
        &self,
        artifact_id: i64,
        build_id: i64,
        device_path: &str,
        device_model: Option<&str>,
        device_serial: Option<&str>,
        wiped_before_flash: bool,
        verification_mode: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO flash_records (artifact_id, build_id, device_path, device_model,
                                        device_serial, requested_at, status,
                                        wiped_before_flash, verification_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![
                artifact_id,
                build_id,
                device_path,
                device_model,
                device_serial,
                now(),
                wiped_before_flash,
                verification_mode,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_flash_running(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE flash_records SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn mark_flash_succeeded(&self, id: i64, verification: VerificationResult) -> Result<()> {
        self.conn().execute(
            "UPDATE flash_records
             SET status = 'succeeded', finished_at = ?2, verification_result = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, now(), verification.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_flash_failed(
        &self,
        id: i64,
        error_type: &str,
        message: &str,
        verification: Option<VerificationResult>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE flash_records
             SET status = 'failed', finished_at = ?2, error_type = ?3, error_message = ?4,
                 verification_result = COALESCE(?5, verification_result)
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, now(), error_type, message, verification.map(|v| v.as_str())],
        )?;
        Ok(())
    }

    pub fn get_flash_record(&self, id: i64) -> Result<Option<FlashRecordRow>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {} FROM flash_records WHERE id = ?1", Self::FLASH_COLS),
                [id],
                Self::flash_from_row,
            )
            .optional()?)
    }

    pub fn list_flash_records(&self, query: &FlashQuery) -> Result<Vec<FlashRecordRow>> {
        let conn = self.conn();
        let mut sql = format!("SELECT {} FROM flash_records WHERE 1=1", Self::FLASH_COLS);
        let mut args: Vec<String> = Vec::new();
        if let Some(v) = query.artifact_id {
            args.push(v.to_string());
            sql.push_str(" AND artifact_id = ?");
        }
        if let Some(v) = query.build_id {
            args.push(v.to_string());
            sql.push_str(" AND build_id = ?");
        }
        if let Some(v) = &query.device_path {
            args.push(v.clone());
            sql.push_str(" AND device_path = ?");
        }
        if let Some(v) = query.status {
            args.push(v.as_str().to_string());
            sql.push_str(" AND status = ?");
        }
        sql.push_str(&format!(
            " ORDER BY id DESC LIMIT {}",
            query.limit.unwrap_or(100)
        ));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::flash_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;
    use crate::types::ArtifactKind;

    fn test_db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn seed_profile(db: &Db) -> i64 {
        let p = Profile::new("t1", "dev", "23.05.3", "ath79", "generic", "archer");
        db.insert_profile(&p).unwrap()
    }

    fn seed_builder(db: &Db) -> i64 {
        db.insert_builder("23.05.3", "ath79", "generic", "https://example/x.tar.xz")
            .unwrap()
    }

    fn artifact_info() -> ArtifactInfo {
        ArtifactInfo {
            filename: "openwrt-sysupgrade.bin".to_string(),
            relative_path: "bin/openwrt-sysupgrade.bin".to_string(),
            size_bytes: 4096,
            sha256: "ab".repeat(32),
            kind: ArtifactKind::Sysupgrade,
            labels: vec!["for_tf_flash".to_string()],
        }
    }

    #[test]
    fn test_builder_lifecycle() {
        let db = test_db();
        let id = seed_builder(&db);
        let row = db.get_builder("23.05.3", "ath79", "generic").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.state, ImageBuilderState::Pending);
        assert!(row.first_used_at.is_none());

        db.set_builder_ready(id, "/cache/23.05.3/ath79/generic/openwrt-x", Some("abcd"))
            .unwrap();
        let row = db.get_builder_by_id(id).unwrap().unwrap();
        assert_eq!(row.state, ImageBuilderState::Ready);
        assert_eq!(row.checksum.as_deref(), Some("abcd"));
        let first = row.first_used_at.unwrap();

        db.touch_builder(id).unwrap();
        let row = db.get_builder_by_id(id).unwrap().unwrap();
        // first_used_at is sticky; last_used_at advances
        assert_eq!(row.first_used_at.unwrap(), first);
        assert!(row.last_used_at.unwrap() >= first);
    }

    #[test]
    fn test_list_builders_filters() {
        let db = test_db();
        seed_builder(&db);
        db.insert_builder("23.05.3", "ramips", "mt7621", "https://example/y.tar.xz")
            .unwrap();
        assert_eq!(db.list_builders(None, None, None, None).unwrap().len(), 2);
        assert_eq!(
            db.list_builders(None, Some("ramips"), None, None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            db.list_builders(None, None, None, Some(ImageBuilderState::Ready))
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn test_build_state_machine() {
        let db = test_db();
        let pid = seed_profile(&db);
        let bid = seed_builder(&db);
        let key = format!("sha256:{}", "0".repeat(64));
        let snapshot = serde_json::json!({"schema_version": "1"});
        let build = db.insert_build(pid, bid, &key, &snapshot).unwrap();

        let row = db.get_build(build).unwrap();
        assert_eq!(row.status, BuildStatus::Pending);
        assert_eq!(row.cache_key, key);
        assert_eq!(row.input_snapshot.unwrap(), snapshot);
        assert!(!row.is_cache_hit);

        db.mark_build_running(build, "/artifacts/x").unwrap();
        db.mark_build_succeeded(build).unwrap();
        let row = db.get_build(build).unwrap();
        assert_eq!(row.status, BuildStatus::Succeeded);
        assert!(row.finished_at.is_some());

        // terminal records never transition backwards
        assert_eq!(
            db.mark_build_failed(build, "build_error", "nope")
                .unwrap_err()
                .kind(),
            "invalid_state"
        );
        assert_eq!(
            db.get_build(build).unwrap().status,
            BuildStatus::Succeeded
        );
    }

    #[test]
    fn test_find_succeeded_build() {
        let db = test_db();
        let pid = seed_profile(&db);
        let bid = seed_builder(&db);
        let key = format!("sha256:{}", "1".repeat(64));
        let snapshot = serde_json::json!({});

        assert!(db.find_succeeded_build(&key).unwrap().is_none());
        let b1 = db.insert_build(pid, bid, &key, &snapshot).unwrap();
        db.mark_build_running(b1, "/a").unwrap();
        db.mark_build_failed(b1, "build_error", "boom").unwrap();
        assert!(db.find_succeeded_build(&key).unwrap().is_none());

        let b2 = db.insert_build(pid, bid, &key, &snapshot).unwrap();
        db.mark_build_running(b2, "/b").unwrap();
        db.mark_build_succeeded(b2).unwrap();
        assert_eq!(db.find_succeeded_build(&key).unwrap().unwrap().id, b2);
    }

    #[test]
    fn test_artifact_unique_per_build() {
        let db = test_db();
        let pid = seed_profile(&db);
        let bid = seed_builder(&db);
        let build = db
            .insert_build(pid, bid, "sha256:x", &serde_json::json!({}))
            .unwrap();
        let info = artifact_info();
        let aid = db.insert_artifact(build, &info, Some("/abs/p")).unwrap();
        assert!(db.insert_artifact(build, &info, None).is_err());

        let row = db.get_artifact(aid).unwrap();
        assert_eq!(row.kind, "sysupgrade");
        assert_eq!(row.labels, vec!["for_tf_flash".to_string()]);
        assert_eq!(row.size_bytes, 4096);
        assert_eq!(db.artifacts_for_build(build).unwrap().len(), 1);
        assert_eq!(db.get_artifact(9999).unwrap_err().kind(), "artifact_not_found");
    }

    #[test]
    fn test_flash_lifecycle() {
        let db = test_db();
        let pid = seed_profile(&db);
        let bid = seed_builder(&db);
        let build = db
            .insert_build(pid, bid, "sha256:y", &serde_json::json!({}))
            .unwrap();
        let aid = db.insert_artifact(build, &artifact_info(), None).unwrap();

        let fid = db
            .insert_flash(aid, build, "/dev/sdb", None, None, true, "full-hash")
            .unwrap();
        db.mark_flash_running(fid).unwrap();
        db.mark_flash_succeeded(fid, VerificationResult::Match).unwrap();
        let row = db.get_flash_record(fid).unwrap().unwrap();
        assert_eq!(row.status, FlashStatus::Succeeded);
        assert_eq!(row.verification_result.as_deref(), Some("match"));
        assert!(row.wiped_before_flash);

        let hits = db
            .list_flash_records(&FlashQuery {
                device_path: Some("/dev/sdb".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = db
            .list_flash_records(&FlashQuery {
                status: Some(FlashStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn test_delete_profile_cascades() {
        let db = test_db();
        let pid = seed_profile(&db);
        let bid = seed_builder(&db);
        let build = db
            .insert_build(pid, bid, "sha256:z", &serde_json::json!({}))
            .unwrap();
        db.mark_build_running(build, "/artifacts/t1/00000001_ab").unwrap();
        let aid = db.insert_artifact(build, &artifact_info(), None).unwrap();
        db.insert_flash(aid, build, "/dev/sdb", None, None, false, "skip")
            .unwrap();

        let dirs = db.delete_profile("t1").unwrap();
        assert_eq!(dirs, vec!["/artifacts/t1/00000001_ab".to_string()]);
        assert!(db.get_build(build).is_err());
        assert!(db.get_artifact(aid).is_err());
    }
}
