//! SQLite persistence for creative units, their provider tasks and the
//! per-unit event log.
//!
//! Every operation opens its own connection inside `spawn_blocking`, so
//! concurrent pollers never share a handle. WAL plus a busy timeout lets
//! writes to distinct task rows proceed without cross-row locking.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

use crate::{
    models::{CreativeUnit, Observation, Task, TaskStatus, UnitEvent},
    now_ms,
};

const TASK_COLUMNS: &str = "id, unit_id, provider_task_id, kind, status, progress, result_url, local_path, \
     character_id, fail_message, warning, stalled, observed_at_ms, created_at_ms, updated_at_ms";

const UNIT_COLUMNS: &str = "id, name, situation, prompt, video_task_id, video_duration_secs, character_name, \
     character_id, character_task_id, next_prompt, next_task_id, stage, created_at_ms, updated_at_ms";

#[derive(Clone, Debug)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `db_path` and applies the schema.
    pub fn init(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        let conn = open(&db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("failed to enable WAL")?;

        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS units (
  id TEXT PRIMARY KEY,
  name TEXT,
  situation TEXT NOT NULL,
  prompt TEXT,
  video_task_id TEXT,
  video_duration_secs INTEGER NOT NULL,
  character_name TEXT,
  character_id TEXT,
  character_task_id TEXT,
  next_prompt TEXT,
  next_task_id TEXT,
  stage TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  unit_id TEXT NOT NULL,
  provider_task_id TEXT NOT NULL UNIQUE,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  progress INTEGER NOT NULL DEFAULT 0,
  result_url TEXT,
  local_path TEXT,
  character_id TEXT,
  fail_message TEXT,
  warning TEXT,
  stalled INTEGER NOT NULL DEFAULT 0,
  observed_at_ms INTEGER,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  FOREIGN KEY(unit_id) REFERENCES units(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_tasks_unit_id ON tasks(unit_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  unit_id TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  data_json TEXT,
  FOREIGN KEY(unit_id) REFERENCES units(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_events_unit_id ON events(unit_id);
            "#,
        )
        .context("failed to init sqlite schema")?;

        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            f(&mut conn)
        })
        .await
        .with_context(|| format!("{op} task failed"))?
        .with_context(|| format!("{op} failed"))
    }

    pub async fn insert_unit(&self, unit: CreativeUnit) -> anyhow::Result<()> {
        self.blocking("insert_unit", move |conn| {
            conn.execute(
                &format!("INSERT INTO units ({UNIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    &unit.id,
                    &unit.name,
                    &unit.situation,
                    &unit.prompt,
                    &unit.video_task_id,
                    unit.video_duration_secs,
                    &unit.character_name,
                    &unit.character_id,
                    &unit.character_task_id,
                    &unit.next_prompt,
                    &unit.next_task_id,
                    unit.stage.as_str(),
                    unit.created_at_ms,
                    unit.updated_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_unit(&self, id: &str) -> anyhow::Result<Option<CreativeUnit>> {
        let id = id.to_string();
        self.blocking("get_unit", move |conn| select_unit(conn, &id)).await
    }

    pub async fn list_units(&self) -> anyhow::Result<Vec<CreativeUnit>> {
        self.blocking("list_units", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {UNIT_COLUMNS} FROM units ORDER BY updated_at_ms DESC LIMIT 100"
            ))?;
            let rows = stmt.query_map([], unit_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Read-modify-write of one unit inside a transaction. Returns `None` when
    /// the unit does not exist.
    pub async fn update_unit<F>(&self, id: &str, apply: F) -> anyhow::Result<Option<CreativeUnit>>
    where
        F: FnOnce(&mut CreativeUnit) + Send + 'static,
    {
        let id = id.to_string();
        self.blocking("update_unit", move |conn| {
            let tx = conn.transaction()?;
            let Some(mut unit) = select_unit(&tx, &id)? else {
                return Ok(None);
            };
            apply(&mut unit);
            unit.updated_at_ms = now_ms();
            tx.execute(
                "UPDATE units SET name = ?2, situation = ?3, prompt = ?4, video_task_id = ?5, \
                 video_duration_secs = ?6, character_name = ?7, character_id = ?8, character_task_id = ?9, \
                 next_prompt = ?10, next_task_id = ?11, stage = ?12, updated_at_ms = ?13 WHERE id = ?1",
                params![
                    &unit.id,
                    &unit.name,
                    &unit.situation,
                    &unit.prompt,
                    &unit.video_task_id,
                    unit.video_duration_secs,
                    &unit.character_name,
                    &unit.character_id,
                    &unit.character_task_id,
                    &unit.next_prompt,
                    &unit.next_task_id,
                    unit.stage.as_str(),
                    unit.updated_at_ms,
                ],
            )?;
            tx.commit()?;
            Ok(Some(unit))
        })
        .await
    }

    /// Deletes the unit together with its tasks and events.
    pub async fn delete_unit(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.blocking("delete_unit", move |conn| {
            Ok(conn.execute("DELETE FROM units WHERE id = ?1", [&id])? > 0)
        })
        .await
    }

    pub async fn insert_task(&self, task: Task) -> anyhow::Result<()> {
        self.blocking("insert_task", move |conn| {
            conn.execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
                params![
                    &task.id,
                    &task.unit_id,
                    &task.provider_task_id,
                    task.kind.as_str(),
                    task.status.as_str(),
                    task.progress,
                    &task.result_url,
                    &task.local_path,
                    &task.character_id,
                    &task.fail_message,
                    &task.warning,
                    task.stalled,
                    task.observed_at_ms,
                    task.created_at_ms,
                    task.updated_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let id = id.to_string();
        self.blocking("get_task", move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    [&id],
                    task_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_unit_tasks(&self, unit_id: &str) -> anyhow::Result<Vec<Task>> {
        let unit_id = unit_id.to_string();
        self.blocking("list_unit_tasks", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE unit_id = ?1 ORDER BY created_at_ms"
            ))?;
            let rows = stmt.query_map([&unit_id], task_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Tasks the provider has not finished yet.
    pub async fn list_pending_tasks(&self) -> anyhow::Result<Vec<Task>> {
        self.blocking("list_pending_tasks", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status NOT IN ('success', 'fail') ORDER BY created_at_ms"
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Writes a provider observation. Rows already in a terminal state are left
    /// untouched; returns whether the row was updated.
    pub async fn record_observation(&self, task_id: &str, obs: &Observation) -> anyhow::Result<bool> {
        let task_id = task_id.to_string();
        let status = obs.status;
        let progress = obs.progress.clamp(0, 100);
        let (result_url, character_id) = if status == TaskStatus::Success {
            (
                obs.result_url().map(str::to_string),
                obs.character_id().map(str::to_string),
            )
        } else {
            (None, None)
        };
        let fail_message = if status == TaskStatus::Fail {
            obs.fail_message.clone()
        } else {
            None
        };

        self.blocking("record_observation", move |conn| {
            let now = now_ms();
            let changed = conn.execute(
                "UPDATE tasks SET status = ?2, progress = ?3, result_url = ?4, character_id = ?5, \
                 fail_message = ?6, stalled = 0, observed_at_ms = ?7, updated_at_ms = ?7 \
                 WHERE id = ?1 AND status NOT IN ('success', 'fail')",
                params![
                    &task_id,
                    status.as_str(),
                    progress,
                    &result_url,
                    &character_id,
                    &fail_message,
                    now
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Records the materialized copy. Only accepted once, and only on successful tasks.
    pub async fn set_local_path(&self, task_id: &str, local_path: &str) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        let local_path = local_path.to_string();
        self.blocking("set_local_path", move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET local_path = ?2, warning = NULL, updated_at_ms = ?3 \
                 WHERE id = ?1 AND status = 'success' AND local_path IS NULL",
                params![&task_id, &local_path, now_ms()],
            )?;
            anyhow::ensure!(
                changed == 1,
                "task {task_id} is not a successful task without a local copy"
            );
            Ok(())
        })
        .await
    }

    pub async fn set_warning(&self, task_id: &str, warning: &str) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        let warning = warning.to_string();
        self.blocking("set_warning", move |conn| {
            conn.execute(
                "UPDATE tasks SET warning = ?2, updated_at_ms = ?3 WHERE id = ?1",
                params![&task_id, &warning, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_stalled(&self, task_id: &str) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        self.blocking("mark_stalled", move |conn| {
            conn.execute(
                "UPDATE tasks SET stalled = 1, updated_at_ms = ?2 \
                 WHERE id = ?1 AND status NOT IN ('success', 'fail')",
                params![&task_id, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_event(
        &self,
        unit_id: &str,
        level: &'static str,
        message: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        let unit_id = unit_id.to_string();
        let message = message.to_string();
        self.blocking("record_event", move |conn| {
            conn.execute(
                "INSERT INTO events (unit_id, ts_ms, level, message, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&unit_id, now_ms(), level, &message, data.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_events(&self, unit_id: &str) -> anyhow::Result<Vec<UnitEvent>> {
        let unit_id = unit_id.to_string();
        self.blocking("list_events", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, unit_id, ts_ms, level, message, data_json FROM events WHERE unit_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([&unit_id], |row| {
                let data_json: Option<String> = row.get(5)?;
                Ok(UnitEvent {
                    id: row.get(0)?,
                    unit_id: row.get(1)?,
                    ts_ms: row.get(2)?,
                    level: row.get(3)?,
                    message: row.get(4)?,
                    data: data_json.and_then(|raw| serde_json::from_str(&raw).ok()),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn open(db_path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open sqlite db at {}", db_path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn select_unit(conn: &Connection, id: &str) -> anyhow::Result<Option<CreativeUnit>> {
    Ok(conn
        .query_row(
            &format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?1"),
            [id],
            unit_from_row,
        )
        .optional()?)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        unit_id: row.get(1)?,
        provider_task_id: row.get(2)?,
        kind: parse_column(row, 3)?,
        status: parse_column(row, 4)?,
        progress: row.get(5)?,
        result_url: row.get(6)?,
        local_path: row.get(7)?,
        character_id: row.get(8)?,
        fail_message: row.get(9)?,
        warning: row.get(10)?,
        stalled: row.get(11)?,
        observed_at_ms: row.get(12)?,
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
    })
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<CreativeUnit> {
    Ok(CreativeUnit {
        id: row.get(0)?,
        name: row.get(1)?,
        situation: row.get(2)?,
        prompt: row.get(3)?,
        video_task_id: row.get(4)?,
        video_duration_secs: row.get(5)?,
        character_name: row.get(6)?,
        character_id: row.get(7)?,
        character_task_id: row.get(8)?,
        next_prompt: row.get(9)?,
        next_task_id: row.get(10)?,
        stage: parse_column(row, 11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
    })
}
