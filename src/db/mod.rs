use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

mod migrations;
pub mod models;

use crate::monitor::WindowEndReason;
use migrations::run_migrations;
use models::DischargeWindow;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn reason_from_str(value: &str) -> Result<WindowEndReason> {
    match value {
        "Charging" => Ok(WindowEndReason::Charging),
        "Reset" => Ok(WindowEndReason::Reset),
        _ => Err(anyhow!("unknown window end reason '{value}'")),
    }
}

/// Handle to the archive database. All access funnels through a dedicated
/// worker thread that owns the connection; callers await replies over
/// oneshot channels.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("drainwatch-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    pub async fn insert_window(&self, window: &DischargeWindow) -> Result<()> {
        let record = window.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO discharge_windows
                     (id, started_at, ended_at, end_reason, window_ms, screen_on_ms,
                      consumed_on_uah, consumed_off_uah, drop_on_pct, drop_off_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.ended_at.to_rfc3339(),
                    record.end_reason.as_str(),
                    to_i64(record.window_ms)?,
                    to_i64(record.screen_on_ms)?,
                    to_i64(record.consumed_on_uah)?,
                    to_i64(record.consumed_off_uah)?,
                    record.drop_on_pct,
                    record.drop_off_pct,
                ],
            )
            .with_context(|| "failed to insert discharge window")?;
            Ok(())
        })
        .await
    }

    pub async fn list_recent_windows(&self, limit: u32) -> Result<Vec<DischargeWindow>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, ended_at, end_reason, window_ms, screen_on_ms,
                        consumed_on_uah, consumed_off_uah, drop_on_pct, drop_off_pct
                 FROM discharge_windows
                 ORDER BY ended_at DESC
                 LIMIT ?1",
            )?;

            let rows = stmt.query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, f64>(9)?,
                ))
            })?;

            let mut windows = Vec::new();
            for row in rows {
                let (
                    id,
                    started_at,
                    ended_at,
                    end_reason,
                    window_ms,
                    screen_on_ms,
                    consumed_on_uah,
                    consumed_off_uah,
                    drop_on_pct,
                    drop_off_pct,
                ) = row?;

                windows.push(DischargeWindow {
                    id,
                    started_at: parse_datetime(&started_at)?,
                    ended_at: parse_datetime(&ended_at)?,
                    end_reason: reason_from_str(&end_reason)?,
                    window_ms: to_u64(window_ms)?,
                    screen_on_ms: to_u64(screen_on_ms)?,
                    consumed_on_uah: to_u64(consumed_on_uah)?,
                    consumed_off_uah: to_u64(consumed_off_uah)?,
                    drop_on_pct,
                    drop_off_pct,
                });
            }

            Ok(windows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ClosedWindow, WindowEndReason};
    use chrono::TimeZone;

    fn closed_window(ended_ms: u64) -> ClosedWindow {
        ClosedWindow {
            started_at: Utc.timestamp_millis_opt(0).unwrap(),
            ended_at: Utc.timestamp_millis_opt(ended_ms as i64).unwrap(),
            window_ms: ended_ms,
            screen_on_ms: ended_ms / 2,
            consumed_on_uah: 250_000,
            consumed_off_uah: 40_000,
            drop_on_pct: 7.5,
            drop_off_pct: 1.25,
            reason: WindowEndReason::Charging,
        }
    }

    #[tokio::test]
    async fn insert_and_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("archive.sqlite3")).unwrap();

        let first = DischargeWindow::from_closed(&closed_window(3_600_000));
        let second = DischargeWindow::from_closed(&closed_window(7_200_000));
        db.insert_window(&first).await.unwrap();
        db.insert_window(&second).await.unwrap();

        let windows = db.list_recent_windows(10).await.unwrap();
        assert_eq!(windows.len(), 2);
        // Most recently ended first.
        assert_eq!(windows[0].id, second.id);
        assert_eq!(windows[0].consumed_on_uah, 250_000);
        assert_eq!(windows[0].end_reason, WindowEndReason::Charging);
        assert_eq!(windows[1].screen_on_ms, 1_800_000);
    }

    #[tokio::test]
    async fn limit_caps_returned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("archive.sqlite3")).unwrap();

        for i in 1..=5u64 {
            let window = DischargeWindow::from_closed(&closed_window(i * 1_000_000));
            db.insert_window(&window).await.unwrap();
        }

        let windows = db.list_recent_windows(3).await.unwrap();
        assert_eq!(windows.len(), 3);
        assert!(windows[0].ended_at > windows[2].ended_at);
    }
}
