// src/storage/pool.rs
// Pooled connection to the embedded SQL store (spec.md §4.E): WAL
// journaling, sqlite-vec virtual tables, retry-on-contention. Grounded on
// the teacher's `db::pool::DatabasePool`.

use std::path::{Path, PathBuf};
use std::sync::Once;

use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;

use crate::error::{AgenrError, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Must run before any
/// connection in the pool is opened.
fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init matches the signature sqlite3_auto_extension
        // expects; this is the standard registration pattern for statically
        // linked SQLite extensions.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

fn is_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// The single connection pool for the agenr database. `AgenrPool::run`
/// serializes nothing by itself — the write queue (§4.F) is the
/// serialization point above this — but the pool still retries on raw
/// SQLite contention from the pool's own internal connection churn.
#[derive(Clone)]
pub struct AgenrPool {
    pool: Pool,
    path: Option<PathBuf>,
}

impl AgenrPool {
    pub async fn open(path: &Path) -> Result<Self> {
        ensure_sqlite_vec_registered();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn_str = path.to_string_lossy().to_string();
        let hook = make_file_post_create_hook(path.to_path_buf());

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .map_err(|e| AgenrError::Pool(e.to_string()))?
            .max_size(8)
            .post_create(hook)
            .build()
            .map_err(|e| AgenrError::Pool(e.to_string()))?;

        let agenr_pool = Self {
            pool,
            path: Some(path.to_path_buf()),
        };

        crate::storage::schema::run_migrations(&agenr_pool).await?;
        Ok(agenr_pool)
    }

    /// Open an in-memory database (tests): shared-cache URI so every pooled
    /// connection sees the same state.
    pub async fn open_in_memory() -> Result<Self> {
        ensure_sqlite_vec_registered();
        let uri = format!("file:agenr_memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let hook = make_memory_post_create_hook();
        let cfg = Config::new(&uri);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .map_err(|e| AgenrError::Pool(e.to_string()))?
            .max_size(8)
            .post_create(hook)
            .build()
            .map_err(|e| AgenrError::Pool(e.to_string()))?;

        let agenr_pool = Self { pool, path: None };
        crate::storage::schema::run_migrations(&agenr_pool).await?;
        Ok(agenr_pool)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure on a pooled connection off the async runtime.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await?;
        conn.interact(move |conn| f(conn)).await?
    }

    /// Like [`interact`](Self::interact) but retries on raw SQLite
    /// contention with the teacher's fixed backoff ladder.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        for delay in RETRY_DELAYS {
            match self.interact(f.clone()).await {
                Ok(v) => return Ok(v),
                Err(AgenrError::Db(e)) if is_contention(&e) => {
                    tracing::warn!(?delay, "SQLite contention, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.interact(f).await
    }
}

fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                        let mut perms = metadata.permissions();
                        perms.set_mode(0o600);
                        if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                            tracing::warn!("failed to set database file permissions: {}", e);
                        }
                    }
                }
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL; \
         PRAGMA journal_size_limit=32768;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_pool_and_runs_migrations() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
                    .map_err(AgenrError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
