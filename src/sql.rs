//! # SQLite wrapper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use rusqlite::OpenFlags;
use tokio::sync::RwLock;

use crate::context::Context;

mod migrations;

/// A wrapper around the underlying Sqlite3 object.
#[derive(Debug)]
pub struct Sql {
    /// Database file path.
    pub(crate) dbfile: PathBuf,

    /// None if the database is not open, Some if it is open.
    pool: RwLock<Option<r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>>>,
}

impl Sql {
    /// Creates new SQL database.
    pub fn new(dbfile: PathBuf) -> Sql {
        Self {
            dbfile,
            pool: Default::default(),
        }
    }

    /// Tests SQL database connection.
    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Closes all underlying Sqlite connections.
    pub async fn close(&self) {
        let _ = self.pool.write().await.take();
        // drop closes the connections
    }

    fn new_pool(dbfile: &Path) -> Result<r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>> {
        let mut open_flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
        open_flags.insert(OpenFlags::SQLITE_OPEN_READ_WRITE);
        open_flags.insert(OpenFlags::SQLITE_OPEN_CREATE);

        // this actually creates min_idle database handles just now.
        // therefore, with_init() must not try to modify the database as otherwise
        // we easily get busy-errors (eg. table-creation, journal_mode etc. should
        // be done on only one handle)
        let mgr = r2d2_sqlite::SqliteConnectionManager::file(dbfile)
            .with_flags(open_flags)
            .with_init(move |c| {
                c.execute_batch(&format!(
                    "PRAGMA secure_delete=on;
                     PRAGMA busy_timeout = {};
                     PRAGMA temp_store=memory;
                     PRAGMA foreign_keys=on;
                     ",
                    Duration::from_secs(10).as_millis()
                ))?;
                Ok(())
            });

        let pool = r2d2::Pool::builder()
            .min_idle(Some(2))
            .max_size(10)
            .connection_timeout(Duration::from_secs(60))
            .build(mgr)
            .context("Can't build SQL connection pool")?;
        Ok(pool)
    }

    async fn try_open(&self, context: &Context, dbfile: &Path) -> Result<()> {
        *self.pool.write().await = Some(Self::new_pool(dbfile)?);

        {
            let conn = self.get_conn().await?;

            // journal_mode is persisted, it is sufficient to change it only for one handle.
            conn.pragma_update(None, "journal_mode", "WAL")?;

            // Default synchronous=FULL is much slower. NORMAL is sufficient for WAL mode.
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        migrations::run(context, self)
            .await
            .context("failed to run migrations")?;

        Ok(())
    }

    /// Opens the provided database and runs any necessary migrations.
    pub async fn open(&self, context: &Context) -> Result<()> {
        if self.is_open().await {
            error!(
                context,
                "Cannot open, database \"{:?}\" already opened.", self.dbfile,
            );
            bail!("SQL database is already opened.");
        }

        if let Err(err) = self.try_open(context, &self.dbfile.clone()).await {
            self.close().await;
            Err(err)
        } else {
            info!(context, "Opened database {:?}.", self.dbfile);
            Ok(())
        }
    }

    pub(crate) async fn get_conn(
        &self,
    ) -> Result<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        let lock = self.pool.read().await;
        let pool = lock.as_ref().context("no SQL connection")?;
        let conn = pool.get()?;

        Ok(conn)
    }

    /// Execute the given query, returning the number of affected rows.
    pub async fn execute(
        &self,
        query: impl AsRef<str>,
        params: impl rusqlite::Params,
    ) -> Result<usize> {
        let conn = self.get_conn().await?;
        let res = conn.execute(query.as_ref(), params)?;
        Ok(res)
    }

    /// Executes the given query, returning the last inserted row ID.
    pub async fn insert(
        &self,
        query: impl AsRef<str>,
        params: impl rusqlite::Params,
    ) -> Result<i64> {
        let conn = self.get_conn().await?;
        conn.execute(query.as_ref(), params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Prepares and executes the statement and maps a function over the resulting rows.
    /// Then executes the second function over the returned iterator and returns the
    /// result of that function.
    pub async fn query_map<T, F, G, H>(
        &self,
        sql: impl AsRef<str>,
        params: impl rusqlite::Params,
        f: F,
        mut g: G,
    ) -> Result<H>
    where
        F: FnMut(&rusqlite::Row) -> rusqlite::Result<T>,
        G: FnMut(rusqlite::MappedRows<F>) -> Result<H>,
    {
        let sql = sql.as_ref();

        let conn = self.get_conn().await?;
        let mut stmt = conn.prepare(sql)?;
        let res = stmt.query_map(params, f)?;
        g(res)
    }

    /// Used for executing `SELECT COUNT` statements only. Returns the resulting count.
    pub async fn count(
        &self,
        query: impl AsRef<str>,
        params: impl rusqlite::Params,
    ) -> Result<usize> {
        let count: isize = self.query_row(query, params, |row| row.get(0)).await?;
        Ok(usize::try_from(count)?)
    }

    /// Used for executing `SELECT COUNT` statements only. Returns `true`, if the
    /// count is at least one, `false` otherwise.
    pub async fn exists(&self, sql: &str, params: impl rusqlite::Params) -> Result<bool> {
        let count = self.count(sql, params).await?;
        Ok(count > 0)
    }

    /// Execute a query which is expected to return one row.
    pub async fn query_row<T, F>(
        &self,
        query: impl AsRef<str>,
        params: impl rusqlite::Params,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn().await?;
        let res = conn.query_row(query.as_ref(), params, f)?;
        Ok(res)
    }

    /// Execute the function inside a transaction.
    ///
    /// If the function returns an error, the transaction will be rolled back.
    /// If it does not return an error, the transaction will be committed.
    pub async fn transaction<G, H>(&self, callback: G) -> Result<H>
    where
        H: Send + 'static,
        G: Send + 'static + FnOnce(&mut rusqlite::Transaction<'_>) -> Result<H>,
    {
        let mut conn = self.get_conn().await?;
        let mut transaction = conn.transaction()?;
        let ret = callback(&mut transaction);

        match ret {
            Ok(ret) => {
                transaction.commit()?;
                Ok(ret)
            }
            Err(err) => {
                transaction.rollback()?;
                Err(err)
            }
        }
    }

    /// Query the database if the requested table already exists.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        let mut exists = false;
        conn.pragma(None, "table_info", name.to_string(), |_row| {
            // will only be executed if the info was found
            exists = true;
            Ok(())
        })?;

        Ok(exists)
    }

    /// Execute a query which is expected to return zero or one row.
    pub async fn query_row_optional<T, F>(
        &self,
        sql: impl AsRef<str>,
        params: impl rusqlite::Params,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn().await?;
        let res = match conn.query_row(sql.as_ref(), params, f) {
            Ok(res) => Ok(Some(res)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(rusqlite::Error::InvalidColumnType(_, _, rusqlite::types::Type::Null)) => Ok(None),
            Err(err) => Err(err),
        }?;
        Ok(res)
    }

    /// Executes a query which is expected to return one row and one column. If
    /// the query does not return a value or returns SQL `NULL`, returns `Ok(None)`.
    pub async fn query_get_value<T>(
        &self,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<T>>
    where
        T: rusqlite::types::FromSql,
    {
        self.query_row_optional(query, params, |row| row.get::<_, T>(0))
            .await
    }

    /// Set private configuration options.
    ///
    /// Setting `None` deletes the value.  On failure an error message
    /// will be logged.
    pub async fn set_raw_config(&self, key: impl AsRef<str>, value: Option<&str>) -> Result<()> {
        let key = key.as_ref();
        if let Some(value) = value {
            self.execute(
                "INSERT OR REPLACE INTO config (keyname, value) VALUES (?, ?)",
                (key, value),
            )
            .await?;
        } else {
            self.execute("DELETE FROM config WHERE keyname=?", (key,))
                .await?;
        }

        Ok(())
    }

    /// Get configuration options from the database.
    pub async fn get_raw_config(&self, key: impl AsRef<str>) -> Result<Option<String>> {
        self.query_get_value("SELECT value FROM config WHERE keyname=?", (key.as_ref(),))
            .await
    }

    /// Sets configuration for the given key to 64-bit signed integer value.
    pub async fn set_raw_config_int64(&self, key: impl AsRef<str>, value: i64) -> Result<()> {
        self.set_raw_config(key, Some(&format!("{value}"))).await
    }

    /// Reads 64-bit signed integer configuration value for the given key.
    pub async fn get_raw_config_int64(&self, key: impl AsRef<str>) -> Result<Option<i64>> {
        let res = self.get_raw_config(key).await?;
        Ok(res.and_then(|r| r.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test]
    async fn test_db_opens_and_migrates() -> Result<()> {
        let t = TestContext::new().await;
        assert!(t.ctx.sql.is_open().await);
        assert!(t.ctx.sql.table_exists("accounts").await?);
        assert!(t.ctx.sql.table_exists("messages").await?);
        assert!(t.ctx.sql.table_exists("folder_uids").await?);
        assert!(t.ctx.sql.table_exists("threads").await?);
        assert!(t.ctx.sql.table_exists("folder_sync_state").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_config() -> Result<()> {
        let t = TestContext::new().await;
        let sql = &t.ctx.sql;
        assert_eq!(sql.get_raw_config("testkey").await?, None);
        sql.set_raw_config("testkey", Some("value")).await?;
        assert_eq!(sql.get_raw_config("testkey").await?, Some("value".to_string()));
        sql.set_raw_config_int64("testkey", 42).await?;
        assert_eq!(sql.get_raw_config_int64("testkey").await?, Some(42));
        sql.set_raw_config("testkey", None).await?;
        assert_eq!(sql.get_raw_config("testkey").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_rollback() -> Result<()> {
        let t = TestContext::new().await;
        let res: Result<()> = t
            .ctx
            .sql
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO config (keyname, value) VALUES ('a', 'b')",
                    (),
                )?;
                anyhow::bail!("nope");
            })
            .await;
        assert!(res.is_err());
        assert_eq!(t.ctx.sql.get_raw_config("a").await?, None);
        Ok(())
    }
}
