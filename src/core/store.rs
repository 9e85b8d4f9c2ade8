use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgQueryResult, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, Transaction};
use tokio::sync::OnceCell;
use tokio::time::{error::Elapsed, timeout};

use crate::core::config::PoolSettings;
use crate::core::error::Error;

/// Owns the process-wide connection pool. Clones share the same pool.
#[derive(Clone, Debug)]
pub(crate) struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: PoolSettings,
    pool: OnceCell<PgPool>,
}

impl Store {
    /// Builds the store without connecting; the pool opens on first use.
    pub(crate) fn new(settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                pool: OnceCell::new(),
            }),
        }
    }

    /// Returns the pool, connecting it the first time. Concurrent callers
    /// wait on the same initialization.
    pub(crate) async fn pool(&self) -> Result<&PgPool, Error> {
        self.inner
            .pool
            .get_or_try_init(|| async {
                let settings = &self.inner.settings;

                tracing::info!(
                    max_connections = settings.max_connections,
                    "opening database pool"
                );

                PgPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .acquire_timeout(settings.acquire_timeout)
                    .connect_with(settings.options.clone())
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    #[cfg(test)]
    pub(crate) fn is_initialized(&self) -> bool {
        self.inner.pool.initialized()
    }

    /// Checks a connection out of the pool. An exhausted pool is retried once
    /// before `PoolExhausted` is surfaced.
    pub(crate) async fn session(&self) -> Result<Session, Error> {
        let pool = self.pool().await?;

        let conn = (move || async move { pool.acquire().await.map_err(Error::from) })
            .retry(retry_policy())
            .when(Error::is_transient)
            .notify(|err, _| tracing::warn!("retrying connection checkout after {}", err))
            .await?;

        Ok(Session {
            conn,
            timeout: self.inner.settings.statement_timeout,
            discard: false,
        })
    }

    pub(crate) async fn close(&self) {
        if let Some(pool) = self.inner.pool.get() {
            tracing::info!("closing database pool");
            pool.close().await;
        }
    }
}

fn retry_policy() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_millis(50))
        .with_max_times(1)
}

/// Runs `op` again once if it fails with a pool or timeout error. Only
/// used for operations that are safe to repeat.
pub(crate) async fn retry_once<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    op.retry(retry_policy())
        .when(Error::is_transient)
        .notify(|err, _| tracing::warn!("retrying after {}", err))
        .await
}

/// A pooled connection checked out for the duration of one operation. It
/// returns to the pool when dropped, unless a statement timed out, in which
/// case the connection is closed instead.
#[derive(Debug)]
pub(crate) struct Session {
    conn: PoolConnection<Postgres>,
    timeout: Duration,
    discard: bool,
}

impl Session {
    pub(crate) async fn execute(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, Error> {
        let result = timeout(self.timeout, query.execute(&mut *self.conn)).await;
        settle(&mut self.discard, result)
    }

    pub(crate) async fn fetch_all(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<PgRow>, Error> {
        let result = timeout(self.timeout, query.fetch_all(&mut *self.conn)).await;
        settle(&mut self.discard, result)
    }

    pub(crate) async fn fetch_optional(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, Error> {
        let result = timeout(self.timeout, query.fetch_optional(&mut *self.conn)).await;
        settle(&mut self.discard, result)
    }

    pub(crate) async fn fetch_one(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgRow, Error> {
        let result = timeout(self.timeout, query.fetch_one(&mut *self.conn)).await;
        settle(&mut self.discard, result)
    }

    /// Opens a transaction on this session's connection.
    pub(crate) async fn begin(&mut self) -> Result<SessionTransaction<'_>, Error> {
        let result = timeout(self.timeout, Connection::begin(&mut *self.conn)).await;
        let tx = settle(&mut self.discard, result)?;

        Ok(SessionTransaction {
            tx,
            timeout: self.timeout,
            discard: &mut self.discard,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.discard {
            self.conn.close_on_drop();
        }
    }
}

fn settle<T>(
    discard: &mut bool,
    result: Result<Result<T, sqlx::Error>, Elapsed>,
) -> Result<T, Error> {
    match result {
        Ok(result) => result.map_err(Error::from),
        Err(_) => {
            tracing::warn!("statement timed out, discarding connection");
            *discard = true;
            Err(Error::OperationTimeout)
        }
    }
}

/// An open transaction on a session. Dropping it without `commit` rolls it
/// back before the connection is reused.
#[derive(Debug)]
pub(crate) struct SessionTransaction<'s> {
    tx: Transaction<'s, Postgres>,
    timeout: Duration,
    discard: &'s mut bool,
}

impl SessionTransaction<'_> {
    pub(crate) async fn execute(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, Error> {
        let result = timeout(self.timeout, query.execute(&mut *self.tx)).await;
        settle(self.discard, result)
    }

    pub(crate) async fn fetch_optional(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, Error> {
        let result = timeout(self.timeout, query.fetch_optional(&mut *self.tx)).await;
        settle(self.discard, result)
    }

    pub(crate) async fn fetch_one(
        &mut self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgRow, Error> {
        let result = timeout(self.timeout, query.fetch_one(&mut *self.tx)).await;
        settle(self.discard, result)
    }

    pub(crate) async fn commit(self) -> Result<(), Error> {
        let result = timeout(self.timeout, self.tx.commit()).await;
        settle(self.discard, result)
    }

    pub(crate) async fn rollback(self) -> Result<(), Error> {
        let result = timeout(self.timeout, self.tx.rollback()).await;
        settle(self.discard, result)
    }
}
