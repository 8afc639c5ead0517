use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};

use crate::domain::run::RunContext;
use crate::publish::sink::md5_digest;

// Session-scoped advisory lock so two workers never drive the same run at once.
// The lock lives on one checked-out connection; lock and unlock must share it.
const LOCK_NAMESPACE: i64 = 0x4D4B_5453_4E41; // "MKTSNA"

fn lock_key_for_run(ctx: &RunContext) -> i64 {
    let digest = md5_digest(format!("{}/{}", ctx.pipeline, ctx.run_id).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    LOCK_NAMESPACE ^ i64::from_be_bytes(head)
}

/// A held run lock and the pooled session that holds it.
pub struct RunLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl RunLock {
    /// Returns `None` when another session already holds the run.
    pub async fn try_acquire(pool: &sqlx::PgPool, ctx: &RunContext) -> anyhow::Result<Option<Self>> {
        let key = lock_key_for_run(ctx);
        let mut conn = pool
            .acquire()
            .await
            .context("failed to check out a connection for the run lock")?;

        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

        Ok(acquired.0.then_some(Self { conn, key }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        let released = sqlx::query_as::<_, (bool,)>("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *self.conn)
            .await;

        match released {
            Ok((true,)) => Ok(()),
            other => {
                // Ending the session is the only other way to drop the lock.
                let _ = self.conn.detach().close().await;
                match other {
                    Ok(_) => anyhow::bail!("advisory lock (key={key}) was not held by its session"),
                    Err(e) => Err(e).with_context(|| {
                        format!("failed to release advisory lock (key={key}); session closed")
                    }),
                }
            }
        }
    }
}
