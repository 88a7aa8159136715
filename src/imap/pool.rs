//! Per-account IMAP connection pooling.
//!
//! Gmail caps the number of simultaneous IMAP connections per account, so
//! all sync tasks of an account share one bounded [`ConnectionPool`].
//! Checked-in sessions are kept logged in; a session idle beyond the
//! keepalive window gets a NOOP probe before reuse and is thrown away if it
//! died. Pools live for the process in a registry keyed by account id.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::client::Client;
use super::session::MailSession;
use crate::account::Account;
use crate::context::Context;

/// Connections per account. Gmail allows 15 per account overall; stay well
/// below so other clients of the account keep working.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// How long a checkout may wait for a free slot.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle sessions older than this get a NOOP probe before reuse.
const KEEPALIVE: Duration = Duration::from_secs(1200);

/// Error of a pool checkout.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Login was rejected, even after a credential refresh.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The provider refused another connection for this account.
    #[error("too many simultaneous connections: {0}")]
    TooManyConnections(String),

    /// All slots stayed busy for the whole checkout timeout.
    #[error("timed out waiting for an IMAP connection")]
    CheckoutTimeout,

    /// Anything else, e.g. DNS or TLS trouble.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Creates new sessions for one account.
#[async_trait]
pub trait SessionConnector: Send + Sync + std::fmt::Debug {
    /// Connects and logs in.
    async fn connect(&self) -> Result<Box<dyn MailSession>, PoolError>;

    /// Picks up externally refreshed credentials after an auth failure.
    async fn refresh_credentials(&self) -> Result<(), PoolError>;
}

struct IdleEntry {
    session: Box<dyn MailSession>,
    last_used: Instant,
}

#[derive(Debug)]
struct PoolInner {
    connector: Box<dyn SessionConnector>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry>>,
}

impl std::fmt::Debug for IdleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleEntry").finish()
    }
}

/// A bounded pool of logged-in sessions for one account.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool of at most `size` concurrent sessions.
    pub fn new(connector: Box<dyn SessionConnector>, size: usize) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                connector,
                semaphore: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Checks out a session, reusing an idle one if possible.
    pub async fn checkout(&self) -> Result<PooledSession, PoolError> {
        let permit = tokio::time::timeout(
            CHECKOUT_TIMEOUT,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::CheckoutTimeout)?
        .map_err(|_| PoolError::Other(anyhow!("connection pool closed")))?;

        while let Some(mut entry) = self.pop_idle() {
            if entry.last_used.elapsed() >= KEEPALIVE {
                // The server may have dropped us while we were idle.
                if entry.session.noop().await.is_err() {
                    continue;
                }
            }
            return Ok(PooledSession {
                session: Some(entry.session),
                broken: false,
                pool: Arc::clone(&self.inner),
                _permit: permit,
            });
        }

        let session = self.connect_with_refresh().await?;
        Ok(PooledSession {
            session: Some(session),
            broken: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    fn pop_idle(&self) -> Option<IdleEntry> {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
    }

    /// A failed login gets one credential refresh and one more try; the
    /// external refresher may have stored a new token meanwhile.
    async fn connect_with_refresh(&self) -> Result<Box<dyn MailSession>, PoolError> {
        match self.inner.connector.connect().await {
            Ok(session) => Ok(session),
            Err(PoolError::AuthFailure(first)) => {
                self.inner.connector.refresh_credentials().await?;
                match self.inner.connector.connect().await {
                    Ok(session) => Ok(session),
                    Err(PoolError::AuthFailure(_)) => Err(PoolError::AuthFailure(first)),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// A checked-out session. Dropping it returns the session to the pool
/// unless it was marked broken.
#[derive(Debug)]
pub struct PooledSession {
    session: Option<Box<dyn MailSession>>,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// Marks the session unusable; it will be dropped instead of reused.
    ///
    /// Call this after any protocol-level error, the connection state is
    /// unknown then.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledSession {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        // Some until drop.
        self.session.as_ref().expect("session already returned").as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session already returned").as_mut()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if !self.broken {
                self.pool
                    .idle
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(IdleEntry {
                        session,
                        last_used: Instant::now(),
                    });
            }
        }
    }
}

/// Connects to the account's real IMAP server.
#[derive(Debug)]
pub struct ImapConnector {
    context: Context,
    account: tokio::sync::Mutex<Account>,
}

impl ImapConnector {
    pub fn new(context: Context, account: Account) -> ImapConnector {
        ImapConnector {
            context,
            account: tokio::sync::Mutex::new(account),
        }
    }
}

fn classify_login_error(err: anyhow::Error) -> PoolError {
    let msg = format!("{err:#}");
    if msg.contains("Too many simultaneous connections") {
        PoolError::TooManyConnections(msg)
    } else if msg.contains("AUTHENTICATIONFAILED") || msg.contains("Invalid credentials") {
        PoolError::AuthFailure(msg)
    } else {
        PoolError::Other(err)
    }
}

#[async_trait]
impl SessionConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailSession>, PoolError> {
        let account = self.account.lock().await.clone();
        let client = Client::connect_secure(&account.imap_host, account.imap_port).await?;
        let session = client
            .login(&account.credentials)
            .await
            .map_err(classify_login_error)?;
        info!(
            self.context,
            "connected to {}:{} for {}", account.imap_host, account.imap_port, account.email_address
        );
        Ok(Box::new(session))
    }

    async fn refresh_credentials(&self) -> Result<(), PoolError> {
        let mut account = self.account.lock().await;
        account
            .reload_credentials(&self.context)
            .await
            .map_err(PoolError::Other)
    }
}

static POOLS: Lazy<Mutex<HashMap<i64, ConnectionPool>>> = Lazy::new(Default::default);

/// Returns the process-wide connection pool of an account, creating it on
/// first use.
pub fn connection_pool(context: &Context, account: &Account) -> ConnectionPool {
    let mut pools = POOLS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    pools
        .entry(account.id)
        .or_insert_with(|| {
            ConnectionPool::new(
                Box::new(ImapConnector::new(context.clone(), account.clone())),
                DEFAULT_POOL_SIZE,
            )
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::imap::replay::{ReplayConnector, ReplayFixture};

    #[tokio::test]
    async fn test_checkout_reuses_idle_session() -> Result<(), PoolError> {
        let fixture = ReplayFixture::new();
        let connector = ReplayConnector::new(fixture);
        let connects = connector.connect_count();
        let pool = ConnectionPool::new(Box::new(connector), 2);

        let session = pool.checkout().await?;
        drop(session);
        let _session = pool.checkout().await?;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_session_is_not_reused() -> Result<(), PoolError> {
        let fixture = ReplayFixture::new();
        let connector = ReplayConnector::new(fixture);
        let connects = connector.connect_count();
        let pool = ConnectionPool::new(Box::new(connector), 2);

        let mut session = pool.checkout().await?;
        session.mark_broken();
        drop(session);
        let _session = pool.checkout().await?;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_once() {
        let fixture = ReplayFixture::new();
        let connector = ReplayConnector::new(fixture);
        // First login attempt fails; the retry after refresh succeeds.
        connector.fail_logins(1);
        let refreshes = connector.refresh_count();
        let pool = ConnectionPool::new(Box::new(connector), 1);

        pool.checkout().await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_auth_failure_surfaces() {
        let fixture = ReplayFixture::new();
        let connector = ReplayConnector::new(fixture);
        connector.fail_logins(usize::MAX);
        let pool = ConnectionPool::new(Box::new(connector), 1);

        match pool.checkout().await {
            Err(PoolError::AuthFailure(_)) => {}
            other => panic!("expected auth failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() -> Result<(), PoolError> {
        let fixture = ReplayFixture::new();
        let pool = ConnectionPool::new(Box::new(ReplayConnector::new(fixture)), 1);

        let held = pool.checkout().await?;
        // The only slot is taken; a second checkout must wait.
        let second = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(second.is_err());
        drop(held);
        pool.checkout().await?;
        Ok(())
    }
}
