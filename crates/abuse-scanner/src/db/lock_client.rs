//! Distributed per-record locks.
//!
//! Stage workers wrap every record mutation in an acquire/release pair.
//! Locks are exclusive and TTL-bounded; a crashed holder at worst parks a
//! record for the TTL. Failing to acquire is a normal outcome (another host
//! got there first) and callers treat it as a skip.

use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use thiserror::Error;
use tracing::warn;

use super::entities::lock;

/// Resource name under which email records are locked.
pub const RESOURCE_EMAILS: &str = "emails";

/// Resource name under which NCMEC report records are locked.
pub const RESOURCE_REPORTS: &str = "ncmec_reports";

/// Owner stamp written into every lock row.
const LOCK_OWNER: &str = "Abuse Scanner";

/// Time-to-live of a lock.
const LOCK_TTL: Duration = Duration::from_secs(300);

/// How long a release is retried before giving up.
const RELEASE_DEADLINE: Duration = Duration::from_secs(60);

const RELEASE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised by the lock client.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another worker holds the lock.
    #[error("resource is locked")]
    Busy,

    #[error("lock database error: {0}")]
    Db(#[from] DbErr),

    #[error("could not release lock '{id}' within the deadline: {source}")]
    ReleaseTimeout {
        id: String,
        #[source]
        source: DbErr,
    },
}

/// Hands out exclusive locks on `(resource, id)` pairs backed by the shared
/// lock collection.
#[derive(Clone)]
pub struct LockClient {
    db: DatabaseConnection,
    host: String,
}

impl LockClient {
    pub fn new(db: DatabaseConnection, host: String) -> Self {
        Self { db, host }
    }

    /// Acquires an exclusive lock. Returns [`LockError::Busy`] when another
    /// worker currently holds it.
    pub async fn acquire(&self, resource: &str, id: &str) -> Result<LockGuard, LockError> {
        let key = lock_key(resource, id);
        let now = Utc::now();

        // an expired row belongs to a crashed holder, clear it first
        lock::Entity::delete_many()
            .filter(lock::Column::Id.eq(&key))
            .filter(lock::Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;

        let row = lock::ActiveModel {
            id: Set(key.clone()),
            owner: Set(LOCK_OWNER.to_string()),
            host: Set(self.host.clone()),
            expires_at: Set(now + LOCK_TTL),
        };

        let insert = lock::Entity::insert(row)
            .on_conflict(OnConflict::column(lock::Column::Id).do_nothing().to_owned())
            .exec(&self.db)
            .await;

        match insert {
            Ok(_) => Ok(LockGuard {
                db: self.db.clone(),
                key,
                host: self.host.clone(),
            }),
            Err(DbErr::RecordNotInserted) => Err(LockError::Busy),
            Err(err) => Err(err.into()),
        }
    }
}

/// A held lock. Must be released explicitly; a guard that is dropped without
/// release simply expires after the TTL.
#[must_use = "a lock guard must be released"]
pub struct LockGuard {
    db: DatabaseConnection,
    key: String,
    host: String,
}

impl LockGuard {
    /// Releases the lock, retrying transient store errors under a bounded
    /// deadline. State written while holding the lock is never rolled back
    /// on release failure; the stage flags reconcile on the next tick.
    pub async fn release(self) -> Result<(), LockError> {
        let deadline = tokio::time::Instant::now() + RELEASE_DEADLINE;
        loop {
            let res = lock::Entity::delete_many()
                .filter(lock::Column::Id.eq(&self.key))
                .filter(lock::Column::Host.eq(&self.host))
                .exec(&self.db)
                .await;
            match res {
                Ok(_) => return Ok(()),
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    return Err(LockError::ReleaseTimeout {
                        id: self.key,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!("failed to release lock '{}', retrying: {}", self.key, err);
                    tokio::time::sleep(RELEASE_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

fn lock_key(resource: &str, id: &str) -> String {
    format!("{}:{}", resource, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key(RESOURCE_EMAILS, "INBOX-1-2"), "emails:INBOX-1-2");
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let client = LockClient::new(db, "host-a".to_string());

        let guard = client.acquire(RESOURCE_EMAILS, "INBOX-1-1").await.unwrap();
        guard.release().await.unwrap();

        // re-acquire after release
        let guard = client.acquire(RESOURCE_EMAILS, "INBOX-1-1").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_busy() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let a = LockClient::new(db.clone(), "host-a".to_string());
        let b = LockClient::new(db, "host-b".to_string());

        let guard = a.acquire(RESOURCE_EMAILS, "INBOX-1-1").await.unwrap();
        assert!(matches!(
            b.acquire(RESOURCE_EMAILS, "INBOX-1-1").await,
            Err(LockError::Busy)
        ));

        // a different id is free
        let other = b.acquire(RESOURCE_EMAILS, "INBOX-1-2").await.unwrap();
        other.release().await.unwrap();

        guard.release().await.unwrap();
        let guard = b.acquire(RESOURCE_EMAILS, "INBOX-1-1").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_expired_lock() {
        let db = init_database("sqlite::memory:").await.unwrap();

        // plant an expired lock row held by a dead host
        let row = lock::ActiveModel {
            id: Set(lock_key(RESOURCE_EMAILS, "INBOX-1-1")),
            owner: Set(LOCK_OWNER.to_string()),
            host: Set("dead-host".to_string()),
            expires_at: Set(Utc::now() - chrono::Duration::seconds(1)),
        };
        lock::Entity::insert(row).exec(&db).await.unwrap();

        let client = LockClient::new(db, "host-a".to_string());
        let guard = client.acquire(RESOURCE_EMAILS, "INBOX-1-1").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_resources_do_not_collide() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let client = LockClient::new(db, "host-a".to_string());

        let email_lock = client.acquire(RESOURCE_EMAILS, "x").await.unwrap();
        let report_lock = client.acquire(RESOURCE_REPORTS, "x").await.unwrap();

        email_lock.release().await.unwrap();
        report_lock.release().await.unwrap();
    }
}
