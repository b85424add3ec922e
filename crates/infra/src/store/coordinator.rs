//! Transaction coordinator.
//!
//! [`Coordinator::run_atomic`] is the only way ledger code obtains a
//! transaction. The work closure receives the transaction handle explicitly:
//!
//! ```rust,ignore
//! let account = coordinator
//!     .run_atomic(move |tx| {
//!         Box::pin(async move {
//!             let account = tx.create_account(params).await?;
//!             tx.create_entry(NewEntry { account_id: account.id, amount: 100 }).await?;
//!             tx.add_account_balance(account.id, 100).await
//!         })
//!     })
//!     .await?;
//! ```
//!
//! ## Outcome
//!
//! | Work result | Action | Returned |
//! |-------------|--------|----------|
//! | `Ok(v)` | commit | `Ok(v)`, or the commit error |
//! | `Err(e)` | rollback succeeds | `Err(e)` unchanged |
//! | `Err(e)` | rollback fails | `StoreError::Rollback { source: e, rollback }` |
//! | deadline elapsed | work dropped, rollback | `StoreError::Timeout` |

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use super::error::{StoreError, StoreResult};
use super::r#trait::{Store, TxHandle};

/// Runs units of work atomically against a [`Store`].
#[derive(Debug, Clone)]
pub struct Coordinator<S> {
    store: S,
    deadline: Option<Duration>,
}

impl<S: Store> Coordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            deadline: None,
        }
    }

    /// Bound the time a unit of work may hold its transaction open.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `work` inside one transaction.
    ///
    /// All statements issued through the handle share one connection and
    /// execute in program order.
    #[instrument(name = "run_atomic", skip_all, err)]
    pub async fn run_atomic<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, StoreResult<T>> + Send,
    {
        let mut tx = self.store.begin().await?;

        let outcome = match self.deadline {
            Some(limit) => match tokio::time::timeout(limit, work(&mut tx)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(deadline_ms = limit.as_millis() as u64, "transaction deadline exceeded");
                    Err(StoreError::Timeout(limit))
                }
            },
            None => work(&mut tx).await,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "rolling back transaction");
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback) => Err(StoreError::Rollback {
                        source: Box::new(err),
                        rollback: Box::new(rollback),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ledgerline_core::{Currency, DomainError, NewAccount, NewUser, Page};

    use super::*;
    use crate::store::{InMemoryStore, Queries};

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut conn = store.acquire().await.unwrap();
        conn.create_user(NewUser {
            username: "alice".into(),
            hashed_password: "hash".into(),
            full_name: "Alice Doe".into(),
            email: "alice@example.com".into(),
        })
        .await
        .unwrap();
        store
    }

    fn usd_account() -> NewAccount {
        NewAccount {
            owner: "alice".into(),
            currency: Currency::Usd,
        }
    }

    #[tokio::test]
    async fn commits_on_success() {
        let store = seeded().await;
        let coordinator = Coordinator::new(store.clone());

        let account = coordinator
            .run_atomic(|tx| Box::pin(async move { tx.create_account(usd_account()).await }))
            .await
            .unwrap();

        let mut conn = store.acquire().await.unwrap();
        assert_eq!(conn.get_account(account.id).await.unwrap(), account);
    }

    #[tokio::test]
    async fn rolls_back_and_returns_the_original_error() {
        let store = seeded().await;
        let coordinator = Coordinator::new(store.clone());

        let err = coordinator
            .run_atomic(|tx| {
                Box::pin(async move {
                    tx.create_account(usd_account()).await?;
                    Err::<(), _>(StoreError::from(DomainError::invariant("boom")))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Domain(DomainError::InvariantViolation(_))));
        let mut conn = store.acquire().await.unwrap();
        assert!(conn.list_accounts("alice", Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_wraps_both_errors() {
        let store = seeded().await;
        store.fail_next_rollback();
        let coordinator = Coordinator::new(store.clone());

        let err = coordinator
            .run_atomic(|tx| {
                Box::pin(async move {
                    tx.create_account(usd_account()).await?;
                    Err::<(), _>(StoreError::not_found("account"))
                })
            })
            .await
            .unwrap_err();

        match err {
            StoreError::Rollback { source, rollback } => {
                assert!(source.is_not_found());
                assert!(matches!(*rollback, StoreError::Database { .. }));
            }
            other => panic!("expected rollback error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn commit_failure_is_returned() {
        let store = seeded().await;
        store.fail_next_commit();
        let coordinator = Coordinator::new(store.clone());

        let err = coordinator
            .run_atomic(|tx| Box::pin(async move { tx.create_account(usd_account()).await }))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Database { operation: "commit", .. }));
        let mut conn = store.acquire().await.unwrap();
        assert!(conn.list_accounts("alice", Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_rolls_back_slow_work() {
        let store = seeded().await;
        let coordinator = Coordinator::new(store.clone()).with_deadline(Duration::from_millis(50));

        let err = coordinator
            .run_atomic(|tx| {
                Box::pin(async move {
                    tx.create_account(usd_account()).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, StoreError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Timeout(_)));
        let mut conn = store.acquire().await.unwrap();
        assert!(conn.list_accounts("alice", Page::default()).await.unwrap().is_empty());
    }
}
