//! Store and workflow tests against a live Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p ledgerline-infra -- --ignored`.
//! Each test works on freshly named users so the database can be reused.

use chrono::{Duration, Utc};
use uuid::Uuid;

use ledgerline_core::{Currency, ErrorKind, NewUser, NewVerifyEmail, Page};
use ledgerline_infra::db;
use ledgerline_infra::ledger::{CreateAccountParams, TransferEngine, TransferTxParams};
use ledgerline_infra::store::{Coordinator, PgStore, Queries, Store, StoreError};
use ledgerline_infra::users::{
    CreateUserParams, UserWorkflow, VerifyEmailTxParams, random_secret_code,
};

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::connect(&url, 10).await.unwrap();
    db::migrate(&pool).await.unwrap();
    PgStore::new(pool)
}

fn unique_username() -> String {
    format!("user_{}", &Uuid::new_v4().simple().to_string()[..12])
}

async fn seed_user(store: &PgStore) -> String {
    let username = unique_username();
    store
        .acquire()
        .await
        .unwrap()
        .create_user(NewUser {
            username: username.clone(),
            hashed_password: "hash".into(),
            full_name: "Test User".into(),
            email: format!("{username}@example.com"),
        })
        .await
        .unwrap();
    username
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn migrated_pool_passes_health_check() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::connect(&url, 2).await.unwrap();
    db::migrate(&pool).await.unwrap();
    db::health_check(&pool).await.unwrap();

    pool.close().await;
    assert!(matches!(
        db::health_check(&pool).await,
        Err(StoreError::Database { operation: "health_check", .. })
    ));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_user_maps_to_unique_violation() {
    let store = store().await;
    let username = seed_user(&store).await;

    let err = store
        .acquire()
        .await
        .unwrap()
        .create_user(NewUser {
            username: username.clone(),
            hashed_password: "hash".into(),
            full_name: "Test User".into(),
            email: format!("other-{username}@example.com"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UniqueViolation(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn missing_rows_are_not_found() {
    let store = store().await;
    let err = store
        .acquire()
        .await
        .unwrap()
        .get_user(&unique_username())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_opposite_transfers_do_not_deadlock() {
    let store = store().await;
    let engine = TransferEngine::new(Coordinator::new(store.clone()));
    let mut ids = Vec::new();
    for _ in 0..2 {
        let owner = seed_user(&store).await;
        let account = engine
            .open_account(CreateAccountParams {
                owner,
                currency: Currency::Usd,
                opening_balance: 1_000,
            })
            .await
            .unwrap();
        ids.push(account.id);
    }
    let (a, b) = (ids[0], ids[1]);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let engine = engine.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        tasks.spawn(async move {
            engine
                .transfer(TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 10,
                })
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    for id in [a, b] {
        let account = engine.account(id).await.unwrap();
        assert_eq!(account.balance, 1_000);
        let entries = engine.entries(id, Page::new(100, 0)).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), account.balance);
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn verify_email_commits_both_writes_once() {
    let store = store().await;
    let workflow = UserWorkflow::new(Coordinator::new(store.clone()));
    let username = unique_username();
    workflow
        .create_user_tx(
            CreateUserParams {
                username: username.clone(),
                password: "secret123".into(),
                full_name: "Test User".into(),
                email: format!("{username}@example.com"),
            },
            |_| async { Ok(()) },
        )
        .await
        .unwrap();

    let code = store
        .acquire()
        .await
        .unwrap()
        .create_verify_email(NewVerifyEmail {
            username: username.clone(),
            email: format!("{username}@example.com"),
            secret_code: random_secret_code(),
            expires_at: Utc::now() + Duration::minutes(15),
        })
        .await
        .unwrap();

    let params = VerifyEmailTxParams {
        email_id: code.id,
        secret_code: &code.secret_code,
    };
    let result = workflow.verify_email_tx(params).await.unwrap();
    assert!(result.user.is_email_verified);
    let err = workflow.verify_email_tx(params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
