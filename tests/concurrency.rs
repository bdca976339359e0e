//! Integration tests for competing writers.

#![cfg(feature = "test-util")]

use std::{sync::Arc, time::Duration};

use tempora::{
    AggregateKey, Error, EventClass, NewEvent, Repository, SaveBatch, StoreConfig,
    store::{AggregatePort, Transactor, TxMode, inmemory},
    test::{AccountOpened, Deposited, ManualClock, t0},
};

fn repo(config: StoreConfig) -> Repository<inmemory::Store> {
    let repo = Repository::new(inmemory::Store::new())
        .with_clock(Arc::new(ManualClock::new(t0())))
        .with_config(config);
    repo.register_event::<AccountOpened>();
    repo.register_event::<Deposited>();
    repo
}

fn opened() -> NewEvent {
    let opened = AccountOpened { owner: "ada".into() };
    NewEvent::from_domain("acme", "1", EventClass::CreateStream, &opened).unwrap()
}

fn deposit(amount: i64) -> SaveBatch {
    let deposit = NewEvent::from_domain("acme", "1", EventClass::Instant, &Deposited { amount }).unwrap();
    SaveBatch::single(deposit).with_expected_version(0)
}

#[tokio::test]
async fn only_one_of_two_writers_on_the_same_version_wins() {
    let repo = repo(StoreConfig::default());
    repo.save(SaveBatch::single(opened())).await.unwrap();

    let (first, second) = tokio::join!(repo.save(deposit(1)), repo.save(deposit(2)));
    let outcomes = [first, second];

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(loser.root(), Error::ConcurrentModification(_)));

    let account = AggregateKey::new("acme", "account", "1");
    let state = repo.get_aggregate_state(&account).await.unwrap();
    assert_eq!(state.current_version, 1);
}

#[tokio::test]
async fn held_aggregate_lock_is_retried_then_reported() {
    let config = StoreConfig::default().with_save_retry_durations(vec![Duration::from_millis(1); 3]);
    let repo = repo(config);
    let account = AggregateKey::new("acme", "account", "1");

    let store = repo.backend();
    let mut holder = store.begin(TxMode::Transactional).await.unwrap();
    store
        .lock_aggregates(&mut holder, std::slice::from_ref(&account))
        .await
        .unwrap();

    let err = repo.save(SaveBatch::single(opened())).await.unwrap_err();
    assert!(err.is_contention());
    assert!(matches!(err, Error::ConcurrentAggregateAccess(_)));

    store.rollback(holder).await.unwrap();
    let outcome = repo.save(SaveBatch::single(opened())).await.unwrap();
    assert_eq!(outcome.events[0].version, 0);
}
