//! Behaviour every [`QueueStore`] backend must show. Backends call
//! [`run_all`] from their own tests with a factory producing an empty store
//! whose maximum error count is 3.

use std::{future::Future, time::Duration};

use chrono::Utc;
use serde_json::json;

use crate::{
    error::QueueError,
    store::QueueStore,
    types::{JobId, JobStatus, NewJob},
};

pub async fn run_all<S, F, Fut>(make: F)
where
    S: QueueStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    enqueue_then_claim(&make().await).await;
    claim_prefers_most_recent(&make().await).await;
    claim_skips_ineligible_jobs(&make().await).await;
    claim_filters_on_consumer_substring(&make().await).await;
    racing_claims_have_one_winner(&make().await).await;
    failures_bump_error_count(&make().await).await;
    final_failure_exhausts_job(&make().await).await;
    unlock_makes_job_claimable_again(&make().await).await;
    remove_is_idempotent(&make().await).await;
    mutations_ignore_missing_rows(&make().await).await;
    listings_and_payload_updates(&make().await).await;
    garbage_collection_only_drops_expired(&make().await).await;
    stale_locks_are_released(&make().await).await;
}

pub async fn enqueue_then_claim<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({"foo": "bar"})))
        .await
        .unwrap();
    assert!(id.is_assigned());

    let job = store.claim_next("").await.unwrap().expect("job should be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.consumer_name, "Example");
    assert_eq!(job.command, "DoSomething");
    assert_eq!(job.data, json!({"foo": "bar"}));
    assert_eq!(job.status, JobStatus::New);
    assert_eq!(job.error_count, 0);
    assert!(job.is_locked());

    let stored = store.get_job(id).await.unwrap().unwrap();
    assert!(stored.is_locked());
    assert!(store.claim_next("").await.unwrap().is_none());
}

pub async fn claim_prefers_most_recent<S: QueueStore>(store: &S) {
    let older = store
        .enqueue(NewJob::new("Example", "DoSomething", json!(1)))
        .await
        .unwrap();
    let newer = store
        .enqueue(NewJob::new("Example", "DoSomething", json!(2)))
        .await
        .unwrap();

    assert_eq!(store.claim_next("").await.unwrap().unwrap().id, newer);
    assert_eq!(store.claim_next("").await.unwrap().unwrap().id, older);
    assert!(store.claim_next("").await.unwrap().is_none());
}

pub async fn claim_skips_ineligible_jobs<S: QueueStore>(store: &S) {
    let eligible = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})).test_mode(true))
        .await
        .unwrap();

    let expired = NewJob::new("Example", "DoSomething", json!({}))
        .expires_at(Utc::now() - chrono::Duration::minutes(1));
    store.enqueue(expired).await.unwrap();

    let exhausted = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    for _ in 0..store.max_error_count() {
        store.increase_error(exhausted, "boom", false).await.unwrap();
    }

    let done = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    store.mark_status(done, JobStatus::Ok).await.unwrap();

    let locked = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    store.lock(locked).await.unwrap();

    let errored = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    store.mark_status(errored, JobStatus::Error).await.unwrap();

    let unexpired = NewJob::new("Example", "DoSomething", json!({}))
        .expires_at(Utc::now() + chrono::Duration::hours(1));
    let unexpired = store.enqueue(unexpired).await.unwrap();

    let mut claimed = Vec::new();
    while let Some(job) = store.claim_next("").await.unwrap() {
        claimed.push(job.id);
    }
    claimed.sort();
    assert_eq!(claimed, vec![eligible, errored, unexpired]);
}

pub async fn claim_filters_on_consumer_substring<S: QueueStore>(store: &S) {
    let mailer = store
        .enqueue(NewJob::new("Mailer", "Send", json!({})))
        .await
        .unwrap();
    let example = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    assert!(store.claim_next("Report").await.unwrap().is_none());
    assert!(store.claim_next("mail").await.unwrap().is_none());
    assert_eq!(store.claim_next("ail").await.unwrap().unwrap().id, mailer);
    assert_eq!(store.claim_next("").await.unwrap().unwrap().id, example);
}

pub async fn racing_claims_have_one_winner<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    let (first, second) = tokio::join!(store.claim_next(""), store.claim_next(""));
    let winners: Vec<_> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, id);
}

pub async fn failures_bump_error_count<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    store.increase_error(id, "first", false).await.unwrap();
    assert_eq!(store.error_count(id).await.unwrap(), 1);
    store.increase_error(id, "second", false).await.unwrap();
    assert_eq!(store.error_count(id).await.unwrap(), 2);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.last_error, "second");
}

pub async fn final_failure_exhausts_job<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    store.increase_error(id, "gone for good", true).await.unwrap();
    assert_eq!(
        store.error_count(id).await.unwrap(),
        store.max_error_count() + 1
    );
    assert!(store.claim_next("").await.unwrap().is_none());

    let job = store.get_job(id).await.unwrap().expect("exhausted jobs are kept");
    assert_eq!(job.last_error, "gone for good");
}

pub async fn unlock_makes_job_claimable_again<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    store.claim_next("").await.unwrap().unwrap();
    store.lock(id).await.unwrap();
    assert!(store.claim_next("").await.unwrap().is_none());

    store.unlock(id).await.unwrap();
    assert!(!store.get_job(id).await.unwrap().unwrap().is_locked());
    assert_eq!(store.claim_next("").await.unwrap().unwrap().id, id);
}

pub async fn remove_is_idempotent<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();

    store.mark_status(id, JobStatus::Ok).await.unwrap();
    store.remove(id).await.unwrap();
    store.remove(id).await.unwrap();
    assert!(store.get_job(id).await.unwrap().is_none());
    assert!(store.list_all().await.unwrap().is_empty());
}

pub async fn mutations_ignore_missing_rows<S: QueueStore>(store: &S) {
    let missing = JobId(4242);
    store.lock(missing).await.unwrap();
    store.unlock(missing).await.unwrap();
    store.mark_status(missing, JobStatus::Ok).await.unwrap();
    store.increase_error(missing, "nobody home", true).await.unwrap();
    store.update_payload(missing, json!({})).await.unwrap();
    store.remove(missing).await.unwrap();

    assert!(matches!(
        store.error_count(missing).await,
        Err(QueueError::JobNotFound(id)) if id == missing
    ));
}

pub async fn listings_and_payload_updates<S: QueueStore>(store: &S) {
    let a = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({"n": 1})))
        .await
        .unwrap();
    let b = store
        .enqueue(NewJob::new("Example", "CheckUniverse", json!({"n": 2})))
        .await
        .unwrap();
    let c = store
        .enqueue(NewJob::new("Mailer", "DoSomething", json!({"n": 3})))
        .await
        .unwrap();

    let ids = |jobs: Vec<crate::types::Job>| {
        let mut ids: Vec<_> = jobs.into_iter().map(|j| j.id).collect();
        ids.sort();
        ids
    };

    assert_eq!(ids(store.list_all().await.unwrap()), vec![a, b, c]);
    assert_eq!(ids(store.list_by_consumer("Example").await.unwrap()), vec![a, b]);
    assert_eq!(ids(store.list_by_command("DoSomething").await.unwrap()), vec![a, c]);
    assert!(store.list_by_consumer("Exam").await.unwrap().is_empty());

    store
        .update_payload(b, json!({"Answer": "42"}))
        .await
        .unwrap();
    let job = store.get_job(b).await.unwrap().unwrap();
    assert_eq!(job.data, json!({"Answer": "42"}));
    assert!(!job.is_locked());
}

pub async fn garbage_collection_only_drops_expired<S: QueueStore>(store: &S) {
    let forever = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    let later = store
        .enqueue(
            NewJob::new("Example", "DoSomething", json!({}))
                .expires_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    let stale = store
        .enqueue(
            NewJob::new("Example", "DoSomething", json!({}))
                .expires_at(Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    store.lock(stale).await.unwrap();

    assert_eq!(store.garbage_collect().await.unwrap(), 1);
    assert!(store.get_job(stale).await.unwrap().is_none());
    assert!(store.get_job(forever).await.unwrap().is_some());
    assert!(store.get_job(later).await.unwrap().is_some());
    assert_eq!(store.garbage_collect().await.unwrap(), 0);
}

pub async fn stale_locks_are_released<S: QueueStore>(store: &S) {
    let id = store
        .enqueue(NewJob::new("Example", "DoSomething", json!({})))
        .await
        .unwrap();
    store.claim_next("").await.unwrap().unwrap();

    assert_eq!(
        store
            .release_stale_locks(Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        store
            .release_stale_locks(Duration::from_millis(5))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.claim_next("").await.unwrap().unwrap().id, id);
}
