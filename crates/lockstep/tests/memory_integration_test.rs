//! End-to-end tests against the in-memory store
//!
//! Run with: cargo test -p lockstep --test memory_integration_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use lockstep::persistence::CoordinationStore;
use lockstep::prelude::*;

fn queue(store: &Arc<InMemoryCoordinationStore>, config: JobQueueConfig) -> Arc<JobQueue> {
    Arc::new(JobQueue::new(store.clone(), config).expect("valid queue config"))
}

// ============================================
// Work Queue
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_claims_yield_one_lease() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("race"));
    queue.enqueue("op-1", "job", json!({"n": 1})).await.unwrap();

    let mut tasks = Vec::new();
    for worker in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let claimant = format!("worker-{worker}");
            // Returned rather than dropped so the item stays held until every task tried.
            queue.claim(&claimant, &[]).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(lease) = task.await.unwrap() {
            winners.push(lease);
        }
    }

    assert_eq!(winners.len(), 1);
    let mut lease = winners.pop().unwrap();
    lease.complete().await.unwrap();
    assert_eq!(store.item_count("race"), 0);
}

#[test_log::test(tokio::test)]
async fn test_claims_follow_priority() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("priorities"));

    for priority in [3, 2, 1] {
        queue
            .enqueue_with_priority("op-1", "job", json!({"p": priority}), priority)
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(mut lease) = queue.claim("worker-1", &[]).await.unwrap() {
        order.push(lease.priority().await.unwrap());
        lease.complete().await.unwrap();
    }
    assert_eq!(order, vec![1, 2, 3]);
}

#[test_log::test(tokio::test)]
async fn test_buffer_flushes_when_full() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("full").with_buffer_size(3));
    queue.enable_buffer();

    queue.enqueue("op-1", "job", json!(1)).await.unwrap();
    queue.enqueue("op-1", "job", json!(2)).await.unwrap();
    assert_eq!(queue.pending(), 2);
    assert_eq!(store.item_count("full"), 0);

    queue.enqueue("op-1", "job", json!(3)).await.unwrap();
    assert_eq!(queue.pending(), 0);
    assert_eq!(store.item_count("full"), 3);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_buffer_flushes_when_aged() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(
        &store,
        JobQueueConfig::new("aged").with_buffer_lifetime(Duration::from_secs(1)),
    );
    queue.enable_buffer();

    queue.enqueue("op-1", "job", json!(1)).await.unwrap();
    assert_eq!(queue.flush().await.unwrap(), 0);

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(queue.flush().await.unwrap(), 1);
    assert_eq!(store.item_count("aged"), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_aged_buffer_flushed_by_other_label() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(
        &store,
        JobQueueConfig::new("aged-labels").with_buffer_lifetime(Duration::from_secs(1)),
    );
    queue.enable_buffer();

    queue.enqueue("op-1", "a", json!(1)).await.unwrap();
    assert_eq!(queue.count_label("a", None).await.unwrap(), 0);

    tokio::time::advance(Duration::from_millis(1500)).await;
    queue.enqueue("op-1", "b", json!(2)).await.unwrap();

    assert_eq!(queue.count_label("a", None).await.unwrap(), 1);
    assert_eq!(queue.pending(), 1);
}

#[test_log::test(tokio::test)]
async fn test_expired_lease_is_reclaimed() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("expiry"));
    queue.enqueue("op-1", "job", json!("payload")).await.unwrap();

    let mut stale = queue
        .claim_with_lease("worker-a", &[], Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert!(queue.claim("worker-b", &[]).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;

    let mut fresh = queue.claim("worker-b", &[]).await.unwrap().unwrap();
    assert_eq!(fresh.id(), stale.id());

    let err = stale.complete().await.unwrap_err();
    assert!(matches!(err, Error::ExpiredLease));
    assert_eq!(stale.state(), LeaseState::Expired);

    // The stale holder's failure must not disturb the new holder.
    assert_eq!(fresh.value().await.unwrap(), &json!("payload"));
    fresh.complete().await.unwrap();
    assert_eq!(store.item_count("expiry"), 0);
}

#[test_log::test(tokio::test)]
async fn test_terminal_leases_reject_release() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("terminal"));
    queue.enqueue("op-1", "a", json!(1)).await.unwrap();
    queue.enqueue("op-1", "b", json!(2)).await.unwrap();

    let mut released = queue.claim("w", &["a".to_string()]).await.unwrap().unwrap();
    queue.release(&mut released).await.unwrap();
    assert!(matches!(
        queue.release(&mut released).await,
        Err(Error::AlreadyReleased)
    ));

    let mut completed = queue.claim("w", &["b".to_string()]).await.unwrap().unwrap();
    queue.complete(&mut completed).await.unwrap();
    assert!(matches!(
        completed.release().await,
        Err(Error::AlreadyReleased)
    ));

    assert_eq!(queue.count_jobs(None).await.unwrap(), 1);
}

#[test_log::test(tokio::test)]
async fn test_producer_and_dispatcher() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let queue = queue(&store, JobQueueConfig::new("mail"));

    let mut producer = JobQueueProducer::new(queue.clone());
    let mut batches = 0;
    producer.set_fn(move |p| {
        batches += 1;
        let first = batches == 1;
        Box::pin(async move {
            if first {
                for n in 0..3 {
                    p.enqueue("send", json!({"n": n})).await?;
                }
            }
            Ok::<_, Error>(())
        })
    });

    assert!(producer.run().await.unwrap());
    assert_eq!(producer.count().await.unwrap(), 3);
    assert!(!producer.is_done().await.unwrap());

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let mut dispatcher = Dispatcher::new(
        queue.clone(),
        DispatcherConfig::new().with_claimant_id("worker-1"),
    )
    .unwrap();
    dispatcher.add_fn("send", move |_label, lease| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(lease.complete())
    });

    assert_eq!(dispatcher.drain().await.unwrap(), 3);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert!(producer.is_done().await.unwrap());
}

// ============================================
// Resource Pool
// ============================================

fn owners(store: &InMemoryCoordinationStore, pool: &str) -> HashMap<Option<String>, usize> {
    let mut owners = HashMap::new();
    for record in store.resources(pool) {
        *owners.entry(record.owner_pool_id).or_default() += 1;
    }
    owners
}

#[test_log::test(tokio::test)]
async fn test_pool_quota_converges() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let config = |id: &str| ResourcePoolConfig::new("relays").with_pool_id(id);

    let a = ResourcePool::new(store.clone(), config("pool-a")).await.unwrap();
    for n in 0..5 {
        a.def(json!(format!("relay-{n}"))).await.unwrap();
    }
    a.update().await.unwrap();
    assert_eq!(a.allocated_size(), 5);

    // Everything is owned by a live member, so the newcomer starts empty.
    let b = ResourcePool::new(store.clone(), config("pool-b")).await.unwrap();
    assert_eq!(b.allocated_size(), 0);

    a.reset_renewal_window();
    a.update().await.unwrap();
    b.reset_renewal_window();
    b.update().await.unwrap();

    assert_eq!(a.allocated_size(), 3);
    assert_eq!(b.allocated_size(), 2);

    let owners = owners(&store, "relays");
    assert_eq!(owners.get(&Some("pool-a".to_string())), Some(&3));
    assert_eq!(owners.get(&Some("pool-b".to_string())), Some(&2));
    assert_eq!(owners.get(&None), None);
}

#[test_log::test(tokio::test)]
async fn test_pool_takes_over_lapsed_member() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let config = |id: &str| ResourcePoolConfig::new("relays").with_pool_id(id);

    let a = ResourcePool::new(store.clone(), config("pool-a")).await.unwrap();
    let b = ResourcePool::new(store.clone(), config("pool-b")).await.unwrap();
    for n in 0..4 {
        a.def(json!(n)).await.unwrap();
    }
    a.update().await.unwrap();
    b.reset_renewal_window();
    b.update().await.unwrap();
    assert_eq!(a.allocated_size() + b.allocated_size(), 4);
    assert_eq!(b.allocated_size(), 2);

    assert!(store.expire_membership("relays", "pool-b"));
    a.reset_renewal_window();
    a.clean().await.unwrap();

    assert_eq!(a.allocated_size(), 4);
    assert_eq!(owners(&store, "relays").get(&Some("pool-a".to_string())), Some(&4));
    assert_eq!(
        store.live_memberships("relays").await.unwrap().len(),
        1,
        "lapsed member removed"
    );
}

#[test_log::test(tokio::test)]
async fn test_pool_handles_round_trip() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let pool = ResourcePool::new(store, ResourcePoolConfig::new("keys")).await?;
    pool.def(json!("k1")).await?;
    pool.def(json!("k2")).await?;

    let mut first = pool.get().await?.context("first key")?;
    let mut second = pool.get().await?.context("second key")?;
    assert_ne!(first.id(), second.id());
    assert!(pool.get().await?.is_none());

    assert_ok!(first.release(Some(Duration::from_secs(600))).await);
    assert_ok!(second.release(None).await);

    let status = pool.status();
    assert_eq!(status.free, 1);
    assert_eq!(status.blocked.within_15m, 1);
    let err = assert_err!(first.release(None).await);
    assert!(matches!(err, Error::AlreadyReleased));
    Ok(())
}
