// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for operation failures and resolution errors.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering::SeqCst},
    },
    time::Duration,
};

use futures::future::ready;
use swirl::{CacheTime, Error, KeySpec, SubscriberOptions, SwrStore};
use tick::Clock;
use tokio::sync::Semaphore;

fn store() -> SwrStore<u32, String> {
    SwrStore::builder(Clock::new_frozen()).default_cache_time(Duration::from_secs(60)).build()
}

#[tokio::test]
async fn failure_reaches_every_waiter_and_is_not_cached() {
    let store = store();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let service = {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        move |id: u32| {
            let attempt = calls.fetch_add(1, SeqCst) + 1;
            let gate = Arc::clone(&gate);
            async move {
                if attempt == 1 {
                    let _permit = gate.acquire().await.map_err(Error::from_source)?;
                    return Err(Error::from_source(io::Error::other("backend down")));
                }
                Ok(format!("user {id}"))
            }
        }
    };
    let leader = store.subscribe(service.clone(), SubscriberOptions::new().key("user:1"));
    let joiner = store.subscribe(service, SubscriberOptions::new().key("user:1"));

    let (a, b, ()) = tokio::join!(leader.run(1), joiner.run(1), async {
        tokio::task::yield_now().await;
        gate.add_permits(1);
    });

    let a = a.unwrap_err();
    assert!(matches!(a, Error::Operation(_)));
    assert_eq!(a.source_as::<io::Error>().map(ToString::to_string), Some("backend down".to_string()));
    assert!(matches!(b, Err(Error::Operation(_))));

    let entry = store.entry("user:1").unwrap();
    assert!(entry.is_expired());
    assert!(!entry.is_pending());
    assert_eq!(entry.subscriber_count(), 2);
    assert_eq!(leader.data().get(), None);

    assert_eq!(joiner.run(1).await.unwrap(), Some("user 1".to_string()));
    assert_eq!(calls.load(SeqCst), 2);
}

#[tokio::test]
async fn failure_keeps_previous_slot_values() {
    let store = store();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscriber = store.subscribe(
        move |id: u32| {
            let attempt = counter.fetch_add(1, SeqCst) + 1;
            ready(if attempt == 2 {
                Err(Error::from_source(io::Error::other("flaky")))
            } else {
                Ok(format!("user {id} #{attempt}"))
            })
        },
        SubscriberOptions::new().key("user:1"),
    );

    subscriber.run(1).await.unwrap();
    assert!(subscriber.revalidate(None).await.is_err());

    assert_eq!(subscriber.data().get(), Some("user 1 #1".to_string()));
    assert_eq!(subscriber.is_executing().get(), Some(false));
    assert!(store.entry("user:1").unwrap().is_expired());
}

#[tokio::test]
async fn key_resolution_error_leaves_store_untouched() {
    let store = store();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscriber = store.subscribe(
        move |id: u32| {
            counter.fetch_add(1, SeqCst);
            ready(Ok(format!("user {id}")))
        },
        SubscriberOptions::new().key(KeySpec::try_derived(|id: &u32| {
            if *id == 0 {
                Err(io::Error::other("no user zero"))
            } else {
                Ok(format!("user:{id}"))
            }
        })),
    );

    let error = subscriber.run(0).await.unwrap_err();

    assert!(matches!(error, Error::KeyResolution(_)));
    assert_eq!(error.to_string(), "failed to resolve cache key: no user zero");
    assert!(store.is_empty());
    assert_eq!(calls.load(SeqCst), 0);
    assert_eq!(subscriber.is_executing().get(), Some(false));
}

#[tokio::test]
async fn cache_time_resolution_error_leaves_store_untouched() {
    let store = store();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscriber = store.subscribe(
        move |id: u32| {
            counter.fetch_add(1, SeqCst);
            ready(Ok(format!("user {id}")))
        },
        SubscriberOptions::new()
            .key("user")
            .cache_time(CacheTime::try_derived(|_: &u32| Err::<Duration, _>(io::Error::other("no policy")))),
    );

    let error = subscriber.run(1).await.unwrap_err();

    assert!(matches!(error, Error::CacheTimeResolution(_)));
    assert!(store.is_empty());
    assert_eq!(calls.load(SeqCst), 0);
}
