// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates several views sharing one user-profile lookup.
//!
//! Three subscribers display the same profile. Only one lookup runs while the
//! entry is fresh, every idle view picks up refreshed data, and dropping the
//! views removes the entry from the store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use swirl::{KeySpec, SubscriberOptions, SwrStore};
use tick::Clock;

#[tokio::main(flavor = "current_thread")]
async fn main() -> swirl::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let store = SwrStore::<u32, String>::builder(Clock::new_tokio())
        .name("profiles")
        .default_cache_time(Duration::from_secs(30))
        .build();

    let lookups = Arc::new(AtomicUsize::new(0));
    let fetch_profile = {
        let lookups = Arc::clone(&lookups);
        move |id: u32| {
            let lookup = lookups.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                // Simulate a slow backend
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, swirl::Error>(format!("User {id} (lookup #{lookup})"))
            }
        }
    };

    let options = SubscriberOptions::new().key(KeySpec::derived(|id: &u32| format!("user:{id}")));
    let header = store.subscribe(fetch_profile.clone(), options.clone());
    let sidebar = store.subscribe(fetch_profile.clone(), options.clone());
    let details = store.subscribe(fetch_profile, options);

    // Concurrent calls share a single lookup.
    let (a, b) = tokio::join!(header.run(42), sidebar.run(42));
    println!("header:  {a:?}");
    println!("sidebar: {b:?}");

    // A late caller is served from the entry.
    println!("details: {:?}", details.run(42).await?);
    println!("lookups so far: {}", lookups.load(Ordering::SeqCst));

    // Refreshing one view pushes the new profile into the idle ones.
    let mut changes = sidebar.data().watch();
    header.revalidate(None).await?;
    if changes.has_changed().unwrap_or_default() {
        println!("sidebar refreshed: {:?}", changes.borrow_and_update().clone());
    }
    println!("lookups so far: {}", lookups.load(Ordering::SeqCst));

    drop((header, sidebar, details));
    println!("entries after views closed: {}", store.len());

    Ok(())
}
