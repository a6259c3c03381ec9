// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::AsyncThrottle;

#[tokio::test]
async fn acquire_and_release() {
    let throttle = AsyncThrottle::new(1, None);
    let permit = throttle.acquire().await;
    assert_eq!(throttle.available_permits(), 0);
    drop(permit);
    assert_eq!(throttle.available_permits(), 1);
    let _permit = throttle.acquire().await;
}

#[tokio::test]
async fn at_most_n_admissions() {
    let throttle = AsyncThrottle::new(1, None);
    let held = throttle.acquire().await;

    let (acquired_tx, mut acquired_rx) = oneshot::channel::<()>();
    let waiter = {
        let throttle = throttle.clone();
        tokio::spawn(async move {
            let _permit = throttle.acquire().await;
            let _ = acquired_tx.send(());
        })
    };

    // The second acquire must not complete while the first permit is held.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(acquired_rx.try_recv().is_err());

    drop(held);
    timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should acquire after release")
        .unwrap();
}

#[tokio::test]
async fn cooldown_spaces_admissions() {
    let cooldown = Duration::from_millis(100);
    let throttle = AsyncThrottle::new(10, Some(cooldown));

    let mut admitted = Vec::new();
    let mut permits = Vec::new();
    for _ in 0..3 {
        permits.push(throttle.acquire().await);
        admitted.push(Instant::now());
    }

    for pair in admitted.windows(2) {
        assert!(
            pair[1] - pair[0] >= cooldown,
            "admissions spaced {:?} apart, expected at least {:?}",
            pair[1] - pair[0],
            cooldown
        );
    }
}

#[tokio::test]
async fn cooldown_released_by_timer_not_permit() {
    let cooldown = Duration::from_millis(50);
    let throttle = AsyncThrottle::new(10, Some(cooldown));

    // Hold the first permit across the second acquisition: the cooldown must
    // expire on its own rather than waiting for the holder.
    let first = throttle.acquire().await;
    let second = timeout(Duration::from_secs(5), throttle.acquire())
        .await
        .expect("second admission should not require the first permit to drop");
    drop(first);
    drop(second);
}

#[tokio::test]
async fn cancelled_waiter_releases_no_slot() {
    let throttle = AsyncThrottle::new(1, None);
    let held = throttle.acquire().await;

    let waiter = {
        let throttle = throttle.clone();
        tokio::spawn(async move {
            let _permit = throttle.acquire().await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    waiter.abort();
    let _ = waiter.await;

    drop(held);
    assert_eq!(throttle.available_permits(), 1);
    let _permit = timeout(Duration::from_secs(5), throttle.acquire())
        .await
        .expect("slot should be reusable after a cancelled waiter");
}
