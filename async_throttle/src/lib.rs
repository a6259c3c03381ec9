// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

///
/// Admission control for expensive connection setup: at most `permits` holders
/// at a time, and (when a cooldown is configured) at most one new admission per
/// cooldown interval across all holders.
///
/// The cooldown is implemented as a lock whose release is driven by a timer
/// rather than by the acquirer: an admitted caller stamps the interval and
/// moves on, so the spacing applies to admissions, not to how long each
/// admission keeps its permit.
///
#[derive(Clone)]
pub struct AsyncThrottle {
    sema: Arc<Semaphore>,
    cooldown: Option<CooldownLock>,
}

#[derive(Clone)]
struct CooldownLock {
    lock: Arc<Mutex<()>>,
    pause: Duration,
}

impl AsyncThrottle {
    ///
    /// Create a throttle admitting `permits` concurrent holders. A `cooldown`
    /// of `None` (or zero) disables admission spacing.
    ///
    pub fn new(permits: usize, cooldown: Option<Duration>) -> AsyncThrottle {
        AsyncThrottle {
            sema: Arc::new(Semaphore::new(permits)),
            cooldown: cooldown
                .filter(|pause| !pause.is_zero())
                .map(|pause| CooldownLock {
                    lock: Arc::new(Mutex::new(())),
                    pause,
                }),
        }
    }

    ///
    /// Wait for a permit, and (if configured) for the cooldown interval since
    /// the previous admission to elapse. The returned `Permit` releases the
    /// underlying slot when dropped; the cooldown interval is always released
    /// by its timer.
    ///
    /// Dropping the future returned by this method before it resolves never
    /// leaks a slot: permit acquisition is cancel-safe, and a waiter parked on
    /// the cooldown lock holds nothing yet.
    ///
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .sema
            .clone()
            .acquire_owned()
            .await
            .expect("Semaphore is never closed.");
        if let Some(cooldown) = &self.cooldown {
            let guard = cooldown.lock.clone().lock_owned().await;
            let pause = cooldown.pause;
            tokio::spawn(async move {
                tokio::time::sleep(pause).await;
                drop(guard);
            });
        }
        Permit { _permit: permit }
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.sema.available_permits()
    }
}

///
/// An admission slot. Holds the concurrency permit only: see
/// `AsyncThrottle::acquire` for the cooldown lifecycle.
///
#[must_use]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests;
