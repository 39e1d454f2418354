//! A single-writer lock that can be permanently retired.
//!
//! The lock moves through three states: unlocked, locked and poisoned. Once a
//! holder poisons it, every later attempt to lock fails with
//! [`LockError::Poisoned`] instead of silently handing out the value again.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// Reasons a [`PoisonedLock`] refused to lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The lock was retired and can never be used again.
    #[error("lock is poisoned")]
    Poisoned,
    /// The lock is currently held by someone else.
    #[error("lock is already held")]
    Locked,
}

/// Mutual exclusion with a terminal poisoned state.
#[derive(Debug)]
pub struct PoisonedLock<T> {
    slot: Mutex<Slot<T>>,
    poisoned: AtomicBool,
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    poisoned: bool,
}

impl<T> PoisonedLock<T> {
    /// Creates an unlocked lock around `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Slot {
                value,
                poisoned: false,
            }),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Waits for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Poisoned`] if the lock was retired.
    pub async fn lock(&self) -> Result<PoisonedGuard<'_, T>, LockError> {
        let guard = self.slot.lock().await;
        self.admit(guard)
    }

    /// Takes the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Locked`] if another holder has it and
    /// [`LockError::Poisoned`] if the lock was retired.
    pub fn try_lock(&self) -> Result<PoisonedGuard<'_, T>, LockError> {
        if self.is_poisoned() {
            return Err(LockError::Poisoned);
        }
        let guard = self.slot.try_lock().map_err(|_| LockError::Locked)?;
        self.admit(guard)
    }

    /// Returns true once the lock was retired.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn admit<'a>(&'a self, guard: MutexGuard<'a, Slot<T>>) -> Result<PoisonedGuard<'a, T>, LockError> {
        if guard.poisoned {
            return Err(LockError::Poisoned);
        }
        Ok(PoisonedGuard {
            guard,
            flag: &self.poisoned,
        })
    }
}

/// Exclusive access to the value of a [`PoisonedLock`].
#[derive(Debug)]
pub struct PoisonedGuard<'a, T> {
    guard: MutexGuard<'a, Slot<T>>,
    flag: &'a AtomicBool,
}

impl<T> PoisonedGuard<'_, T> {
    /// Retires the lock. The value stays reachable through this guard until it drops.
    pub fn poison(&mut self) {
        self.guard.poisoned = true;
        self.flag.store(true, Ordering::Release);
    }
}

impl<T> Deref for PoisonedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for PoisonedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}
