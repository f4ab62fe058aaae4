//! Reader/writer lock selected per call site
//!
//! Transfer dispatch takes the lock shared so any number of lookups run in
//! parallel; reconfiguration takes it exclusive. The policy is a plain value
//! so one scan routine serves both.

use std::ops::Deref;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// How a lookup acquires the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Many concurrent holders
    Shared,
    /// Sole holder; waits for every shared holder to leave
    Exclusive,
}

/// RwLock acquired according to a [`LockPolicy`]
///
/// A panic inside a holder does not leave the protected value half-written
/// (writers replace it wholesale), so poisoning is ignored.
#[derive(Debug, Default)]
pub struct PolicyLock<T> {
    inner: RwLock<T>,
}

impl<T> PolicyLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Acquire under `policy`, blocking until available
    pub fn acquire(&self, policy: LockPolicy) -> PolicyGuard<'_, T> {
        match policy {
            LockPolicy::Shared => PolicyGuard::Shared(self.read()),
            LockPolicy::Exclusive => PolicyGuard::Exclusive(self.write()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard returned by [`PolicyLock::acquire`]
pub enum PolicyGuard<'a, T> {
    Shared(RwLockReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

impl<T> PolicyGuard<'_, T> {
    pub fn policy(&self) -> LockPolicy {
        match self {
            PolicyGuard::Shared(_) => LockPolicy::Shared,
            PolicyGuard::Exclusive(_) => LockPolicy::Exclusive,
        }
    }

    /// Mutable access, only when held exclusively
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            PolicyGuard::Shared(_) => None,
            PolicyGuard::Exclusive(guard) => Some(&mut **guard),
        }
    }
}

impl<T> Deref for PolicyGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            PolicyGuard::Shared(guard) => &**guard,
            PolicyGuard::Exclusive(guard) => &**guard,
        }
    }
}
