//! Lock helpers that survive poisoning.
//!
//! A panic while a partition lock is held leaves the map intact (entries are
//! swapped whole), so the guard is recovered and a warning logged.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(poisoned: PoisonError<G>, op: &'static str, kind: &'static str) -> G {
  warn!(op, lock_kind = kind, "recovered poisoned cache lock");
  poisoned.into_inner()
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
  lock.read().unwrap_or_else(|e| recover(e, op, "rwlock.read"))
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
  lock.write().unwrap_or_else(|e| recover(e, op, "rwlock.write"))
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
  mutex.lock().unwrap_or_else(|e| recover(e, op, "mutex"))
}
