//! Collectors: lazily created, key-scoped coordinators between otherwise unrelated tasks.
//!
//! A collector is an ordinary [`Task`] that never finishes. The connection creates it the first
//! time some task addresses its [`CollectorKey`] and keeps it for the rest of the session.

pub mod dirlock;
pub mod semaphore;

pub use dirlock::{Dirlock, parent_dir};
pub use semaphore::Semaphore;

use crate::task::{CollectorKey, Task};

pub(crate) fn create(key: &CollectorKey) -> Box<dyn Task> {
    match key {
        CollectorKey::Dirlock(path) => Box::new(Dirlock::new(path.clone())),
        CollectorKey::Semaphore(name) => Box::new(Semaphore::new(name.clone())),
    }
}
