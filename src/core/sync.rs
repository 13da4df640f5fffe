//! Synchronization types re-exported here so the rest of the crate pulls
//! them from a single place.

pub use parking_lot::{Condvar, Mutex, MutexGuard};

pub use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
pub use std::sync::{Arc, Weak};
pub use std::thread;
