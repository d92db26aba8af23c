//! Object-level exclusive locks with lazy TTL expiry.

mod manager;
mod store;

pub(crate) use manager::key_for;
pub use manager::LockManager;
pub use store::{AcquireOutcome, LockKey, LockStore};
