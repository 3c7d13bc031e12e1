//! Utility modules for midime-pm

pub mod db_retry;
pub mod keyed_lock;

pub use db_retry::{is_lock_error, retry_on_lock};
pub use keyed_lock::KeyedMutex;
