//! On-disk persistence helpers for the JSON documents Keel owns.

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_json};
