//! Persistent record of which feed entries have already been forwarded.

mod seen;

pub use seen::{SeenStore, StoreError};
