//! Posts new entries from RSS/Atom feeds into Matrix rooms.
//!
//! One [`poller::FeedPoller`] per configured (room, feed) pair checks its
//! feed on an interval. New entries, as decided by the shared
//! [`storage::SeenStore`], are formatted and handed to the
//! [`matrix::DeliveryQueue`], which delivers them in order and backs off
//! when the homeserver rate limits.

pub mod config;
pub mod feed;
pub mod format;
pub mod matrix;
pub mod poller;
pub mod storage;
