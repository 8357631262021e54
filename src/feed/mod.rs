//! Feed fetching, parsing and change detection.
//!
//! - **Parsing**: Convert RSS XML (or Atom/JSON Feed via `feed-rs`) into a
//!   [`Channel`] of trimmed [`Item`]s
//! - **Checking**: Fetch a feed over HTTP and keep only the entries the
//!   [`SeenStore`](crate::storage::SeenStore) has not recorded yet
//!
//! # Example
//!
//! ```ignore
//! use crate::feed::FeedChecker;
//!
//! let checker = FeedChecker::new(url, client, store);
//! for item in checker.check().await?.into_iter().rev() {
//!     // oldest first
//! }
//! ```

mod checker;
mod parser;

pub use checker::{FeedChecker, FetchError};
pub use parser::{parse, Channel, Item, ParseError, Rss};
