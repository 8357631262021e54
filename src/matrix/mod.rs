//! Delivery of chat messages to a Matrix homeserver.
//!
//! - [`HomeserverClient`] performs the `join` and `send` calls
//! - [`DeliveryQueue`] owns the single worker that drains outbound requests,
//!   retrying rate-limited ones with exponential backoff
//! - [`QueueSender`] is the cloneable producer handle given to feed pollers

mod client;
mod message;
mod queue;

pub use client::{DeliveryError, HomeserverClient, Request, DEFAULT_API_PREFIX};
pub use message::{Message, FORMAT_HTML, MSGTYPE_IMAGE, MSGTYPE_TEXT};
pub use queue::{DeliveryQueue, DeliveryStats, Outbound, QueueOptions, QueueSender};
