//! # MTDS Controller
//!
//! Control plane between a cache worker and the cluster controller.
//!
//! A [`Worker`] registers itself with the controller, relays cache events
//! (admissions, evictions) over a batched push channel and answers control
//! requests such as "clear these tokens" by calling into the local
//! [`CacheEngine`]. Messages are tagged CBOR maps ([`message`]) carried in
//! length-prefixed frames over TCP ([`transport`]).

pub mod message;
pub mod transport;
pub mod worker;

pub use message::*;
pub use transport::*;
pub use worker::*;

pub use mtds_types::{MtdsError, Result};
