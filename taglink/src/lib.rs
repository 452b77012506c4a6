//! taglink - connection-oriented messaging over a polling transport
//! provider.
//!
//! The runtime turns a low-level provider (endpoints, tagged messages,
//! per-endpoint byte streams, completion polling) into a usable
//! connection abstraction: timeout-driven establishment with a two-sided
//! connection-id handshake, tag-routed data transfer, in-band control
//! messages, and disciplined cancellation on disconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Worker                               │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────────┐  │
//! │  │ RequestArena │  │ conn registry │  │ progress queues    │  │
//! │  │ (slab of     │  │ conn_id →     │  │ handshaking        │  │
//! │  │  in-flight   │  │ Connection    │  │ pending accepts    │  │
//! │  │  records)    │  │               │  │ failed / reaping   │  │
//! │  └──────────────┘  └───────────────┘  └────────────────────┘  │
//! │                                                               │
//! │  progress(): provider poll → event drains → completion        │
//! │  dispatch → io message → timeouts → accepts → error hooks     │
//! │  → disconnect reaping                                         │
//! └───────────────────────────────────────────────────────────────┘
//!                     │
//!           ┌─────────┼──────────┐
//!           ▼         ▼          ▼
//!     ┌──────────┐ ┌──────────┐ ┌──────────┐
//!     │Connection│ │Connection│ │Connection│
//!     │ endpoint │ │ endpoint │ │ endpoint │
//!     └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! - One worker is one cooperative single-threaded progress context; all
//!   observable asynchrony is callbacks invoked from [`Worker::progress`].
//! - A 64-bit tag carries an io-message marker, a connection id, and a
//!   sequence number; senders tag with the remote side's id so receivers
//!   match on their own.
//! - An operation may complete while its submission is still on the
//!   stack; the request arena resolves that race without locks.

pub mod conn;
pub mod error;
pub mod provider;
pub mod request;
pub mod tag;
pub mod worker;

// Re-export main types
pub use conn::Connection;
pub use error::{Error, Result, Status};
pub use provider::{ConnRequest, EpHandle, Features, Provider, Submit};
pub use request::{noop, Attach, CompletionCb, DataCb, ReqCallback, ReqId, RequestArena};
pub use worker::{Handler, Worker, WorkerConfig};
