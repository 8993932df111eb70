//! Session storage on Amazon DynamoDB.
//!
//! Sessions are rows in a DynamoDB table keyed by a signed session id. The
//! crate provides:
//!
//! - **Signed identifiers** - ids are `"<hmac>--<token>"`; tampered ids are
//!   detected and replaced, and ids in the older HMAC-MD5 format still verify.
//! - **Pessimistic locking** (optional) - a request holds the lock on its
//!   session from `find` until `persist`, using only conditional writes.
//!   Abandoned locks are busted after `lock_expiry_time`, and the holder that
//!   lost its lock can no longer write.
//! - **Garbage collection** - sweeps delete records older than `max_age` or
//!   idle longer than `max_stale`, in batches of 25.
//! - **Error policy** - hard errors always propagate; soft errors can be
//!   reported and swallowed so a request still gets served.
//!
//! # Features
//!
//! - `dynamodb` - the AWS SDK backend (enabled by default)
//!
//! The in-process [`MemoryTable`] backend is always available.
//!
//! # Examples
//!
//! ```no_run
//! use sessionstore_dynamodb::prelude::*;
//! use sessionstore_dynamodb::dynamodb::DynamoDbTable;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SessionError> {
//!     let config = SessionConfig::resolve(ConfigLayer::default())?
//!         .with_max_stale(Duration::from_secs(3600))
//!         .with_locking(true);
//!     let table = DynamoDbTable::connect(None, None).await;
//!     let store = SessionStore::new(config, Arc::new(table))?;
//!
//!     // Once per request
//!     let mut ctx = RequestContext::new();
//!     let cookie: Option<&str> = None;
//!     let (id, mut session) = store.find(&mut ctx, cookie).await?;
//!     session.set("user_id", 123)?;
//!     store.persist(&mut ctx, &id, &session).await?;
//!
//!     // From a scheduled job
//!     let report = store.collect_garbage().await?;
//!     println!("deleted {} sessions", report.deleted);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod gc;
pub mod handler;
pub mod identity;
pub mod locking;
pub mod memory;
pub mod record;
pub mod store;
pub mod table;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use config::{ConfigLayer, SessionConfig};
pub use data::SessionData;
pub use error::{BackendError, SessionError, SessionResult, Severity};
pub use gc::{GarbageCollector, SweepReport};
pub use handler::{DefaultErrorHandler, ErrorHandler, RequestContext};
pub use identity::{IdFormat, IdentitySigner, Verification};
pub use locking::{LockCoordinator, LockMarker};
pub use memory::MemoryTable;
pub use record::{RecordStore, SessionRecord};
pub use store::SessionStore;
pub use table::SessionTable;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbTable;

#[cfg(feature = "dynamodb")]
pub use aws_sdk_dynamodb;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigLayer, SessionConfig};
    pub use crate::data::SessionData;
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::gc::{GarbageCollector, SweepReport};
    pub use crate::handler::{ErrorHandler, RequestContext};
    pub use crate::memory::MemoryTable;
    pub use crate::store::SessionStore;
    pub use crate::table::SessionTable;

    #[cfg(feature = "dynamodb")]
    pub use crate::dynamodb::DynamoDbTable;
}
