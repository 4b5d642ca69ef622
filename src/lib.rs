//! # Tally
//!
//! **A single shared, bounded counter behind HTTP, safe under concurrent writers.**
//!
//! Tally keeps one versioned record in a key-value store and mutates it with
//! optimistic concurrency: read the record, check the new value against the
//! allowed range, then write it back only if nobody else wrote in between.
//! Lost races are retried with exponential backoff and jitter; no lock is ever
//! held across requests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tally::{Backend, Builder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let counter = Builder::new().backend(Backend::Log).data_dir("./data").build().await?;
//!
//!     // The record is provisioned once, out of band
//!     counter.provision(0).await?;
//!
//!     let record = counter.increment().await?;
//!     assert_eq!(record.value, 1);
//!
//!     let record = counter.update(-1).await?;
//!     println!("value {} at version {}", record.value, record.version);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Serving over HTTP
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tally::Builder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let counter = Arc::new(Builder::from_env()?.build().await?);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!
//!     tally::serve(listener, counter, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! | Route | Outcome | Status | `error` |
//! |---|---|---|---|
//! | `GET /count`, `POST /increment`, `POST /decrement` | success | 200 | |
//! | | record missing | 404 | `NotFound` |
//! | | out of range | 400 | `BoundaryViolation` |
//! | | retries exhausted | 409 | `ConcurrentUpdateConflict` |
//! | | store failure | 500 | `InternalServerError` |
//!
//! ## Error Handling
//!
//! Counter operations return `Result<Counter, CounterError>`:
//!
//! ```no_run
//! use tally::{Builder, CounterError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let counter = Builder::new().build().await?;
//!
//!     match counter.increment().await {
//!         Ok(record) => println!("now {}", record.value),
//!         Err(CounterError::NotFound { key }) => eprintln!("provision `{key}` first"),
//!         Err(CounterError::Boundary { proposed, max, .. }) => {
//!             eprintln!("{proposed} would exceed {max}")
//!         }
//!         Err(CounterError::RetryExhausted { attempts }) => {
//!             eprintln!("lost {attempts} races, try again later")
//!         }
//!         Err(CounterError::Store(err)) => eprintln!("store failure: {err}"),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Stores
//!
//! Anything implementing [`KvStore`] can back the counter, as long as its
//! conditional write compares the version and replaces the record atomically.
//! Two are built in:
//! - [`MemoryStore`]: process local, for tests and throwaway servers
//! - [`LogStore`]: an fsynced, CRC-checked append-only log that compacts itself

#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions
)]

pub(crate) mod accessor;
pub(crate) mod config;
pub(crate) mod errors;
pub(crate) mod helpers;
pub(crate) mod http;
pub(crate) mod log_store;
pub(crate) mod record;
pub(crate) mod service;
pub(crate) mod store;
pub(crate) mod wal;

pub use accessor::{CounterAccessor, WriteAttempt};
pub use config::{Backend, Builder, Config};
pub use errors::{CounterError, StoreError};
pub use helpers::{COUNTER_ITEM_ID, MAX_COUNTER_VALUE, MAX_RETRY_ATTEMPTS, MIN_COUNTER_VALUE};
pub use http::{CountResponse, ErrorResponse, router, serve};
pub use log_store::LogStore;
pub use record::Counter;
pub use service::CounterService;
pub use store::{KvStore, MemoryStore, PutOutcome};
