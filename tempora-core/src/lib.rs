//! Core types and services for the tempora bitemporal event store.
//!
//! - [`aggregate`] - per-aggregate write model (`AggregateStream`)
//! - [`projection`] - host `Projection` trait, options and state machine
//! - [`executor`] - drivers for consistent and eventual projections
//! - [`saver`] - the transactional write path (`SaverService`)
//! - [`service`] - projection lifecycle and asynchronous execution
//! - [`repository`] - the public surface (`Repository`)
//! - [`store`] - persistence ports and the in-memory adapter
//! - [`snapshot`] - patch-free periods for snapshot placement
//! - [`worker`] - the `RateLimitedWorker` debouncer
//!
//! # Example
//!
//! ```
//! use tempora_core::{repository::Repository, store::inmemory};
//!
//! let repo = Repository::new(inmemory::Store::new());
//! ```
//!
//! Most users should depend on the `tempora` crate, which re-exports these
//! types.

pub mod aggregate;
pub mod bus;
pub mod collection;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod ids;
pub mod projection;
pub mod registry;
pub mod repository;
pub mod saver;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod time;
pub mod worker;



pub use error::{Error, Result};
pub use nonempty::NonEmpty;
