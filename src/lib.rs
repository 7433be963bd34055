//! Stripe Remap
//!
//! Core of an erasure-coded key-value store that can move overloaded storage
//! servers out of the normal request path while the cluster keeps running.
//! Keys are placed on stripe lists built over a consistent-hash ring, chunks
//! are protected by one of several erasure codes, and a coordinator drives
//! every router through a two-phase remapping protocol.

pub mod config;
pub mod ds;
pub mod erasure;
pub mod error;
pub mod hash;
pub mod pending;
pub mod remap;
pub mod storage;
pub mod stripe_list;

pub use config::Config;
pub use erasure::{create_coding, Coding, CodingScheme};
pub use error::Error;
pub use remap::{
    CoordinatorRemapHandler, LoadMonitor, RemapState, RouterRemapHandler, StorageRemapHandler, TransitWorker,
};
pub use storage::Cluster;
pub use stripe_list::StripeList;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;
