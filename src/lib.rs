//! jsondrop: multi-tenant, schema-validated JSON document store.
//!
//! Each database (tenant) is addressed by an opaque id and two capability
//! keys, owns a byte quota, and gets its own Sled storage unit. Collections
//! are declared with a flat typed schema before documents can be written.
//! Every committed mutation is fanned out to live subscribers.
//!
//! Layers, bottom up:
//! - [`sanitize`], [`keygen`], [`validation`]: pure helpers
//! - [`storage`]: pooled per-tenant Sled databases
//! - [`catalog`]: tenants, keys, schemas, quota, expiry
//! - [`documents`]: document CRUD and filtered queries
//! - [`events`]: change broadcasting
//! - [`rest`]: Axum HTTP adapter

pub mod catalog;
pub mod config;
pub mod documents;
pub mod error;
pub mod events;
pub mod keygen;
pub mod models;
pub mod observability;
pub mod rest;
pub mod sanitize;
pub mod storage;
pub mod validation;

pub use catalog::Catalog;
pub use documents::DocumentStore;
pub use error::{DbError, DbResult, ErrorKind};
pub use events::Broadcaster;
