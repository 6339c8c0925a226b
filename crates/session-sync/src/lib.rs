//! Typed, cancellable access to a document store with listener semantics.
//!
//! Every session kind (live broadcasts, partner workouts, user aggregates)
//! is persisted through a [`DocumentStore`]. The [`SessionSyncClient`] wraps
//! a store and layers on:
//! - typed decode/encode of documents into entities
//! - push subscriptions that can be cancelled from any clone of their handle
//! - compare-and-swap transactions for counters and state transitions

mod client;
mod document;
mod store;
mod subscription;

pub use client::{SessionSyncClient, DEFAULT_TRANSACTION_ATTEMPTS};
pub use document::{apply_patch, Direction, Document, Fields, Filter, FilterOp, OrderBy, Query};
pub use store::{DocumentStore, DocumentWatch, InMemoryDocumentStore};
pub use subscription::{Subscription, SubscriptionHandle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("version conflict on {collection}/{id}")]
    VersionConflict { collection: String, id: String },
    #[error("transaction on {collection}/{id} gave up after {attempts} attempts")]
    Contention {
        collection: String,
        id: String,
        attempts: usize,
    },
    #[error("failed to decode {collection}/{id}: {source}")]
    Decode {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode entity: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
