//! Client for the upstream quote producer.
//!
//! [`QuoteClient`] issues `GET <base>/quotes?symbols=…` and validates the
//! envelope; [`is_retriable`] tells the worker's retry loop which failures
//! are worth another attempt.

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

pub use client::QuoteClient;
pub use error::SourceError;
pub use retry::is_retriable;
pub use types::QuotesResponse;
