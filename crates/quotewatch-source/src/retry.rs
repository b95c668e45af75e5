//! Retry classification for [`SourceError`].

use crate::error::SourceError;

/// Returns `true` for errors that are worth retrying after a back-off delay.
///
/// **Retriable:** network failures and timeouts, any non-2xx status, an
/// empty or `null` envelope, and an envelope that fails to decode.
///
/// **Not retriable:** [`SourceError::InvalidBaseUrl`]. Only
/// [`QuoteClient::new`](crate::QuoteClient::new) produces it, so the worker
/// hits it at startup and never from inside a polling cycle.
#[must_use]
pub fn is_retriable(err: &SourceError) -> bool {
    match err {
        SourceError::Http(_)
        | SourceError::UnexpectedStatus { .. }
        | SourceError::MissingEnvelope { .. }
        | SourceError::Deserialize { .. } => true,
        SourceError::InvalidBaseUrl { .. } => false,
    }
}
