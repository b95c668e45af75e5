//! HTTP client for the quote producer's `/quotes` endpoint.
//!
//! Every non-2xx status, empty body or undecodable body is surfaced as a
//! typed [`SourceError`]; retrying is left to the caller.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use quotewatch_core::FetchEnvelope;
use reqwest::{Client, Url};

use crate::error::SourceError;
use crate::types::QuotesResponse;

pub struct QuoteClient {
    client: Client,
    base_url: Url,
}

impl QuoteClient {
    /// Creates a client pointed at `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed, or [`SourceError::InvalidBaseUrl`] if
    /// `base_url` does not parse.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
            .user_agent("quotewatch/0.1 (quote-ingest)")
            .build()?;

        // Exactly one trailing slash so `join("quotes")` appends instead of
        // replacing the last path segment.
        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalised).map_err(|e| SourceError::InvalidBaseUrl {
            url: base_url.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self { client, base_url })
    }

    /// Builds `<base>/quotes?symbols=A,B,C`.
    ///
    /// Each symbol is percent-encoded on its own so the separating commas go
    /// out literally.
    #[must_use]
    pub fn quotes_url(&self, symbols: &[String]) -> Url {
        let mut url = self.base_url.clone();
        // http(s) URLs always have a path, so this only fails for cannot-be-a-base URLs.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("quotes");
        }
        let list: Vec<String> = symbols
            .iter()
            .map(|s| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string())
            .collect();
        url.set_query(Some(&format!("symbols={}", list.join(","))));
        url
    }

    /// Fetches one envelope of quotes for `symbols`.
    ///
    /// An envelope with zero quotes is a successful fetch.
    ///
    /// # Errors
    ///
    /// - [`SourceError::Http`] on network failure or timeout.
    /// - [`SourceError::UnexpectedStatus`] on any non-2xx status.
    /// - [`SourceError::MissingEnvelope`] if the body is empty or `null`.
    /// - [`SourceError::Deserialize`] if the body is not a valid envelope.
    pub async fn fetch_quotes(&self, symbols: &[String]) -> Result<FetchEnvelope, SourceError> {
        let url = self.quotes_url(symbols);
        tracing::debug!(%url, "requesting quotes");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await?;
        parse_envelope(&body, url.as_str())
    }
}

fn parse_envelope(body: &str, url: &str) -> Result<FetchEnvelope, SourceError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        tracing::warn!(url, reason = "envelope_null", "invalid quote response");
        return Err(SourceError::MissingEnvelope {
            url: url.to_owned(),
        });
    }

    let response: QuotesResponse =
        serde_json::from_str(trimmed).map_err(|e| SourceError::Deserialize {
            context: format!("quotes envelope from {url}"),
            source: e,
        })?;
    Ok(response.into())
}
