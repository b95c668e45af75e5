//! Wire shapes for the `/quotes` endpoint.

use chrono::{DateTime, NaiveDateTime, Utc};
use quotewatch_core::{FetchEnvelope, QuotedItem};
use serde::{Deserialize, Deserializer};

/// Body of `GET /quotes`. `quotes` may be absent or `null`, both meaning
/// "nothing to report".
///
/// `generated_at` is informational only: it may be missing, carry no offset
/// (read as UTC) or be unparseable (dropped), and none of those reject the
/// quotes that came with it.
#[derive(Debug, Deserialize)]
pub struct QuotesResponse {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quotes: Option<Vec<QuotedItem>>,
}

impl From<QuotesResponse> for FetchEnvelope {
    fn from(response: QuotesResponse) -> Self {
        Self {
            generated_at: response.generated_at,
            items: response.quotes.unwrap_or_default(),
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"));
    match parsed {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            tracing::debug!(generated_at = raw, "ignoring unparseable generated_at");
            None
        }
    }
}
