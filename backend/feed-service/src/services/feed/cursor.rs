//! Opaque page tokens for feed pagination.
//!
//! A token is the URL-safe base64 of `"{unix_nanos}:{post_id}"` and marks the
//! last item served. Feed order is `(created_at desc, post_id asc)`; the next
//! page starts strictly after the token's position in that order.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
    pub created_at: DateTime<Utc>,
    pub post_id: Uuid,
}

impl PageToken {
    pub fn new(created_at: DateTime<Utc>, post_id: Uuid) -> Self {
        Self {
            created_at,
            post_id,
        }
    }

    pub fn encode(&self) -> String {
        // Out-of-range nanos only happen for dates past year 2262
        let nanos = self
            .created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.created_at.timestamp_micros().saturating_mul(1_000));
        general_purpose::URL_SAFE_NO_PAD.encode(format!("{}:{}", nanos, self.post_id))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| AppError::BadRequest("Invalid page token format".to_string()))?;
        let raw = String::from_utf8(decoded)
            .map_err(|_| AppError::BadRequest("Invalid page token encoding".to_string()))?;

        let (ts, post_id) = raw
            .split_once(':')
            .ok_or_else(|| AppError::BadRequest("Invalid page token value".to_string()))?;
        let nanos: i64 = ts
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid page token timestamp".to_string()))?;
        let post_id = Uuid::parse_str(post_id)
            .map_err(|_| AppError::BadRequest("Invalid page token post id".to_string()))?;

        Ok(Self::new(Utc.timestamp_nanos(nanos), post_id))
    }

    /// Decode an optional request token; empty strings mean "first page".
    pub fn parse_optional(token: Option<&str>) -> Result<Option<Self>> {
        match token {
            Some(t) if !t.trim().is_empty() => Self::decode(t).map(Some),
            _ => Ok(None),
        }
    }

    /// True when `(created_at, post_id)` belongs to a later page than this token.
    pub fn is_before(&self, created_at: DateTime<Utc>, post_id: Uuid) -> bool {
        feed_order((self.created_at, self.post_id), (created_at, post_id)) == Ordering::Less
    }
}

/// Total feed order: newest first, post id ascending on ties.
pub fn feed_order(a: (DateTime<Utc>, Uuid), b: (DateTime<Utc>, Uuid)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}
