//! Remote side of the pipeline: authenticating against the payment portal and
//! listing raw transaction rows. Everything past [`RawRecord`] is portal
//! agnostic.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AuthError, FetchError};

pub mod fetcher;
pub mod http;
pub mod session;

pub use session::{SessionHandle, SessionState, SessionStore};

static TRANSACTION_ID_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)transaction\s+id[:\s]+(\d+)").unwrap());

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Inclusive purchase date range; an open bound means "as far as the portal goes".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<Self> {
        match (from, to) {
            (Some(from), Some(to)) if from > to => None,
            _ => Some(Self { from, to }),
        }
    }
}

/// One transaction row as listed by the portal, before any interpretation.
///
/// `fragment` is the row's summary cells joined with `" | "`; `details` holds
/// the expanded detail lines (line items, transaction id) when the portal
/// shows them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub transaction_id: Option<String>,
    pub fragment: String,
    pub details: Vec<String>,
}

impl RawRecord {
    pub fn new(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            ..Default::default()
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_details<I, S>(mut self, details: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details = details.into_iter().map(Into::into).collect();
        self
    }

    /// Explicit id if the listing had one, otherwise a `Transaction ID: N` detail line.
    pub fn transaction_id(&self) -> Option<String> {
        if let Some(id) = self.transaction_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
        self.details
            .iter()
            .find_map(|line| TRANSACTION_ID_LINE.captures(line))
            .map(|caps| caps[1].to_string())
    }

    /// Text kept in failure reports.
    pub fn audit_text(&self) -> String {
        if self.details.is_empty() {
            self.fragment.clone()
        } else {
            format!("{} / {}", self.fragment, self.details.join(" / "))
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Run the portal login flow. Any automation resource used for the flow
    /// is scoped to this call and released on every return path.
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, AuthError>;
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Rows on listing page `page` (1-based). An empty page ends the listing.
    async fn fetch_page(
        &self,
        session: &SessionHandle,
        range: &DateRange,
        page: u32,
    ) -> Result<Vec<RawRecord>, FetchError>;
}
