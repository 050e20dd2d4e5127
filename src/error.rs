use thiserror::Error;

use crate::money::{Money, MoneySum};

/// Login against the portal failed. Always fatal to a run.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("credentials rejected by portal")]
    Rejected,

    #[error("login flow changed shape: {0}")]
    FlowChanged(String),

    #[error("portal unreachable during login: {0}")]
    Unreachable(String),

    #[error("session state storage failed: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("portal session expired")]
    SessionExpired,

    #[error("portal unavailable: {0}")]
    PortalUnavailable(String),

    #[error("no data for requested range")]
    NoData,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseReason {
    #[error("malformed amount")]
    MalformedAmount,

    #[error("malformed date")]
    MalformedDate,

    #[error("malformed time")]
    MalformedTime,

    #[error("malformed card digits")]
    MalformedCard,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("malformed transaction id {0:?}")]
    MalformedTransactionId(String),

    #[error("unknown type token {0:?}")]
    UnknownTypeToken(String),
}

/// A raw fragment that could not be turned into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} in {raw:?}")]
pub struct ParseError {
    pub reason: ParseReason,
    pub raw: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("bay lines sum to {actual}, transaction total is {expected}")]
    Reconciliation { expected: String, actual: String },

    #[error("unknown type token {0:?}")]
    UnknownTypeToken(String),

    #[error("missing station number")]
    MissingStation,

    #[error("invalid station number {0}")]
    InvalidStation(u32),

    #[error("bay line {bay} has no amount")]
    MissingLineAmount { bay: u32 },
}

impl ClassifyError {
    pub fn reconciliation(expected: &Money, actual: &MoneySum) -> Self {
        ClassifyError::Reconciliation {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// A record whose insert was rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transaction {transaction_id} rolled back: {reason}")]
pub struct LoadError {
    pub transaction_id: i64,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors that end a pipeline run in the `Failed` state.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}
