use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{Authenticator, Credentials};
use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Authenticated portal state that survives between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: Vec<Cookie>,
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(cookies: Vec<Cookie>) -> Self {
        Self {
            cookies,
            created_at: Utc::now(),
        }
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    LoggedIn,
    Restored,
}

/// Session passed explicitly to every portal call for the duration of a run.
#[derive(Debug)]
pub struct SessionHandle {
    state: SessionState,
    origin: SessionOrigin,
}

impl SessionHandle {
    pub fn logged_in(state: SessionState) -> Self {
        Self {
            state,
            origin: SessionOrigin::LoggedIn,
        }
    }

    pub fn restored(state: SessionState) -> Self {
        Self {
            state,
            origin: SessionOrigin::Restored,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }
}

/// JSON file holding the last good [`SessionState`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // an unreadable or corrupt file only costs a fresh login
    pub fn load(&self) -> Option<SessionState> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "cannot read session state: {e}");
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring corrupt session state: {e}");
                None
            }
        }
    }

    pub fn save(&self, state: &SessionState) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AuthError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(state).map_err(|e| AuthError::Storage(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| AuthError::Storage(e.to_string()))
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }
}

/// Session left behind by an earlier login, if the store holds a readable one.
pub fn restore(store: &SessionStore) -> Option<SessionHandle> {
    let state = store.load()?;
    info!(created_at = %state.created_at, "reusing cached portal session");
    Some(SessionHandle::restored(state))
}

/// Log in and cache the resulting session.
#[instrument(skip(authenticator, store, credentials), fields(path = %store.path().display()))]
pub async fn login<A>(authenticator: &A, store: &SessionStore, credentials: &Credentials) -> Result<SessionHandle, AuthError>
where
    A: Authenticator + ?Sized,
{
    let session = authenticator.authenticate(credentials).await?;
    store.save(session.state())?;
    info!("logged in to portal, session cached");
    Ok(session)
}
