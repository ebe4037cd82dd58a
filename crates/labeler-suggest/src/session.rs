//! Session credential lifecycle for the chat backend.
//!
//! States: no session, valid, expired. Expiry is time based and checked on
//! every access; an expired credential is refreshed transparently by the next
//! caller that needs it. A 401 from the backend or an explicit disconnect
//! drops the credential. Fetches are single-flight: the slot's async mutex is
//! held across the fetch so concurrent callers queue and reuse its result.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use labeler_core::{
    clear_credential_in, labeler_dir, read_credential_in, write_credential_in, Error, Result,
    SessionCredential, SessionEndpoints,
};

use crate::engine::{transport_error, upstream_error};

// --- Clock ---

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// --- Session endpoint ---

/// Body of the session endpoint. Every field is optional: a logged-out
/// browser session answers `{}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub user: Option<SessionUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUser {
    #[serde(default)]
    pub email: Option<String>,
}

impl SessionInfo {
    pub fn into_credential(self) -> Result<SessionCredential> {
        let token = self
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or(Error::NotAuthenticated)?;
        Ok(SessionCredential {
            token,
            expires_at_epoch_ms: self.expires.as_deref().and_then(parse_expiry),
            subject_label: self.user.and_then(|u| u.email),
        })
    }
}

fn parse_expiry(raw: &str) -> Option<i64> {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.timestamp_millis()),
        Err(e) => {
            tracing::warn!(target: "labeler::session", expires = raw, error = %e, "unparseable session expiry, treating as non-expiring");
            None
        }
    }
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch(&self) -> Result<SessionInfo>;
}

/// Reads the session endpoint over HTTP, presenting the configured cookie.
pub struct HttpSessionSource {
    client: reqwest::Client,
    url: String,
    cookie: Option<String>,
}

impl HttpSessionSource {
    pub fn new(client: reqwest::Client, endpoints: &SessionEndpoints) -> Self {
        Self {
            client,
            url: endpoints.session_url.clone(),
            cookie: endpoints.cookie.clone().filter(|c| !c.trim().is_empty()),
        }
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch(&self) -> Result<SessionInfo> {
        let mut req = self.client.get(&self.url).header(ACCEPT, "application/json");
        if let Some(cookie) = &self.cookie {
            req = req.header(COOKIE, cookie);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::NotAuthenticated);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }

        resp.json::<SessionInfo>().await.map_err(transport_error)
    }
}

// --- Credential store ---

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<SessionCredential>;
    fn save(&self, credential: &SessionCredential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// `session.json` in the settings directory.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for FileCredentialStore {
    fn default() -> Self {
        Self::new(labeler_dir())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<SessionCredential> {
        read_credential_in(&self.dir)
    }

    fn save(&self, credential: &SessionCredential) -> Result<()> {
        write_credential_in(&self.dir, credential)
    }

    fn clear(&self) -> Result<()> {
        clear_credential_in(&self.dir)
    }
}

/// Process-local store, for callers that must not touch disk.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: StdMutex<Option<SessionCredential>>,
}

impl MemoryCredentialStore {
    pub fn with(credential: SessionCredential) -> Self {
        Self {
            slot: StdMutex::new(Some(credential)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<SessionCredential>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<SessionCredential> {
        self.slot().clone()
    }

    fn save(&self, credential: &SessionCredential) -> Result<()> {
        *self.slot() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}

// --- Manager ---

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    NoSession,
    Valid,
    Expired,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_epoch_ms: Option<i64>,
}

pub struct SessionManager {
    slot: Mutex<Option<SessionCredential>>,
    source: Box<dyn SessionSource>,
    store: Box<dyn CredentialStore>,
    clock: Box<dyn Clock>,
    fetch_timeout: Duration,
}

impl SessionManager {
    /// Default bound on one session fetch.
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a manager, picking up any credential the store still holds.
    pub fn new(
        source: Box<dyn SessionSource>,
        store: Box<dyn CredentialStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let persisted = store.load();
        if persisted.is_some() {
            tracing::debug!(target: "labeler::session", "loaded persisted session credential");
        }
        Self {
            slot: Mutex::new(persisted),
            source,
            store,
            clock,
            fetch_timeout: Self::FETCH_TIMEOUT,
        }
    }

    /// Bound each session fetch; the slot guard is released when it elapses.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// A usable token, fetching one if there is none or it has expired.
    pub async fn token(&self) -> Result<String> {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(cred) if !cred.is_expired(self.clock.now_ms()) => return Ok(cred.token.clone()),
            Some(_) => tracing::info!(target: "labeler::session", "session expired, refreshing"),
            None => tracing::info!(target: "labeler::session", "no session, fetching"),
        }
        let cred = self.refresh(&mut slot).await?;
        Ok(cred.token)
    }

    /// Fetch a fresh credential even if the current one is still valid.
    pub async fn connect(&self) -> Result<SessionStatus> {
        let mut slot = self.slot.lock().await;
        let cred = self.refresh(&mut slot).await?;
        Ok(SessionStatus {
            state: SessionState::Valid,
            subject: cred.subject_label,
            expires_at_epoch_ms: cred.expires_at_epoch_ms,
        })
    }

    /// Drop the credential if it is still the one `token` refers to.
    /// A newer credential fetched meanwhile by another caller is kept.
    pub async fn invalidate(&self, token: &str) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|c| c.token == token) {
            tracing::info!(target: "labeler::session", "session rejected by backend, clearing");
            *slot = None;
            if let Err(e) = self.store.clear() {
                tracing::warn!(target: "labeler::session", error = %e, "failed to clear stored credential");
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        *slot = None;
        self.store.clear()
    }

    /// Current state without fetching. Waits for an in-flight fetch to
    /// settle, which takes at most the fetch timeout.
    pub async fn status(&self) -> SessionStatus {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            None => SessionStatus {
                state: SessionState::NoSession,
                subject: None,
                expires_at_epoch_ms: None,
            },
            Some(cred) => SessionStatus {
                state: if cred.is_expired(self.clock.now_ms()) {
                    SessionState::Expired
                } else {
                    SessionState::Valid
                },
                subject: cred.subject_label.clone(),
                expires_at_epoch_ms: cred.expires_at_epoch_ms,
            },
        }
    }

    async fn refresh(&self, slot: &mut Option<SessionCredential>) -> Result<SessionCredential> {
        let info = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .map_err(|_| {
                tracing::warn!(target: "labeler::session", timeout = ?self.fetch_timeout, "session fetch timed out");
                Error::Timeout(self.fetch_timeout)
            })??;
        let cred = info.into_credential()?;
        if let Err(e) = self.store.save(&cred) {
            tracing::warn!(target: "labeler::session", error = %e, "failed to persist session credential");
        }
        tracing::info!(
            target: "labeler::session",
            subject = cred.subject_label.as_deref().unwrap_or("-"),
            expires_at_epoch_ms = ?cred.expires_at_epoch_ms,
            "session established"
        );
        *slot = Some(cred.clone());
        Ok(cred)
    }
}
