pub mod engine;
pub mod parse;
pub mod prompt;
pub mod session;
pub mod stream;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use labeler_core::{
    build_tree, AuthMode, Envelope, Error, LeveledEntry, Result, Settings, TaxonomyIndex,
};

pub use engine::{CompletionBackend, Gateway, Message, ModelRequest};
pub use session::{SessionManager, SessionState, SessionStatus};
pub use validate::{Policy, RuleKind, ValidationVerdict, Violation};

/// One article to label against one taxonomy snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub entries: Vec<LeveledEntry>,
    pub title: String,
    pub body: String,
}

impl ClassificationRequest {
    pub fn new(entries: Vec<LeveledEntry>, title: impl Into<String>, body: impl Into<String>) -> Result<Self> {
        let request = Self {
            entries,
            title: title.into(),
            body: body.into(),
        };
        request.check()?;
        Ok(request)
    }

    fn check(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::EmptySource);
        }
        if self.title.trim().is_empty() {
            return Err(Error::InvalidRequest("missing title".to_string()));
        }
        if self.body.trim().is_empty() {
            return Err(Error::InvalidRequest("missing content".to_string()));
        }
        Ok(())
    }
}

/// Build and index the taxonomy the request was made against.
pub fn index_for(entries: &[LeveledEntry], settings: &Settings) -> Result<TaxonomyIndex> {
    let forest = build_tree(entries, &settings.taxonomy.denylist)?;
    let index = TaxonomyIndex::new(&forest, &settings.taxonomy);
    tracing::debug!(
        target: "labeler::pipeline",
        roots = forest.len(),
        known = index.all_labels.len(),
        cyber = index.cyber.len(),
        general = index.general.len(),
        "taxonomy indexed"
    );
    Ok(index)
}

fn compose_for(request: &ClassificationRequest, index: &TaxonomyIndex, settings: &Settings) -> String {
    prompt::compose(
        &prompt::LabelLists::from_index(index),
        &request.title,
        &request.body,
        &settings.rules,
        &settings.taxonomy.categories,
    )
}

/// The exact prompt a classification run would send.
pub fn render_prompt(request: &ClassificationRequest, settings: &Settings) -> Result<String> {
    request.check()?;
    let index = index_for(&request.entries, settings)?;
    Ok(compose_for(request, &index, settings))
}

fn judge(raw: &str, index: &TaxonomyIndex, settings: &Settings, policy: Policy) -> Result<ValidationVerdict> {
    let parsed = parse::parse_answer(raw)?;
    if parsed.labels.is_empty() {
        return Err(Error::NotRelevant);
    }
    let verdict = validate::validate(&parsed.labels, index, &settings.rules, policy);
    tracing::info!(
        target: "labeler::pipeline",
        labels = verdict.labels.len(),
        violations = verdict.violations.len(),
        accepted = verdict.accepted,
        shape = ?parsed.shape,
        "answer validated"
    );
    Ok(verdict)
}

/// Validate an answer obtained elsewhere against a taxonomy snapshot.
pub fn validate_answer(
    entries: &[LeveledEntry],
    raw: &str,
    settings: &Settings,
    policy: Policy,
) -> Result<ValidationVerdict> {
    let index = index_for(entries, settings)?;
    judge(raw, &index, settings, policy)
}

/// Run one article through build, index, compose, submit, parse and validate.
pub async fn classify(
    request: &ClassificationRequest,
    settings: &Settings,
    backend: &dyn CompletionBackend,
    policy: Policy,
) -> Result<ValidationVerdict> {
    request.check()?;
    let index = index_for(&request.entries, settings)?;
    let prompt = compose_for(request, &index, settings);
    let model_request = ModelRequest::from_prompt(settings, prompt);

    tracing::info!(target: "labeler::pipeline", model = %model_request.model, "submitting article");

    let budget = Duration::from_secs(settings.timeout_secs);
    let raw = tokio::time::timeout(budget, backend.submit(&model_request))
        .await
        .map_err(|_| Error::Timeout(budget))??;

    tracing::debug!(target: "labeler::pipeline", raw = %raw, "raw model answer");
    judge(&raw, &index, settings, policy)
}

/// Turn a run's outcome into the boundary envelope. A rejected verdict is a
/// failure that still carries the verdict.
pub fn verdict_envelope(result: Result<ValidationVerdict>) -> Envelope<ValidationVerdict> {
    match result {
        Ok(verdict) if verdict.accepted => Envelope::ok(verdict),
        Ok(verdict) => {
            let summary = format!("answer rejected: {}", verdict.summary());
            Envelope::fail_with(verdict, summary)
        }
        Err(e) => {
            tracing::warn!(target: "labeler::pipeline", error = %e, "classification failed");
            Envelope::fail(e.to_string())
        }
    }
}

/// Per-call overrides of the stored settings.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub auth_mode: Option<AuthMode>,
}

/// Settings plus the one session manager every session-mode call shares.
pub struct Classifier {
    settings: Settings,
    client: reqwest::Client,
    sessions: Arc<SessionManager>,
}

impl Classifier {
    pub fn new(settings: Settings, client: reqwest::Client, sessions: Arc<SessionManager>) -> Self {
        Self {
            settings,
            client,
            sessions,
        }
    }

    /// Wire the HTTP session source and the on-disk credential store.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let client = http_client(settings.timeout_secs)?;
        let sessions = Arc::new(session_manager(&client, &settings));
        Ok(Self::new(settings, client, sessions))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Same session manager and client, new settings.
    pub fn with_settings(&self, settings: Settings) -> Self {
        Self {
            settings,
            client: self.client.clone(),
            sessions: self.sessions.clone(),
        }
    }

    pub async fn classify(
        &self,
        request: &ClassificationRequest,
        overrides: &Overrides,
        policy: Policy,
    ) -> Envelope<ValidationVerdict> {
        let mut settings = self.settings.clone();
        if let Some(model) = overrides.model.as_ref().filter(|m| !m.trim().is_empty()) {
            settings.model = model.clone();
        }
        let auth_mode = overrides.auth_mode.unwrap_or(settings.auth_mode);

        let result = match Gateway::from_settings(&settings, &self.client, &self.sessions, auth_mode) {
            Ok(gateway) => classify(request, &settings, &gateway, policy).await,
            Err(e) => Err(e),
        };
        verdict_envelope(result)
    }
}

pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("labeler/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(timeout_secs.clamp(1, 30)))
        .build()
        .map_err(|e| Error::Config(format!("HTTP client: {e}")))
}

/// Session manager over HTTP and `session.json`. Each fetch is bounded by
/// the configured timeout, capped at the default fetch bound.
pub fn session_manager(client: &reqwest::Client, settings: &Settings) -> SessionManager {
    let bound = Duration::from_secs(settings.timeout_secs.max(1)).min(SessionManager::FETCH_TIMEOUT);
    SessionManager::new(
        Box::new(session::HttpSessionSource::new(client.clone(), &settings.session)),
        Box::new(session::FileCredentialStore::default()),
        Box::new(session::SystemClock),
    )
    .with_fetch_timeout(bound)
}
