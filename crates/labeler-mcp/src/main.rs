use std::sync::{Arc, RwLock};

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use labeler_core::{rules::rule_document, AuthMode, Envelope, LeveledEntry, RuleSet, Settings};
use labeler_suggest::{
    render_prompt, validate_answer, verdict_envelope, ClassificationRequest, Classifier, Overrides,
    Policy,
};

/// Shown in place of secrets by `get_settings`; saving it back keeps the stored value.
const MASK: &str = "********";

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ClassifyArticleRequest {
    /// Taxonomy rows in pre-order, each with its label and 1-based depth. Rows with a null label are skipped.
    entries: Vec<LeveledEntry>,
    /// Article headline
    title: String,
    /// Article text
    body: String,
    /// Model override for this call, e.g. "gpt-5-mini"
    model: Option<String>,
    /// Backend override for this call: "apiKey" or "session"
    auth_mode: Option<AuthMode>,
    /// "strict" (default) rejects on any violation; "lenient" only warns on category minimums and geography
    policy: Option<Policy>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RenderPromptRequest {
    /// Taxonomy rows in pre-order, each with its label and 1-based depth
    entries: Vec<LeveledEntry>,
    /// Article headline
    title: String,
    /// Article text
    body: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ValidateAnswerRequest {
    /// Taxonomy rows the answer was produced against
    entries: Vec<LeveledEntry>,
    /// Raw model answer: a JSON array of labels or {label, justification} objects
    answer: String,
    /// "strict" (default) or "lenient"
    policy: Option<Policy>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SaveSettingsRequest {
    /// The complete settings object, as returned by get_settings. Masked secrets keep their stored value.
    settings: Settings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RulesView {
    document: String,
    rules: RuleSet,
}

// --- Server ---

#[derive(Clone)]
pub struct LabelerServer {
    classifier: Arc<RwLock<Arc<Classifier>>>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl LabelerServer {
    pub fn new(classifier: Classifier) -> Self {
        Self {
            classifier: Arc::new(RwLock::new(Arc::new(classifier))),
            tool_router: Self::tool_router(),
        }
    }

    fn current(&self) -> Arc<Classifier> {
        self.classifier
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn settings(&self) -> Settings {
        self.current().settings().clone()
    }

    #[tool(
        description = "Label one article against a taxonomy snapshot. Builds the label lists from `entries`, asks the model, parses and validates its answer. Returns {success, data?: {accepted, policy, labels, violations: [{rule, message}]}, error?}. A rejected answer still carries its verdict in `data`."
    )]
    async fn classify_article(
        &self,
        Parameters(req): Parameters<ClassifyArticleRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = match ClassificationRequest::new(req.entries, req.title, req.body) {
            Ok(r) => r,
            Err(e) => return respond(verdict_envelope(Err(e))),
        };
        let overrides = Overrides {
            model: req.model,
            auth_mode: req.auth_mode,
        };
        let classifier = self.current();
        let envelope = classifier
            .classify(&request, &overrides, req.policy.unwrap_or_default())
            .await;
        respond(envelope)
    }

    #[tool(description = "Render the exact prompt classify_article would send, without calling a model")]
    fn render_prompt(
        &self,
        Parameters(req): Parameters<RenderPromptRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result = ClassificationRequest::new(req.entries, req.title, req.body)
            .and_then(|request| render_prompt(&request, &self.settings()));
        respond(Envelope::from_result(result))
    }

    #[tool(
        description = "Validate a model answer obtained elsewhere against a taxonomy snapshot and the configured rules. Same result shape as classify_article."
    )]
    fn validate_answer(
        &self,
        Parameters(req): Parameters<ValidateAnswerRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result = validate_answer(
            &req.entries,
            &req.answer,
            &self.settings(),
            req.policy.unwrap_or_default(),
        );
        respond(verdict_envelope(result))
    }

    #[tool(description = "Get the labeling rules: the rendered rule document plus the configured thresholds")]
    fn get_rules(&self) -> Result<CallToolResult, McpError> {
        let settings = self.settings();
        respond(Envelope::ok(RulesView {
            document: rule_document(&settings.rules, &settings.taxonomy.categories),
            rules: settings.rules,
        }))
    }

    #[tool(description = "Get the current settings. The API key and session cookie are masked.")]
    fn get_settings(&self) -> Result<CallToolResult, McpError> {
        respond(Envelope::ok(masked(self.settings())))
    }

    #[tool(
        description = "Replace the settings and persist them to ~/.labeler/settings.json. Send the full object from get_settings with your changes; masked secrets are kept."
    )]
    fn save_settings(
        &self,
        Parameters(req): Parameters<SaveSettingsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let current = self.current();
        let settings = unmasked(req.settings, current.settings());

        if let Err(e) = labeler_core::write_settings(&settings) {
            return respond(Envelope::<Settings>::fail(e.to_string()));
        }

        let next = if settings.session == current.settings().session
            && settings.timeout_secs == current.settings().timeout_secs
        {
            Ok(current.with_settings(settings.clone()))
        } else {
            Classifier::from_settings(settings.clone())
        };
        match next {
            Ok(classifier) => {
                *self
                    .classifier
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(classifier);
                tracing::info!(target: "labeler::mcp", "settings saved");
                respond(Envelope::ok(masked(settings)))
            }
            Err(e) => respond(Envelope::<Settings>::fail(e.to_string())),
        }
    }

    #[tool(description = "Get the JSON Schema of the settings object")]
    fn settings_schema(&self) -> Result<CallToolResult, McpError> {
        respond(Envelope::ok(labeler_core::settings_schema()))
    }

    #[tool(
        description = "Report the chat-backend session state (noSession, valid or expired) with subject and expiry. Never contacts the backend."
    )]
    async fn session_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.current().sessions().status().await;
        respond(Envelope::ok(status))
    }

    #[tool(
        description = "Fetch a fresh chat-backend session using the configured session cookie. Fails if the browser session is not logged in."
    )]
    async fn connect_session(&self) -> Result<CallToolResult, McpError> {
        let result = self.current().sessions().connect().await;
        respond(Envelope::from_result(result))
    }

    #[tool(description = "Forget the chat-backend session and delete the stored credential")]
    async fn disconnect_session(&self) -> Result<CallToolResult, McpError> {
        let result = self.current().sessions().disconnect().await;
        respond(Envelope::from_result(result.map(|()| "disconnected".to_string())))
    }
}

#[tool_handler]
impl ServerHandler for LabelerServer {
    fn get_info(&self) -> ServerInfo {
        let settings = self.settings();
        let instructions = format!(
            "{}\n\n## Labeling Rules\n{}",
            INSTRUCTIONS,
            rule_document(&settings.rules, &settings.taxonomy.categories)
        );
        ServerInfo {
            instructions: Some(instructions.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// --- Helpers ---

/// Envelope as pretty JSON text; failures become tool errors, not protocol faults.
fn respond<T: Serialize>(envelope: Envelope<T>) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(&envelope).unwrap_or_else(|e| {
        serde_json::json!({"success": false, "error": format!("serialization error: {e}")}).to_string()
    });
    if envelope.success {
        Ok(CallToolResult::success(vec![Content::text(text)]))
    } else {
        Ok(CallToolResult::error(vec![Content::text(text)]))
    }
}

fn masked(mut settings: Settings) -> Settings {
    if !settings.api_key.is_empty() {
        settings.api_key = MASK.to_string();
    }
    if settings.session.cookie.as_deref().is_some_and(|c| !c.is_empty()) {
        settings.session.cookie = Some(MASK.to_string());
    }
    settings
}

fn unmasked(mut incoming: Settings, stored: &Settings) -> Settings {
    if incoming.api_key == MASK {
        incoming.api_key = stored.api_key.clone();
    }
    if incoming.session.cookie.as_deref() == Some(MASK) {
        incoming.session.cookie = stored.session.cookie.clone();
    }
    incoming
}

const INSTRUCTIONS: &str = r#"labeler assigns taxonomy labels to news articles with a language model and checks the answer against structural rules.

## Inputs
A taxonomy snapshot is a list of `{label, depth}` rows in pre-order (depth 1 = root). Roots named after the four categories (Cyber, General, News info, Structure) supply the label lists; operational roots on the denylist are dropped. Every tool that needs a taxonomy takes it as `entries`.

## Workflow
1. Call `classify_article` with the taxonomy rows, title and body. The verdict lists every rule violation.
2. `success: false` with `data` means the model answered but broke a rule. Without `data` the call itself failed: read `error`.
3. Use `render_prompt` to inspect what the model sees, and `validate_answer` to check an answer you already have.

## Backends
`authMode: "apiKey"` calls the completion API with the stored key. `authMode: "session"` uses the chat backend with a browser session: call `connect_session` once after logging in there; `session_status` shows whether the session is still valid. A "please reconnect" error means the session was rejected and has been cleared.

## Settings
`get_settings` / `save_settings` read and write ~/.labeler/settings.json (thresholds, label names, model, endpoints). `settings_schema` returns its JSON Schema."#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // `labeler-mcp schema` prints the settings schema for editors
    if std::env::args().nth(1).as_deref() == Some("schema") {
        println!("{}", serde_json::to_string_pretty(&labeler_core::settings_schema())?);
        return Ok(());
    }

    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = labeler_core::read_settings();
    tracing::info!(
        target: "labeler::mcp",
        auth_mode = ?settings.auth_mode,
        model = %settings.model,
        configured = labeler_core::auth_configured(&settings),
        "starting"
    );

    let service = LabelerServer::new(Classifier::from_settings(settings)?)
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(target: "labeler::mcp", error = %e, "MCP server error"))?;
    service.waiting().await?;
    Ok(())
}
