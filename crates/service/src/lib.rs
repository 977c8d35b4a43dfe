//! Request/response surface over the rule store and engine.
//!
//! Operations are keyed by short names (`evaluate_rules`, `create_rule`, …)
//! and exchange structured JSON payloads. Success responses carry
//! `{"success": true, …}`; every failure funnels into
//! `{"error": {"code", "message", "retry_allowed"}}`. The outer transport
//! (message framing, authentication) lives elsewhere and calls
//! [`RuleService::dispatch`] or the typed methods directly.

#![deny(unsafe_code)]

use dsl::Evaluator;
use rule_engine::{Engine, EngineConfig, DEFAULT_ENGINE_VERSION};
use rule_store::{RuleStore, YamlRuleStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use warden_core::error::RuleError;
use warden_core::model::{Action, Context, Rule, Scope, TieBreaking};
use warden_core::time::now_iso8601;

/// Which store implementation backs the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// One YAML document per scope under `rules_dir`.
    #[default]
    File,
}

/// Service configuration knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the per-scope rule documents.
    pub rules_dir: String,
    /// Store implementation to use.
    pub storage_backend: StorageBackend,
    /// Tie-breaking policy handed to the engine.
    pub priority_tie_breaking: TieBreaking,
    /// Per-evaluation wall-clock budget in milliseconds.
    pub max_evaluation_time_ms: u64,
    /// Declared engine version for `engine_min_version` checks.
    pub engine_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules_dir: "config/rules".to_string(),
            storage_backend: StorageBackend::File,
            priority_tie_breaking: TieBreaking::Fifo,
            max_evaluation_time_ms: 1000,
            engine_version: DEFAULT_ENGINE_VERSION.to_string(),
        }
    }
}

impl Settings {
    /// Defaults overridden by `WARDEN_*` environment variables where set.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(dir) = std::env::var("WARDEN_RULES_DIR") {
            settings.rules_dir = dir;
        }
        if let Ok(raw) = std::env::var("WARDEN_STORAGE_BACKEND") {
            match raw.as_str() {
                "file" => settings.storage_backend = StorageBackend::File,
                other => warn!(value = other, "unknown WARDEN_STORAGE_BACKEND, keeping default"),
            }
        }
        if let Ok(raw) = std::env::var("WARDEN_PRIORITY_TIE_BREAKING") {
            match raw.as_str() {
                "fifo" => settings.priority_tie_breaking = TieBreaking::Fifo,
                "lexi" => settings.priority_tie_breaking = TieBreaking::Lexi,
                "first" => settings.priority_tie_breaking = TieBreaking::First,
                other => {
                    warn!(value = other, "unknown WARDEN_PRIORITY_TIE_BREAKING, keeping default");
                }
            }
        }
        if let Ok(raw) = std::env::var("WARDEN_MAX_EVALUATION_TIME_MS") {
            match raw.parse() {
                Ok(ms) => settings.max_evaluation_time_ms = ms,
                Err(_) => {
                    warn!(value = raw, "unparseable WARDEN_MAX_EVALUATION_TIME_MS, keeping default");
                }
            }
        }
        if let Ok(version) = std::env::var("WARDEN_ENGINE_VERSION") {
            settings.engine_version = version;
        }
        settings
    }
}

/// Initialize structured logging (JSON) with env filter.
/// Set `RUST_LOG`, e.g. `info,service=debug`.
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// In-process counters of final actions served by `evaluate_rules`.
/// Low-cardinality by construction; intended for tests and local
/// observability.
#[derive(Default, Clone)]
pub struct DecisionMetrics {
    inner: Arc<Mutex<HashMap<&'static str, u64>>>,
}

impl DecisionMetrics {
    /// Current count of evaluations that arbitrated to `action`.
    pub fn final_action_count(&self, action: Action) -> u64 {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        guard.get(action.as_str()).copied().unwrap_or(0)
    }

    fn inc(&self, action: Action) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        *guard.entry(action.as_str()).or_insert(0) += 1;
    }
}

/// Request payload for `create_rule`: rule fields without timestamps.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRuleRequest {
    /// Rule name, unique within the scope.
    pub name: String,
    /// Target scope.
    pub scope: Scope,
    /// Priority in `[0, 100]`, defaulting to 50.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Condition labels to expressions or combinators.
    #[serde(default)]
    pub conditions: Map<String, Value>,
    /// Action on match.
    pub action: Action,
    /// Opaque parameters surfaced with the decision.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Optional single parent.
    #[serde(default)]
    pub parent_rule: Option<String>,
    /// Optional ordered parent list.
    #[serde(default)]
    pub inherits_from: Option<Vec<String>>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the rule participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u8 {
    Rule::DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

/// Request payload for `update_rule`: `name` and `scope` select the rule and
/// are immutable; absent fields retain their prior value.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRuleRequest {
    /// Name of the rule to patch.
    pub name: String,
    /// Scope of the rule to patch.
    pub scope: Scope,
    /// New priority, if given.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Replacement conditions, if given.
    #[serde(default)]
    pub conditions: Option<Map<String, Value>>,
    /// New action, if given.
    #[serde(default)]
    pub action: Option<Action>,
    /// Replacement parameters, if given.
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    /// New single parent, if given.
    #[serde(default)]
    pub parent_rule: Option<String>,
    /// Replacement parent list, if given.
    #[serde(default)]
    pub inherits_from: Option<Vec<String>>,
    /// New description, if given.
    #[serde(default)]
    pub description: Option<String>,
    /// Enable or disable, if given.
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Request payload for `evaluate_rules`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluateRulesRequest {
    /// The context to evaluate.
    pub context: Context,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeleteRuleRequest {
    name: String,
    scope: Scope,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetRuleRequest {
    name: String,
    #[serde(default)]
    scope: Option<Scope>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListRulesRequest {
    #[serde(default)]
    scope: Option<Scope>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateDslRequest {
    expression: String,
}

/// The rule management service: storage, engine, DSL validation, health.
pub struct RuleService {
    settings: Settings,
    store: Arc<dyn RuleStore>,
    engine: Engine,
    evaluator: Evaluator,
    metrics: DecisionMetrics,
}

impl RuleService {
    /// Build the service from settings, constructing the configured store
    /// and an engine over it.
    pub fn new(settings: Settings) -> Result<Self, RuleError> {
        let store: Arc<dyn RuleStore> = match settings.storage_backend {
            StorageBackend::File => Arc::new(YamlRuleStore::new(&settings.rules_dir)?),
        };
        let engine = Engine::new(
            store.clone(),
            EngineConfig {
                tie_breaking: settings.priority_tie_breaking,
                max_evaluation_time_ms: settings.max_evaluation_time_ms,
                engine_version: settings.engine_version.clone(),
            },
        );
        Ok(Self {
            settings,
            store,
            engine,
            evaluator: Evaluator::new(),
            metrics: DecisionMetrics::default(),
        })
    }

    /// Decision counters served so far.
    pub fn metrics(&self) -> &DecisionMetrics {
        &self.metrics
    }

    /// Route an operation by its short name. Unknown names and malformed
    /// payloads produce the standard error shape.
    pub async fn dispatch(&self, operation: &str, payload: Value) -> Value {
        match operation {
            "evaluate_rules" => match serde_json::from_value(payload) {
                Ok(request) => self.evaluate_rules(request).await,
                Err(e) => malformed(e),
            },
            "create_rule" => match serde_json::from_value(payload) {
                Ok(request) => self.create_rule(request).await,
                Err(e) => malformed(e),
            },
            "update_rule" => match serde_json::from_value(payload) {
                Ok(request) => self.update_rule(request).await,
                Err(e) => malformed(e),
            },
            "delete_rule" => match serde_json::from_value::<DeleteRuleRequest>(payload) {
                Ok(request) => self.delete_rule(&request.name, request.scope).await,
                Err(e) => malformed(e),
            },
            "list_rules" => match serde_json::from_value::<ListRulesRequest>(payload) {
                Ok(request) => self.list_rules(request.scope).await,
                Err(e) => malformed(e),
            },
            "get_rule" => match serde_json::from_value::<GetRuleRequest>(payload) {
                Ok(request) => self.get_rule(&request.name, request.scope).await,
                Err(e) => malformed(e),
            },
            "validate_rule_dsl" => match serde_json::from_value::<ValidateDslRequest>(payload) {
                Ok(request) => self.validate_rule_dsl(&request.expression),
                Err(e) => malformed(e),
            },
            "health_check" => self.health_check().await,
            other => error_payload(&RuleError::Unexpected(format!("Unknown operation '{other}'"))),
        }
    }

    /// Evaluate rules against a context and return the summary.
    pub async fn evaluate_rules(&self, request: EvaluateRulesRequest) -> Value {
        match self.engine.evaluate(&request.context).await {
            Ok(summary) => {
                self.metrics.inc(summary.final_action);
                info!(
                    final_action = %summary.final_action,
                    applicable = summary.applicable_rules_count,
                    matched = summary.matched_rules_count,
                    "evaluated rules"
                );
                match serde_json::to_value(&summary) {
                    Ok(value) => value,
                    Err(e) => error_payload(&RuleError::Unexpected(e.to_string())),
                }
            }
            Err(e) => error_payload(&e),
        }
    }

    /// Create a new rule.
    pub async fn create_rule(&self, request: CreateRuleRequest) -> Value {
        let rule = Rule {
            name: request.name,
            scope: request.scope,
            priority: request.priority,
            conditions: request.conditions,
            action: request.action,
            parameters: request.parameters,
            parent_rule: request.parent_rule,
            inherits_from: request.inherits_from,
            description: request.description,
            enabled: request.enabled,
            created_at: None,
            updated_at: None,
        };
        match self.store.add(rule).await {
            Ok(rule) => {
                info!(name = %rule.name, scope = %rule.scope, "created rule");
                json!({"success": true, "rule": rule})
            }
            Err(e) => error_payload(&e),
        }
    }

    /// Patch an existing rule; absent fields keep their prior values.
    pub async fn update_rule(&self, request: UpdateRuleRequest) -> Value {
        let existing = match self.store.get(&request.name, Some(request.scope)).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                return error_payload(&RuleError::RuleNotFound { name: request.name })
            }
            Err(e) => return error_payload(&e),
        };

        let mut updated = existing;
        if let Some(priority) = request.priority {
            updated.priority = priority;
        }
        if let Some(conditions) = request.conditions {
            updated.conditions = conditions;
        }
        if let Some(action) = request.action {
            updated.action = action;
        }
        if let Some(parameters) = request.parameters {
            updated.parameters = parameters;
        }
        if let Some(parent_rule) = request.parent_rule {
            updated.parent_rule = Some(parent_rule);
        }
        if let Some(inherits_from) = request.inherits_from {
            updated.inherits_from = Some(inherits_from);
        }
        if let Some(description) = request.description {
            updated.description = Some(description);
        }
        if let Some(enabled) = request.enabled {
            updated.enabled = enabled;
        }

        match self.store.update(updated).await {
            Ok(rule) => {
                info!(name = %rule.name, scope = %rule.scope, "updated rule");
                json!({"success": true, "rule": rule})
            }
            Err(e) => error_payload(&e),
        }
    }

    /// Delete a rule by `(name, scope)`.
    pub async fn delete_rule(&self, name: &str, scope: Scope) -> Value {
        match self.store.delete(name, scope).await {
            Ok(true) => {
                info!(name, %scope, "deleted rule");
                json!({"success": true, "message": format!("Rule '{name}' deleted")})
            }
            Ok(false) => error_payload(&RuleError::RuleNotFound { name: name.to_string() }),
            Err(e) => error_payload(&e),
        }
    }

    /// List rules, optionally filtered to one scope.
    pub async fn list_rules(&self, scope: Option<Scope>) -> Value {
        match self.store.list(scope).await {
            Ok(rules) => json!({"success": true, "count": rules.len(), "rules": rules}),
            Err(e) => error_payload(&e),
        }
    }

    /// Fetch one rule by name, searching all scopes when none is given.
    pub async fn get_rule(&self, name: &str, scope: Option<Scope>) -> Value {
        match self.store.get(name, scope).await {
            Ok(Some(rule)) => json!({"success": true, "rule": rule}),
            Ok(None) => error_payload(&RuleError::RuleNotFound { name: name.to_string() }),
            Err(e) => error_payload(&e),
        }
    }

    /// Syntactically validate a DSL expression. Never fails; issues are
    /// returned in the payload.
    pub fn validate_rule_dsl(&self, expression: &str) -> Value {
        let issues = self.evaluator.validate_expression(expression);
        json!({"success": true, "valid": issues.is_empty(), "issues": issues})
    }

    /// Report storage health.
    pub async fn health_check(&self) -> Value {
        let healthy = self.store.health().await;
        json!({
            "success": true,
            "healthy": healthy,
            "storage_backend": self.settings.storage_backend,
            "timestamp": now_iso8601(),
        })
    }
}

/// The single error shape every operation funnels failures into.
fn error_payload(error: &RuleError) -> Value {
    json!({
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "retry_allowed": error.retry_allowed(),
        }
    })
}

fn malformed(e: serde_json::Error) -> Value {
    error_payload(&RuleError::Unexpected(format!("Malformed request payload: {e}")))
}
