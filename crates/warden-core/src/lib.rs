//! Warden core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the warden core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod time {
    //! Timestamp helpers: all persisted timestamps are ISO-8601 UTC strings.

    use chrono::{SecondsFormat, Utc};

    /// Current UTC time as an ISO-8601 string with microsecond resolution.
    pub fn now_iso8601() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

}

pub mod error {
    //! Error taxonomy with stable codes and retryability.

    use thiserror::Error;

    /// Errors raised by the rule engine, DSL, store, and service surface.
    ///
    /// Each variant carries a stable code (`E001`..`E500`) and a retryability
    /// flag surfaced to callers in structured error payloads.
    #[derive(Debug, Clone, Error, PartialEq)]
    pub enum RuleError {
        /// Malformed or unevaluable DSL expression (`E001`).
        #[error("Rule DSL syntax error: {message}")]
        DslSyntax {
            /// What went wrong.
            message: String,
            /// The offending expression.
            expression: String,
        },
        /// A cycle in the rule inheritance graph (`E002`).
        #[error("Circular inheritance detected: {chain}")]
        CircularInheritance {
            /// The resolution path that closed the cycle, e.g. `"a -> b -> a"`.
            chain: String,
        },
        /// Lookup of a rule by name failed (`E003`).
        #[error("Rule not found: {name}")]
        RuleNotFound {
            /// Name that was searched for.
            name: String,
        },
        /// A loaded ruleset requires a newer engine (`E004`).
        #[error(
            "Ruleset version {ruleset_version} is incompatible with minimum required version {min_version}"
        )]
        IncompatibleRuleset {
            /// Document schema version of the offending ruleset.
            ruleset_version: String,
            /// Minimum engine version the ruleset declared.
            min_version: String,
        },
        /// Reserved: arbitration could not resolve a priority tie (`E101`).
        #[error("Priority conflict resolution failure: {0}")]
        PriorityConflict(String),
        /// A cooperative or advisory lock could not be acquired (`E201`).
        #[error("Storage lock failure: {0}")]
        StorageLock(String),
        /// Anything else, including storage I/O and parse failures (`E500`).
        #[error("Unexpected error: {0}")]
        Unexpected(String),
    }

    impl RuleError {
        /// Stable error code for structured payloads.
        pub fn code(&self) -> &'static str {
            match self {
                Self::DslSyntax { .. } => "E001",
                Self::CircularInheritance { .. } => "E002",
                Self::RuleNotFound { .. } => "E003",
                Self::IncompatibleRuleset { .. } => "E004",
                Self::PriorityConflict(_) => "E101",
                Self::StorageLock(_) => "E201",
                Self::Unexpected(_) => "E500",
            }
        }

        /// Whether a caller may retry the failed operation.
        pub fn retry_allowed(&self) -> bool {
            matches!(
                self,
                Self::PriorityConflict(_) | Self::StorageLock(_) | Self::Unexpected(_)
            )
        }

        /// Shorthand for a DSL syntax error over `expression`.
        pub fn dsl(message: impl Into<String>, expression: impl Into<String>) -> Self {
            Self::DslSyntax { message: message.into(), expression: expression.into() }
        }
    }

    impl From<std::io::Error> for RuleError {
        fn from(e: std::io::Error) -> Self {
            Self::Unexpected(e.to_string())
        }
    }

}

pub mod model {
    //! Rule data model: scopes, actions, rules, rule sets, contexts, results.

    use crate::error::RuleError;
    use serde::{Deserialize, Deserializer, Serialize};
    use serde_json::{Map, Value};
    use std::collections::HashSet;
    use std::fmt;

    /// Classification bucket a rule belongs to. Hierarchy order is
    /// global < project < individual (more specific last).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Scope {
        /// Applies to every request.
        Global,
        /// Applies within a project.
        Project,
        /// Applies to a single user.
        Individual,
    }

    impl Scope {
        /// All scopes in hierarchy order (least to most specific).
        pub const fn hierarchy() -> [Scope; 3] {
            [Scope::Global, Scope::Project, Scope::Individual]
        }

        /// Lowercase wire name of the scope.
        pub const fn as_str(self) -> &'static str {
            match self {
                Scope::Global => "global",
                Scope::Project => "project",
                Scope::Individual => "individual",
            }
        }
    }

    impl fmt::Display for Scope {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Decision a rule asks for when it matches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Action {
        /// Permit the request.
        Allow,
        /// Block the request.
        Deny,
        /// Permit with a warning surfaced to the caller.
        Warn,
        /// Caller should modify the request per the rule's parameters.
        Modify,
        /// Caller should run additional validation per the rule's parameters.
        Validate,
    }

    impl Action {
        /// Lowercase wire name of the action.
        pub const fn as_str(self) -> &'static str {
            match self {
                Action::Allow => "allow",
                Action::Deny => "deny",
                Action::Warn => "warn",
                Action::Modify => "modify",
                Action::Validate => "validate",
            }
        }
    }

    impl fmt::Display for Action {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Policy for picking among matched rules of equal priority.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TieBreaking {
        /// Preserve discovery order (scope hierarchy, then document order).
        #[default]
        Fifo,
        /// Ascending rule name.
        Lexi,
        /// First match wins; sorts like `Fifo`, distinguished at arbitration.
        First,
    }

    const DEFAULT_PRIORITY: u8 = 50;

    fn default_priority() -> u8 {
        DEFAULT_PRIORITY
    }

    fn default_enabled() -> bool {
        true
    }

    fn priority_in_range<'de, D>(d: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = u8::deserialize(d)?;
        if v > 100 {
            return Err(serde::de::Error::custom(format!(
                "priority {v} out of range, must be between 0 and 100"
            )));
        }
        Ok(v)
    }

    /// A single declaratively authored rule.
    ///
    /// `conditions` maps documentation labels to either DSL expression strings
    /// or structured combinator objects; all entries must match for the rule
    /// to match. Timestamps are owned by the store.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    pub struct Rule {
        /// Unique name within the rule's scope.
        pub name: String,
        /// Scope document this rule belongs to.
        pub scope: Scope,
        /// Priority in `[0, 100]`; higher wins. Defaults to 50.
        #[serde(default = "default_priority", deserialize_with = "priority_in_range")]
        pub priority: u8,
        /// Label -> DSL string or structured condition object.
        #[serde(default)]
        pub conditions: Map<String, Value>,
        /// Decision requested when the rule matches.
        pub action: Action,
        /// Opaque payload surfaced with the decision when matched.
        #[serde(default)]
        pub parameters: Map<String, Value>,
        /// Optional single parent rule name (resolved first).
        #[serde(default)]
        pub parent_rule: Option<String>,
        /// Optional ordered list of additional parent names.
        #[serde(default)]
        pub inherits_from: Option<Vec<String>>,
        /// Free-text description, echoed in evaluation messages.
        #[serde(default)]
        pub description: Option<String>,
        /// Disabled rules are skipped entirely.
        #[serde(default = "default_enabled")]
        pub enabled: bool,
        /// ISO-8601 UTC creation time, stamped by the store.
        #[serde(default)]
        pub created_at: Option<String>,
        /// ISO-8601 UTC last-update time, stamped by the store.
        #[serde(default)]
        pub updated_at: Option<String>,
    }

    impl Rule {
        /// Default priority assigned when a rule does not set one.
        pub const DEFAULT_PRIORITY: u8 = DEFAULT_PRIORITY;

        /// A rule with default priority, empty conditions and parameters,
        /// enabled, and no timestamps.
        pub fn new(name: impl Into<String>, scope: Scope, action: Action) -> Self {
            Self {
                name: name.into(),
                scope,
                priority: DEFAULT_PRIORITY,
                conditions: Map::new(),
                action,
                parameters: Map::new(),
                parent_rule: None,
                inherits_from: None,
                description: None,
                enabled: true,
                created_at: None,
                updated_at: None,
            }
        }

        /// Check the structural invariants that serde cannot express for
        /// programmatically built rules: non-empty name, priority range.
        pub fn validate(&self) -> Result<(), RuleError> {
            if self.name.trim().is_empty() {
                return Err(RuleError::Unexpected("rule name must be non-empty".into()));
            }
            if self.priority > 100 {
                return Err(RuleError::Unexpected(format!(
                    "rule '{}' priority {} out of range, must be between 0 and 100",
                    self.name, self.priority
                )));
            }
            Ok(())
        }
    }

    fn default_ruleset_version() -> String {
        "1.1".to_string()
    }

    fn default_engine_min_version() -> String {
        ">=2.8.0".to_string()
    }

    /// Document grouping the rules of one scope. Rule order within the
    /// document is meaningful for `fifo` tie-breaking.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    pub struct RuleSet {
        /// Document schema version, independent of the engine version.
        #[serde(default = "default_ruleset_version")]
        pub ruleset_version: String,
        /// Version expression asserted against the engine, e.g. `">=2.8.0"`.
        #[serde(default = "default_engine_min_version")]
        pub engine_min_version: String,
        /// Scope all rules in this document belong to.
        pub scope: Scope,
        /// Ordered rules.
        #[serde(default)]
        pub rules: Vec<Rule>,
        /// Free-form document metadata.
        #[serde(default)]
        pub metadata: Map<String, Value>,
    }

    impl RuleSet {
        /// An empty ruleset for `scope` with default versions.
        pub fn empty(scope: Scope) -> Self {
            Self {
                ruleset_version: default_ruleset_version(),
                engine_min_version: default_engine_min_version(),
                scope,
                rules: Vec::new(),
                metadata: Map::new(),
            }
        }

        /// Check document invariants: per-rule validity, scope agreement,
        /// and name uniqueness within the set.
        pub fn validate(&self) -> Result<(), RuleError> {
            let mut seen: HashSet<&str> = HashSet::new();
            for rule in &self.rules {
                rule.validate()?;
                if rule.scope != self.scope {
                    return Err(RuleError::Unexpected(format!(
                        "rule '{}' has scope {} but belongs to a {} document",
                        rule.name, rule.scope, self.scope
                    )));
                }
                if !seen.insert(rule.name.as_str()) {
                    return Err(RuleError::Unexpected(format!(
                        "duplicate rule name '{}' in scope {}",
                        rule.name, self.scope
                    )));
                }
            }
            Ok(())
        }
    }

    /// Attributes describing the request under evaluation. All fields are
    /// optional; unknown identifiers resolve to null in the DSL.
    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    pub struct Context {
        /// Requesting user.
        #[serde(default)]
        pub user_id: Option<String>,
        /// Project the request belongs to.
        #[serde(default)]
        pub project_id: Option<String>,
        /// Session identifier.
        #[serde(default)]
        pub session_id: Option<String>,
        /// Target model name.
        #[serde(default)]
        pub model_name: Option<String>,
        /// Prompt length in characters.
        #[serde(default)]
        pub prompt_length: Option<i64>,
        /// Caller-supplied timestamp.
        #[serde(default)]
        pub timestamp: Option<String>,
        /// Arbitrary additional attributes, reachable from the DSL by key or
        /// dotted path.
        #[serde(default)]
        pub custom_attributes: Map<String, Value>,
    }

    /// Outcome of evaluating one rule.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    pub struct EvaluationResult {
        /// Name of the evaluated rule.
        pub rule_name: String,
        /// The rule's declared action, recorded whether or not it matched.
        pub action: Action,
        /// Whether every condition matched.
        pub matched: bool,
        /// Rule parameters, copied only when matched.
        #[serde(default)]
        pub parameters: Map<String, Value>,
        /// Human-readable outcome description.
        #[serde(default)]
        pub message: Option<String>,
        /// Effective priority the rule was evaluated at.
        pub priority: u8,
        /// Wall time spent evaluating this rule, in milliseconds.
        #[serde(default)]
        pub execution_time_ms: Option<f64>,
    }

    /// Result of one full evaluation: per-rule results in evaluation order
    /// plus the arbitrated final action.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    pub struct Summary {
        /// The context that was evaluated.
        pub context: Context,
        /// Per-rule results, in the engine's sorted order.
        pub results: Vec<EvaluationResult>,
        /// The single arbitrated decision.
        pub final_action: Action,
        /// Total wall time for the evaluation, in milliseconds.
        pub total_execution_time_ms: f64,
        /// ISO-8601 UTC timestamp taken after arbitration.
        pub evaluated_at: String,
        /// Number of enabled rules considered.
        pub applicable_rules_count: usize,
        /// Number of rules whose conditions all matched.
        pub matched_rules_count: usize,
    }

}
