//! Deterministic rule evaluation engine.
//!
//! One evaluation is a fresh computation over the injected store:
//!
//! 1. Load every scope's ruleset in hierarchy order, gate on
//!    `engine_min_version`, and keep enabled rules.
//! 2. Resolve inheritance over the name-indexed union of all scopes,
//!    detecting cycles.
//! 3. Stable-sort by descending priority with the configured tie-breaking.
//! 4. Evaluate each rule's conditions; a rule's own failure is contained as
//!    a non-matching deny rather than aborting the batch.
//! 5. Arbitrate a single final action from the matched rules.
//!
//! Evaluations carry a wall-clock budget; the deadline is checked before
//! each rule, so overshoot is bounded by a single rule's evaluation time.

#![deny(unsafe_code)]

use dsl::{Evaluator, Value};
use rule_store::RuleStore;
use semver::Version;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use warden_core::error::RuleError;
use warden_core::model::{
    Action, Context, EvaluationResult, Rule, RuleSet, Scope, Summary, TieBreaking,
};
use warden_core::time::now_iso8601;

/// Engine version asserted against ruleset `engine_min_version` expressions
/// when the configuration does not override it.
pub const DEFAULT_ENGINE_VERSION: &str = "2.8.0";

/// Tunables for [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Policy for ordering and arbitrating equal-priority rules.
    pub tie_breaking: TieBreaking,
    /// Wall-clock budget for one evaluation, in milliseconds.
    pub max_evaluation_time_ms: u64,
    /// Declared engine version for `engine_min_version` checks.
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tie_breaking: TieBreaking::Fifo,
            max_evaluation_time_ms: 1000,
            engine_version: DEFAULT_ENGINE_VERSION.to_string(),
        }
    }
}

/// Evaluates rule sets from a [`RuleStore`] against request contexts.
/// Stateless between evaluations.
pub struct Engine {
    store: Arc<dyn RuleStore>,
    tie_breaking: TieBreaking,
    max_evaluation_time_ms: u64,
    engine_version: Version,
    evaluator: Evaluator,
}

impl Engine {
    /// Build an engine over `store`. An unparseable configured version falls
    /// back to [`DEFAULT_ENGINE_VERSION`].
    pub fn new(store: Arc<dyn RuleStore>, config: EngineConfig) -> Self {
        let engine_version = Version::parse(&config.engine_version).unwrap_or_else(|e| {
            warn!(
                version = %config.engine_version,
                error = %e,
                "invalid configured engine version, using default"
            );
            Version::new(2, 8, 0)
        });
        Self {
            store,
            tie_breaking: config.tie_breaking,
            max_evaluation_time_ms: config.max_evaluation_time_ms,
            engine_version,
            evaluator: Evaluator::new(),
        }
    }

    /// Evaluate all applicable rules against `context` and arbitrate a final
    /// action.
    pub async fn evaluate(&self, context: &Context) -> Result<Summary, RuleError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.max_evaluation_time_ms);

        let applicable = self.applicable_rules().await?;
        debug!(count = applicable.len(), "gathered applicable rules");

        let mut results = Vec::with_capacity(applicable.len());
        for rule in &applicable {
            if Instant::now() >= deadline {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                return Err(RuleError::Unexpected(format!(
                    "Rule evaluation failed after {elapsed:.2}ms: exceeded evaluation time budget of {}ms",
                    self.max_evaluation_time_ms
                )));
            }
            results.push(self.evaluate_rule(rule, context));
        }

        let final_action = self.arbitrate(&results);
        let matched_rules_count = results.iter().filter(|r| r.matched).count();
        Ok(Summary {
            context: context.clone(),
            final_action,
            total_execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            evaluated_at: now_iso8601(),
            applicable_rules_count: results.len(),
            matched_rules_count,
            results,
        })
    }

    /// Enabled rules from all scopes in hierarchy order, inheritance
    /// resolved, sorted for evaluation.
    async fn applicable_rules(&self) -> Result<Vec<Rule>, RuleError> {
        let mut rules = Vec::new();
        for scope in Scope::hierarchy() {
            let ruleset = self.store.load(scope).await?;
            self.check_ruleset_version(&ruleset)?;
            rules.extend(ruleset.rules.into_iter().filter(|r| r.enabled));
        }
        let resolved = resolve_inheritance(&rules)?;
        Ok(self.sort_rules(resolved))
    }

    /// Gate a loaded ruleset on its `engine_min_version` expression. A
    /// malformed expression is logged and treated as no constraint.
    fn check_ruleset_version(&self, ruleset: &RuleSet) -> Result<(), RuleError> {
        let expr = ruleset.engine_min_version.trim();
        if expr.is_empty() {
            return Ok(());
        }
        let min = expr.strip_prefix(">=").unwrap_or(expr).trim();
        match Version::parse(min) {
            Ok(min_version) => {
                if self.engine_version < min_version {
                    return Err(RuleError::IncompatibleRuleset {
                        ruleset_version: ruleset.ruleset_version.clone(),
                        min_version: min.to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    scope = %ruleset.scope,
                    expression = expr,
                    error = %e,
                    "unparseable engine_min_version, ignoring constraint"
                );
                Ok(())
            }
        }
    }

    /// Stable sort: descending priority, then the configured tie-breaking.
    /// `fifo` and `first` keep discovery order on ties.
    fn sort_rules(&self, mut rules: Vec<Rule>) -> Vec<Rule> {
        match self.tie_breaking {
            TieBreaking::Lexi => rules.sort_by(|a, b| {
                b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name))
            }),
            TieBreaking::Fifo | TieBreaking::First => {
                rules.sort_by(|a, b| b.priority.cmp(&a.priority));
            }
        }
        rules
    }

    /// Evaluate a single rule. Failures are contained: the result records a
    /// non-matching deny carrying the error text.
    fn evaluate_rule(&self, rule: &Rule, context: &Context) -> EvaluationResult {
        let started = Instant::now();
        match self.rule_matches(rule, context) {
            Ok(matched) => EvaluationResult {
                rule_name: rule.name.clone(),
                action: rule.action,
                matched,
                parameters: if matched { rule.parameters.clone() } else { Map::new() },
                message: Some(rule_message(rule, matched)),
                priority: rule.priority,
                execution_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            },
            Err(e) => EvaluationResult {
                rule_name: rule.name.clone(),
                action: Action::Deny,
                matched: false,
                parameters: Map::new(),
                message: Some(format!("Rule evaluation error: {e}")),
                priority: rule.priority,
                execution_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            },
        }
    }

    /// All condition entries must match; an empty conditions map matches.
    fn rule_matches(&self, rule: &Rule, context: &Context) -> Result<bool, RuleError> {
        for condition in rule.conditions.values() {
            if !self.condition_matches(condition, context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A string condition is a DSL expression; an object is a structured
    /// combinator; anything else matches on its truthiness.
    fn condition_matches(&self, condition: &Json, context: &Context) -> Result<bool, RuleError> {
        match condition {
            Json::String(expr) => self.evaluator.evaluate(expr, context),
            Json::Object(map) => self.combinator_matches(map, context),
            other => Ok(Value::from_json(other).is_truthy()),
        }
    }

    /// Single-key `and`/`or`/`not` objects combine their children; any other
    /// object is an implicit conjunction over its entry values.
    fn combinator_matches(
        &self,
        map: &Map<String, Json>,
        context: &Context,
    ) -> Result<bool, RuleError> {
        if map.len() == 1 {
            if let Some(children) = map.get("and") {
                return self.all_match(children, context);
            }
            if let Some(children) = map.get("or") {
                return self.any_match(children, context);
            }
            if let Some(child) = map.get("not") {
                return Ok(!self.condition_matches(child, context)?);
            }
        }
        for child in map.values() {
            if !self.condition_matches(child, context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn all_match(&self, children: &Json, context: &Context) -> Result<bool, RuleError> {
        match children {
            Json::Array(items) => {
                for item in items {
                    if !self.condition_matches(item, context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            single => self.condition_matches(single, context),
        }
    }

    fn any_match(&self, children: &Json, context: &Context) -> Result<bool, RuleError> {
        match children {
            Json::Array(items) => {
                for item in items {
                    if self.condition_matches(item, context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            single => self.condition_matches(single, context),
        }
    }

    /// Pick the final action from the matched rules: none matched means
    /// allow; otherwise the highest-priority match wins, with ties resolved
    /// by the configured policy.
    fn arbitrate(&self, results: &[EvaluationResult]) -> Action {
        let matched: Vec<&EvaluationResult> = results.iter().filter(|r| r.matched).collect();
        let Some(top) = matched.iter().map(|r| r.priority).max() else {
            return Action::Allow;
        };
        let mut at_top: Vec<&EvaluationResult> =
            matched.into_iter().filter(|r| r.priority == top).collect();
        if self.tie_breaking == TieBreaking::Lexi {
            at_top.sort_by(|a, b| a.rule_name.cmp(&b.rule_name));
        }
        at_top.first().map_or(Action::Allow, |r| r.action)
    }
}

fn rule_message(rule: &Rule, matched: bool) -> String {
    let status = if matched { "matched" } else { "not matched" };
    match &rule.description {
        Some(description) => format!("Rule '{}' {status}: {description}", rule.name),
        None => format!("Rule '{}' {status}", rule.name),
    }
}

/// Resolve inheritance for every rule against the name-indexed union of all
/// scopes. Later scopes shadow earlier ones in the index; a name already
/// resolved is not resolved again.
fn resolve_inheritance(rules: &[Rule]) -> Result<Vec<Rule>, RuleError> {
    let mut index: HashMap<&str, &Rule> = HashMap::with_capacity(rules.len());
    for rule in rules {
        index.insert(rule.name.as_str(), rule);
    }
    let mut resolved = Vec::with_capacity(rules.len());
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for rule in rules {
        if !seen.insert(rule.name.as_str()) {
            continue;
        }
        let mut path = Vec::new();
        resolved.push(resolve_rule(rule, &index, &mut path)?);
    }
    Ok(resolved)
}

/// Depth-first resolution of one rule: `parent_rule` first, then each
/// `inherits_from` entry in order, each parent itself resolved first.
/// `path` carries the names on the current resolution branch for cycle
/// detection.
fn resolve_rule(
    rule: &Rule,
    index: &HashMap<&str, &Rule>,
    path: &mut Vec<String>,
) -> Result<Rule, RuleError> {
    if path.iter().any(|name| name == &rule.name) {
        let chain = format!("{} -> {}", path.join(" -> "), rule.name);
        return Err(RuleError::CircularInheritance { chain });
    }
    let no_parents = rule.parent_rule.is_none()
        && rule.inherits_from.as_ref().map_or(true, |parents| parents.is_empty());
    if no_parents {
        return Ok(rule.clone());
    }

    path.push(rule.name.clone());
    let mut resolved = rule.clone();
    if let Some(parent_name) = &rule.parent_rule {
        if let Some(parent) = index.get(parent_name.as_str()) {
            let parent_resolved = resolve_rule(parent, index, path)?;
            resolved = merge_rules(&parent_resolved, &resolved);
        }
    }
    if let Some(parents) = &rule.inherits_from {
        for parent_name in parents {
            if let Some(parent) = index.get(parent_name.as_str()) {
                let parent_resolved = resolve_rule(parent, index, path)?;
                resolved = merge_rules(&parent_resolved, &resolved);
            }
        }
    }
    path.pop();
    Ok(resolved)
}

/// Overlay `derived` onto `base`. Conditions and parameters merge by key
/// with the derived side winning; a derived priority equal to the default
/// (50) is treated as unset and inherits the base priority.
fn merge_rules(base: &Rule, derived: &Rule) -> Rule {
    let mut merged = base.clone();
    merged.name = derived.name.clone();
    merged.scope = derived.scope;
    merged.action = derived.action;
    if derived.priority != Rule::DEFAULT_PRIORITY {
        merged.priority = derived.priority;
    }
    if let Some(description) = &derived.description {
        merged.description = Some(description.clone());
    }
    for (key, value) in &derived.conditions {
        merged.conditions.insert(key.clone(), value.clone());
    }
    for (key, value) in &derived.parameters {
        merged.parameters.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(name: &str, priority: u8, action: Action) -> Rule {
        let mut r = Rule::new(name, Scope::Global, action);
        r.priority = priority;
        r
    }

    fn result(name: &str, priority: u8, action: Action, matched: bool) -> EvaluationResult {
        EvaluationResult {
            rule_name: name.into(),
            action,
            matched,
            parameters: Map::new(),
            message: None,
            priority,
            execution_time_ms: None,
        }
    }

    fn engine(tie: TieBreaking) -> Engine {
        let dir = tempfile::tempdir().unwrap();
        let store = rule_store::YamlRuleStore::new(dir.path()).unwrap();
        Engine::new(
            Arc::new(store),
            EngineConfig { tie_breaking: tie, ..EngineConfig::default() },
        )
    }

    #[test]
    fn merge_overlays_child_and_keeps_parent_fields() {
        let mut base = rule("base", 70, Action::Deny);
        base.conditions.insert("size".into(), json!("prompt_length > 1000"));
        base.parameters.insert("msg".into(), json!("base"));

        let mut child = rule("child", 50, Action::Warn);
        child.parent_rule = Some("base".into());
        child.parameters.insert("reason".into(), json!("oversize"));

        let merged = merge_rules(&base, &child);
        assert_eq!(merged.name, "child");
        assert_eq!(merged.action, Action::Warn);
        assert_eq!(merged.priority, 70); // child's 50 reads as unset
        assert_eq!(merged.conditions["size"], json!("prompt_length > 1000"));
        assert_eq!(merged.parameters["msg"], json!("base"));
        assert_eq!(merged.parameters["reason"], json!("oversize"));
    }

    #[test]
    fn merge_child_priority_other_than_default_wins() {
        let base = rule("base", 70, Action::Deny);
        let mut child = rule("child", 30, Action::Warn);
        child.parent_rule = Some("base".into());
        assert_eq!(merge_rules(&base, &child).priority, 30);
    }

    #[test]
    fn cycle_is_detected_with_a_chain() {
        let mut a = rule("a", 50, Action::Allow);
        a.inherits_from = Some(vec!["b".into()]);
        let mut b = rule("b", 50, Action::Allow);
        b.inherits_from = Some(vec!["a".into()]);

        let err = resolve_inheritance(&[a, b]).unwrap_err();
        assert_eq!(err.code(), "E002");
        let chain = err.to_string();
        assert!(chain.contains('a') && chain.contains('b'), "{chain}");
    }

    #[test]
    fn missing_parent_is_ignored() {
        let mut orphan = rule("orphan", 60, Action::Deny);
        orphan.inherits_from = Some(vec!["nonexistent".into()]);
        let resolved = resolve_inheritance(std::slice::from_ref(&orphan)).unwrap();
        assert_eq!(resolved[0], orphan);
    }

    #[test]
    fn sort_is_stable_for_fifo() {
        let e = engine(TieBreaking::Fifo);
        let sorted = e.sort_rules(vec![
            rule("b_rule", 50, Action::Deny),
            rule("a_rule", 50, Action::Warn),
            rule("low", 10, Action::Allow),
            rule("high", 90, Action::Deny),
        ]);
        let names: Vec<&str> = sorted.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["high", "b_rule", "a_rule", "low"]);
    }

    #[test]
    fn sort_lexi_orders_ties_by_name() {
        let e = engine(TieBreaking::Lexi);
        let sorted = e.sort_rules(vec![
            rule("b_rule", 50, Action::Deny),
            rule("a_rule", 50, Action::Warn),
        ]);
        let names: Vec<&str> = sorted.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a_rule", "b_rule"]);
    }

    #[test]
    fn arbitration_none_matched_allows() {
        let e = engine(TieBreaking::Fifo);
        let results = vec![result("r", 90, Action::Deny, false)];
        assert_eq!(e.arbitrate(&results), Action::Allow);
    }

    #[test]
    fn arbitration_highest_priority_wins() {
        let e = engine(TieBreaking::Fifo);
        let results = vec![
            result("high", 80, Action::Deny, true),
            result("low", 10, Action::Allow, true),
        ];
        assert_eq!(e.arbitrate(&results), Action::Deny);
    }

    #[test]
    fn arbitration_lexi_tie_breaks_by_name() {
        let e = engine(TieBreaking::Lexi);
        let results = vec![
            result("b_rule", 50, Action::Deny, true),
            result("a_rule", 50, Action::Warn, true),
        ];
        assert_eq!(e.arbitrate(&results), Action::Warn);
    }

    #[test]
    fn version_gate_accepts_equal_and_older_minimums() {
        let e = engine(TieBreaking::Fifo);
        let mut set = RuleSet::empty(Scope::Global);
        set.engine_min_version = ">=2.8.0".into();
        assert!(e.check_ruleset_version(&set).is_ok());
        set.engine_min_version = ">=1.0.0".into();
        assert!(e.check_ruleset_version(&set).is_ok());
    }

    #[test]
    fn version_gate_rejects_newer_minimums() {
        let e = engine(TieBreaking::Fifo);
        let mut set = RuleSet::empty(Scope::Global);
        set.engine_min_version = ">=99.0.0".into();
        let err = e.check_ruleset_version(&set).unwrap_err();
        assert_eq!(err.code(), "E004");
    }

    #[test]
    fn version_gate_ignores_malformed_expressions() {
        let e = engine(TieBreaking::Fifo);
        let mut set = RuleSet::empty(Scope::Global);
        set.engine_min_version = "about 2.8 or so".into();
        assert!(e.check_ruleset_version(&set).is_ok());
        set.engine_min_version = String::new();
        assert!(e.check_ruleset_version(&set).is_ok());
    }
}
