use serde_json::json;
use service::{
    CreateRuleRequest, EvaluateRulesRequest, RuleService, Settings, StorageBackend,
};
use warden_core::model::{Action, Scope};

fn service() -> (tempfile::TempDir, RuleService) {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        rules_dir: dir.path().to_string_lossy().into_owned(),
        ..Settings::default()
    };
    let service = RuleService::new(settings).expect("service");
    (dir, service)
}

fn create_request(name: &str, scope: Scope, action: Action) -> CreateRuleRequest {
    serde_json::from_value(json!({
        "name": name,
        "scope": scope,
        "action": action,
    }))
    .unwrap()
}

#[tokio::test]
async fn create_returns_the_stamped_rule() {
    let (_dir, service) = service();
    let response = service.create_rule(create_request("quota", Scope::Global, Action::Deny)).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["rule"]["name"], "quota");
    assert_eq!(response["rule"]["priority"], 50);
    assert!(response["rule"]["created_at"].is_string());
    assert!(response["rule"]["updated_at"].is_string());
}

#[tokio::test]
async fn create_duplicate_is_an_error_payload() {
    let (_dir, service) = service();
    service.create_rule(create_request("quota", Scope::Global, Action::Deny)).await;
    let response = service.create_rule(create_request("quota", Scope::Global, Action::Deny)).await;
    assert_eq!(response["error"]["code"], "E500");
    assert!(response["error"]["message"].as_str().unwrap().contains("already exists"));
    assert_eq!(response["error"]["retry_allowed"], true);
}

#[tokio::test]
async fn update_patches_only_the_given_fields() {
    let (_dir, service) = service();
    let created = service
        .dispatch(
            "create_rule",
            json!({
                "name": "quota",
                "scope": "global",
                "action": "deny",
                "priority": 70,
                "description": "original description",
                "parameters": {"limit": 10}
            }),
        )
        .await;
    assert_eq!(created["success"], true);

    let response = service
        .dispatch("update_rule", json!({"name": "quota", "scope": "global", "priority": 90}))
        .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["rule"]["priority"], 90);
    assert_eq!(response["rule"]["description"], "original description");
    assert_eq!(response["rule"]["parameters"]["limit"], 10);
    assert_eq!(response["rule"]["created_at"], created["rule"]["created_at"]);
}

#[tokio::test]
async fn update_missing_rule_is_not_found() {
    let (_dir, service) = service();
    let response = service
        .dispatch("update_rule", json!({"name": "ghost", "scope": "global", "priority": 10}))
        .await;
    assert_eq!(response["error"]["code"], "E003");
}

#[tokio::test]
async fn update_cannot_move_a_rule_between_scopes() {
    let (_dir, service) = service();
    service.create_rule(create_request("pinned", Scope::Project, Action::Warn)).await;
    // The (name, scope) pair addresses the rule; a different scope is a miss.
    let response = service
        .dispatch("update_rule", json!({"name": "pinned", "scope": "global", "priority": 10}))
        .await;
    assert_eq!(response["error"]["code"], "E003");
}

#[tokio::test]
async fn delete_then_delete_again() {
    let (_dir, service) = service();
    service.create_rule(create_request("quota", Scope::Global, Action::Deny)).await;
    let response = service.delete_rule("quota", Scope::Global).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["message"], "Rule 'quota' deleted");

    let response = service.delete_rule("quota", Scope::Global).await;
    assert_eq!(response["error"]["code"], "E003");
}

#[tokio::test]
async fn list_scoped_and_unscoped() {
    let (_dir, service) = service();
    service.create_rule(create_request("g1", Scope::Global, Action::Allow)).await;
    service.create_rule(create_request("p1", Scope::Project, Action::Allow)).await;

    let all = service.list_rules(None).await;
    assert_eq!(all["success"], true);
    assert_eq!(all["count"], 2);

    let global_only = service.dispatch("list_rules", json!({"scope": "global"})).await;
    assert_eq!(global_only["count"], 1);
    assert_eq!(global_only["rules"][0]["name"], "g1");
}

#[tokio::test]
async fn get_searches_hierarchy_when_unscoped() {
    let (_dir, service) = service();
    service.create_rule(create_request("shared", Scope::Project, Action::Warn)).await;
    let response = service.dispatch("get_rule", json!({"name": "shared"})).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["rule"]["scope"], "project");

    let response = service.dispatch("get_rule", json!({"name": "absent"})).await;
    assert_eq!(response["error"]["code"], "E003");
}

#[tokio::test]
async fn validate_rule_dsl_reports_issues_without_failing() {
    let (_dir, service) = service();
    let response = service.validate_rule_dsl("user_id in ['a','b']");
    assert_eq!(response, json!({"success": true, "valid": true, "issues": []}));

    let response = service.validate_rule_dsl("(user_id == 'x'");
    assert_eq!(response["valid"], false);
    let issues = response["issues"].as_array().unwrap();
    assert!(issues.iter().any(|i| i.as_str().unwrap().to_lowercase().contains("parentheses")));
}

#[tokio::test]
async fn health_check_reports_backend_and_timestamp() {
    let (_dir, service) = service();
    let response = service.health_check().await;
    assert_eq!(response["success"], true);
    assert_eq!(response["healthy"], true);
    assert_eq!(response["storage_backend"], "file");
    assert!(response["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn evaluate_via_dispatch_end_to_end() {
    let (_dir, service) = service();
    service
        .dispatch(
            "create_rule",
            json!({
                "name": "admin_override",
                "scope": "global",
                "action": "allow",
                "priority": 90,
                "conditions": {"role": "user_role == 'admin'"}
            }),
        )
        .await;
    service
        .dispatch(
            "create_rule",
            json!({
                "name": "default_deny",
                "scope": "global",
                "action": "deny",
                "priority": 10
            }),
        )
        .await;

    let summary = service
        .dispatch(
            "evaluate_rules",
            json!({"context": {"custom_attributes": {"user_role": "admin"}}}),
        )
        .await;
    assert_eq!(summary["final_action"], "allow");
    assert_eq!(summary["applicable_rules_count"], 2);
    assert_eq!(summary["matched_rules_count"], 2);
    assert_eq!(service.metrics().final_action_count(Action::Allow), 1);

    let summary = service
        .evaluate_rules(EvaluateRulesRequest { context: Default::default() })
        .await;
    assert_eq!(summary["final_action"], "deny");
    assert_eq!(service.metrics().final_action_count(Action::Deny), 1);
}

#[tokio::test]
async fn every_operation_routes_through_dispatch() {
    let (_dir, service) = service();
    service.create_rule(create_request("quota", Scope::Global, Action::Deny)).await;

    let response = service
        .dispatch("validate_rule_dsl", json!({"expression": "prompt_length > 10"}))
        .await;
    assert_eq!(response["valid"], true);

    let response = service.dispatch("health_check", json!({})).await;
    assert_eq!(response["healthy"], true);

    let response = service
        .dispatch("delete_rule", json!({"name": "quota", "scope": "global"}))
        .await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn dispatch_rejects_unknown_operations_and_bad_payloads() {
    let (_dir, service) = service();
    let response = service.dispatch("explode", json!({})).await;
    assert_eq!(response["error"]["code"], "E500");
    assert!(response["error"]["message"].as_str().unwrap().contains("explode"));

    let response = service.dispatch("create_rule", json!({"name": "x"})).await;
    assert_eq!(response["error"]["code"], "E500");
    assert!(response["error"]["message"].as_str().unwrap().contains("Malformed"));

    let response = service
        .dispatch("create_rule", json!({"name": "x", "scope": "global", "action": "deny", "bogus": 1}))
        .await;
    assert_eq!(response["error"]["code"], "E500");
}

#[tokio::test]
async fn evaluation_errors_surface_as_error_payloads() {
    let (_dir, service) = service();
    // Rules forming an inheritance cycle make every evaluation fail.
    service
        .dispatch(
            "create_rule",
            json!({"name": "a", "scope": "global", "action": "allow", "inherits_from": ["b"]}),
        )
        .await;
    service
        .dispatch(
            "create_rule",
            json!({"name": "b", "scope": "global", "action": "allow", "inherits_from": ["a"]}),
        )
        .await;

    let response = service.dispatch("evaluate_rules", json!({"context": {}})).await;
    assert_eq!(response["error"]["code"], "E002");
    assert_eq!(response["error"]["retry_allowed"], false);
}

#[tokio::test]
async fn settings_backend_is_file() {
    let (_dir, service) = service();
    // The only built-in backend today; the enum is the extension point.
    let _ = StorageBackend::File;
    let response = service.health_check().await;
    assert_eq!(response["storage_backend"], "file");
}
