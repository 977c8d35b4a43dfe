//! Algebraic laws of the combinators, checked over a generated corpus of
//! atomic comparisons.

use dsl::Evaluator;
use proptest::prelude::*;
use serde_json::json;
use warden_core::model::Context;

fn context() -> Context {
    let mut ctx = Context::default();
    ctx.user_id = Some("user123".into());
    ctx.model_name = Some("gpt-4".into());
    ctx.prompt_length = Some(1500);
    ctx.custom_attributes =
        serde_json::from_value(json!({"tier": "pro", "quota": 20})).unwrap();
    ctx
}

/// Atomic comparisons with a mix of true, false, and unresolved outcomes.
fn atom() -> impl Strategy<Value = String> {
    let fields = prop_oneof![
        Just("user_id"),
        Just("model_name"),
        Just("prompt_length"),
        Just("tier"),
        Just("quota"),
        Just("missing_attr"),
    ];
    let ops = prop_oneof![Just("=="), Just("!=")];
    let literals = prop_oneof![
        Just("'user123'"),
        Just("'gpt-4'"),
        Just("1500"),
        Just("'pro'"),
        Just("20"),
        Just("null"),
    ];
    (fields, ops, literals).prop_map(|(f, op, lit)| format!("{f} {op} {lit}"))
}

proptest! {
    #[test]
    fn not_negates(e in atom()) {
        let eval = Evaluator::new();
        let ctx = context();
        let plain = eval.evaluate(&e, &ctx).unwrap();
        let negated = eval.evaluate(&format!("not ({e})"), &ctx).unwrap();
        prop_assert_eq!(negated, !plain);
    }

    #[test]
    fn and_is_conjunction(a in atom(), b in atom()) {
        let eval = Evaluator::new();
        let ctx = context();
        let left = eval.evaluate(&a, &ctx).unwrap();
        let right = eval.evaluate(&b, &ctx).unwrap();
        let both = eval.evaluate(&format!("{a} and {b}"), &ctx).unwrap();
        prop_assert_eq!(both, left && right);
    }

    #[test]
    fn or_is_disjunction(a in atom(), b in atom()) {
        let eval = Evaluator::new();
        let ctx = context();
        let left = eval.evaluate(&a, &ctx).unwrap();
        let right = eval.evaluate(&b, &ctx).unwrap();
        let either = eval.evaluate(&format!("{a} or {b}"), &ctx).unwrap();
        prop_assert_eq!(either, left || right);
    }

    #[test]
    fn valid_atoms_pass_validation(e in atom()) {
        let issues = Evaluator::new().validate_expression(&e);
        prop_assert!(issues.is_empty(), "unexpected issues: {:?}", issues);
    }
}
