//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use chrono::{TimeZone, Utc};
use ed25519_dalek::SigningKey;
use playgate_core::rollback::plan_reversal;
use playgate_core::signing;
use playgate_core::substitution::{self, SubstitutionContext, SubstitutionKey};
use playgate_core::types::{
    ExecutionRecord, ExecutionStatus, Playbook, Step, StepOutcome, StepStatus, StepType,
};
use playgate_core::validator;
use serde_json::{Value, json};
use uuid::Uuid;

fn arb_step_type() -> impl Strategy<Value = StepType> {
    prop::sample::select(StepType::ALL.to_vec())
}

fn required_params(step_type: StepType, value: &str) -> serde_json::Map<String, Value> {
    step_type
        .required_parameters()
        .iter()
        .map(|key| ((*key).to_string(), Value::String(value.to_string())))
        .collect()
}

fn arb_playbook() -> impl Strategy<Value = Playbook> {
    (
        "[a-z][a-z0-9-]{0,15}",
        "[A-Za-z ]{1,30}",
        prop::collection::vec((arb_step_type(), "[a-z0-9.]{1,12}"), 1..8),
    )
        .prop_map(|(id, name, steps)| Playbook {
            playbook_id: id,
            playbook_name: name,
            playbook_version: "1.0.0".into(),
            scope: "incident".into(),
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(i, (step_type, value))| Step {
                    step_id: format!("step-{i}"),
                    step_type,
                    step_order: i as u32,
                    parameters: step_type
                        .required_parameters()
                        .iter()
                        .map(|key| ((*key).to_string(), value.clone()))
                        .collect(),
                })
                .collect(),
            created_by: "alice".into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            playbook_signature: None,
            playbook_key_id: None,
        })
}

fn arb_step_status() -> impl Strategy<Value = StepStatus> {
    prop::sample::select(vec![
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Skipped,
    ])
}

fn ctx() -> SubstitutionContext {
    SubstitutionContext {
        subject_id: "host-42".into(),
        playbook_id: "pb-contain".into(),
        playbook_version: "1.0.0".into(),
        executed_by: "alice".into(),
    }
}

// --- Signature properties ---

proptest! {
    #[test]
    fn sign_then_verify_succeeds(playbook in arb_playbook(), seed in any::<[u8; 32]>()) {
        let key = SigningKey::from_bytes(&seed);
        let signature = signing::sign(&playbook, &key);
        prop_assert!(signing::verify(&playbook, &signature, &key.verifying_key()));
    }

    #[test]
    fn any_single_bit_flip_breaks_the_signature(
        playbook in arb_playbook(),
        bit in any::<prop::sample::Index>(),
    ) {
        let key = SigningKey::from_bytes(&[7; 32]);
        let canonical = signing::canonical_bytes(&playbook);
        let signature = signing::sign_canonical(&canonical, &key);

        let mut tampered = canonical.clone();
        let bit = bit.index(tampered.len() * 8);
        tampered[bit / 8] ^= 1 << (bit % 8);

        prop_assert!(!signing::verify_canonical(&tampered, &signature, &key.verifying_key()));
    }

    #[test]
    fn signature_fields_do_not_change_the_content_hash(playbook in arb_playbook()) {
        let key = SigningKey::from_bytes(&[3; 32]);
        let mut sealed = playbook.clone();
        sealed.playbook_signature = Some(signing::sign(&playbook, &key));
        sealed.playbook_key_id = Some("ops".into());
        prop_assert_eq!(signing::content_hash(&playbook), signing::content_hash(&sealed));
    }
}

// --- Validator properties ---

proptest! {
    #[test]
    fn validated_orders_are_contiguous_from_zero(
        steps in prop::collection::vec(arb_step_type(), 1..10)
            .prop_map(|types| types.into_iter().enumerate().collect::<Vec<_>>())
            .prop_shuffle(),
    ) {
        let raw: Vec<Value> = steps
            .iter()
            .map(|(order, step_type)| json!({
                "step_id": format!("step-{order}"),
                "step_type": step_type.as_str(),
                "step_order": order,
                "parameters": required_params(*step_type, "x"),
            }))
            .collect();
        let document = json!({
            "playbook_id": "pb-prop",
            "playbook_name": "Property playbook",
            "playbook_version": "1.0.0",
            "scope": "incident",
            "created_by": "alice",
            "created_at": "2026-03-01T09:00:00Z",
            "steps": raw,
        });

        let playbook = validator::validate(&document).unwrap();
        let orders: Vec<u32> = playbook.steps.iter().map(|s| s.step_order).collect();
        let expected: Vec<u32> = (0..steps.len() as u32).collect();
        prop_assert_eq!(orders, expected);
    }

    #[test]
    fn orders_with_a_gap_are_rejected(len in 2usize..10, gap in any::<prop::sample::Index>()) {
        let mut orders: Vec<i64> = (0..len as i64).collect();
        let at = gap.index(len);
        orders[at] += len as i64;
        prop_assert!(validator::check_order(&orders).is_err());
    }
}

// --- Rollback planning properties ---

proptest! {
    #[test]
    fn reversal_plan_is_completed_steps_reversed(
        steps in prop::collection::vec((arb_step_type(), arb_step_status()), 0..10),
    ) {
        let record = ExecutionRecord {
            execution_id: Uuid::nil(),
            playbook_id: "pb".into(),
            playbook_version: "1.0.0".into(),
            playbook_signature: "sig".into(),
            scope: "incident".into(),
            subject_id: "host-42".into(),
            authority_action_id: "act-1".into(),
            explanation_bundle_id: "bundle-1".into(),
            executed_by: "alice".into(),
            step_outcomes: steps
                .iter()
                .enumerate()
                .map(|(i, (step_type, status))| StepOutcome {
                    step_id: format!("step-{i}"),
                    step_type: *step_type,
                    step_order: i as u32,
                    status: *status,
                    resolved_parameters: Default::default(),
                    output: Default::default(),
                    detail: None,
                })
                .collect(),
            status: ExecutionStatus::Failed,
            executed_at: Utc::now(),
        };

        let planned: Vec<String> = plan_reversal(&record).into_iter().map(|p| p.step_id).collect();
        let mut expected: Vec<String> = record.completed_steps().map(|s| s.step_id.clone()).collect();
        expected.reverse();
        prop_assert_eq!(planned, expected);
    }
}

// --- Substitution properties ---

proptest! {
    #[test]
    fn resolve_is_total(template in ".{0,64}") {
        let _ = substitution::resolve(&template, &ctx());
    }

    #[test]
    fn text_without_placeholders_is_unchanged(template in "[^$]{0,64}") {
        prop_assert_eq!(substitution::resolve(&template, &ctx()), template);
    }

    #[test]
    fn allow_listed_placeholders_resolve_to_context_values(
        parts in prop::collection::vec(
            ("[a-z ]{0,6}", prop::sample::select(SubstitutionKey::ALL.to_vec())),
            0..6,
        ),
    ) {
        let ctx = ctx();
        let mut template = String::new();
        let mut expected = String::new();
        for (text, key) in &parts {
            template.push_str(text);
            template.push_str(&format!("${{{}}}", key.name()));
            expected.push_str(text);
            expected.push_str(ctx.value(*key));
        }
        prop_assert!(substitution::scan(&template).is_ok());
        prop_assert_eq!(substitution::resolve(&template, &ctx), expected);
    }
}
