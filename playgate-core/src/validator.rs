//! Playbook schema validation.
//!
//! Playbooks are data, never code. The validator turns an untyped JSON
//! candidate into a typed [`Playbook`] and rejects anything that could smuggle
//! logic in: unknown step types, gaps in the step order, loop/branch keys,
//! executable syntax, nested parameter values, and substitutions outside the
//! allow-list. It has no side effects.

use crate::error::ValidationError;
use crate::substitution;
use crate::types::{Parameters, Playbook, Step, StepType};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

const PLAYBOOK_FIELDS: &[&str] = &[
    "playbook_id",
    "playbook_name",
    "playbook_version",
    "scope",
    "steps",
    "created_by",
    "created_at",
    "playbook_signature",
    "playbook_key_id",
];

const REQUIRED_TEXT_FIELDS: &[&str] = &[
    "playbook_id",
    "playbook_name",
    "playbook_version",
    "scope",
    "created_by",
];

const STEP_FIELDS: &[&str] = &["step_id", "step_type", "step_order", "parameters"];

/// Keys that name control flow or embedded code. Rejected wherever they appear.
const CONTROL_FLOW_KEYS: &[&str] = &[
    "condition",
    "conditions",
    "if",
    "else",
    "when",
    "unless",
    "loop",
    "for_each",
    "foreach",
    "while",
    "repeat",
    "retry",
    "goto",
    "branch",
    "script",
    "code",
    "command",
    "exec",
    "eval",
    "lambda",
];

/// Substrings that indicate executable or template syntax.
const EXECUTABLE_MARKERS: &[&str] = &[
    "$(", "`", "{{", "}}", "{%", "%}", "<script", "eval(", "exec(", "#{",
];

/// Validate an untyped candidate and produce a typed playbook.
///
/// Steps in the returned playbook are sorted by `step_order`.
pub fn validate(candidate: &Value) -> Result<Playbook, ValidationError> {
    let obj = candidate.as_object().ok_or_else(|| ValidationError::Malformed {
        reason: "playbook must be a JSON object".into(),
    })?;

    reject_unknown_fields(obj, PLAYBOOK_FIELDS, "playbook")?;

    for field in REQUIRED_TEXT_FIELDS {
        required_text(obj, field, field)?;
    }

    let created_at = parse_timestamp(obj)?;

    let raw_steps = match obj.get("steps") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField {
                field: "steps".into(),
            });
        }
        Some(Value::Array(steps)) => steps,
        Some(_) => {
            return Err(ValidationError::ForbiddenConstruct {
                field: "steps".into(),
                reason: "steps must be a flat list".into(),
            });
        }
    };

    let mut steps = Vec::with_capacity(raw_steps.len());
    let mut orders = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let (step, order) = parse_step(index, raw)?;
        steps.push(step);
        orders.push(order);
    }
    check_order(&orders)?;

    let mut playbook = Playbook {
        playbook_id: text(obj, "playbook_id"),
        playbook_name: text(obj, "playbook_name"),
        playbook_version: text(obj, "playbook_version"),
        scope: text(obj, "scope"),
        steps: steps
            .into_iter()
            .zip(orders)
            .map(|(mut step, order)| {
                step.step_order = order as u32;
                step
            })
            .collect(),
        created_by: text(obj, "created_by"),
        created_at,
        playbook_signature: optional_text(obj, "playbook_signature")?,
        playbook_key_id: optional_text(obj, "playbook_key_id")?,
    };

    playbook.steps.sort_by_key(|s| s.step_order);
    check(&playbook)?;
    Ok(playbook)
}

/// Re-validate a typed playbook.
///
/// Used by the registry so that a playbook constructed in code (rather than
/// parsed from a document) passes through the same rules.
pub fn check(playbook: &Playbook) -> Result<(), ValidationError> {
    for (field, value) in [
        ("playbook_id", &playbook.playbook_id),
        ("playbook_name", &playbook.playbook_name),
        ("playbook_version", &playbook.playbook_version),
        ("scope", &playbook.scope),
        ("created_by", &playbook.created_by),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: field.to_string(),
            });
        }
        check_literal(field, value)?;
    }

    if playbook.steps.is_empty() {
        return Err(ValidationError::Malformed {
            reason: "playbook must contain at least one step".into(),
        });
    }

    let orders: Vec<i64> = playbook.steps.iter().map(|s| s.step_order as i64).collect();
    check_order(&orders)?;

    for step in &playbook.steps {
        let step_field = format!("steps[{}]", step.step_order);
        if step.step_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: format!("{step_field}.step_id"),
            });
        }
        check_literal(&format!("{step_field}.step_id"), &step.step_id)?;

        for (key, value) in &step.parameters {
            let field = format!("{step_field}.parameters.{key}");
            check_parameter_key(&field, key)?;
            check_parameter_value(&field, value)?;
        }

        for required in step.step_type.required_parameters() {
            let present = step
                .parameters
                .get(*required)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ValidationError::MissingRequiredParameter {
                    step_id: step.step_id.clone(),
                    step_type: step.step_type.to_string(),
                    parameter: required.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Step orders must be exactly `{0, ..., N-1}` with no gaps or duplicates.
pub fn check_order(orders: &[i64]) -> Result<(), ValidationError> {
    let mut sorted = orders.to_vec();
    sorted.sort_unstable();
    let contiguous = sorted
        .iter()
        .enumerate()
        .all(|(expected, actual)| *actual == expected as i64);
    if contiguous {
        Ok(())
    } else {
        Err(ValidationError::NonContiguousOrder {
            expected_len: orders.len(),
            found: sorted,
        })
    }
}

fn parse_step(index: usize, raw: &Value) -> Result<(Step, i64), ValidationError> {
    let field = format!("steps[{index}]");
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::ForbiddenConstruct {
            field: field.clone(),
            reason: "each step must be a flat object".into(),
        })?;

    reject_unknown_fields(obj, STEP_FIELDS, &field)?;

    let step_id = required_text(obj, "step_id", &format!("{field}.step_id"))?;

    let step_type = match obj.get("step_type") {
        Some(Value::String(s)) => s.parse::<StepType>().map_err(|unknown| {
            ValidationError::UnknownStepType {
                step_id: step_id.clone(),
                step_type: unknown,
            }
        })?,
        Some(other) => {
            return Err(ValidationError::UnknownStepType {
                step_id,
                step_type: other.to_string(),
            });
        }
        None => {
            return Err(ValidationError::MissingField {
                field: format!("{field}.step_type"),
            });
        }
    };

    let order = match obj.get("step_order") {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| ValidationError::Malformed {
            reason: format!("{field}.step_order must be an integer"),
        })?,
        Some(_) => {
            return Err(ValidationError::Malformed {
                reason: format!("{field}.step_order must be an integer"),
            });
        }
        None => {
            return Err(ValidationError::MissingField {
                field: format!("{field}.step_order"),
            });
        }
    };

    let parameters = match obj.get("parameters") {
        None | Some(Value::Null) => Parameters::new(),
        Some(Value::Object(map)) => parse_parameters(&field, map)?,
        Some(_) => {
            return Err(ValidationError::ForbiddenConstruct {
                field: format!("{field}.parameters"),
                reason: "parameters must be a flat key/value map".into(),
            });
        }
    };

    Ok((
        Step {
            step_id,
            step_type,
            step_order: 0,
            parameters,
        },
        order,
    ))
}

fn parse_parameters(field: &str, map: &Map<String, Value>) -> Result<Parameters, ValidationError> {
    let mut parameters = Parameters::new();
    for (key, value) in map {
        let value_field = format!("{field}.parameters.{key}");
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => {
                return Err(ValidationError::Malformed {
                    reason: format!("{value_field} must not be null"),
                });
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(ValidationError::ForbiddenConstruct {
                    field: value_field,
                    reason: "nested parameter values are not permitted".into(),
                });
            }
        };
        parameters.insert(key.clone(), text);
    }
    Ok(parameters)
}

fn reject_unknown_fields(
    obj: &Map<String, Value>,
    allowed: &[&str],
    context: &str,
) -> Result<(), ValidationError> {
    for key in obj.keys() {
        if allowed.contains(&key.as_str()) {
            continue;
        }
        let reason = if is_control_flow_key(key) {
            format!("'{key}' introduces control flow or code, which playbooks may not contain")
        } else {
            format!("unknown field '{key}'")
        };
        return Err(ValidationError::ForbiddenConstruct {
            field: format!("{context}.{key}"),
            reason,
        });
    }
    Ok(())
}

fn is_control_flow_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    CONTROL_FLOW_KEYS.contains(&lower.as_str())
}

fn check_parameter_key(field: &str, key: &str) -> Result<(), ValidationError> {
    let well_formed = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !well_formed {
        return Err(ValidationError::ForbiddenConstruct {
            field: field.to_string(),
            reason: "parameter names must be lowercase identifiers".into(),
        });
    }
    if is_control_flow_key(key) {
        return Err(ValidationError::ForbiddenConstruct {
            field: field.to_string(),
            reason: format!("parameter '{key}' introduces control flow or code"),
        });
    }
    Ok(())
}

/// Parameter values may carry allow-listed placeholders, nothing executable.
fn check_parameter_value(field: &str, value: &str) -> Result<(), ValidationError> {
    check_executable_markers(field, value)?;
    substitution::scan(value).map_err(|issue| ValidationError::ForbiddenConstruct {
        field: field.to_string(),
        reason: issue.to_string(),
    })?;
    Ok(())
}

/// Identity and descriptive fields are literal: no placeholders at all.
fn check_literal(field: &str, value: &str) -> Result<(), ValidationError> {
    check_executable_markers(field, value)?;
    if value.contains("${") {
        return Err(ValidationError::ForbiddenConstruct {
            field: field.to_string(),
            reason: "substitution is only permitted in parameter values".into(),
        });
    }
    Ok(())
}

fn check_executable_markers(field: &str, value: &str) -> Result<(), ValidationError> {
    let lower = value.to_ascii_lowercase();
    if let Some(marker) = EXECUTABLE_MARKERS.iter().find(|m| lower.contains(*m)) {
        return Err(ValidationError::ForbiddenConstruct {
            field: field.to_string(),
            reason: format!("executable syntax '{marker}' is not permitted"),
        });
    }
    Ok(())
}

fn required_text(
    obj: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<String, ValidationError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => Err(ValidationError::MissingField {
            field: field.to_string(),
        }),
        Some(_) => Err(ValidationError::Malformed {
            reason: format!("{field} must be a string"),
        }),
    }
}

fn optional_text(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::Malformed {
            reason: format!("{key} must be a string"),
        }),
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_timestamp(obj: &Map<String, Value>) -> Result<DateTime<Utc>, ValidationError> {
    let raw = required_text(obj, "created_at", "created_at")?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ValidationError::Malformed {
            reason: format!("created_at is not an RFC 3339 timestamp: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate() -> Value {
        json!({
            "playbook_id": "pb-contain",
            "playbook_name": "Contain host",
            "playbook_version": "1.0.0",
            "scope": "incident",
            "created_by": "alice",
            "created_at": "2026-01-01T00:00:00Z",
            "steps": [
                {
                    "step_id": "notify",
                    "step_type": "notify_human",
                    "step_order": 1,
                    "parameters": {
                        "notification_target": "soc@example.com",
                        "notification_message": "Host ${subject_id} isolated"
                    }
                },
                {
                    "step_id": "isolate",
                    "step_type": "isolate_host",
                    "step_order": 0,
                    "parameters": { "host_id": "${subject_id}" }
                }
            ]
        })
    }

    #[test]
    fn test_valid_playbook_sorted_by_order() {
        let playbook = validate(&candidate()).unwrap();
        assert_eq!(playbook.steps.len(), 2);
        assert_eq!(playbook.steps[0].step_id, "isolate");
        assert_eq!(playbook.steps[0].step_order, 0);
        assert_eq!(playbook.steps[1].step_type, StepType::NotifyHuman);
        assert!(!playbook.is_signed());
    }

    #[test]
    fn test_unknown_step_type() {
        let mut c = candidate();
        c["steps"][0]["step_type"] = json!("run_shell");
        let err = validate(&c).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStepType { ref step_type, .. } if step_type == "run_shell"));
    }

    #[test]
    fn test_gap_in_order() {
        let mut c = candidate();
        c["steps"][0]["step_order"] = json!(2);
        let err = validate(&c).unwrap_err();
        assert!(matches!(err, ValidationError::NonContiguousOrder { .. }));
    }

    #[test]
    fn test_duplicate_order() {
        let mut c = candidate();
        c["steps"][0]["step_order"] = json!(0);
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::NonContiguousOrder { .. }
        ));
    }

    #[test]
    fn test_negative_order() {
        let mut c = candidate();
        c["steps"][1]["step_order"] = json!(-1);
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::NonContiguousOrder { .. }
        ));
    }

    #[test]
    fn test_condition_key_is_forbidden() {
        let mut c = candidate();
        c["steps"][0]["condition"] = json!("subject_id == 'x'");
        let err = validate(&c).unwrap_err();
        match err {
            ValidationError::ForbiddenConstruct { field, reason } => {
                assert_eq!(field, "steps[0].condition");
                assert!(reason.contains("control flow"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_top_level_loop_is_forbidden() {
        let mut c = candidate();
        c["loop"] = json!({"times": 3});
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::ForbiddenConstruct { .. }
        ));
    }

    #[test]
    fn test_substitution_outside_allow_list() {
        let mut c = candidate();
        c["steps"][1]["parameters"]["host_id"] = json!("${env.HOSTNAME}");
        let err = validate(&c).unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenConstruct { .. }));
    }

    #[test]
    fn test_executable_syntax_rejected() {
        for payload in ["$(rm -rf /)", "`id`", "{{ inputs.host }}", "<script>x</script>"] {
            let mut c = candidate();
            c["steps"][0]["parameters"]["notification_message"] = json!(payload);
            assert!(
                matches!(validate(&c).unwrap_err(), ValidationError::ForbiddenConstruct { .. }),
                "payload {payload} should be rejected"
            );
        }
    }

    #[test]
    fn test_placeholder_in_name_rejected() {
        let mut c = candidate();
        c["playbook_name"] = json!("Contain ${subject_id}");
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::ForbiddenConstruct { .. }
        ));
    }

    #[test]
    fn test_nested_parameter_rejected() {
        let mut c = candidate();
        c["steps"][1]["parameters"]["hosts"] = json!(["a", "b"]);
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::ForbiddenConstruct { .. }
        ));
    }

    #[test]
    fn test_scalar_parameters_normalized() {
        let mut c = candidate();
        c["steps"][1]["parameters"]["grace_seconds"] = json!(30);
        let playbook = validate(&c).unwrap();
        assert_eq!(playbook.steps[0].parameters["grace_seconds"], "30");
    }

    #[test]
    fn test_missing_required_parameter() {
        let mut c = candidate();
        c["steps"][0]["parameters"]
            .as_object_mut()
            .unwrap()
            .remove("notification_target");
        let err = validate(&c).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequiredParameter {
                step_id: "notify".into(),
                step_type: "notify_human".into(),
                parameter: "notification_target".into(),
            }
        );
    }

    #[test]
    fn test_missing_field_and_empty_steps() {
        let mut c = candidate();
        c.as_object_mut().unwrap().remove("scope");
        assert_eq!(
            validate(&c).unwrap_err(),
            ValidationError::MissingField {
                field: "scope".into()
            }
        );

        let mut c = candidate();
        c["steps"] = json!([]);
        assert!(matches!(
            validate(&c).unwrap_err(),
            ValidationError::Malformed { .. }
        ));
    }

    #[test]
    fn test_check_order_helper() {
        assert!(check_order(&[2, 0, 1]).is_ok());
        assert!(check_order(&[]).is_ok());
        assert!(check_order(&[1, 2]).is_err());
        assert!(check_order(&[0, 0]).is_err());
    }
}
