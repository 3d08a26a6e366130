use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ed25519_dalek::SigningKey;
use playgate_core::signing;
use playgate_core::substitution::{self, SubstitutionContext};
use playgate_core::validator;
use serde_json::{Value, json};

fn document(steps: usize) -> Value {
    let steps: Vec<Value> = (0..steps)
        .map(|i| {
            json!({
                "step_id": format!("notify-{i}"),
                "step_type": "notify_human",
                "step_order": i,
                "parameters": {
                    "notification_target": "soc@example.com",
                    "notification_message": "${subject_id} contained by ${executed_by}"
                }
            })
        })
        .collect();
    json!({
        "playbook_id": "pb-bench",
        "playbook_name": "Benchmark playbook",
        "playbook_version": "1.0.0",
        "scope": "incident",
        "created_by": "alice",
        "created_at": "2026-03-01T09:00:00Z",
        "steps": steps,
    })
}

fn bench_validator(c: &mut Criterion) {
    let small = document(3);
    let large = document(100);

    c.bench_function("validate_3_steps", |b| {
        b.iter(|| validator::validate(black_box(&small)))
    });

    c.bench_function("validate_100_steps", |b| {
        b.iter(|| validator::validate(black_box(&large)))
    });
}

fn bench_signing(c: &mut Criterion) {
    let key = SigningKey::from_bytes(&[9; 32]);
    let verifying = key.verifying_key();
    let playbook = validator::validate(&document(20)).unwrap();
    let signature = signing::sign(&playbook, &key);

    c.bench_function("canonicalize_20_steps", |b| {
        b.iter(|| signing::canonical_bytes(black_box(&playbook)))
    });

    c.bench_function("sign_20_steps", |b| {
        b.iter(|| signing::sign(black_box(&playbook), &key))
    });

    c.bench_function("verify_20_steps", |b| {
        b.iter(|| signing::verify(black_box(&playbook), &signature, &verifying))
    });

    c.bench_function("content_hash_20_steps", |b| {
        b.iter(|| signing::content_hash(black_box(&playbook)))
    });
}

fn bench_substitution(c: &mut Criterion) {
    let ctx = SubstitutionContext {
        subject_id: "host-42".into(),
        playbook_id: "pb-bench".into(),
        playbook_version: "1.0.0".into(),
        executed_by: "alice".into(),
    };
    let template = "Host ${subject_id} isolated by ${executed_by} via ${playbook_id}@${playbook_version}";

    c.bench_function("resolve_four_placeholders", |b| {
        b.iter(|| substitution::resolve(black_box(template), &ctx))
    });
}

criterion_group!(benches, bench_validator, bench_signing, bench_substitution);
criterion_main!(benches);
