//! Input resolution for a step about to run.

use serde_json::{Map, Value};

use playbook_types::{PlaybookRun, StepDefinition, StepExecution, StepStatus};

/// Merge, later layers winning on key clashes:
///
/// 1. the run's inputs
/// 2. outputs of completed steps, each under `step_<sequence>`
/// 3. the definition's `input_overrides`
/// 4. `extra`, supplied by the caller for this dispatch
pub fn resolve(
    run: &PlaybookRun,
    run_steps: &[StepExecution],
    definition: &StepDefinition,
    extra: Option<&Value>,
) -> Value {
    let mut merged = Map::new();
    merge_object(&mut merged, &run.inputs);

    for step in run_steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed && s.sequence < definition.sequence)
    {
        if let Some(ref outputs) = step.outputs {
            merged.insert(step.output_key(), outputs.clone());
        }
    }

    for (key, value) in &definition.input_overrides {
        merged.insert(key.clone(), value.clone());
    }
    if let Some(extra) = extra {
        merge_object(&mut merged, extra);
    }
    Value::Object(merged)
}

/// Shallow merge of an object into `target`; other values are ignored.
fn merge_object(target: &mut Map<String, Value>, source: &Value) {
    if let Value::Object(map) = source {
        for (key, value) in map {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Outputs of all completed steps merged in sequence order.
pub fn merged_outputs(run_steps: &[StepExecution]) -> Value {
    let mut ordered: Vec<&StepExecution> = run_steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .collect();
    ordered.sort_by_key(|s| s.sequence);
    let mut merged = Map::new();
    for step in ordered {
        if let Some(ref outputs) = step.outputs {
            merge_object(&mut merged, outputs);
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_types::WorkerType;
    use serde_json::json;

    fn completed(sequence: u32, outputs: Value) -> StepExecution {
        serde_json::from_value(json!({
            "id": format!("s{sequence}"),
            "sequence": sequence,
            "worker_type": "system",
            "status": "completed",
            "outputs": outputs,
        }))
        .unwrap()
    }

    #[test]
    fn test_layers_merge_in_order() {
        let run: PlaybookRun = serde_json::from_value(json!({
            "inputs": {"customer": "acme", "region": "eu"}
        }))
        .unwrap();
        let mut definition = StepDefinition::new("review", 3, WorkerType::Human);
        definition
            .input_overrides
            .insert("region".into(), json!("us"));
        let steps = vec![
            completed(1, json!({"score": 3})),
            completed(2, json!({"tier": "gold"})),
        ];

        let inputs = resolve(&run, &steps, &definition, Some(&json!({"note": "rush"})));
        assert_eq!(inputs["customer"], json!("acme"));
        assert_eq!(inputs["region"], json!("us"));
        assert_eq!(inputs["step_1"], json!({"score": 3}));
        assert_eq!(inputs["step_2"], json!({"tier": "gold"}));
        assert_eq!(inputs["note"], json!("rush"));
    }

    #[test]
    fn test_later_steps_are_not_visible() {
        let run: PlaybookRun = serde_json::from_value(json!({})).unwrap();
        let definition = StepDefinition::new("first", 1, WorkerType::System);
        let steps = vec![completed(2, json!({"x": 1}))];
        let inputs = resolve(&run, &steps, &definition, None);
        assert_eq!(inputs, json!({}));
    }

    #[test]
    fn test_merged_outputs_later_step_wins() {
        let steps = vec![
            completed(2, json!({"decision": "approve"})),
            completed(1, json!({"decision": "pending", "score": 9})),
        ];
        assert_eq!(
            merged_outputs(&steps),
            json!({"decision": "approve", "score": 9})
        );
    }
}
