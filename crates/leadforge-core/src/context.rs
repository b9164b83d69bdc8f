// Context assembly for step execution
//
// A step's provider input is built from the labeled form submission plus the
// outputs of its dependency steps, rendered as fenced blocks. Selection is
// driven by `depends_on` (0-indexed); when unset, every strictly-earlier step
// is a dependency.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::records::{ExecutionStep, ExecutionStepKind, Form};

/// Render submission data as `<label>: <value>` lines.
///
/// Labels come from the form's field map; fields the form does not know are
/// rendered by id. This is the step-0 output.
pub fn format_submission(data: &BTreeMap<String, Value>, form: Option<&Form>) -> String {
    let labels = form.map(Form::field_label_map).unwrap_or_default();
    data.iter()
        .map(|(key, value)| {
            let label = labels.get(key.as_str()).copied().unwrap_or(key.as_str());
            format!("{label}: {}", render_value(value))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Resolved dependency step orders (1-based) for a step at `step_index`.
///
/// `depends_on` holds 0-based indices of earlier steps; absent means all
/// strictly-earlier steps.
pub fn dependency_orders(step_index: usize, depends_on: Option<&[usize]>) -> Vec<u32> {
    match depends_on {
        Some(indices) => {
            let mut orders: Vec<u32> = indices
                .iter()
                .filter(|&&i| i < step_index)
                .map(|&i| (i + 1) as u32)
                .collect();
            orders.sort_unstable();
            orders.dedup();
            orders
        }
        None => (1..=step_index as u32).collect(),
    }
}

/// Build the previous-context block for a step.
///
/// The form submission always leads; each dependency step contributes a
/// `=== Step N: <name> ===` block with its output and, when present, a
/// `Generated Images:` list.
pub fn build_previous_context(
    initial_context: &str,
    execution_steps: &[ExecutionStep],
    dependency_orders: &[u32],
) -> String {
    let mut blocks = vec![format!("=== Form Submission ===\n{initial_context}")];

    let mut steps: Vec<&ExecutionStep> = execution_steps
        .iter()
        .filter(|s| {
            matches!(
                s.step_type,
                ExecutionStepKind::AiGeneration | ExecutionStepKind::Webhook
            ) && dependency_orders.contains(&s.step_order)
        })
        .collect();
    steps.sort_by_key(|s| s.step_order);

    for step in steps {
        let mut block = format!(
            "\n=== Step {}: {} ===\n{}",
            step.step_order,
            step.step_name,
            step.output_text()
        );
        let urls: Vec<&str> = step.image_urls().collect();
        if !urls.is_empty() {
            block.push_str("\n\nGenerated Images:\n");
            block.push_str(
                &urls
                    .iter()
                    .map(|url| format!("- {url}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        blocks.push(block);
    }

    blocks.join("\n\n")
}

/// Raw text input for the current step: the labeled submission on step 0,
/// empty afterwards (prior content travels in the previous context).
pub fn current_step_context(step_index: usize, initial_context: &str) -> String {
    if step_index == 0 {
        initial_context.to_string()
    } else {
        String::new()
    }
}

/// Image URLs produced by steps strictly earlier than `current_order`,
/// nulls and empties dropped. Feeds multimodal input for image steps.
pub fn collect_previous_image_urls(
    execution_steps: &[ExecutionStep],
    current_order: u32,
) -> Vec<String> {
    let mut steps: Vec<&ExecutionStep> = execution_steps
        .iter()
        .filter(|s| s.step_type == ExecutionStepKind::AiGeneration && s.step_order < current_order)
        .collect();
    steps.sort_by_key(|s| s.step_order);
    steps
        .iter()
        .flat_map(|s| s.image_urls())
        .map(str::to_string)
        .collect()
}

/// Combine current context with previous context into the provider input.
/// An empty previous context degenerates to exactly `context`.
pub fn build_input_text(context: &str, previous_context: &str) -> String {
    if previous_context.is_empty() {
        context.to_string()
    } else {
        format!("{previous_context}\n\n--- Current Step Context ---\n{context}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ai_step(order: u32, name: &str, output: &str, images: Vec<&str>) -> ExecutionStep {
        ExecutionStep {
            step_name: name.to_string(),
            step_order: order,
            step_type: ExecutionStepKind::AiGeneration,
            model: None,
            input: Value::Null,
            output: json!(output),
            image_urls: images.into_iter().map(str::to_string).collect(),
            usage_info: None,
            timestamp: Utc::now(),
            duration_ms: None,
            artifact_id: None,
            error: None,
            success: None,
        }
    }

    #[test]
    fn submission_uses_form_labels_and_falls_back_to_ids() {
        let form: Form = serde_json::from_value(json!({
            "form_id": "f1",
            "form_fields_schema": {"fields": [{"field_id": "name", "label": "Your Name"}]}
        }))
        .unwrap();
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), json!("Ada"));
        data.insert("topic".to_string(), json!("dragons"));

        let rendered = format_submission(&data, Some(&form));
        assert_eq!(rendered, "Your Name: Ada\ntopic: dragons");
    }

    #[test]
    fn previous_context_contains_dependency_blocks() {
        let steps = vec![ai_step(1, "Research", "MARKET: demand 7/10", vec![])];
        let ctx = build_previous_context("name: Ada", &steps, &dependency_orders(1, Some(&[0])));
        assert!(ctx.contains("=== Form Submission ===\nname: Ada"));
        assert!(ctx.contains("=== Step 1: Research ===\nMARKET: demand 7/10"));
    }

    #[test]
    fn previous_context_excludes_non_dependencies() {
        let steps = vec![
            ai_step(1, "A", "out-a", vec![]),
            ai_step(2, "B", "out-b", vec![]),
        ];
        let ctx = build_previous_context("x: y", &steps, &dependency_orders(2, Some(&[1])));
        assert!(!ctx.contains("=== Step 1"));
        assert!(ctx.contains("=== Step 2: B ===\nout-b"));
    }

    #[test]
    fn implicit_dependencies_are_all_earlier_steps() {
        assert_eq!(dependency_orders(3, None), vec![1, 2, 3]);
        assert_eq!(dependency_orders(0, None), Vec::<u32>::new());
        // Indices at or past the current step are ignored
        assert_eq!(dependency_orders(2, Some(&[0, 2, 5])), vec![1]);
    }

    #[test]
    fn generated_images_render_as_bullets() {
        let steps = vec![ai_step(1, "Art", "two images", vec!["https://a/1.png", ""])];
        let ctx = build_previous_context("", &steps, &[1]);
        assert!(ctx.contains("Generated Images:\n- https://a/1.png"));
        // Empty URLs are dropped entirely
        assert_eq!(ctx.matches("- ").count(), 1);
    }

    #[test]
    fn collect_image_urls_respects_order_bound() {
        let steps = vec![
            ai_step(1, "A", "", vec!["https://a/1.png"]),
            ai_step(2, "B", "", vec!["https://a/2.png"]),
        ];
        assert_eq!(collect_previous_image_urls(&steps, 2), vec!["https://a/1.png"]);
        assert_eq!(collect_previous_image_urls(&steps, 3).len(), 2);
    }

    #[test]
    fn input_text_degenerates_without_previous_context() {
        assert_eq!(build_input_text("ctx", ""), "ctx");
        let combined = build_input_text("ctx", "prev");
        assert_eq!(combined, "prev\n\n--- Current Step Context ---\nctx");
    }
}
