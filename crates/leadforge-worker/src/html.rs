// HTML assembly
//
// When a workflow references a published template and the last step output
// is not already HTML, one model call turns the accumulated context into a
// complete HTML document styled after the template.

use std::collections::BTreeMap;

use serde_json::Value;

/// System instructions for the HTML-assembly call
pub fn build_html_instructions(template_style: Option<&str>) -> String {
    let mut instructions = String::from(
        "You are an expert web developer and content designer.\n\n\
         Your task is to create a beautifully styled HTML document based on research content and a template design.\n\n\
         Requirements:\n\
         1. Use the research content provided as the basis for the document\n\
         2. Style the HTML to match the design and structure of the provided template\n\
         3. Maintain all research content and facts accurately\n\
         4. Apply the template's styling, layout, and visual design\n\
         5. Ensure semantic HTML structure\n\
         6. Include proper headings, sections, and formatting\n\
         7. Make it visually appealing and professional\n\
         8. DO NOT use placeholder syntax like {PLACEHOLDER_NAME} - generate complete, personalized content directly\n\
         9. Personalize all content based on the research and submission data provided",
    );
    if let Some(style) = template_style {
        if !style.is_empty() {
            instructions.push_str("\n\nTemplate Style Notes: ");
            instructions.push_str(style);
        }
    }
    instructions.push_str(
        "\n\nReturn ONLY the complete HTML document, with no additional commentary or markdown code blocks.",
    );
    instructions
}

/// User message: research content + submission data + the template to mimic
pub fn build_html_user_message(
    content: &str,
    template_html: &str,
    submission_data: &BTreeMap<String, Value>,
) -> String {
    let mut submission_context = String::new();
    if !submission_data.is_empty() {
        submission_context.push_str("\n\nAdditional Context:\n");
        submission_context.push_str(
            &submission_data
                .iter()
                .map(|(key, value)| match value {
                    Value::String(s) => format!("- {key}: {s}"),
                    other => format!("- {key}: {other}"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    format!(
        "Given this research content:\n\n{content}{submission_context}\n\n\
         And this template to style it after:\n\n{template_html}\n\n\
         Generate a complete HTML document that:\n\
         - Contains all the research content\n\
         - Matches the template's design, layout, and styling\n\
         - Is ready to use as a final document"
    )
}

/// Strip markdown code fences that models wrap HTML in
pub fn clean_html_markdown(html: &str) -> String {
    let trimmed = html.trim();
    if let Some(rest) = trimmed.strip_prefix("```html") {
        return rest.trim_start().trim_end_matches("```").trim().to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        let mut inner = rest;
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        let inner = inner.trim_start();
        let inner = inner.strip_prefix("html").unwrap_or(inner);
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// The last-step heuristic: trimmed output starting with `<` is used as the
/// final HTML verbatim.
pub fn looks_like_html(output: &str) -> bool {
    output.trim_start().starts_with('<')
}
