use std::fmt::Write as _;

use autofix_core::Issue;

const NOT_AVAILABLE: &str = "N/A";

const RESPONSE_CONTRACT: &str = r#"Respond in JSON format:
{
    "analysis": "detailed analysis of the root cause",
    "fix_type": "model_config|prompt_adjustment|system_fix|model_reinstall|other",
    "fix_commands": ["array", "of", "bash", "commands"],
    "verification_steps": ["array", "of", "verification", "steps"],
    "confidence": 0.95,
    "expected_outcome": "what should happen after applying the fix"
}"#;

/// Analysis request sent to every backend: historical digest, issue fields and
/// the JSON shape the reply must contain.
#[must_use]
pub fn render_analysis_prompt(issue: &Issue, historical_context: &str) -> String {
    let field = |value: Option<&str>| {
        value
            .filter(|v| !v.is_empty())
            .unwrap_or(NOT_AVAILABLE)
            .to_string()
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are an AI model testing expert with access to historical data about previous fixes.\n"
    );
    let _ = writeln!(out, "{historical_context}");
    let _ = writeln!(out, "Current Issue Details:");
    let _ = writeln!(out, "- Model: {}", issue.model);
    let _ = writeln!(out, "- Issue Type: {}", issue.issue_type);
    let _ = writeln!(out, "- Description: {}", field(Some(issue.description.as_str())));
    let _ = writeln!(out, "- Error Output: {}", field(issue.error_output.as_deref()));
    let _ = writeln!(out, "- Test Prompt: {}", field(issue.test_prompt.as_deref()));
    let _ = writeln!(out, "- Expected Pattern: {}", field(issue.expected_pattern.as_deref()));
    let _ = writeln!(out, "- Actual Response: {}", field(issue.actual_response.as_deref()));
    if !issue.environment.is_empty() {
        let environment = serde_json::to_string(&issue.environment).unwrap_or_default();
        let _ = writeln!(out, "- Environment: {environment}");
    }
    let _ = writeln!(
        out,
        "\nContext:\n\
         - Models under test are served locally through Ollama\n\
         - Tests send a prompt and match the reply against an expected pattern\n\
         - Prefer fixes that worked before for this model or issue type\n"
    );
    let _ = writeln!(
        out,
        "Provide a root cause analysis, the bash commands that implement the fix \
         (if any), and how to verify it.\n"
    );
    let _ = writeln!(out, "{RESPONSE_CONTRACT}\n");
    let _ = write!(out, "Respond only with the JSON, no other text.");
    out
}
