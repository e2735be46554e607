//! Bounded historical digest injected into analysis requests.

use std::fmt::Write as _;

use crate::{truncate_chars, FixAttempt, Issue, KnowledgeBase, ModelInsights, SimilarIssues};

const EXACT_MATCH_LIMIT: usize = 2;
const MODEL_MATCH_LIMIT: usize = 2;
const STRATEGY_LIMIT: usize = 3;
const EXACT_ANALYSIS_CHARS: usize = 100;
const MODEL_DESCRIPTION_CHARS: usize = 80;

pub const CONTEXT_HEADER: &str = "=== HISTORICAL CONTEXT FROM AI MEMORY ===";
pub const CONTEXT_FOOTER: &str = "=== END HISTORICAL CONTEXT ===";

/// Everything the digest may draw on. Missing pieces drop their section.
#[derive(Debug, Clone, Copy)]
pub struct HistoricalContext<'a> {
    pub issue: &'a Issue,
    pub insights: Option<&'a ModelInsights>,
    pub similar: Option<&'a SimilarIssues>,
    pub knowledge: Option<&'a KnowledgeBase>,
}

fn outcome_marker(attempt: &FixAttempt) -> &'static str {
    if attempt.fix_applied {
        "[SUCCESS]"
    } else {
        "[FAILED]"
    }
}

#[must_use]
pub fn render_historical_context(input: &HistoricalContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{CONTEXT_HEADER}");

    if let Some(insights) = input
        .insights
        .filter(|insights| insights.characteristics.total_tests > 0)
    {
        let stats = &insights.characteristics;
        let _ = writeln!(out, "\nModel history for {}:", input.issue.model);
        let _ = writeln!(out, "- Total previous tests: {}", stats.total_tests);
        let _ = writeln!(out, "- Success rate: {:.1}%", stats.success_rate * 100.0);
        if !stats.common_issues.is_empty() {
            let _ = writeln!(out, "- Common issues: {}", stats.common_issues.join(", "));
        }
        if !stats.effective_fixes.is_empty() {
            let _ = writeln!(out, "- Effective fixes: {}", stats.effective_fixes.join(", "));
        }
        if let Some(notes) = stats.performance_notes.as_deref().filter(|notes| !notes.is_empty()) {
            let _ = writeln!(out, "- Notes: {notes}");
        }
    }

    if let Some(similar) = input.similar {
        if !similar.exact_matches.is_empty() {
            let _ = writeln!(out, "\nExact matches found ({}):", similar.exact_matches.len());
            for attempt in similar.exact_matches.iter().take(EXACT_MATCH_LIMIT) {
                let _ = writeln!(
                    out,
                    "- {}: {}...",
                    outcome_marker(attempt),
                    truncate_chars(&attempt.analysis, EXACT_ANALYSIS_CHARS)
                );
                if attempt.fix_applied {
                    match attempt.commands.first() {
                        Some(command) => {
                            let _ = writeln!(out, "  Successful fix: {command}");
                        }
                        None => {
                            let _ = writeln!(out, "  Successful fix: No commands recorded");
                        }
                    }
                }
            }
        }

        if !similar.model_matches.is_empty() {
            let _ = writeln!(
                out,
                "\nSame model, same issue type ({}):",
                similar.model_matches.len()
            );
            for attempt in similar.model_matches.iter().take(MODEL_MATCH_LIMIT) {
                let _ = writeln!(
                    out,
                    "- {}: {}...",
                    outcome_marker(attempt),
                    truncate_chars(&attempt.description, MODEL_DESCRIPTION_CHARS)
                );
            }
        }
    }

    if let Some(knowledge) = input.knowledge {
        let strategies = knowledge.strategies_for(&input.issue.issue_type);
        if !strategies.is_empty() {
            let _ = writeln!(
                out,
                "\nKnown successful strategies for {}:",
                input.issue.issue_type
            );
            for strategy in strategies.iter().take(STRATEGY_LIMIT) {
                let _ = writeln!(out, "- {strategy}");
            }
        }
    }

    let _ = writeln!(out, "\n{CONTEXT_FOOTER}");
    out
}
