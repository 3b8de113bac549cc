//! Prompt and bounded context construction.

use crate::domain::{Phase, PhaseExecutionRecord, Task};

/// Characters of accepted content kept as the record summary.
pub const SUMMARY_CHARS: usize = 600;

const ELLIPSIS: &str = "…";

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let keep = max_chars.saturating_sub(ELLIPSIS.chars().count());
            let cut = text
                .char_indices()
                .nth(keep)
                .map_or(idx, |(i, _)| i);
            format!("{}{ELLIPSIS}", &text[..cut])
        }
        None => text.to_string(),
    }
}

pub fn summarize(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, SUMMARY_CHARS)
}

/// Prior-phase summaries, newest kept first when the budget runs out, printed
/// in phase order.
pub fn build_context(records: &[PhaseExecutionRecord], budget_chars: usize) -> String {
    let mut accepted: Vec<&PhaseExecutionRecord> = records.iter().filter(|r| r.accepted).collect();
    accepted.sort_by_key(|r| r.phase.index());

    let mut sections: Vec<String> = Vec::new();
    let mut used = 0;
    for record in accepted.iter().rev() {
        let section = format!("## {}\n{}\n", record.phase, record.summary);
        let len = section.chars().count();
        if used + len > budget_chars {
            let remaining = budget_chars.saturating_sub(used);
            if remaining > record.phase.as_str().len() + 8 {
                sections.push(truncate_chars(&section, remaining));
            }
            break;
        }
        used += len;
        sections.push(section);
    }
    sections.reverse();
    sections.concat()
}

pub fn build_prompt(task: &Task, phase: Phase) -> String {
    let mut prompt = format!(
        "Phase: {phase}\nTask {}: {}\nComplexity: {}/10\n",
        task.id, task.title, task.estimated_complexity
    );
    if !task.description.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(task.description.trim());
        prompt.push('\n');
    }
    if let Some(next) = phase.next() {
        prompt.push_str(&format!("\nProduce the {phase} output; {next} follows.\n"));
    } else {
        prompt.push_str(&format!("\nProduce the {phase} output; this is the final phase.\n"));
    }
    prompt
}
