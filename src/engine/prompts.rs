//! Patient-facing reply text.

use std::collections::BTreeSet;

use super::machine::Rejection;
use crate::instruments::{Assessment, InstrumentDefinition, InstrumentRegistry};

/// "0, 1, 2 or 3", or "0 to 10" for long contiguous ranges.
pub fn format_domain(domain: &BTreeSet<u32>) -> String {
    let values: Vec<u32> = domain.iter().copied().collect();
    match values.as_slice() {
        [] => String::new(),
        [only] => only.to_string(),
        [first, .., last]
            if values.len() > 4 && (last - first) as usize + 1 == values.len() =>
        {
            format!("{first} to {last}")
        }
        [init @ .., last] => {
            let head: Vec<String> = init.iter().map(u32::to_string).collect();
            format!("{} or {last}", head.join(", "))
        }
    }
}

fn scale_legend(def: &InstrumentDefinition) -> Option<String> {
    if def.scale.is_empty() {
        return None;
    }
    let parts: Vec<String> = def
        .scale
        .iter()
        .map(|o| format!("{} = {}", o.value, o.label))
        .collect();
    Some(parts.join(", "))
}

fn domain_phrase(def: &InstrumentDefinition) -> String {
    match def.common_domain() {
        Some(domain) => format!("each one of {}", format_domain(domain)),
        None => "each from the options listed for that question".to_string(),
    }
}

/// Example bulk reply cycling through the answer domain.
fn bulk_example(def: &InstrumentDefinition) -> String {
    def.prompts
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let values: Vec<&u32> = p.answer_domain.iter().collect();
            values.get(i % values.len().max(1)).map(|v| v.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full questionnaire, sent when bulk intake starts.
pub fn full_instructions(def: &InstrumentDefinition) -> String {
    let mut out = format!("{}\n", def.name);
    if !def.preamble.is_empty() {
        out.push_str(&def.preamble);
        out.push('\n');
    }
    for prompt in &def.prompts {
        out.push_str(&format!("{}. {}\n", prompt.index + 1, prompt.text));
    }
    if let Some(legend) = scale_legend(def) {
        out.push_str(&format!("Answer with: {legend}.\n"));
    }
    out.push_str(&format!(
        "Reply with all {} answers in one message, separated by spaces (for example \"{}\").",
        def.len(),
        bulk_example(def)
    ));
    out
}

/// A single question, sent in stepwise mode.
pub fn step_prompt(def: &InstrumentDefinition, index: usize) -> String {
    let Some(prompt) = def.prompt(index) else {
        return String::new();
    };
    let mut out = String::new();
    if index == 0 {
        out.push_str(&format!("{}\n", def.name));
        if !def.preamble.is_empty() {
            out.push_str(&format!("{}\n", def.preamble));
        }
    }
    out.push_str(&format!(
        "Question {} of {}: {}\n",
        index + 1,
        def.len(),
        prompt.text
    ));
    if let Some(legend) = scale_legend(def) {
        out.push_str(&format!("{legend}\n"));
    }
    out.push_str(&format!(
        "Reply with one number: {}.",
        format_domain(&prompt.answer_domain)
    ));
    out
}

/// Re-prompt after an unreadable bulk answer. Always names count and domain.
pub fn bulk_reprompt(def: &InstrumentDefinition, rejection: &Rejection) -> String {
    let reason = match rejection {
        Rejection::WrongCount { got, .. } => format!("I got {got} answers. "),
        Rejection::OutOfDomain { position, token } => {
            format!("Answer {position} (\"{token}\") is not one of the options. ")
        }
        Rejection::NotNumeric | Rejection::NotSingleAnswer => String::new(),
    };
    format!(
        "Sorry, I couldn't read that. {reason}Please reply with {} numbers separated by spaces, {}.",
        def.len(),
        domain_phrase(def)
    )
}

/// Re-prompt after an unreadable stepwise answer; repeats the question.
pub fn step_reprompt(def: &InstrumentDefinition, index: usize) -> String {
    let Some(prompt) = def.prompt(index) else {
        return String::new();
    };
    format!(
        "Sorry, please reply with a single number: {}.\nQuestion {} of {}: {}",
        format_domain(&prompt.answer_domain),
        index + 1,
        def.len(),
        prompt.text
    )
}

/// Sent once all answers are in.
pub fn completion(def: &InstrumentDefinition, assessment: &Assessment) -> String {
    let mut out = format!(
        "Thank you, your {} is complete. Total score: {} ({}).",
        def.name, assessment.total_score, assessment.category
    );
    if !assessment.interpretation.is_empty() {
        out.push(' ');
        out.push_str(&assessment.interpretation);
    }
    out
}

/// Sent for free text when no questionnaire is in progress.
pub fn idle_help(registry: &InstrumentRegistry) -> String {
    let keywords: Vec<String> = registry
        .primary_keywords()
        .into_iter()
        .map(str::to_uppercase)
        .collect();
    match keywords.as_slice() {
        [] => "No questionnaire is in progress.".to_string(),
        [only] => format!("No questionnaire is in progress. Text {only} to start one."),
        [init @ .., last] => format!(
            "No questionnaire is in progress. Text {} or {last} to start one.",
            init.join(", ")
        ),
    }
}

/// Sent when a stored session refers to an instrument no longer in the catalogue.
pub fn instrument_withdrawn(registry: &InstrumentRegistry) -> String {
    format!(
        "That questionnaire is no longer available. {}",
        idle_help(registry)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gad7() -> std::sync::Arc<InstrumentDefinition> {
        InstrumentRegistry::builtin().unwrap().get("gad7").unwrap()
    }

    #[test]
    fn domain_formatting() {
        assert_eq!(format_domain(&[0, 1, 2, 3].into()), "0, 1, 2 or 3");
        assert_eq!(format_domain(&[1].into()), "1");
        assert_eq!(format_domain(&(0..=10).collect()), "0 to 10");
        assert_eq!(format_domain(&[0, 5, 9, 20, 30].into()), "0, 5, 9, 20 or 30");
    }

    #[test]
    fn instructions_list_every_prompt() {
        let def = gad7();
        let text = full_instructions(&def);
        assert!(text.starts_with("GAD-7\n"));
        for prompt in &def.prompts {
            assert!(text.contains(&prompt.text));
        }
        assert!(text.contains("all 7 answers"));
        assert!(text.contains("0 = Not at all"));
        assert!(text.contains("\"0 1 2 3 0 1 2\""));
    }

    #[test]
    fn bulk_reprompt_names_count_and_domain() {
        let def = gad7();
        let text = bulk_reprompt(&def, &Rejection::WrongCount { expected: 7, got: 6 });
        assert!(text.contains("7 numbers"));
        assert!(text.contains("0, 1, 2 or 3"));
        assert!(text.contains("I got 6 answers"));
    }

    #[test]
    fn step_prompt_includes_preamble_only_first() {
        let def = gad7();
        assert!(step_prompt(&def, 0).contains(&def.preamble));
        assert!(!step_prompt(&def, 1).contains(&def.preamble));
        assert!(step_prompt(&def, 1).starts_with("Question 2 of 7"));
    }

    #[test]
    fn help_lists_keywords() {
        let registry = InstrumentRegistry::builtin().unwrap();
        assert_eq!(
            idle_help(&registry),
            "No questionnaire is in progress. Text GAD7 to start one."
        );
    }
}
