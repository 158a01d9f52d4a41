//! Renders roadmaps and canned replies into WhatsApp text.
//!
//! Everything here is a pure function of its input.

use crate::workflow::types::{ComplianceRoadmap, ComplianceStep};

/// WhatsApp's per-message text limit, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Render a completed roadmap.
///
/// Steps are grouped under Mandatory, Conditional and Recommended headings
/// (empty groups omitted), followed by the totals.
pub fn format(roadmap: &ComplianceRoadmap) -> String {
    let mut lines: Vec<String> = vec!["🏢 *Compliance Roadmap*".into(), String::new()];

    lines.push(format!("📋 *Business Type:* {}", roadmap.business_type()));
    lines.push(format!("📍 *Location:* {}", roadmap.location()));

    for (category, steps) in roadmap.steps_by_category() {
        lines.push(String::new());
        lines.push(format!("📌 *{} Requirements*", category.heading()));
        for step in steps {
            render_step(&mut lines, step);
        }
    }

    let uncategorized: Vec<&ComplianceStep> = roadmap
        .compliance_steps()
        .iter()
        .filter(|s| roadmap.requirement_for(s).is_none())
        .collect();
    if !uncategorized.is_empty() {
        lines.push(String::new());
        lines.push("📌 *Other Requirements*".into());
        for step in uncategorized {
            render_step(&mut lines, step);
        }
    }

    lines.push(String::new());
    lines.push("📊 *Summary*".into());
    lines.push(format!("Steps: {}", roadmap.compliance_steps().len()));
    lines.push(format!(
        "💰 Total Cost: {}",
        format_currency(roadmap.total_estimated_cost())
    ));
    lines.push(format!(
        "⏱️ Total Time: {}",
        format_duration(roadmap.total_timeline_days())
    ));
    lines.push(String::new());
    lines.push("Reply START to check another business, or HELP for options.".into());

    lines.join("\n")
}

fn render_step(lines: &mut Vec<String>, step: &ComplianceStep) {
    lines.push(String::new());
    lines.push(format!("*{}. {}*", step.step_number, step.title));
    if !step.description.trim().is_empty() {
        lines.push(format!("   {}", step.description.trim()));
    }
    lines.push(format!("   💰 Cost: {}", format_currency(step.cost)));
    lines.push(format!("   ⏱️ Time: {}", format_duration(step.timeline_days)));
    lines.push(format!("   🏛️ Authority: {}", step.authority));
    if !step.documents_required.is_empty() {
        lines.push(format!(
            "   📄 Documents: {}",
            step.documents_required.join(", ")
        ));
    }
}

/// `KSh 5,000`, or `Free` for zero.
pub fn format_currency(amount: u64) -> String {
    if amount == 0 {
        return "Free".into();
    }
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("KSh {grouped}")
}

/// Human-readable duration: days under a week, then weeks, months (30 days)
/// and years (365 days) with any remainder in days.
pub fn format_duration(days: u32) -> String {
    let (unit, size) = match days {
        0..7 => return plural(days, "day"),
        7..30 => ("week", 7),
        30..365 => ("month", 30),
        _ => ("year", 365),
    };
    let whole = days / size;
    let rest = days % size;
    if rest == 0 {
        plural(whole, unit)
    } else {
        format!("{} and {}", plural(whole, unit), plural(rest, "day"))
    }
}

fn plural(n: u32, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// paragraph breaks, then line breaks, then spaces.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        let chunk = remaining[..split_at].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Canned replies ──────────────────────────────────────────────────

pub fn welcome_message() -> &'static str {
    "🏢 *Welcome to the Compliance Advisor!*\n\n\
     I help you work out which licences, permits and registrations your business needs in Kenya.\n\n\
     Tell me what your business does and where it operates, for example:\n\
     \"I sell electronics in Westlands\"\n\n\
     I'll reply with a step-by-step roadmap including costs and timelines."
}

pub fn help_message() -> &'static str {
    "🆘 *Compliance Advisor Help*\n\n\
     • Describe your business and its location to get a roadmap\n\
     • Type START to begin a new enquiry\n\
     • Type HELP to see this message\n\n\
     *Tips:* mention your county or town and what you sell or offer."
}

/// Sent while the roadmap is being prepared.
pub fn processing_message() -> &'static str {
    "⏳ Working on your compliance roadmap. This can take up to a minute."
}

pub fn throttled_message() -> &'static str {
    "⚠️ You're sending messages too quickly. Please wait a moment and try again."
}

pub fn invalid_input_message() -> &'static str {
    "🤔 I couldn't read that message. Please describe your business in a short sentence, \
     for example \"I run a salon in Mombasa\"."
}

pub fn failure_message() -> &'static str {
    "❌ Sorry, I couldn't prepare your roadmap right now. Please try again in a few minutes."
}
