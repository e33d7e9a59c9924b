use owo_colors::OwoColorize;

/// Bold, underlined section heading.
pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub(crate) fn format_usd(usd: f64) -> String {
    format!("${:.4}", usd)
}

pub(crate) fn format_optional_score(score: Option<f64>) -> String {
    score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "-".to_string())
}
