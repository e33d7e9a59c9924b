use super::shared::format_section_heading;
use owo_colors::OwoColorize;

/// Outcome of `glossgen validate`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub terms: Option<usize>,
    pub dimensions: Option<usize>,
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn tasks(&self) -> Option<usize> {
        Some(self.terms? * self.dimensions?)
    }
}

pub fn format_validation_report(report: &ValidationReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Validation")));
    let count = |n: Option<usize>| n.map_or_else(|| "-".to_string(), |n| n.to_string());
    out.push_str(&format!("  Terms: {}\n", count(report.terms)));
    out.push_str(&format!("  Dimensions: {}\n", count(report.dimensions)));
    out.push_str(&format!("  Tasks: {}\n\n", count(report.tasks())));

    if report.is_valid() {
        out.push_str(&format!("  {}\n", "Configuration is valid".green()));
    } else {
        out.push_str(&format!(
            "  {} problem(s) found:\n",
            report.problems.len().to_string().red()
        ));
        for problem in &report.problems {
            out.push_str(&format!("    - {}\n", problem));
        }
    }
    out
}
