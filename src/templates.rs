//! Prompt Template Store
//!
//! Holds the dimension catalogue: for every content dimension its complexity
//! tier and its prompt triplet (generative, evaluative, improvement) plus a
//! shared system prompt. Templates use `{name}` placeholders; anything in
//! braces that is not a known placeholder is emitted verbatim, so prompts may
//! contain literal JSON.

use crate::error::TemplateError;
use crate::types::{ComplexityTier, DimensionId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Which prompt of the triplet a request was rendered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Generative,
    Evaluative,
    Improvement,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::Generative => "generative",
            PromptKind::Evaluative => "evaluative",
            PromptKind::Improvement => "improvement",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert technical writer producing \
glossary content. Write accurate, well-structured prose for a technical audience.";

pub const DEFAULT_GENERATIVE_PROMPT: &str = "Write the \"{dimension}\" section for the \
glossary term \"{term}\".\n\nSection guidance: {dimension_description}\n\nRespond with the \
section content only.";

pub const DEFAULT_EVALUATIVE_PROMPT: &str = "Evaluate the following \"{dimension}\" section \
written for the glossary term \"{term}\".\n\nSection guidance: {dimension_description}\n\n\
---\n{content}\n---\n\nScore it from 1 (unusable) to 10 (publishable as is). Respond with JSON \
only: {\"score\": <integer 1-10>, \"rationale\": \"<what is missing or wrong>\"}";

pub const DEFAULT_IMPROVEMENT_PROMPT: &str = "Revise the \"{dimension}\" section for the \
glossary term \"{term}\". The previous draft scored {score}/10.\n\nReviewer feedback:\n\
{feedback}\n\nPrevious draft:\n---\n{content}\n---\n\nRespond with the improved section \
content only.";

/// The prompts bound to one content dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTriplet {
    pub system: String,
    pub generative: String,
    pub evaluative: String,
    pub improvement: String,
}

impl Default for PromptTriplet {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            generative: DEFAULT_GENERATIVE_PROMPT.to_string(),
            evaluative: DEFAULT_EVALUATIVE_PROMPT.to_string(),
            improvement: DEFAULT_IMPROVEMENT_PROMPT.to_string(),
        }
    }
}

impl PromptTriplet {
    pub fn template(&self, kind: PromptKind) -> &str {
        match kind {
            PromptKind::Generative => &self.generative,
            PromptKind::Evaluative => &self.evaluative,
            PromptKind::Improvement => &self.improvement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionTemplate {
    pub id: DimensionId,
    pub title: String,
    pub description: String,
    pub complexity: ComplexityTier,
    pub prompts: PromptTriplet,
}

impl DimensionTemplate {
    /// Dimension using the built-in prompts
    pub fn new(id: impl Into<String>, complexity: ComplexityTier) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            description: String::new(),
            id,
            complexity,
            prompts: PromptTriplet::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompts(mut self, prompts: PromptTriplet) -> Self {
        self.prompts = prompts;
        self
    }

    fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |message: &str| TemplateError::InvalidTemplate {
            dimension: self.id.clone(),
            message: message.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("dimension id is empty"));
        }
        if self.id.chars().any(char::is_control) {
            return Err(invalid("dimension id contains control characters"));
        }
        for (kind, text) in [
            ("system", &self.prompts.system),
            ("generative", &self.prompts.generative),
            ("evaluative", &self.prompts.evaluative),
            ("improvement", &self.prompts.improvement),
        ] {
            if text.trim().is_empty() {
                return Err(invalid(&format!("{} prompt is empty", kind)));
            }
        }
        if !self.prompts.evaluative.contains("{content}") {
            return Err(invalid("evaluative prompt must reference {content}"));
        }
        if !self.prompts.improvement.contains("{content}")
            || !self.prompts.improvement.contains("{feedback}")
        {
            return Err(invalid(
                "improvement prompt must reference {content} and {feedback}",
            ));
        }
        Ok(())
    }
}

/// Values substituted into a template
pub struct PromptContext<'a> {
    pub term: &'a Term,
    pub dimension: &'a DimensionTemplate,
    pub content: Option<&'a str>,
    pub score: Option<u8>,
    pub feedback: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    pub fn new(term: &'a Term, dimension: &'a DimensionTemplate) -> Self {
        Self {
            term,
            dimension,
            content: None,
            score: None,
            feedback: None,
        }
    }

    pub fn with_content(mut self, content: &'a str) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_evaluation(mut self, score: u8, feedback: &'a str) -> Self {
        self.score = Some(score);
        self.feedback = Some(feedback);
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        let value = match name {
            "term" => self.term.display_name.clone(),
            "term_id" => self.term.id.clone(),
            "dimension" => self.dimension.title.clone(),
            "dimension_id" => self.dimension.id.clone(),
            "dimension_description" => self.dimension.description.clone(),
            "content" => self.content.unwrap_or_default().to_string(),
            "score" => self.score.map(|s| s.to_string()).unwrap_or_default(),
            "feedback" => self.feedback.unwrap_or_default().to_string(),
            other => {
                let key = other.strip_prefix("meta.")?;
                self.term.metadata.get(key).cloned().unwrap_or_default()
            }
        };
        Some(value)
    }
}

/// Substitute known `{name}` placeholders in `template`.
pub fn render(template: &str, ctx: &PromptContext<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let name = &after[..close];
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
            if valid {
                ctx.lookup(name).map(|value| (value, close))
            } else {
                None
            }
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// On-disk catalogue format
#[derive(Debug, Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    dimensions: Vec<DimensionEntry>,
}

#[derive(Debug, Deserialize)]
struct DimensionEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: String,
    complexity: ComplexityTier,
    #[serde(default)]
    prompts: PromptOverrides,
}

#[derive(Debug, Default, Deserialize)]
struct PromptOverrides {
    system: Option<String>,
    generative: Option<String>,
    evaluative: Option<String>,
    improvement: Option<String>,
}

impl From<DimensionEntry> for DimensionTemplate {
    fn from(entry: DimensionEntry) -> Self {
        let defaults = PromptTriplet::default();
        let prompts = PromptTriplet {
            system: entry.prompts.system.unwrap_or(defaults.system),
            generative: entry.prompts.generative.unwrap_or(defaults.generative),
            evaluative: entry.prompts.evaluative.unwrap_or(defaults.evaluative),
            improvement: entry.prompts.improvement.unwrap_or(defaults.improvement),
        };
        DimensionTemplate {
            title: entry.title.unwrap_or_else(|| entry.id.clone()),
            id: entry.id,
            description: entry.description,
            complexity: entry.complexity,
            prompts,
        }
    }
}

/// Ordered, validated dimension catalogue
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    dimensions: Vec<Arc<DimensionTemplate>>,
    index: HashMap<DimensionId, usize>,
}

impl TemplateStore {
    pub fn from_dimensions(dimensions: Vec<DimensionTemplate>) -> Result<Self, TemplateError> {
        let mut store = TemplateStore::default();
        for dimension in dimensions {
            dimension.validate()?;
            if store.index.contains_key(&dimension.id) {
                return Err(TemplateError::DuplicateDimension(dimension.id));
            }
            store
                .index
                .insert(dimension.id.clone(), store.dimensions.len());
            store.dimensions.push(Arc::new(dimension));
        }
        Ok(store)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TemplateError> {
        let file: CatalogueFile =
            toml::from_str(raw).map_err(|e| TemplateError::Parse(e.to_string()))?;
        Self::from_dimensions(file.dimensions.into_iter().map(Into::into).collect())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<DimensionTemplate>> {
        self.index.get(id).map(|&i| &self.dimensions[i])
    }

    pub fn get_or_error(&self, id: &str) -> Result<&Arc<DimensionTemplate>, TemplateError> {
        self.get(id)
            .ok_or_else(|| TemplateError::UnknownDimension(id.to_string()))
    }

    /// Dimensions in catalogue order
    pub fn dimensions(&self) -> impl Iterator<Item = &Arc<DimensionTemplate>> {
        self.dimensions.iter()
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }
}
