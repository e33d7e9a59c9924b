//! Term catalogue loading and task-matrix derivation.

use crate::error::CatalogError;
use crate::templates::TemplateStore;
use crate::types::{Task, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Order in which the task matrix is dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraversalOrder {
    /// Term-major, catalogue order
    #[default]
    TopDown,
    /// Reverse of `TopDown`
    BottomUp,
}

impl FromStr for TraversalOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "top-down" | "topdown" => Ok(TraversalOrder::TopDown),
            "bottom-up" | "bottomup" => Ok(TraversalOrder::BottomUp),
            other => Err(format!(
                "unknown traversal order '{}': expected top-down or bottom-up",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TermEntry {
    Id(String),
    Full {
        id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        metadata: BTreeMap<String, serde_json::Value>,
    },
}

/// Ordered set of terms
#[derive(Debug, Clone, Default)]
pub struct TermCatalog {
    terms: Vec<Arc<Term>>,
}

impl TermCatalog {
    pub fn from_terms(terms: Vec<Term>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(terms.len());
        for term in terms {
            if term.id.trim().is_empty() {
                continue;
            }
            if term.id.chars().any(char::is_control) {
                return Err(CatalogError::InvalidIdentifier(term.id));
            }
            if !seen.insert(term.id.clone()) {
                return Err(CatalogError::DuplicateTerm(term.id));
            }
            out.push(Arc::new(term));
        }
        Ok(Self { terms: out })
    }

    /// Parse a JSON array of ids or `{ id, display_name?, metadata? }` objects.
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let entries: Vec<TermEntry> =
            serde_json::from_str(raw).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let terms = entries
            .into_iter()
            .map(|entry| match entry {
                TermEntry::Id(id) => Term::new(id.trim()),
                TermEntry::Full {
                    id,
                    display_name,
                    metadata,
                } => {
                    let mut term = Term::new(id.trim());
                    if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
                        term.display_name = name;
                    }
                    term.metadata = metadata
                        .into_iter()
                        .map(|(k, v)| {
                            let text = match v {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            };
                            (k, text)
                        })
                        .collect();
                    term
                }
            })
            .collect();
        Self::from_terms(terms)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn terms(&self) -> &[Arc<Term>] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Derive every (term, dimension) task in dispatch order.
pub fn task_matrix(
    catalog: &TermCatalog,
    templates: &TemplateStore,
    order: TraversalOrder,
) -> Vec<Task> {
    let mut tasks: Vec<Task> = catalog
        .terms()
        .iter()
        .flat_map(|term| {
            templates.dimensions().map(move |dimension| Task {
                term: Arc::clone(term),
                dimension_id: dimension.id.clone(),
                complexity: dimension.complexity,
            })
        })
        .collect();
    if order == TraversalOrder::BottomUp {
        tasks.reverse();
    }
    tasks
}
