use serde::Deserialize;

use super::Document;

/// Pre-dedup document filters. The set of kinds is closed; configuration
/// naming any other kind fails to load.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DocumentFilter {
    /// Removes documents with fewer than `min_chars` characters.
    MinLength { min_chars: usize },
    /// Removes documents with more than `max_chars` characters.
    MaxLength { max_chars: usize },
    /// Removes documents whose URL contains any of the patterns.
    UrlContains { patterns: Vec<String> },
}

impl DocumentFilter {
    pub fn keeps(&self, doc: &Document) -> bool {
        match self {
            DocumentFilter::MinLength { min_chars } => doc.text_length >= *min_chars,
            DocumentFilter::MaxLength { max_chars } => doc.text_length <= *max_chars,
            DocumentFilter::UrlContains { patterns } => {
                !patterns.iter().any(|p| doc.url.contains(p.as_str()))
            }
        }
    }
}

/// Returns the first filter rejecting `doc`, if any.
pub fn rejected_by<'a>(filters: &'a [DocumentFilter], doc: &Document) -> Option<&'a DocumentFilter> {
    filters.iter().find(|f| !f.keeps(doc))
}
