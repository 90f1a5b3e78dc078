//! Document model shared by the router, adaptor and watcher.
//!
//! A document is a bag of string fields keyed by name. Only `title` and
//! `tags` carry meaning for this crate; everything else is passed through
//! untouched between the document store and the files on disk.

pub mod codec;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw document fields, ordered by name for stable serialization.
pub type Fields = BTreeMap<String, String>;

/// Field holding the unique document key.
pub const TITLE_FIELD: &str = "title";
/// Field holding the space separated tag list.
pub const TAGS_FIELD: &str = "tags";
/// Field holding the document body.
pub const TEXT_FIELD: &str = "text";
/// Field holding the content type.
pub const TYPE_FIELD: &str = "type";
/// Field pointing at content stored outside the document.
pub const CANONICAL_URI_FIELD: &str = "_canonical_uri";

/// A titled unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: Fields,
}

impl Document {
    /// Create an empty document with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert(TITLE_FIELD.to_string(), title.into());
        Self { fields }
    }

    /// Build a document from raw fields.
    ///
    /// Returns `None` when the fields carry no usable title.
    pub fn from_fields(fields: Fields) -> Option<Self> {
        match fields.get(TITLE_FIELD) {
            Some(title) if !title.is_empty() => Some(Self { fields }),
            _ => None,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Builder-style tag setter.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.set(TAGS_FIELD, stringify_list(&tags));
        self
    }

    pub fn title(&self) -> &str {
        self.fields
            .get(TITLE_FIELD)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Parsed tag list.
    pub fn tags(&self) -> Vec<String> {
        self.fields
            .get(TAGS_FIELD)
            .map(|raw| parse_string_list(raw))
            .unwrap_or_default()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Content type, defaulting to wikitext.
    pub fn content_type(&self) -> &str {
        match self.field(TYPE_FIELD) {
            Some(ty) if !ty.is_empty() => ty,
            _ => codec::DEFAULT_CONTENT_TYPE,
        }
    }

    /// Whether the document's content is stored in its own file.
    pub fn is_editable(&self) -> bool {
        !self.fields.contains_key(CANONICAL_URI_FIELD)
    }
}

/// Parse a string list such as `[[multi word]] single another`.
pub fn parse_string_list(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut rest = raw.trim_start();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("[[") {
            match after.find("]]") {
                Some(end) => {
                    push_unique(&mut items, &after[..end]);
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated bracket: keep the remainder as one item.
                    push_unique(&mut items, after);
                    rest = "";
                }
            }
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            push_unique(&mut items, &rest[..end]);
            rest = &rest[end..];
        }
        rest = rest.trim_start();
    }

    items
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !item.is_empty() && !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
    }
}

/// Inverse of [`parse_string_list`].
pub fn stringify_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| {
            if item.chars().any(char::is_whitespace) {
                format!("[[{item}]]")
            } else {
                item.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_list_mixed() {
        let parsed = parse_string_list("Journal [[Daily Notes]]  Task");
        assert_eq!(parsed, vec!["Journal", "Daily Notes", "Task"]);
    }

    #[test]
    fn test_parse_string_list_dedupes() {
        assert_eq!(parse_string_list("a a [[a]]"), vec!["a"]);
    }

    #[test]
    fn test_parse_unterminated_bracket() {
        assert_eq!(parse_string_list("x [[open ended"), vec!["x", "open ended"]);
    }

    #[test]
    fn test_stringify_brackets_spaces() {
        let items = vec!["Journal".to_string(), "Daily Notes".to_string()];
        assert_eq!(stringify_list(&items), "Journal [[Daily Notes]]");
    }

    #[test]
    fn test_document_accessors() {
        let doc = Document::new("Entry1")
            .with_tags(["Journal", "Daily Notes"])
            .with_field("text", "hello");

        assert_eq!(doc.title(), "Entry1");
        assert_eq!(doc.tags(), vec!["Journal", "Daily Notes"]);
        assert_eq!(doc.content_type(), codec::DEFAULT_CONTENT_TYPE);
        assert!(doc.is_editable());
    }

    #[test]
    fn test_from_fields_requires_title() {
        let mut fields = Fields::new();
        fields.insert("text".into(), "orphan".into());
        assert!(Document::from_fields(fields.clone()).is_none());

        fields.insert("title".into(), "Named".into());
        assert!(Document::from_fields(fields).is_some());
    }
}
