//! Entity label handling.
//!
//! Extracted entities carry a set of labels: the catch-all entity marker,
//! sometimes the chunk-container label, and whatever type the extraction
//! model chose. Nothing about the order of that set is stable across runs or
//! models, so the meaningful label is selected by filtering, never by
//! position.

use crate::models::{CHUNK_LABEL, DOCUMENT_LABEL, ENTITY_MARKER_LABEL};
use std::collections::BTreeSet;

pub fn is_structural_label(label: &str) -> bool {
    label == CHUNK_LABEL || label == ENTITY_MARKER_LABEL
}

/// The meaningful label of an entity: the first label, in sorted order, that
/// is neither the chunk-container label nor the entity marker. Sorting makes
/// the choice independent of the order labels were assigned in. `None` when
/// only structural labels are present.
pub fn resolve_label<I, S>(labels: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .filter(|label| {
            let label = label.as_ref();
            !label.is_empty() && !is_structural_label(label)
        })
        .map(|label| label.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .next()
}

/// Makes an extracted label safe to splice into Cypher: ASCII alphanumerics
/// and `_`, starting with a letter, not one of the structural labels.
pub fn sanitize_label(raw: &str) -> String {
    sanitize_identifier(raw)
        .filter(|label| !is_structural_label(label) && label != DOCUMENT_LABEL)
        .unwrap_or_else(|| "Entity".to_string())
}

pub fn sanitize_relationship_type(raw: &str) -> String {
    sanitize_identifier(&raw.replace([' ', '-'], "_"))
        .map(|kind| kind.to_ascii_uppercase())
        .filter(|kind| kind != "FROM_CHUNK" && kind != "FROM_DOCUMENT")
        .unwrap_or_else(|| "RELATED_TO".to_string())
}

fn sanitize_identifier(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    match cleaned.chars().next() {
        Some(first) if first.is_ascii_alphabetic() => Some(cleaned),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meaningful_label_ignores_assignment_order() {
        let orders = [
            ["__Entity__", "Chunk", "Person"],
            ["Person", "__Entity__", "Chunk"],
            ["Chunk", "Person", "__Entity__"],
        ];
        for labels in orders {
            assert_eq!(resolve_label(labels).as_deref(), Some("Person"));
        }
    }

    #[test]
    fn only_structural_labels_resolve_to_none() {
        assert_eq!(resolve_label(["__Entity__", "Chunk"]), None);
        assert_eq!(resolve_label(Vec::<String>::new()), None);
    }

    #[test]
    fn several_meaningful_labels_pick_the_same_one_every_time() {
        let first = resolve_label(["Organization", "__Entity__", "Company"]);
        let second = resolve_label(["Company", "Organization", "__Entity__"]);
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("Company"));
    }

    #[test]
    fn labels_are_sanitized_for_cypher() {
        assert_eq!(sanitize_label("Person"), "Person");
        assert_eq!(sanitize_label("Person`) DETACH DELETE n //"), "PersonDETACHDELETEn");
        assert_eq!(sanitize_label("42nd"), "Entity");
        assert_eq!(sanitize_label("Chunk"), "Entity");
        assert_eq!(sanitize_label("__Entity__"), "Entity");
        assert_eq!(sanitize_label(""), "Entity");
    }

    #[test]
    fn identifiers_must_start_with_a_letter() {
        assert_eq!(sanitize_label("__Foo"), "Entity");
        assert_eq!(sanitize_label("_Person"), "Entity");
        assert_eq!(sanitize_relationship_type("__OWNS"), "RELATED_TO");
        assert_eq!(sanitize_relationship_type("owns__"), "OWNS__");
    }

    #[test]
    fn relationship_types_are_upper_snake_case() {
        assert_eq!(sanitize_relationship_type("founded by"), "FOUNDED_BY");
        assert_eq!(sanitize_relationship_type("works-at"), "WORKS_AT");
        assert_eq!(sanitize_relationship_type("FROM_CHUNK"), "RELATED_TO");
        assert_eq!(sanitize_relationship_type("!!"), "RELATED_TO");
    }
}
