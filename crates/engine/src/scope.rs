//! Heuristic for queries that must be answered project-wide even when the
//! caller pinned a focus document: comparisons and relationship questions
//! only make sense across documents.

const RELATION_HINTS: &[&str] = &[
    "related",
    "relationship",
    "relationships",
    "compare",
    "comparison",
    "differences",
    "similarities",
    "across",
    "between",
    "connect",
    "overlap",
    "fit together",
    "how they",
];

const MULTI_DOC_HINTS: &[&str] = &[
    "files",
    "documents",
    "docs",
    "papers",
    "slides",
    "presentations",
    "sources",
    "these files",
    "these documents",
    "all files",
    "all documents",
];

const SINGLE_DOC_HINTS: &[&str] = &[
    "this file",
    "this document",
    "this slide",
    "slide ",
    "page ",
    "section ",
];

#[must_use]
pub fn requires_project_scope(query: &str) -> bool {
    let normalized = format!(" {} ", query.to_ascii_lowercase());
    let relation = RELATION_HINTS.iter().any(|hint| normalized.contains(hint));
    let multi_doc = MULTI_DOC_HINTS.iter().any(|hint| normalized.contains(hint));
    let single_doc = SINGLE_DOC_HINTS.iter().any(|hint| normalized.contains(hint));
    let plural_pronoun = normalized.contains(" they ") || normalized.contains(" them ");

    if multi_doc && (relation || plural_pronoun) {
        return true;
    }
    if normalized.contains("across documents") || normalized.contains("across files") {
        return true;
    }
    if relation && plural_pronoun {
        return true;
    }
    relation && multi_doc && !single_doc
}
