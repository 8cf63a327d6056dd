//! Title normalization shared by the ingest path and the dedupe sweeps.
//! Everything here is pure; if these functions disagreed between the two
//! paths the sweeps would oscillate.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn non_alnum_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex"))
}

/// Kebab-case normalized form of a title: lowercase, alphanumeric runs
/// joined by single dashes. Idempotent.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    non_alnum_runs()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// Product slug for a title (same shape as `normalize_title`; kept separate
/// so slug policy can diverge from the dedupe key without touching it).
pub fn slugify(input: &str) -> String {
    normalize_title(input)
}

/// The dedupe grouping key: the normalized title when non-empty, else the
/// lowercased raw title.
pub fn canonical_title_key(normalized_title: &str, title: &str) -> String {
    if !normalized_title.is_empty() {
        normalized_title.to_string()
    } else {
        title.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditionHint {
    pub has_edition: bool,
    pub label: Option<String>,
}

fn strip_token_edges(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '\'' && c != '-')
        .to_string()
}

/// Infer whether a title is an "Edition" and (if present) extract the word
/// immediately preceding "Edition" from either the title or metadata text.
pub fn edition_hint(title: &str, metadata: Option<&Value>) -> EditionHint {
    fn scan_text(text: &str) -> EditionHint {
        let raw_tokens: Vec<&str> = text.split_whitespace().collect();
        for (idx, tok) in raw_tokens.iter().enumerate() {
            let clean = strip_token_edges(tok);
            if clean.eq_ignore_ascii_case("edition") {
                if idx == 0 {
                    return EditionHint {
                        has_edition: true,
                        label: None,
                    };
                }
                let prev = strip_token_edges(raw_tokens[idx - 1]);
                let label = if prev.is_empty() { None } else { Some(prev) };
                return EditionHint {
                    has_edition: true,
                    label,
                };
            }
        }
        EditionHint::default()
    }

    fn scan_json_strings(v: &Value) -> Option<EditionHint> {
        match v {
            Value::String(s) => {
                let hint = scan_text(s);
                hint.has_edition.then_some(hint)
            }
            Value::Array(items) => items.iter().find_map(scan_json_strings),
            Value::Object(map) => map.values().find_map(scan_json_strings),
            _ => None,
        }
    }

    let hint = scan_text(title);
    if hint.has_edition {
        return hint;
    }
    if let Some(meta) = metadata {
        if let Some(hint) = scan_json_strings(meta) {
            return hint;
        }
    }
    EditionHint::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_collapses_punctuation_and_case() {
        assert_eq!(normalize_title("Portal 2"), "portal-2");
        assert_eq!(normalize_title("  The Witcher® 3: Wild Hunt "), "the-witcher-3-wild-hunt");
        assert_eq!(normalize_title("NieR:Automata™"), "nier-automata");
    }

    #[test]
    fn normalize_is_idempotent() {
        for t in ["Portal 2", "Déraciné", "FINAL FANTASY VII REMAKE"] {
            let once = normalize_title(t);
            assert_eq!(normalize_title(&once), once);
        }
    }

    #[test]
    fn canonical_key_prefers_normalized_form() {
        assert_eq!(canonical_title_key("portal-2", "Portal 2"), "portal-2");
        assert_eq!(canonical_title_key("", "Portal 2"), "portal 2");
    }

    #[test]
    fn edition_hint_from_title() {
        let h = edition_hint("Portal 2 Deluxe Edition", None);
        assert!(h.has_edition);
        assert_eq!(h.label.as_deref(), Some("Deluxe"));
    }

    #[test]
    fn edition_hint_from_metadata_strings() {
        let meta = json!({"variants": ["Gold Edition"]});
        let h = edition_hint("Portal 2", Some(&meta));
        assert!(h.has_edition);
        assert_eq!(h.label.as_deref(), Some("Gold"));
    }

    #[test]
    fn plain_title_has_no_edition() {
        assert_eq!(edition_hint("Portal 2", None), EditionHint::default());
    }
}
