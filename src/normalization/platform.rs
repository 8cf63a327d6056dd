use strsim::jaro_winkler;

/// Minimum similarity score (Jaro-Winkler) required for two platform names
/// to be treated as equivalent.
pub const MIN_PLATFORM_SIMILARITY: f64 = 0.80;

/// Resolved canonical identity for a raw platform label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDescriptor {
    pub code: String,
    pub name: String,
    pub family: &'static str,
}

/// Lowercase alphanumeric projection of a code or name. Two platform rows
/// sharing this value are the same platform; the dedupe sweep enforces it.
pub fn canonical_platform_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Collapse storefront spellings onto the canonical platform code. The alias
/// table is the same one the dedupe sweep uses, so ingest and dedupe cannot
/// disagree about where `ps4` lands.
pub fn resolve_platform_alias(raw: &str) -> PlatformDescriptor {
    let key = canonical_platform_code(raw);
    let (code, name) = match key.as_str() {
        "ps4" | "playstation4" => ("playstation-4", "PlayStation 4"),
        "ps5" | "playstation5" => ("playstation-5", "PlayStation 5"),
        "ps3" | "playstation3" => ("playstation-3", "PlayStation 3"),
        "psvita" | "vita" => ("ps-vita", "PS Vita"),
        "xboxseriesx" | "xboxseriess" | "xboxseriesxs" | "xboxseries" => {
            ("xbox-series", "Xbox Series")
        }
        "xboxone" | "xbone" => ("xbox-one", "Xbox One"),
        "xbox360" => ("xbox-360", "Xbox 360"),
        "nintendoswitch" | "switch" => ("nintendo-switch", "Nintendo Switch"),
        "nintendoswitch2" | "switch2" => ("nintendo-switch-2", "Nintendo Switch 2"),
        "generic" | "pc" | "windows" | "win" | "steamdeck" | "linux" | "macos" | "mac"
        | "osx" => ("pc", "PC"),
        "ios" | "iphone" | "ipad" => ("ios", "iOS"),
        "android" => ("android", "Android"),
        _ => {
            let code = slug_from_label(raw);
            let name = raw.trim().to_string();
            return PlatformDescriptor {
                family: family_for_code(&code),
                code,
                name,
            };
        }
    };
    PlatformDescriptor {
        code: code.to_string(),
        name: name.to_string(),
        family: family_for_code(code),
    }
}

pub fn family_for_code(code: &str) -> &'static str {
    let key = canonical_platform_code(code);
    if key.starts_with("playstation") || key.starts_with("ps") {
        "playstation"
    } else if key.starts_with("xbox") {
        "xbox"
    } else if key.starts_with("nintendo") || key.starts_with("switch") || key.starts_with("wii") {
        "nintendo"
    } else if matches!(key.as_str(), "pc" | "windows" | "linux" | "macos" | "steamdeck") {
        "pc"
    } else if matches!(key.as_str(), "ios" | "android") {
        "mobile"
    } else {
        "other"
    }
}

fn slug_from_label(raw: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Canonicalized platform key used for fuzzy comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformKey {
    normalized: String,
    numeric_sig: Option<String>,
}

impl PlatformKey {
    /// Build a normalized comparison key from a raw platform label.
    ///
    /// Normalization steps:
    /// - trim whitespace
    /// - lowercase and remove punctuation/whitespace
    /// - remove PAL/NTSC/JPY style region prefixes
    /// - expand PSx abbreviations to "playstationx"
    /// - record the numeric signature so PS4 ≠ PS5
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim().to_ascii_lowercase();
        let without_prefix = strip_region_prefixes(&trimmed);
        let alnum_only: String = without_prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        let expanded = expand_common_abbreviations(&alnum_only);
        let digits: String = expanded.chars().filter(|c| c.is_ascii_digit()).collect();
        let numeric_sig = if digits.is_empty() {
            None
        } else {
            Some(digits)
        };

        Self {
            normalized: expanded,
            numeric_sig,
        }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Optional numeric signature extracted from the normalized form (e.g., "5" for PS5).
    pub fn numeric_signature(&self) -> Option<&str> {
        self.numeric_sig.as_deref()
    }

    /// Whether the numeric signatures are compatible (both empty or equal).
    pub fn numeric_compatible(&self, other: &Self) -> bool {
        match (&self.numeric_sig, &other.numeric_sig) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Jaro-Winkler similarity between two normalized keys.
    pub fn similarity(&self, other: &Self) -> f64 {
        jaro_winkler(self.normalized(), other.normalized())
    }
}

fn strip_region_prefixes(input: &str) -> &str {
    const PREFIXES: [&str; 3] = ["pal", "ntsc", "jpy"];
    for prefix in PREFIXES {
        for sep in ["-", "_", " "] {
            let candidate = format!("{prefix}{sep}");
            if input.starts_with(&candidate) {
                return input[candidate.len()..].trim();
            }
        }
    }
    input
}

fn expand_common_abbreviations(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("ps") {
        if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return format!("playstation{rest}");
        }
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_region_prefixes_and_punctuation() {
        let a = PlatformKey::new("PAL-PlayStation®5");
        let b = PlatformKey::new("PlayStation 5");
        assert_eq!(a.numeric_signature(), Some("5"));
        assert!(a.similarity(&b) >= MIN_PLATFORM_SIMILARITY);
    }

    #[test]
    fn numeric_signatures_keep_generations_apart() {
        let ps4 = PlatformKey::new("PS4");
        let ps5 = PlatformKey::new("PS5");
        assert!(!ps4.numeric_compatible(&ps5));
    }

    #[test]
    fn ps_abbreviations_expand() {
        let a = PlatformKey::new("ps5");
        let b = PlatformKey::new("PlayStation 5");
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn alias_map_collapses_playstation_spellings() {
        for raw in ["ps4", "PS4", "PlayStation 4", "playstation-4", "PlayStation®4"] {
            let d = resolve_platform_alias(raw);
            assert_eq!(d.code, "playstation-4", "{raw}");
            assert_eq!(d.family, "playstation");
        }
    }

    #[test]
    fn xbox_series_variants_merge() {
        for raw in ["xbox-series-x", "Xbox Series S", "xbox series x|s"] {
            assert_eq!(resolve_platform_alias(raw).code, "xbox-series", "{raw}");
        }
    }

    #[test]
    fn generic_maps_to_pc() {
        assert_eq!(resolve_platform_alias("generic").code, "pc");
        assert_eq!(resolve_platform_alias("Windows").code, "pc");
        assert_eq!(resolve_platform_alias("pc").family, "pc");
    }

    #[test]
    fn unknown_labels_slugify_and_keep_their_name() {
        let d = resolve_platform_alias("Sega Dreamcast");
        assert_eq!(d.code, "sega-dreamcast");
        assert_eq!(d.name, "Sega Dreamcast");
        assert_eq!(d.family, "other");
    }

    #[test]
    fn canonical_code_strips_everything_but_alnum() {
        assert_eq!(canonical_platform_code("Xbox Series X|S"), "xboxseriesxs");
        assert_eq!(canonical_platform_code("playstation-4"), "playstation4");
    }

    #[test]
    fn canonical_code_is_idempotent() {
        let once = canonical_platform_code("PlayStation®5");
        assert_eq!(canonical_platform_code(&once), once);
    }
}
