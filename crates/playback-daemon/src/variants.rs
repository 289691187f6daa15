//! Alternate spellings of artist and album names.
//!
//! Catalog naming drifts from collection naming in a handful of predictable
//! ways ("The Beatles" vs "Beatles", "&" vs "and", edition suffixes).  The
//! generator rewrites a name with a configured, ordered list of transforms and
//! returns the distinct results most-likely-first.  Callers try them strictly
//! in order: there is only one browse cursor, so candidates cannot be raced.
use playback_proto::config::{VariantTransform, VariantsConfig, MAX_SUFFIX_KEYWORDS};

#[derive(Debug, Clone)]
pub struct VariantGenerator {
    artist_transforms: Vec<VariantTransform>,
    album_transforms: Vec<VariantTransform>,
    suffix_keywords: Vec<String>,
}

impl Default for VariantGenerator {
    fn default() -> Self {
        Self::new(&VariantsConfig::default())
    }
}

impl VariantGenerator {
    pub fn new(config: &VariantsConfig) -> Self {
        Self {
            artist_transforms: config.artist_transforms.clone(),
            album_transforms: config.album_transforms.clone(),
            suffix_keywords: config
                .suffix_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .take(MAX_SUFFIX_KEYWORDS)
                .collect(),
        }
    }

    pub fn generate_artist_variants(&self, name: &str) -> Vec<String> {
        self.generate(name, &self.artist_transforms)
    }

    pub fn generate_album_variants(&self, name: &str) -> Vec<String> {
        self.generate(name, &self.album_transforms)
    }

    /// Identity first, then each transform applied to the original, then each
    /// later transform applied on top of the suffix-stripped form.
    fn generate(&self, name: &str, transforms: &[VariantTransform]) -> Vec<String> {
        let mut out = vec![name.to_string()];
        let original = name.trim();
        if original.is_empty() {
            return out;
        }

        let mut push = |candidate: Option<String>| {
            if let Some(c) = candidate {
                let c = collapse_whitespace(&c);
                if !c.is_empty() && !out.contains(&c) {
                    out.push(c);
                }
            }
        };

        for t in transforms {
            push(self.apply(*t, original));
        }

        // "The Wall (Remastered)" should also yield "Wall"
        let strips = transforms.contains(&VariantTransform::StripSuffix);
        if let Some(stripped) = self.strip_suffix(original).filter(|_| strips) {
            for t in transforms {
                if *t != VariantTransform::StripSuffix {
                    push(self.apply(*t, &stripped));
                }
            }
        }

        out
    }

    fn apply(&self, transform: VariantTransform, name: &str) -> Option<String> {
        match transform {
            VariantTransform::LeadingArticle => toggle_leading_article(name),
            VariantTransform::Conjunction => toggle_conjunction(name),
            VariantTransform::StripSuffix => self.strip_suffix(name),
        }
    }

    /// Remove trailing bracketed groups that mention one of the keywords.
    /// "Dune (Original Motion Picture Soundtrack) [Deluxe Edition]" → "Dune".
    fn strip_suffix(&self, name: &str) -> Option<String> {
        let mut current = name.trim_end();
        let mut stripped = false;
        while let Some(start) = trailing_group_start(current) {
            let group = current[start..].to_lowercase();
            if !self.suffix_keywords.iter().any(|k| group.contains(k.as_str())) {
                break;
            }
            current = current[..start].trim_end().trim_end_matches(['-', ':']).trim_end();
            stripped = true;
        }
        (stripped && !current.is_empty()).then(|| current.to_string())
    }
}

fn trailing_group_start(s: &str) -> Option<usize> {
    let (open, close) = match s.chars().last()? {
        ')' => ('(', ')'),
        ']' => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (idx, ch) in s.char_indices().rev() {
        if ch == close {
            depth += 1;
        } else if ch == open {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

fn toggle_leading_article(name: &str) -> Option<String> {
    match name.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("the ") => {
            let rest = name[4..].trim_start();
            (!rest.is_empty()).then(|| rest.to_string())
        }
        _ => Some(format!("The {}", name)),
    }
}

fn toggle_conjunction(name: &str) -> Option<String> {
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.contains(&"&") {
        let replaced: Vec<&str> = words
            .iter()
            .map(|w| if *w == "&" { "and" } else { w })
            .collect();
        return Some(replaced.join(" "));
    }
    if words.iter().any(|w| w.eq_ignore_ascii_case("and")) {
        let replaced: Vec<&str> = words
            .iter()
            .map(|w| if w.eq_ignore_ascii_case("and") { "&" } else { w })
            .collect();
        return Some(replaced.join(" "));
    }
    None
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
