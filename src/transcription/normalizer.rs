//! # Model Name Normalization
//!
//! Every model name the service uses goes through [`ModelNameNormalizer`]:
//! caller input is trimmed, an empty value falls back to the configured
//! default, and marketing names are rewritten to the checkpoint that
//! actually backs them.

use std::collections::HashMap;
use tracing::info;

/// Aliases every deployment gets, before configured ones are merged in.
const BUILTIN_ALIASES: &[(&str, &str)] = &[("large-v3-turbo", "large-v3")];

#[derive(Debug, Clone)]
pub struct ModelNameNormalizer {
    default_model: String,
    /// Keys are stored lowercased; values keep the casing they were given.
    aliases: HashMap<String, String>,
}

impl ModelNameNormalizer {
    /// Create a normalizer with the built-in alias table only.
    pub fn new(default_model: impl Into<String>) -> Self {
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();

        Self {
            default_model: default_model.into(),
            aliases,
        }
    }

    /// Merge extra aliases over the built-in table.
    pub fn with_aliases<I, K, V>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (from, to) in extra {
            self.aliases
                .insert(from.as_ref().trim().to_lowercase(), to.into());
        }
        self
    }

    /// Resolve a requested model name to its canonical form.
    ///
    /// `None`, `""` and whitespace-only input all resolve to the default.
    /// Alias lookup is case-insensitive; the alias target is returned as
    /// written in the table.
    pub fn normalize(&self, requested: Option<&str>) -> String {
        let trimmed = requested.map(str::trim).unwrap_or_default();
        let name = if trimmed.is_empty() {
            self.default_model.as_str()
        } else {
            trimmed
        };

        match self.aliases.get(&name.to_lowercase()) {
            Some(alias) => {
                info!(from = %name, to = %alias, "Model alias mapping applied");
                alias.clone()
            }
            None => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_input_uses_default() {
        let normalizer = ModelNameNormalizer::new("base");
        assert_eq!(normalizer.normalize(None), "base");
        assert_eq!(normalizer.normalize(Some("")), "base");
        assert_eq!(normalizer.normalize(Some("   ")), "base");
    }

    #[test]
    fn test_turbo_alias_resolves_for_default_and_explicit_names() {
        let normalizer = ModelNameNormalizer::new("large-v3-turbo");
        assert_eq!(normalizer.normalize(None), "large-v3");
        assert_eq!(normalizer.normalize(Some("large-v3-turbo")), "large-v3");
        assert_eq!(normalizer.normalize(Some("LARGE-V3-TURBO")), "large-v3");
        assert_eq!(normalizer.normalize(Some("  Large-V3-Turbo\n")), "large-v3");
    }

    #[test]
    fn test_unknown_names_pass_through_trimmed() {
        let normalizer = ModelNameNormalizer::new("large-v3-turbo");
        assert_eq!(normalizer.normalize(Some(" small.en ")), "small.en");
        assert_eq!(normalizer.normalize(Some("Medium")), "Medium");
    }

    #[test]
    fn test_configured_aliases_merge_over_builtins() {
        let normalizer = ModelNameNormalizer::new("fast")
            .with_aliases([("Fast", "tiny.en"), ("large-v3-turbo", "distil-large-v3")]);

        assert_eq!(normalizer.normalize(None), "tiny.en");
        assert_eq!(normalizer.normalize(Some("FAST")), "tiny.en");
        assert_eq!(normalizer.normalize(Some("large-v3-turbo")), "distil-large-v3");
    }
}
