use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Requested rendition of an asset (e.g. `thumbnail`, `public`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant(String);

impl Variant {
    /// Rendition served when a caller does not ask for one.
    pub const DEFAULT: &'static str = "public";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scoring table for [`PriorityModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Base score per variant. Smaller renditions are reused in more
    /// places and score higher.
    pub variants: BTreeMap<String, u32>,
    /// Score for variants missing from the table.
    pub fallback_score: u32,
    /// Substrings marking a key as featured content.
    pub featured_markers: Vec<String>,
    pub featured_bonus: u32,
    pub case_sensitive: bool,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        let variants = [
            ("thumbnail", 5),
            ("public", 4),
            ("size1", 3),
            ("size2", 2),
            ("size3", 1),
        ]
        .into_iter()
        .map(|(name, score)| (name.to_string(), score))
        .collect();

        Self {
            variants,
            fallback_score: 1,
            featured_markers: vec!["featured".to_string(), "hero".to_string()],
            featured_bonus: 2,
            case_sensitive: true,
        }
    }
}

/// Static priority score for a key, computed once when an entry is created.
#[derive(Debug, Clone)]
pub struct PriorityModel {
    config: PriorityConfig,
    markers: Vec<String>,
}

impl Default for PriorityModel {
    fn default() -> Self {
        Self::new(PriorityConfig::default())
    }
}

impl PriorityModel {
    pub fn new(config: PriorityConfig) -> Self {
        let markers = config
            .featured_markers
            .iter()
            .filter(|marker| !marker.is_empty())
            .map(|marker| {
                if config.case_sensitive {
                    marker.clone()
                } else {
                    marker.to_lowercase()
                }
            })
            .collect();
        Self { config, markers }
    }

    pub fn is_featured(&self, key: &str) -> bool {
        if self.config.case_sensitive {
            self.markers.iter().any(|marker| key.contains(marker.as_str()))
        } else {
            let key = key.to_lowercase();
            self.markers.iter().any(|marker| key.contains(marker.as_str()))
        }
    }

    pub fn score(&self, key: &str, variant: &Variant) -> u32 {
        let base = self
            .config
            .variants
            .get(variant.as_str())
            .copied()
            .unwrap_or(self.config.fallback_score);
        let bonus = if self.is_featured(key) {
            self.config.featured_bonus
        } else {
            0
        };
        base.saturating_add(bonus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_variants_score_higher() {
        let model = PriorityModel::default();
        let thumb = model.score("poster-1", &Variant::from("thumbnail"));
        let public = model.score("poster-1", &Variant::default());
        let large = model.score("poster-1", &Variant::from("size3"));
        assert_eq!((thumb, public, large), (5, 4, 1));
    }

    #[test]
    fn unknown_variant_uses_fallback() {
        let model = PriorityModel::default();
        assert_eq!(model.score("poster-1", &Variant::from("w1280")), 1);
    }

    #[test]
    fn featured_and_hero_keys_get_bonus() {
        let model = PriorityModel::default();
        assert_eq!(model.score("featured-banner", &Variant::default()), 6);
        assert_eq!(model.score("home-hero-2", &Variant::from("thumbnail")), 7);
    }

    #[test]
    fn marker_matching_is_case_sensitive_by_default() {
        let model = PriorityModel::default();
        assert!(!model.is_featured("FEATURED-banner"));

        let relaxed = PriorityModel::new(PriorityConfig {
            case_sensitive: false,
            ..PriorityConfig::default()
        });
        assert!(relaxed.is_featured("FEATURED-banner"));
        assert!(relaxed.is_featured("Hero"));
    }

    #[test]
    fn empty_markers_never_match() {
        let model = PriorityModel::new(PriorityConfig {
            featured_markers: vec![String::new()],
            ..PriorityConfig::default()
        });
        assert!(!model.is_featured("anything"));
    }
}
