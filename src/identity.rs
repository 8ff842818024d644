//! Product identity: the immutable per-run lock and the per-source match
//! scorer.
//!
//! Identity is taken as input; the engine never reconciles across different
//! products. What it does decide, per source, is whether the page is talking
//! about the locked product at all, and at what confidence.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Variant strings treated as "no variant" when building product ids.
const PLACEHOLDER_VARIANTS: &[&str] = &["unk", "unknown", "na", "n/a", "none", "null", ""];

/// The fields that receive a stricter confidence cap when a source fails the
/// identity gate.
pub const IDENTITY_GATED_FIELDS: &[&str] = &["brand", "model", "variant", "sku", "base_model"];

/// Immutable product identity for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLock {
    /// Brand name, e.g. "Logitech"
    pub brand: String,
    /// Model name, e.g. "G Pro X Superlight 2"
    pub model: String,
    /// Variant, may be blank
    #[serde(default)]
    pub variant: String,
    /// SKU when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

/// How much of the identity is locked, from most to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// No identity fields present
    Unlocked,
    /// Brand only
    LockedPartial,
    /// Brand and model
    LockedBrandModel,
    /// Brand, model, and variant or SKU
    LockedFull,
}

impl IdentityLock {
    /// Build a lock; blank-safe.
    pub fn new(brand: impl Into<String>, model: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            model: model.into(),
            variant: variant.into(),
            sku: None,
        }
    }

    /// Attach a SKU.
    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    /// Derive the lock status from which fields are non-blank.
    pub fn status(&self) -> LockStatus {
        let brand = !self.brand.trim().is_empty();
        let model = !self.model.trim().is_empty();
        let variant = !is_placeholder_variant(&self.variant);
        let sku = self.sku.as_deref().map_or(false, |s| !s.trim().is_empty());

        match (brand, model) {
            (true, true) if variant || sku => LockStatus::LockedFull,
            (true, true) => LockStatus::LockedBrandModel,
            (true, false) => LockStatus::LockedPartial,
            _ => LockStatus::Unlocked,
        }
    }

    /// Whether the lock is strong enough to plan a run.
    pub fn is_plannable(&self) -> bool {
        self.status() >= LockStatus::LockedBrandModel
    }

    /// Tokens of the model string, for path model-signal checks.
    pub fn model_tokens(&self) -> Vec<String> {
        tokenize(&self.model)
    }
}

/// True when a variant string is a placeholder meaning "no variant".
pub fn is_placeholder_variant(variant: &str) -> bool {
    PLACEHOLDER_VARIANTS.contains(&variant.trim().to_ascii_lowercase().as_str())
}

/// Deterministic product id slug: `category-brand-model[-variant]`.
///
/// Placeholder variants are stripped; everything is lowercased and
/// non-alphanumeric runs collapse to single dashes.
pub fn product_id(category: &str, lock: &IdentityLock) -> String {
    let mut parts = vec![category.to_string(), lock.brand.clone(), lock.model.clone()];
    if !is_placeholder_variant(&lock.variant) {
        parts.push(lock.variant.clone());
    }
    slugify(&parts.join(" "))
}

fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// What a source page claims about its own product identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Brand observed on the page, if any
    #[serde(default)]
    pub brand: Option<String>,
    /// Model/product name observed on the page
    #[serde(default)]
    pub model: Option<String>,
    /// SKU observed on the page
    #[serde(default)]
    pub sku: Option<String>,
    /// Page title, used as a fallback haystack
    #[serde(default)]
    pub title: Option<String>,
}

/// Identity decision for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityDecision {
    /// Source is about the locked product
    Accept,
    /// Ambiguous; candidates pass but flagged for review
    Review,
    /// Different product
    Reject,
}

/// Outcome of scoring one source against the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    /// True iff the decision is `Accept`
    pub matched: bool,
    /// Combined similarity in [0, 1]
    pub score: f64,
    /// Tri-state decision
    pub decision: IdentityDecision,
    /// Populated on `Reject`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

/// Threshold at or above which a source is accepted.
pub const IDENTITY_ACCEPT_THRESHOLD: f64 = 0.70;
/// Threshold at or above which a source is held for review rather than
/// rejected.
pub const IDENTITY_REVIEW_THRESHOLD: f64 = 0.45;

/// Score a source's claimed identity against the lock.
///
/// Brand and model are compared with token overlap blended with character
/// bigram similarity; an exact SKU match short-circuits to a full accept.
pub fn score_identity(lock: &IdentityLock, source: &SourceIdentity) -> IdentityMatch {
    if let (Some(lock_sku), Some(src_sku)) = (lock.sku.as_deref(), source.sku.as_deref()) {
        if !lock_sku.trim().is_empty()
            && lock_sku.trim().eq_ignore_ascii_case(src_sku.trim())
        {
            return IdentityMatch {
                matched: true,
                score: 1.0,
                decision: IdentityDecision::Accept,
                reject_reason: None,
            };
        }
    }

    let title = source.title.as_deref().unwrap_or("");
    let brand_haystack = source.brand.as_deref().unwrap_or(title);
    let model_haystack = source.model.as_deref().unwrap_or(title);

    let brand_score = similarity(&lock.brand, brand_haystack);
    let model_score = similarity(&lock.model, model_haystack);

    // A variant the page mentions strengthens the match; many sources omit
    // it, so its absence never weakens one.
    let variant_bonus = if is_placeholder_variant(&lock.variant) {
        0.0
    } else {
        0.1 * similarity(&lock.variant, model_haystack).max(similarity(&lock.variant, title))
    };

    let score = (0.3 * brand_score + 0.7 * model_score + variant_bonus).min(1.0);

    let decision = if score >= IDENTITY_ACCEPT_THRESHOLD {
        IdentityDecision::Accept
    } else if score >= IDENTITY_REVIEW_THRESHOLD {
        IdentityDecision::Review
    } else {
        IdentityDecision::Reject
    };

    IdentityMatch {
        matched: decision == IdentityDecision::Accept,
        score,
        decision,
        reject_reason: match decision {
            IdentityDecision::Reject => Some(format!(
                "identity similarity {:.2} below review threshold",
                score
            )),
            _ => None,
        },
    }
}

/// Blend of token overlap and bigram similarity in [0, 1].
fn similarity(needle: &str, haystack: &str) -> f64 {
    if needle.trim().is_empty() || haystack.trim().is_empty() {
        return 0.0;
    }
    0.6 * token_overlap(needle, haystack) + 0.4 * bigram_similarity(needle, haystack)
}

/// Fraction of the needle's tokens present in the haystack.
fn token_overlap(needle: &str, haystack: &str) -> f64 {
    let need: Vec<String> = tokenize(needle);
    if need.is_empty() {
        return 0.0;
    }
    let have: HashSet<String> = tokenize(haystack).into_iter().collect();
    let hit = need.iter().filter(|t| have.contains(*t)).count();
    hit as f64 / need.len() as f64
}

/// Dice coefficient over character bigrams of the whitespace-collapsed,
/// lowercased strings.
fn bigram_similarity(a: &str, b: &str) -> f64 {
    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return 0.0;
    }
    let overlap = a_grams.intersection(&b_grams).count();
    (2 * overlap) as f64 / (a_grams.len() + b_grams.len()) as f64
}

fn bigrams(raw: &str) -> HashSet<(char, char)> {
    let cleaned: Vec<char> = raw
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    cleaned.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(raw: &str) -> Vec<String> {
    raw.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_status_ladder() {
        assert_eq!(IdentityLock::new("", "", "").status(), LockStatus::Unlocked);
        assert_eq!(
            IdentityLock::new("Razer", "", "").status(),
            LockStatus::LockedPartial
        );
        assert_eq!(
            IdentityLock::new("Razer", "Viper V3 Pro", "").status(),
            LockStatus::LockedBrandModel
        );
        assert_eq!(
            IdentityLock::new("Razer", "Viper V3 Pro", "Wireless").status(),
            LockStatus::LockedFull
        );
        assert_eq!(
            IdentityLock::new("Razer", "Viper V3 Pro", "unk")
                .with_sku("RZ01-05120100")
                .status(),
            LockStatus::LockedFull
        );
    }

    #[test]
    fn test_placeholder_variant_does_not_upgrade_lock() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "N/A");
        assert_eq!(lock.status(), LockStatus::LockedBrandModel);
        assert!(lock.is_plannable());
    }

    #[test]
    fn test_product_id_strips_placeholder_variant() {
        let lock = IdentityLock::new("Logitech", "G Pro X Superlight 2", "unknown");
        assert_eq!(
            product_id("gaming-mice", &lock),
            "gaming-mice-logitech-g-pro-x-superlight-2"
        );

        let lock = IdentityLock::new("Logitech", "G Pro X Superlight 2", "Wireless");
        assert_eq!(
            product_id("gaming-mice", &lock),
            "gaming-mice-logitech-g-pro-x-superlight-2-wireless"
        );
    }

    #[test]
    fn test_matching_source_accepts() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "");
        let source = SourceIdentity {
            brand: Some("Razer".into()),
            model: Some("Viper V3 Pro Wireless Gaming Mouse".into()),
            sku: None,
            title: None,
        };
        let m = score_identity(&lock, &source);
        assert!(m.matched);
        assert_eq!(m.decision, IdentityDecision::Accept);
        assert!(m.score > 0.8, "score was {}", m.score);
    }

    #[test]
    fn test_different_product_rejects() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "");
        let source = SourceIdentity {
            brand: Some("Razer".into()),
            model: Some("Basilisk Ultimate".into()),
            sku: None,
            title: None,
        };
        let m = score_identity(&lock, &source);
        assert!(!m.matched);
        assert_eq!(m.decision, IdentityDecision::Reject);
        assert!(m.reject_reason.is_some());
    }

    #[test]
    fn test_sku_match_short_circuits() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "").with_sku("RZ01-05120100");
        let source = SourceIdentity {
            brand: None,
            model: None,
            sku: Some("rz01-05120100".into()),
            title: Some("Product page".into()),
        };
        let m = score_identity(&lock, &source);
        assert!(m.matched);
        assert_eq!(m.score, 1.0);
    }

    #[test]
    fn test_title_fallback_haystack() {
        let lock = IdentityLock::new("Logitech", "G Pro X Superlight 2", "");
        let source = SourceIdentity {
            title: Some("Logitech G Pro X Superlight 2 review: still the one".into()),
            ..SourceIdentity::default()
        };
        let m = score_identity(&lock, &source);
        assert!(m.matched, "score was {}", m.score);
    }
}
