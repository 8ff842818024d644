//! Retrieval query generation for under-supported fields.

use crate::identity::{is_placeholder_variant, IdentityLock};
use crate::rules::FieldRule;

/// Build the retrieval query for one NeedSet row.
///
/// Identity first, then the field's best search handle: an explicit query
/// term, an anchor phrase, or the humanized field key. An expected unit is
/// appended when the hints carry one.
pub fn build_retrieval_query(lock: &IdentityLock, rule: &FieldRule) -> String {
    let mut parts = vec![lock.brand.clone(), lock.model.clone()];
    if !is_placeholder_variant(&lock.variant) {
        parts.push(lock.variant.clone());
    }

    let handle = rule
        .search_hints
        .query_terms
        .first()
        .or_else(|| rule.search_hints.anchor_phrases.first())
        .cloned()
        .unwrap_or_else(|| rule.field_key.replace('_', " "));
    parts.push(handle);

    if let Some(unit) = rule.search_hints.expected_units.first() {
        parts.push(unit.clone());
    }

    parts.retain(|p| !p.trim().is_empty());
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ValueType;

    #[test]
    fn test_query_uses_anchor_and_unit() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "");
        let mut rule = FieldRule::new("polling_rate", ValueType::Number).with_anchor("Polling Rate");
        rule.search_hints.expected_units.push("Hz".into());
        assert_eq!(
            build_retrieval_query(&lock, &rule),
            "Razer Viper V3 Pro Polling Rate Hz"
        );
    }

    #[test]
    fn test_query_falls_back_to_humanized_key() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "Wireless");
        let rule = FieldRule::new("battery_life", ValueType::Number);
        assert_eq!(
            build_retrieval_query(&lock, &rule),
            "Razer Viper V3 Pro Wireless battery life"
        );
    }

    #[test]
    fn test_placeholder_variant_omitted() {
        let lock = IdentityLock::new("Razer", "Viper V3 Pro", "unk");
        let rule = FieldRule::new("weight", ValueType::Number);
        assert_eq!(build_retrieval_query(&lock, &rule), "Razer Viper V3 Pro weight");
    }
}
