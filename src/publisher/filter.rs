//! Keyword decisions taken against a routing policy

use crate::config::RoutingPolicy;

fn contains_any(text: &str, keys: &[String]) -> bool {
    keys.iter().any(|key| text.contains(key.as_str()))
}

/// Include-then-exclude decision
///
/// A message alerts only if it contains a filter key and no ignore key.
/// Exclusion always wins.
pub fn should_alert(policy: &RoutingPolicy, text: &str) -> bool {
    contains_any(text, &policy.filter_keys) && !contains_any(text, &policy.ignore_keys)
}

/// Whether the alert mentions everyone
///
/// An explicit recipient list always suppresses the mention of everyone.
pub fn is_at_all(policy: &RoutingPolicy, text: &str) -> bool {
    policy.at_mobiles.is_empty() && !contains_any(text, &policy.not_at_keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(filter: &[&str], ignore: &[&str], not_at: &[&str], mobiles: &[&str]) -> RoutingPolicy {
        let owned = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect();
        RoutingPolicy {
            filter_keys: owned(filter),
            ignore_keys: owned(ignore),
            not_at_keys: owned(not_at),
            at_mobiles: owned(mobiles),
            ..Default::default()
        }
    }

    #[test]
    fn test_include_then_exclude() {
        let p = policy(&["ERROR", "FATAL"], &["ignore-me"], &[], &[]);
        assert!(should_alert(&p, "ERROR: disk full"));
        assert!(should_alert(&p, "FATAL crash"));
        assert!(!should_alert(&p, "ERROR ignore-me disk full"));
        assert!(!should_alert(&p, "INFO all good"));
    }

    #[test]
    fn test_no_filter_keys_never_alerts() {
        let p = policy(&[], &[], &[], &[]);
        assert!(!should_alert(&p, "ERROR: disk full"));
    }

    #[test]
    fn test_is_at_all() {
        let p = policy(&["ERROR"], &[], &["quiet"], &[]);
        assert!(is_at_all(&p, "ERROR: disk full"));
        assert!(!is_at_all(&p, "ERROR quiet disk full"));

        let p = policy(&["ERROR"], &[], &[], &["13800000000"]);
        assert!(!is_at_all(&p, "ERROR: disk full"));
    }
}
