//! Consistency checks run on every loaded or overridden snapshot.

use crate::errors::PolicyError;
use crate::model::{PolicySnapshot, SiteRule};

impl PolicySnapshot {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.convergence.poll_interval_ms == 0 {
            return Err(invalid("convergence.poll_interval_ms must be positive"));
        }
        if self.convergence.max_rounds == 0 {
            return Err(invalid("convergence.max_rounds must be at least 1"));
        }
        if self.layout.box_width == 0 || self.layout.box_height == 0 {
            return Err(invalid("layout box size must be positive"));
        }
        if self.layout.visible_boxes == 0 {
            return Err(invalid("layout.visible_boxes must be at least 1"));
        }
        for (index, rule) in self.sites.iter().enumerate() {
            check_pattern(rule).map_err(|reason| {
                invalid(&format!("sites[{index}] `{}` {reason}", rule.pattern))
            })?;
        }
        Ok(())
    }
}

/// Patterns are bare host names, optionally prefixed with `*.`.
fn check_pattern(rule: &SiteRule) -> Result<(), &'static str> {
    let host = rule.pattern.trim();
    let host = host.strip_prefix("*.").unwrap_or(host);
    if host.is_empty() {
        return Err("is empty");
    }
    if host.contains("://") {
        return Err("carries a scheme");
    }
    if host.contains('/') {
        return Err("carries a path");
    }
    if host.chars().any(char::is_whitespace) {
        return Err("contains whitespace");
    }
    if host.starts_with('.') || host.ends_with('.') || host.contains("..") {
        return Err("has an empty label");
    }
    Ok(())
}

fn invalid(reason: &str) -> PolicyError {
    PolicyError::InvalidValue(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::default_snapshot;

    fn site(pattern: &str) -> SiteRule {
        SiteRule {
            pattern: pattern.into(),
            refresh_third_party_ads: Some(true),
            replay_inline_scripts_on_error: None,
            override_page_ready_hook: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(default_snapshot().validate().is_ok());
    }

    #[test]
    fn zero_interval_and_budget_are_rejected() {
        let mut snapshot = default_snapshot();
        snapshot.convergence.poll_interval_ms = 0;
        assert!(matches!(
            snapshot.validate(),
            Err(PolicyError::InvalidValue(_))
        ));

        let mut snapshot = default_snapshot();
        snapshot.convergence.max_rounds = 0;
        assert!(snapshot.validate().is_err());

        let mut snapshot = default_snapshot();
        snapshot.layout.visible_boxes = 0;
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn site_patterns_must_be_host_names() {
        for bad in [
            "",
            "*.",
            "https://example.com",
            "example.com/ads",
            "ex ample.com",
            ".example.com",
            "a..b",
        ] {
            let mut snapshot = default_snapshot();
            snapshot.sites.push(site(bad));
            assert!(snapshot.validate().is_err(), "{bad:?} accepted");
        }
        for good in ["example.com", "*.example.org", " news.example.net "] {
            let mut snapshot = default_snapshot();
            snapshot.sites.push(site(good));
            assert!(snapshot.validate().is_ok(), "{good:?} rejected");
        }
    }
}
