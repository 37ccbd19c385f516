//! Per-site override resolution.

use url::Url;

use crate::model::{PolicySnapshot, SiteOverrides, SiteRule};

impl PolicySnapshot {
    /// Overrides for the page at `location`. The first rule whose pattern equals
    /// the host, or is a parent domain of it, wins; otherwise the site defaults.
    pub fn site_overrides(&self, location: &str) -> SiteOverrides {
        let host = match Url::parse(location) {
            Ok(url) => url.host_str().map(|h| h.to_ascii_lowercase()),
            Err(_) => None,
        };
        let Some(host) = host else {
            return self.site_defaults;
        };
        self.sites
            .iter()
            .find(|rule| rule_matches(rule, &host))
            .map(|rule| rule.apply(self.site_defaults))
            .unwrap_or(self.site_defaults)
    }
}

fn rule_matches(rule: &SiteRule, host: &str) -> bool {
    let pattern = rule.pattern.trim().trim_start_matches("*.").to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    host == pattern
        || host
            .strip_suffix(pattern.as_str())
            .map(|rest| rest.ends_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::default_snapshot;

    fn rule(pattern: &str) -> SiteRule {
        SiteRule {
            pattern: pattern.into(),
            refresh_third_party_ads: Some(true),
            replay_inline_scripts_on_error: None,
            override_page_ready_hook: Some(true),
        }
    }

    #[test]
    fn subdomains_match_parent_rule() {
        let mut snapshot = default_snapshot();
        snapshot.sites.push(rule("example.com"));

        let resolved = snapshot.site_overrides("https://news.example.com/article");
        assert!(resolved.refresh_third_party_ads);
        assert!(resolved.override_page_ready_hook);
        assert!(!resolved.replay_inline_scripts_on_error);
    }

    #[test]
    fn lookalike_hosts_do_not_match() {
        let mut snapshot = default_snapshot();
        snapshot.sites.push(rule("example.com"));

        let resolved = snapshot.site_overrides("https://badexample.com/");
        assert_eq!(resolved, snapshot.site_defaults);
    }

    #[test]
    fn unparsable_location_falls_back_to_defaults() {
        let mut snapshot = default_snapshot();
        snapshot.site_defaults.replay_inline_scripts_on_error = true;
        snapshot.sites.push(rule("example.com"));

        let resolved = snapshot.site_overrides("not a url");
        assert!(resolved.replay_inline_scripts_on_error);
        assert!(!resolved.refresh_third_party_ads);
    }
}
