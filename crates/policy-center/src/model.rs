use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PolicySnapshot {
    pub rev: u64,
    pub general: GeneralPolicy,
    pub layout: LayoutPolicy,
    pub convergence: ConvergencePolicy,
    pub site_defaults: SiteOverrides,
    #[serde(default)]
    pub sites: Vec<SiteRule>,
    #[serde(default)]
    pub provenance: HashMap<String, PolicyProvenance>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GeneralPolicy {
    pub enabled: bool,
    /// Seconds before a revealed sidebar hides itself again, 0 disables.
    pub autohide_seconds: u64,
    pub ad_scaling_enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LayoutPolicy {
    /// Nominal cell size of one relocated ad.
    pub box_width: u32,
    pub box_height: u32,
    /// Sidebar size when expanded.
    pub max_width: u32,
    pub max_height: u32,
    /// Number of cells visible in the collapsed container.
    pub visible_boxes: u32,
    pub scale_factor: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ConvergencePolicy {
    pub poll_interval_ms: u64,
    pub max_rounds: u32,
    pub empty_refresh_ratio: f64,
    pub min_visible_px: f64,
}

/// Per-site switches for the script error remediation and refresh heuristics.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SiteOverrides {
    pub refresh_third_party_ads: bool,
    pub replay_inline_scripts_on_error: bool,
    pub override_page_ready_hook: bool,
}

/// Site rule matched against the page host (exact host or any subdomain).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteRule {
    pub pattern: String,
    #[serde(default)]
    pub refresh_third_party_ads: Option<bool>,
    #[serde(default)]
    pub replay_inline_scripts_on_error: Option<bool>,
    #[serde(default)]
    pub override_page_ready_hook: Option<bool>,
}

impl SiteRule {
    pub fn apply(&self, base: SiteOverrides) -> SiteOverrides {
        SiteOverrides {
            refresh_third_party_ads: self
                .refresh_third_party_ads
                .unwrap_or(base.refresh_third_party_ads),
            replay_inline_scripts_on_error: self
                .replay_inline_scripts_on_error
                .unwrap_or(base.replay_inline_scripts_on_error),
            override_page_ready_hook: self
                .override_page_ready_hook
                .unwrap_or(base.override_page_ready_hook),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyProvenance {
    pub path: String,
    pub source: PolicySource,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicySource {
    Builtin,
    File,
    Env,
    Cli,
    RuntimeOverride,
}

impl PolicySnapshot {
    pub fn set_provenance(&mut self, path: &str, source: PolicySource) {
        self.provenance.insert(
            path.to_string(),
            PolicyProvenance {
                path: path.to_string(),
                source,
            },
        );
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeOverrideSpec {
    pub path: String,
    pub value: serde_json::Value,
    pub owner: String,
    pub reason: String,
    pub ttl_seconds: u64,
}
