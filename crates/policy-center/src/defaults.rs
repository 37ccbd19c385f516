use crate::model::{
    ConvergencePolicy, GeneralPolicy, LayoutPolicy, PolicySnapshot, SiteOverrides,
};

pub fn default_snapshot() -> PolicySnapshot {
    PolicySnapshot {
        rev: 1,
        general: GeneralPolicy {
            enabled: true,
            autohide_seconds: 0,
            ad_scaling_enabled: true,
        },
        layout: LayoutPolicy {
            box_width: 200,
            box_height: 200,
            max_width: 800,
            max_height: 600,
            visible_boxes: 3,
            scale_factor: 0.5,
        },
        convergence: ConvergencePolicy {
            poll_interval_ms: 1_000,
            max_rounds: 5,
            empty_refresh_ratio: 0.5,
            min_visible_px: 15.0,
        },
        site_defaults: SiteOverrides {
            refresh_third_party_ads: false,
            replay_inline_scripts_on_error: false,
            override_page_ready_hook: false,
        },
        sites: Vec::new(),
        provenance: Default::default(),
    }
}
