//! One-shot repair pass after replay when a script error was recorded.
//!
//! Errors after replay usually mean page code depended on a script that was
//! blocked at first. Depending on per-site switches, inline page scripts are
//! re-run inside the container, the page-ready hook is made immediate and the
//! third-party ad API is asked to refresh.

use tracing::{debug, info};

use crate::host::DomHost;
use crate::model::InlineScript;
use crate::session::PageSession;

/// Returns true when the pass ran. It runs at most once per session.
pub(crate) fn run(session: &mut PageSession, host: &mut dyn DomHost) -> bool {
    if !session.script_error || session.remediated {
        return false;
    }
    session.remediated = true;
    let site = session.site;

    let scripts: Vec<InlineScript> = if site.replay_inline_scripts_on_error {
        let sidebar_root = session.sidebar.root();
        host.inline_scripts()
            .into_iter()
            .filter(|node| {
                sidebar_root
                    .map(|root| !host.contains(root, *node))
                    .unwrap_or(true)
            })
            .filter_map(|node| host.inline_script_source(node))
            .filter(|script| !script.text.trim().is_empty())
            .collect()
    } else {
        Vec::new()
    };

    if site.override_page_ready_hook {
        let replaced = host.override_page_ready_hook();
        debug!(target: "adsidebar.phase", page_view = %session.id, replaced, "page ready hook override");
    }

    for script in &scripts {
        let node = host.create_inline_script(script);
        session.relocate(host, node);
    }

    let mut refreshed = false;
    if site.refresh_third_party_ads && host.has_ad_refresh_api() {
        refreshed = host.refresh_third_party_ads();
        if refreshed {
            session.monitor.note_refresh();
        }
    }

    info!(
        target: "adsidebar.phase",
        page_view = %session.id,
        rerun_scripts = scripts.len(),
        refreshed,
        "script error remediation ran"
    );
    true
}
