//! Convergence monitor.
//!
//! There is no authoritative "ads finished loading" signal, so the container
//! subtree is sampled on a fixed period. A round is unstable when mutations
//! arrived since the last check, a frame document is still loading, or a
//! candidate box is still empty. After `max_rounds` rounds whatever is there
//! is accepted.

use std::sync::Arc;

use tracing::{debug, info};

use adsidebar_core_types::{FeedId, Phase, TimerId};

use crate::host::{DomHost, FrameReadyState, NodeKind};
use crate::metrics;
use crate::phase;
use crate::session::PageSession;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MonitorStatus {
    #[default]
    Idle,
    Polling,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartReason {
    Mutations,
    FrameLoading,
    EmptyBoxes { empty: usize, candidates: usize },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoundOutcome {
    Restart(RestartReason),
    Stable { forced: bool },
}

#[derive(Debug, Default)]
pub struct ConvergenceMonitor {
    status: MonitorStatus,
    round: u32,
    dirty: bool,
    feed: Option<FeedId>,
    timer: Option<TimerId>,
    rounds_total: u32,
    refresh_calls: u32,
    completions: u32,
    forced_acceptances: u32,
}

impl ConvergenceMonitor {
    pub fn status(&self) -> MonitorStatus {
        self.status
    }

    pub fn is_polling(&self) -> bool {
        self.status == MonitorStatus::Polling
    }

    /// Rounds sampled since the last start.
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn feed(&self) -> Option<FeedId> {
        self.feed
    }

    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn rounds_total(&self) -> u32 {
        self.rounds_total
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls
    }

    pub fn completions(&self) -> u32 {
        self.completions
    }

    pub fn forced_acceptances(&self) -> u32 {
        self.forced_acceptances
    }

    pub(crate) fn note_refresh(&mut self) {
        self.refresh_calls += 1;
        metrics::record_refresh();
    }

    /// Marks the round dirty when `feed` is the monitor's own feed.
    pub(crate) fn note_mutations(&mut self, feed: FeedId) -> bool {
        if self.feed == Some(feed) {
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn stop(&mut self, host: &mut dyn DomHost) {
        if let Some(timer) = self.timer.take() {
            host.clear_timer(timer);
        }
        if let Some(feed) = self.feed.take() {
            host.disconnect(feed);
        }
        self.status = MonitorStatus::Idle;
    }
}

pub(crate) fn start(session: &mut PageSession, host: &mut dyn DomHost) {
    if session.monitor.is_polling() {
        return;
    }
    let Some(root) = session.container.as_ref().map(|c| c.root()) else {
        return;
    };
    let poll_ms = session.policy.convergence.poll_interval_ms;
    session.monitor.feed = Some(host.observe(root));
    session.monitor.timer = Some(host.set_timer(poll_ms));
    session.monitor.status = MonitorStatus::Polling;
    session.monitor.round = 0;
    session.monitor.dirty = false;
    debug!(target: "adsidebar.monitor", page_view = %session.id, poll_ms, "monitor started");
}

/// Reaction to a relocation: start when idle, otherwise push the next round
/// one full period out.
pub(crate) fn kick(session: &mut PageSession, host: &mut dyn DomHost) {
    if session.phase < Phase::AdMonitorStarted {
        return;
    }
    match session.monitor.status {
        MonitorStatus::Idle => start(session, host),
        MonitorStatus::Polling => {
            if let Some(timer) = session.monitor.timer.take() {
                host.clear_timer(timer);
            }
            let poll_ms = session.policy.convergence.poll_interval_ms;
            session.monitor.timer = Some(host.set_timer(poll_ms));
        }
    }
}

/// Returns false when `timer` is not the monitor's.
pub(crate) fn on_timer(session: &mut PageSession, host: &mut dyn DomHost, timer: TimerId) -> bool {
    if session.monitor.timer != Some(timer) {
        return false;
    }
    session.monitor.timer = None;
    match run_round(session, host) {
        RoundOutcome::Restart(reason) => {
            debug!(
                target: "adsidebar.monitor",
                page_view = %session.id,
                round = session.monitor.round,
                ?reason,
                "not settled yet"
            );
            let poll_ms = session.policy.convergence.poll_interval_ms;
            session.monitor.timer = Some(host.set_timer(poll_ms));
        }
        RoundOutcome::Stable { forced } => complete(session, host, forced),
    }
    true
}

/// One sampling round. Never modifies the document apart from the optional
/// third-party refresh.
pub(crate) fn run_round(session: &mut PageSession, host: &mut dyn DomHost) -> RoundOutcome {
    let policy = Arc::clone(&session.policy);
    let cfg = &policy.convergence;

    session.monitor.round += 1;
    session.monitor.rounds_total += 1;
    metrics::record_round();
    let round = session.monitor.round;

    let Some(container) = session.container.as_mut() else {
        return RoundOutcome::Stable { forced: false };
    };

    if round > cfg.max_rounds {
        session.ad_stats.non_empty_box_count = container.scan(host, cfg.min_visible_px);
        return RoundOutcome::Stable { forced: true };
    }

    let pending = session
        .monitor
        .feed
        .map(|feed| host.take_records(feed))
        .unwrap_or(0);
    if pending > 0 {
        session.monitor.dirty = true;
    }
    if session.monitor.dirty {
        session.monitor.dirty = false;
        return RoundOutcome::Restart(RestartReason::Mutations);
    }

    let loading = host
        .descendants_of_kind(container.root(), NodeKind::Frame)
        .into_iter()
        .any(|frame| {
            matches!(host.frame_ready_state(frame), Some(state) if state != FrameReadyState::Complete)
        });
    if loading {
        return RoundOutcome::Restart(RestartReason::FrameLoading);
    }

    let candidates = container.scan(host, cfg.min_visible_px);
    let empty = container.empty_boxes(host, cfg.min_visible_px).len();
    session.ad_stats.non_empty_box_count = candidates;
    session.ad_stats.empty_box_count = empty;
    if empty > 0 {
        maybe_refresh(session, host, empty, candidates);
        return RoundOutcome::Restart(RestartReason::EmptyBoxes { empty, candidates });
    }

    RoundOutcome::Stable { forced: false }
}

/// Asks the third-party ad API to refill slots when a large share of the
/// candidates stayed empty. At most once per round.
fn maybe_refresh(session: &mut PageSession, host: &mut dyn DomHost, empty: usize, candidates: usize) {
    if candidates == 0 {
        return;
    }
    let ratio = empty as f64 / candidates as f64;
    if ratio < session.policy.convergence.empty_refresh_ratio {
        return;
    }
    if session.script_error || !session.site.refresh_third_party_ads {
        return;
    }
    if !host.has_ad_refresh_api() {
        return;
    }
    if host.refresh_third_party_ads() {
        session.monitor.note_refresh();
        info!(
            target: "adsidebar.monitor",
            page_view = %session.id,
            empty,
            candidates,
            "requested third-party ad refresh"
        );
    }
}

fn complete(session: &mut PageSession, host: &mut dyn DomHost, forced: bool) {
    let policy = Arc::clone(&session.policy);
    let min_visible = policy.convergence.min_visible_px;
    let rounds = session.monitor.round;

    session.monitor.round = 0;
    session.monitor.stop(host);
    session.monitor.completions += 1;
    if forced {
        session.monitor.forced_acceptances += 1;
        metrics::record_forced_acceptance();
    }

    let expanded = session.sidebar.is_expanded();
    let Some(container) = session.container.as_mut() else {
        return;
    };
    container.strip_frame_positioning(host);
    container.apply_styles(
        host,
        &policy.layout,
        expanded,
        policy.general.ad_scaling_enabled,
    );
    container.hide_non_candidates(host);
    let empties = container.empty_boxes(host, min_visible);
    container.hide_boxes(host, &empties);
    let previous_last_box = container.refresh_last_visible_box(host);
    let non_empty = container.entries().len();

    session.ad_stats.non_empty_box_count = non_empty;
    session.ad_stats.empty_box_count = empties.len();
    let confirmed = non_empty.saturating_sub(empties.len());
    info!(
        target: "adsidebar.monitor",
        page_view = %session.id,
        rounds,
        forced,
        candidates = non_empty,
        empty = empties.len(),
        confirmed,
        "relocated content settled"
    );
    phase::monitor_settled(session, host, confirmed, previous_last_box);
}
