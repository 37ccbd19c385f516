//! AdSidebar relocation engine
//!
//! Elements a content blocker would remove are relocated into a sidebar
//! container, replayed in order after the page loads, and revealed once the
//! relocated content has stopped changing.

pub mod container;
pub mod controller;
pub mod errors;
pub mod events;
pub mod host;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod observer;
pub mod phase;
pub mod remediation;
pub mod replay;
pub mod session;
pub mod sidebar;
pub mod sim;

pub use controller::AdSidebar;
pub use errors::EngineError;
pub use events::SidebarEvent;
pub use host::{DomHost, FrameReadyState, NodeKind, SettleOutcome, Size};
pub use model::{AdEntry, AdLoadStats, PendingItem, ReplayStats, ScriptDescriptor, SessionStats};
pub use session::PageSession;

pub use adsidebar_core_types::{
    FilterKind, Hit, NodeId, PageViewId, Phase, PolicyDecision, SidebarError, Verdict,
};
