use adsidebar_core_types::PageViewId;
use adsidebar_registry::RegistryError;
use thiserror::Error;

/// API level failures. Page-level trouble (dead nodes, failed loads, an
/// exhausted round budget) is recovered inside the engine and never surfaces
/// here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown page view {0}")]
    UnknownPageView(PageViewId),
    #[error("sidebar not created yet for page view {0}")]
    SidebarNotReady(PageViewId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("metrics encoding failed: {0}")]
    Metrics(String),
}
