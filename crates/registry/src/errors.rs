use adsidebar_core_types::PageViewId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("page view {0} already registered")]
    AlreadyRegistered(PageViewId),
}
