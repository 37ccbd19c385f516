pub mod api;
pub mod defaults;
pub mod errors;
pub mod loader;
pub mod model;
pub mod override_store;
pub mod sites;
pub mod validation;

pub use api::{InMemoryPolicyCenter, PolicyCenter, PolicyGuard};
pub use defaults::default_snapshot;
pub use errors::PolicyError;
pub use loader::{load_snapshot, PolicyLoader};
pub use model::{
    ConvergencePolicy, GeneralPolicy, LayoutPolicy, PolicySnapshot, PolicySource,
    RuntimeOverrideSpec, SiteOverrides, SiteRule,
};

#[cfg(test)]
mod tests;
