//! Simulated host used by the integration tests and the `simulate` command.

mod dom;
mod markup;
pub mod scenario;

pub use dom::{FrameBehavior, HostCallback, ScriptBehavior, SimDom};
pub use scenario::{
    run_scenario, Action, BoxReport, HitSpec, Scenario, ScenarioError, ScenarioReport,
    ScenarioRunner, Step,
};
