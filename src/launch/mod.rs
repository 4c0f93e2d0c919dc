//! Per-stream parameter staging and kernel launch policy.

pub mod coordinator;
pub mod params;

pub use coordinator::LaunchCoordinator;
pub use params::{LaunchParams, ParamTable, SceneConstants, ShaderEvalState, WorkTile};
