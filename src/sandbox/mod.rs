//! Sandbox orchestration: the fleet manager, container provisioning and the
//! background bridge the front end drives long operations through.

#[cfg(test)]
pub(crate) mod fakes;
mod manager;
mod progress;
mod provision;
mod types;

pub use manager::{Manager, validate_name};
pub use progress::{Bridge, Event};
pub use types::{Sandbox, SandboxError, Status};
