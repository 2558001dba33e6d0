//! Route planning and the artifacts it produces

pub mod hosts;
pub mod planner;
pub mod resolve;
pub mod route;

pub use hosts::{HostsEntry, HostsManager};
pub use planner::{DesiredState, plan};
pub use resolve::{Resolve, SystemResolver};
pub use route::{ActiveRoute, RouteOrigin, RouteSource, RouteTarget};
