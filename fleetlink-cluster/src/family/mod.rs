//! Worker families: membership, load balancing, residence and client placement

mod capability;
#[allow(clippy::module_inception)]
mod family;
mod load_balancer;
mod registry;
mod residence;
pub(crate) mod worker;

pub use capability::{Selectable, UnregisterReason, WorkerLifecycle, WorkerPool};
pub use family::Family;
pub use load_balancer::{compare, least_connection, weighted_least_connection, Load, LoadBalancer};
pub use registry::FamilyRegistry;
pub use residence::{Residence, ResidenceBook, ResidentSelector};
pub use worker::{Worker, WorkerSpec};
