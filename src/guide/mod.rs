//! Virtual-mechanism blending: the mechanisms, their handover automata, the manager that blends
//! their forces each control cycle, and the workers that change the bank while the loop runs.

pub mod blend;
pub mod handover;
pub mod interface;
pub mod lifecycle;
pub mod manager;
pub mod mechanism;
pub mod telemetry;
pub mod worker;

pub use interface::GuideSystem;
pub use manager::{Manager, ManagerConfig, MechanismId, MechanismTarget};
pub use mechanism::{GuideMechanism, VirtualMechanism};
