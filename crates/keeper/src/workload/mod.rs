//! Synthetic load generation: compute backends, the per-device generator
//! loop, and the fleet that owns one generator per target device.

pub mod backend;
pub mod fleet;
pub mod generator;

pub use backend::ComputeBackend;
pub use fleet::DeviceFleet;
pub use generator::{GeneratorState, GeneratorStatus, LoadGenerator};
