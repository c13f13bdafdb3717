//! Hardware layer.
//!
//! Transport traits, the servo-chain controller, the oscilloscope sampler
//! and the simulated rig used by tests and dry runs.

pub mod bus;
pub mod mock;
pub mod scope;
pub mod servo;

pub use bus::{ActuatorBus, InstrumentIo};
pub use mock::{MockBus, MockScopeIo, SimulatedRig};
pub use scope::ScopeSampler;
pub use servo::{AxisState, ServoController};
