pub mod device;
pub mod frame;
pub mod scheduler;

pub use device::{CompletionResult, FrameCompletion, OutputDevice, SimulatedOutput};
pub use frame::{OutputFrame, WireFormat};
pub use scheduler::{OutputScheduler, OutputState};
