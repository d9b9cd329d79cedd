//! Audio hand-off between capture and the gate, plus optional cpal devices.

pub mod channel;
#[cfg(feature = "device-audio")]
pub mod device;

pub use channel::{AudioChannel, PushOutcome, Pull};
