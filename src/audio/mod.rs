//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{AudioFrame, JitterBuffer, JitterStats, SampleRing};
pub use capture::AudioCapture;
pub use device::{find_device, list_devices, AudioDeviceInfo, Direction};
pub use playback::AudioPlayback;
