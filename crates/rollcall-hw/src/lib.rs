//! rollcall-hw: camera acquisition for the attendance kiosk.
//!
//! Opens a V4L2 capture device, negotiates a pixel format and hands out
//! RGB frames. The device is released when the `Camera` is dropped.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
