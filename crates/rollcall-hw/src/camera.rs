//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;
const MAX_VIDEO_NODES: u32 = 16;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// A capture-capable node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the kiosk camera may hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    const PREFERENCE: [(PixelFormat, &'static [u8; 4]); 3] = [
        (PixelFormat::Yuyv, b"YUYV"),
        (PixelFormat::Mjpg, b"MJPG"),
        (PixelFormat::Grey, b"GREY"),
    ];

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::PREFERENCE
            .iter()
            .find(|(_, code)| fourcc == FourCC::new(code))
            .map(|(format, _)| *format)
    }
}

/// An open capture device. Closing happens on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") at roughly `width`x`height`.
    ///
    /// The driver may settle on another size; the negotiated one is kept.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("cannot query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::debug!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "camera opened"
        );

        let (pixel_format, width, height) = negotiate(&device, width, height)?;
        tracing::info!(
            device = device_path,
            width,
            height,
            format = ?pixel_format,
            "camera format set"
        );

        Ok(Self {
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Grab one frame and convert it to RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("cannot map buffers: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("cannot dequeue buffer: {e}")))?;

        let (width, height) = (self.width, self.height);
        let (rgb, width, height) = match self.pixel_format {
            PixelFormat::Yuyv => (frame::yuyv_to_rgb(buf, width, height)?, width, height),
            PixelFormat::Grey => (frame::grey_to_rgb(buf, width, height)?, width, height),
            // the JPEG payload is shorter than the mapped buffer
            PixelFormat::Mjpg => {
                let used = (meta.bytesused as usize).min(buf.len());
                frame::mjpeg_to_rgb(&buf[..used])?
            }
        };

        Ok(Frame::from_rgb(rgb, width, height, meta.sequence)?)
    }

    /// Capture-capable `/dev/videoN` nodes.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Ask for each supported format in turn at the requested size and keep
/// the first the driver accepts unchanged.
fn negotiate(
    device: &Device,
    width: u32,
    height: u32,
) -> Result<(PixelFormat, u32, u32), CameraError> {
    let current = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot read format: {e}")))?;

    let mut last = current.fourcc;
    for (wanted, code) in PixelFormat::PREFERENCE {
        let mut fmt = current;
        fmt.fourcc = FourCC::new(code);
        fmt.width = width;
        fmt.height = height;
        let got = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot set format: {e}")))?;
        if PixelFormat::from_fourcc(got.fourcc) == Some(wanted) {
            return Ok((wanted, got.width, got.height));
        }
        last = got.fourcc;
    }

    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offers {last}, need YUYV, MJPG or GREY"
    )))
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}
