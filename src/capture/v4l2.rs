//! V4L2 camera source (`camera-v4l2` feature).
//!
//! Opens the device at the calibration resolution in RGB3, applies exposure
//! and gain controls from the runtime params, and anchors the device clock to
//! the pipeline clock at open so capture timestamps are comparable across
//! cameras.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use crate::capture::CameraRuntimeParams;
use crate::config::CameraCalibration;
use crate::frame::pipeline_now;

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_GAIN: u32 = 0x0098_0913;

pub struct V4l2Camera {
    device_path: String,
    state: V4l2State,
    width: u32,
    height: u32,
    /// pipeline-clock seconds minus device-clock seconds, anchored on the
    /// first captured frame.
    clock_offset: Option<f64>,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    pub fn open(
        device_path: &str,
        calibration: &CameraCalibration,
        params: &CameraRuntimeParams,
    ) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = calibration.resolution[0];
        format.height = calibration.resolution[1];
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("failed to set format on {}: {}", device_path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if &format.fourcc.repr != b"RGB3" {
            return Err(anyhow!(
                "{} does not support RGB3 capture (got {})",
                device_path,
                format.fourcc
            ));
        }
        if format.width != calibration.resolution[0] || format.height != calibration.resolution[1] {
            log::warn!(
                "{} capture resolution {}x{} differs from calibration {}x{}",
                device_path,
                format.width,
                format.height,
                calibration.resolution[0],
                calibration.resolution[1]
            );
        }

        if params.target_fps > 0.0 {
            let fps = params.target_fps.round().max(1.0) as u32;
            if let Err(err) = device.set_params(&v4l::video::capture::Parameters::with_fps(fps)) {
                log::warn!("failed to set fps on {}: {}", device_path, err);
            }
        }
        apply_control(&device, device_path, CID_EXPOSURE_AUTO, if params.auto_exposure { 3 } else { 1 });
        if !params.auto_exposure {
            apply_control(
                &device,
                device_path,
                CID_EXPOSURE_ABSOLUTE,
                params.exposure.round() as i64,
            );
        }
        apply_control(&device, device_path, CID_GAIN, params.gain.round() as i64);

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "opened {} at {}x{}",
            device_path,
            format.width,
            format.height
        );
        Ok(Self {
            device_path: device_path.to_string(),
            state,
            width: format.width,
            height: format.height,
            clock_offset: None,
        })
    }

    pub fn read(&mut self) -> Result<(RgbImage, f64)> {
        use v4l::io::traits::CaptureStream;

        let (buf, meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .with_context(|| format!("capture frame from {}", self.device_path))?;
        let expected = (self.width * self.height * 3) as usize;
        if buf.len() < expected {
            return Err(anyhow!(
                "short frame from {}: {} of {} bytes",
                self.device_path,
                buf.len(),
                expected
            ));
        }
        let image = RgbImage::from_raw(self.width, self.height, buf[..expected].to_vec())
            .ok_or_else(|| anyhow!("frame buffer from {} has a bad layout", self.device_path))?;
        let device_seconds =
            meta.timestamp.sec as f64 + meta.timestamp.usec as f64 * 1e-6;
        // Device timestamps are CLOCK_MONOTONIC; translate them into the
        // pipeline clock domain, anchored on the first frame after open.
        let offset = *self
            .clock_offset
            .get_or_insert_with(|| pipeline_now() - device_seconds);
        Ok((image, device_seconds + offset))
    }
}

fn apply_control(device: &v4l::Device, path: &str, id: u32, value: i64) {
    let control = v4l::Control {
        id,
        value: v4l::control::Value::Integer(value),
    };
    if let Err(err) = device.set_control(control) {
        log::warn!("failed to set control {:#x} on {}: {}", id, path, err);
    }
}
