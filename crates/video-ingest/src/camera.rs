//! OpenCV-backed capture devices.

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    source::{FrameSource, SourceOptions},
    types::{CaptureError, Frame},
};

pub struct OpenCvCamera {
    label: String,
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
    target: (i32, i32),
}

impl OpenCvCamera {
    pub fn open(index: u32, options: &SourceOptions) -> Result<Self, CaptureError> {
        let label = format!("/dev/video{index}");
        let mut cap = open_video_capture(index as i32, &label)?;
        let target = (options.width as i32, options.height as i32);
        configure_camera(&mut cap, target, 30.0);
        // Keep only the newest frame in the driver queue.
        let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        Ok(Self {
            label,
            cap: Some(cap),
            frame: Mat::default(),
            scratch: Mat::default(),
            target,
        })
    }
}

impl FrameSource for OpenCvCamera {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let Some(cap) = self.cap.as_mut() else {
            return Err(CaptureError::EndOfStream);
        };
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !grabbed || size.width <= 0 {
            return Err(CaptureError::Read(format!("{} returned an empty frame", self.label)));
        }

        let (target_w, target_h) = self.target;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Read(e.to_string()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Read(e.to_string()))?
            .to_vec();
        Frame::from_bgr(data, target_w as u32, target_h as u32)
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(err) = cap.release() {
                warn!(device = %self.label, error = %err, "failed to release capture device");
            }
            debug!(device = %self.label, "capture device released");
        }
    }

    fn describe(&self) -> &str {
        &self.label
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_video_capture(index: i32, label: &str) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(index, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!(device = index, backend, error = %err, "backend failed to open device");
            }
        }
    }

    Err(CaptureError::Open {
        uri: label.to_string(),
    })
}

/// Prefer MJPG, then YUYV, then apply resolution and rate.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mjpg_set = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G')
        .ok()
        .map(|mjpg| matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)))
        .unwrap_or(false);
    if !mjpg_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
