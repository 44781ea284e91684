use crate::types::{CaptureError, Frame};

/// Linear brightness/contrast correction applied to every channel:
/// `out = clamp(contrast * v + brightness, 0, 255)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameAdjust {
    pub brightness: f32,
    pub contrast: f32,
}

impl Default for FrameAdjust {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
        }
    }
}

impl FrameAdjust {
    pub fn new(brightness: f32, contrast: f32) -> Self {
        Self {
            brightness,
            contrast,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0 && self.contrast == 1.0
    }

    /// Returns the corrected frame. The identity adjustment hands back the input untouched.
    pub fn apply(&self, frame: Frame) -> Result<Frame, CaptureError> {
        if self.is_identity() {
            return Ok(frame);
        }
        let lut = self.lookup_table();
        let data = frame.data().iter().map(|&v| lut[v as usize]).collect();
        frame.derive(data, frame.width(), frame.height())
    }

    fn lookup_table(&self) -> [u8; 256] {
        let mut lut = [0u8; 256];
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = (self.contrast * v as f32 + self.brightness)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
        lut
    }
}
