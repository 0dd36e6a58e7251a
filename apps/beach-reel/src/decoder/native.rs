//! Binding to the platform H.264 decoder library (`MFh264Decoder`).
//!
//! The library keeps a single decoder in process-global state, so at most one
//! adapter may be alive at a time; further `create` calls fail with
//! [`DecoderError::Unavailable`] until the live one is released.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{DecoderAdapter, DecoderError, DecoderFactory, check_output_size};
use crate::session::Resolution;

#[link(name = "MFh264Decoder")]
unsafe extern "C" {
    fn InitializeDecoder(width: i32, height: i32) -> i32;
    fn SubmitInputToDecoder(data: *const u8, len: i32) -> i32;
    // Win32 BOOL, not a C99 bool.
    fn GetOutputFromDecoder(out: *mut u8, len: i32) -> i32;
    fn GetFrameWidth() -> i32;
    fn GetFrameHeight() -> i32;
    fn ReleaseDecoder();
}

static IN_USE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFactory;

impl DecoderFactory for NativeFactory {
    fn name(&self) -> &'static str {
        "native"
    }

    fn create(&self) -> Result<Box<dyn DecoderAdapter>, DecoderError> {
        if IN_USE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DecoderError::Unavailable(
                "native decoder supports a single live session".into(),
            ));
        }
        Ok(Box::new(NativeDecoder {
            initialized: false,
            released: false,
        }))
    }
}

pub struct NativeDecoder {
    initialized: bool,
    released: bool,
}

impl NativeDecoder {
    /// Size of the picture the library is currently producing.
    fn frame_size(&self) -> Option<Resolution> {
        if !self.initialized || self.released {
            return None;
        }
        let (width, height) = unsafe { (GetFrameWidth(), GetFrameHeight()) };
        match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => Some(Resolution::new(w, h)),
            _ => None,
        }
    }
}

impl DecoderAdapter for NativeDecoder {
    fn init(&mut self, resolution: Resolution) -> Result<(), DecoderError> {
        let width = i32::try_from(resolution.width).map_err(|_| DecoderError::Init(-1))?;
        let height = i32::try_from(resolution.height).map_err(|_| DecoderError::Init(-1))?;
        let status = unsafe { InitializeDecoder(width, height) };
        if status != 0 {
            return Err(DecoderError::Init(status));
        }
        self.initialized = true;
        Ok(())
    }

    fn submit(&mut self, data: &[u8]) -> Result<(), DecoderError> {
        if self.released {
            return Err(DecoderError::Released);
        }
        let len = i32::try_from(data.len()).map_err(|_| DecoderError::Submit(-1))?;
        let status = unsafe { SubmitInputToDecoder(data.as_ptr(), len) };
        if status != 0 {
            return Err(DecoderError::Submit(status));
        }
        Ok(())
    }

    fn try_get_output(&mut self, out: &mut [u8]) -> Result<bool, DecoderError> {
        if self.released {
            return Err(DecoderError::Released);
        }
        let len = i32::try_from(out.len())
            .map_err(|_| DecoderError::Output(format!("output buffer too large: {}", out.len())))?;
        let produced = unsafe { GetOutputFromDecoder(out.as_mut_ptr(), len) };
        if produced == 0 {
            return Ok(false);
        }
        // A picture whose real size disagrees with the declared one would be
        // split into the wrong planes.
        check_output_size(self.frame_size(), out.len())?;
        Ok(true)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        if self.initialized {
            unsafe { ReleaseDecoder() };
        }
        self.released = true;
        IN_USE.store(false, Ordering::Release);
    }
}

impl Drop for NativeDecoder {
    fn drop(&mut self) {
        self.release();
    }
}
