//! Decoder boundary.
//!
//! The H.264 decoding itself lives outside this crate. A [`DecoderFactory`]
//! hands out one [`DecoderAdapter`] per stream session; the adapter is created
//! and initialized on the owning thread and then driven exclusively by the
//! network thread, so implementations must be `Send` but never need to be
//! `Sync`.

pub mod echo;
#[cfg(feature = "native")]
pub mod native;

use thiserror::Error;

use crate::session::Resolution;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
    #[error("decoder init failed with status {0}")]
    Init(i32),
    #[error("decoder rejected input with status {0}")]
    Submit(i32),
    #[error("decoder output failed: {0}")]
    Output(String),
    #[error("decoder used after release")]
    Released,
}

pub trait DecoderAdapter: Send {
    fn init(&mut self, resolution: Resolution) -> Result<(), DecoderError>;

    fn submit(&mut self, data: &[u8]) -> Result<(), DecoderError>;

    /// Writes one decoded NV12 picture into `out`. `Ok(false)` means the
    /// decoder has nothing to emit yet, which is normal while it warms up.
    fn try_get_output(&mut self, out: &mut [u8]) -> Result<bool, DecoderError>;

    /// Frees the underlying decoder. Called at most once per adapter.
    fn release(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self) -> Result<Box<dyn DecoderAdapter>, DecoderError>;
}

/// Checks a picture size reported by the decoder against the output buffer
/// sized from the sender's declared resolution. A size the decoder cannot
/// report yet (`None` or zero) is accepted.
pub fn check_output_size(reported: Option<Resolution>, out_len: usize) -> Result<(), DecoderError> {
    match reported {
        Some(size) if size.luma_len() > 0 && size.frame_len() != out_len => Err(DecoderError::Output(
            format!("decoder produced {size} but the frame declared {out_len} bytes"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_size_must_match_declared_frame() {
        let declared = Resolution::new(64, 32).frame_len();
        assert!(check_output_size(Some(Resolution::new(64, 32)), declared).is_ok());
        assert!(check_output_size(None, declared).is_ok());
        assert!(check_output_size(Some(Resolution::new(0, 0)), declared).is_ok());
        assert!(matches!(
            check_output_size(Some(Resolution::new(128, 32)), declared),
            Err(DecoderError::Output(_))
        ));
    }
}
