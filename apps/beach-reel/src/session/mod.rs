//! Per-stream decoder sessions.

pub mod buffers;
pub mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use buffers::{BufferSizes, FrameBufferPool};
pub use registry::{Lookup, RegistryError, StreamRegistry, StreamState};

use crate::decoder::{DecoderAdapter, DecoderError, DecoderFactory};
use crate::dispatch::{DispatchTask, Dispatcher};
use crate::protocol::StreamId;

/// Largest picture a session accepts unless configured otherwise.
pub const DEFAULT_MAX_RESOLUTION: Resolution = Resolution::new(4096, 4096);

/// Picture size in pixels. Valid resolutions are non-zero and even in both
/// dimensions so the chroma plane is exactly half of each.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Valid and no larger than `max` in either dimension.
    pub fn fits_within(&self, max: Resolution) -> bool {
        self.is_valid() && self.width <= max.width && self.height <= max.height
    }

    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn chroma_len(&self) -> usize {
        self.luma_len() / 2
    }

    pub fn frame_len(&self) -> usize {
        self.luma_len() * 3 / 2
    }

    pub fn chroma(&self) -> Resolution {
        Resolution::new(self.width / 2, self.height / 2)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.parse::<u32>().map_err(|err| format!("invalid width {w:?}: {err}"))?;
        let height = h.parse::<u32>().map_err(|err| format!("invalid height {h:?}: {err}"))?;
        let resolution = Resolution::new(width, height);
        if !resolution.is_valid() {
            return Err(format!("resolution {resolution} must be non-zero and even"));
        }
        Ok(resolution)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created and initialized; no frame decoded yet.
    Ready,
    /// At least one frame decoded.
    Active,
    Released,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid resolution {0}")]
    InvalidResolution(Resolution),
    #[error("failed to open decoder: {0}")]
    Open(#[source] DecoderError),
    #[error("decoder rejected frame: {0}")]
    SubmitFailed(#[source] DecoderError),
    #[error("decoder has no output yet")]
    NoOutputYet,
    #[error("decoder failed to produce output: {0}")]
    DecodeFailed(#[source] DecoderError),
    #[error("session {0} already released")]
    Released(StreamId),
}

impl SessionError {
    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::InvalidResolution(_) => "invalid_resolution",
            SessionError::Open(_) => "open_failed",
            SessionError::SubmitFailed(_) => "submit_failed",
            SessionError::NoOutputYet => "no_output_yet",
            SessionError::DecodeFailed(_) => "decode_failed",
            SessionError::Released(_) => "released",
        }
    }
}

/// One decoder instance bound to one stream id.
///
/// The session owns its decoder and buffers outright; the network thread
/// drives it through [`StreamSession::process_frame`] and everything that
/// touches rendering resources is handed to the dispatcher instead.
pub struct StreamSession {
    id: StreamId,
    decoder: Box<dyn DecoderAdapter>,
    resolution: Resolution,
    max_resolution: Resolution,
    buffers: FrameBufferPool,
    state: SessionState,
    dispatcher: Arc<Dispatcher<DispatchTask>>,
    frames_decoded: u64,
}

impl StreamSession {
    /// Creates and initializes a decoder and sizes the buffers for
    /// `resolution`. Frames larger than `max_resolution` are refused for the
    /// life of the session.
    pub fn open(
        id: StreamId,
        factory: &dyn DecoderFactory,
        resolution: Resolution,
        max_resolution: Resolution,
        dispatcher: Arc<Dispatcher<DispatchTask>>,
    ) -> Result<Self, SessionError> {
        if !resolution.fits_within(max_resolution) {
            return Err(SessionError::InvalidResolution(resolution));
        }
        let mut decoder = factory.create().map_err(SessionError::Open)?;
        if let Err(err) = decoder.init(resolution) {
            decoder.release();
            return Err(SessionError::Open(err));
        }
        tracing::debug!(
            target: "beach_reel::session",
            stream = id,
            %resolution,
            decoder = factory.name(),
            "session opened"
        );
        Ok(Self {
            id,
            decoder,
            resolution,
            max_resolution,
            buffers: FrameBufferPool::with_resolution(resolution),
            state: SessionState::Ready,
            dispatcher,
            frames_decoded: 0,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn buffer_sizes(&self) -> BufferSizes {
        self.buffers.sizes()
    }

    /// Feeds one compressed frame to the decoder and, if a picture comes out,
    /// queues its planes for upload on the owning thread.
    ///
    /// `width`/`height` are the sender's declared size for this frame and win
    /// over whatever the session saw before. On any error the recorded
    /// resolution is left untouched and the frame is simply lost.
    pub fn process_frame(
        &mut self,
        compressed: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Released {
            return Err(SessionError::Released(self.id));
        }
        // Checked before anything is sized from the declared dimensions.
        let resolution = Resolution::new(width, height);
        if !resolution.fits_within(self.max_resolution) {
            return Err(SessionError::InvalidResolution(resolution));
        }

        self.decoder
            .submit(compressed)
            .map_err(SessionError::SubmitFailed)?;

        let produced = self
            .decoder
            .try_get_output(self.buffers.output_mut(resolution))
            .map_err(SessionError::DecodeFailed)?;
        if !produced {
            return Err(SessionError::NoOutputYet);
        }

        let (luma, chroma) = self.buffers.split(resolution);
        let task = DispatchTask::UploadPlanes {
            stream: self.id,
            resolution,
            luma: Bytes::copy_from_slice(luma),
            chroma: Bytes::copy_from_slice(chroma),
        };
        self.dispatcher.enqueue(task);

        if resolution != self.resolution {
            tracing::info!(
                target: "beach_reel::session",
                stream = self.id,
                from = %self.resolution,
                to = %resolution,
                "stream resolution changed"
            );
        }
        self.resolution = resolution;
        self.state = SessionState::Active;
        self.frames_decoded += 1;
        Ok(())
    }

    /// Releases the decoder. Returns false if the session was already released.
    pub fn release(&mut self) -> bool {
        if self.state == SessionState::Released {
            return false;
        }
        self.decoder.release();
        self.buffers = FrameBufferPool::new();
        self.state = SessionState::Released;
        tracing::debug!(
            target: "beach_reel::session",
            stream = self.id,
            frames = self.frames_decoded,
            "session released"
        );
        true
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("resolution", &self.resolution)
            .field("state", &self.state)
            .field("frames_decoded", &self.frames_decoded)
            .finish()
    }
}
