use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DecoderAdapter, DecoderError, DecoderFactory};
use crate::session::Resolution;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    released: AtomicU64,
    submitted: AtomicU64,
}

/// Decoder stand-in that needs no native library.
///
/// After `warmup` submitted frames it emits one picture per submitted frame,
/// filled by repeating the bytes of the most recent input. Empty input is
/// rejected the way a real decoder rejects a zero-length sample.
#[derive(Debug, Clone, Default)]
pub struct EchoFactory {
    warmup: u64,
    fail_init: bool,
    fail_output: bool,
    counters: Arc<Counters>,
}

impl EchoFactory {
    pub fn new(warmup: u64) -> Self {
        Self {
            warmup,
            ..Self::default()
        }
    }

    /// Every decoder this factory creates fails `init`.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Every decoder this factory creates accepts input but errors when asked
    /// for a picture.
    pub fn failing_output(mut self) -> Self {
        self.fail_output = true;
        self
    }

    pub fn created(&self) -> u64 {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Frames submitted across every decoder from this factory.
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::SeqCst)
    }
}

impl DecoderFactory for EchoFactory {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn create(&self) -> Result<Box<dyn DecoderAdapter>, DecoderError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EchoDecoder {
            warmup: self.warmup,
            fail_init: self.fail_init,
            fail_output: self.fail_output,
            counters: self.counters.clone(),
            resolution: None,
            last_input: Vec::new(),
            submitted: 0,
            emitted: 0,
            released: false,
        }))
    }
}

pub struct EchoDecoder {
    warmup: u64,
    fail_init: bool,
    fail_output: bool,
    counters: Arc<Counters>,
    resolution: Option<Resolution>,
    last_input: Vec<u8>,
    submitted: u64,
    emitted: u64,
    released: bool,
}

impl DecoderAdapter for EchoDecoder {
    fn init(&mut self, resolution: Resolution) -> Result<(), DecoderError> {
        if self.fail_init {
            return Err(DecoderError::Init(-1));
        }
        self.resolution = Some(resolution);
        Ok(())
    }

    fn submit(&mut self, data: &[u8]) -> Result<(), DecoderError> {
        if self.released {
            return Err(DecoderError::Released);
        }
        if self.resolution.is_none() {
            return Err(DecoderError::Unavailable("decoder not initialized".into()));
        }
        if data.is_empty() {
            return Err(DecoderError::Submit(-1));
        }
        self.last_input.clear();
        self.last_input.extend_from_slice(data);
        self.submitted += 1;
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_get_output(&mut self, out: &mut [u8]) -> Result<bool, DecoderError> {
        if self.released {
            return Err(DecoderError::Released);
        }
        if self.fail_output {
            return Err(DecoderError::Output("echo output disabled".into()));
        }
        if self.submitted <= self.warmup || self.emitted >= self.submitted {
            return Ok(false);
        }
        for (slot, byte) in out.iter_mut().zip(self.last_input.iter().cycle()) {
            *slot = *byte;
        }
        self.emitted += 1;
        Ok(true)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}
