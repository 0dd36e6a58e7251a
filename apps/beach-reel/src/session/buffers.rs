use super::Resolution;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub scratch: usize,
    pub luma: usize,
    pub chroma: usize,
}

/// Reusable decode buffers for one stream.
///
/// The scratch buffer receives the decoder's NV12 output (luma followed by
/// interleaved chroma); `split` copies the two planes into their own buffers.
/// Buffers grow to fit the largest resolution seen and never shrink, so a
/// stream of same-sized frames allocates once.
#[derive(Debug, Default)]
pub struct FrameBufferPool {
    scratch: Vec<u8>,
    luma: Vec<u8>,
    chroma: Vec<u8>,
    grow_count: u64,
}

impl FrameBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution(resolution: Resolution) -> Self {
        let mut pool = Self::new();
        pool.ensure(resolution);
        pool
    }

    /// Grows any undersized buffer. Returns true if something was reallocated.
    pub fn ensure(&mut self, resolution: Resolution) -> bool {
        let scratch = grow(&mut self.scratch, resolution.frame_len());
        let luma = grow(&mut self.luma, resolution.luma_len());
        let chroma = grow(&mut self.chroma, resolution.chroma_len());
        let grew = scratch || luma || chroma;
        if grew {
            self.grow_count += 1;
        }
        grew
    }

    /// Scratch space for exactly one frame at `resolution`.
    pub fn output_mut(&mut self, resolution: Resolution) -> &mut [u8] {
        self.ensure(resolution);
        &mut self.scratch[..resolution.frame_len()]
    }

    /// Copies the luma prefix and chroma suffix of the scratch buffer into the
    /// plane buffers and returns them, trimmed to `resolution`.
    pub fn split(&mut self, resolution: Resolution) -> (&[u8], &[u8]) {
        self.ensure(resolution);
        let luma_len = resolution.luma_len();
        let chroma_len = resolution.chroma_len();
        self.luma[..luma_len].copy_from_slice(&self.scratch[..luma_len]);
        self.chroma[..chroma_len].copy_from_slice(&self.scratch[luma_len..luma_len + chroma_len]);
        (&self.luma[..luma_len], &self.chroma[..chroma_len])
    }

    pub fn sizes(&self) -> BufferSizes {
        BufferSizes {
            scratch: self.scratch.len(),
            luma: self.luma.len(),
            chroma: self.chroma.len(),
        }
    }

    pub fn grow_count(&self) -> u64 {
        self.grow_count
    }
}

fn grow(buf: &mut Vec<u8>, len: usize) -> bool {
    if buf.len() >= len {
        return false;
    }
    buf.resize(len, 0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_nv12_layout() {
        let pool = FrameBufferPool::with_resolution(Resolution::new(640, 480));
        assert_eq!(
            pool.sizes(),
            BufferSizes {
                scratch: 640 * 480 * 3 / 2,
                luma: 640 * 480,
                chroma: 640 * 480 / 2,
            }
        );
    }

    #[test]
    fn grows_but_never_shrinks() {
        let mut pool = FrameBufferPool::with_resolution(Resolution::new(320, 240));
        assert!(pool.ensure(Resolution::new(640, 480)));
        let grown = pool.sizes();
        assert!(!pool.ensure(Resolution::new(160, 120)));
        assert!(!pool.ensure(Resolution::new(640, 480)));
        assert_eq!(pool.sizes(), grown);
        assert_eq!(pool.grow_count(), 2);
    }

    #[test]
    fn split_copies_planes_without_overlap() {
        let resolution = Resolution::new(4, 2);
        let mut pool = FrameBufferPool::new();
        let out = pool.output_mut(resolution);
        assert_eq!(out.len(), 12);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let (luma, chroma) = pool.split(resolution);
        assert_eq!(luma, &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(chroma, &[8, 9, 10, 11]);
    }

    #[test]
    fn split_after_shrink_stays_in_bounds() {
        let mut pool = FrameBufferPool::with_resolution(Resolution::new(64, 64));
        let small = Resolution::new(8, 4);
        pool.output_mut(small).fill(7);
        let (luma, chroma) = pool.split(small);
        assert_eq!(luma.len(), 32);
        assert_eq!(chroma.len(), 16);
        assert!(luma.iter().chain(chroma).all(|b| *b == 7));
        assert_eq!(pool.sizes().luma, 64 * 64);
    }
}
