//! Rendered frames and the per-handle buffer pool.
//!
//! The engine acquires a [`FrameBuffer`] from the handle's [`FramePool`], fills
//! it and hands it to the sink. The bridge lends the pixels to the render
//! callback as a [`Frame`] and returns the buffer to the pool only after the
//! callback has returned.

use parking_lot::Mutex;

pub const BYTES_PER_PIXEL: usize = 4;

/// Largest accepted frame width or height, in pixels.
pub const MAX_FRAME_DIMENSION: u32 = 16_384;

/// Owned RGBA8 pixel storage travelling from the engine to the callback.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(len: usize) -> Self {
        Self { pixels: vec![0; len] }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Address of the first pixel; only meaningful for identity checks.
    pub fn as_ptr(&self) -> *const u8 {
        self.pixels.as_ptr()
    }
}

/// A rendered frame lent to a render callback.
///
/// The pixel slice cannot outlive the callback invocation.
#[derive(Debug, Copy, Clone)]
pub struct Frame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> Frame<'a> {
    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Pixel at `(x, y)` as RGBA.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        let px = self.pixels.get(offset..offset + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// Bytes needed for a `width` x `height` RGBA8 frame, or `None` when either
/// side exceeds [`MAX_FRAME_DIMENSION`].
pub fn frame_len(width: u32, height: u32) -> Option<usize> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return None;
    }
    (width as usize).checked_mul(height as usize)?.checked_mul(BYTES_PER_PIXEL)
}

/// Recycles frame buffers so that steady rendering does not allocate.
pub struct FramePool {
    free: Mutex<Vec<FrameBuffer>>,
    capacity: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new(Vec::with_capacity(capacity)), capacity }
    }

    /// Takes a pooled buffer (or allocates) and sizes it to `len` bytes.
    /// The contents are unspecified; engines overwrite every byte.
    pub fn acquire(&self, len: usize) -> FrameBuffer {
        match self.free.lock().pop() {
            Some(mut buf) => {
                buf.pixels.resize(len, 0);
                buf
            }
            None => FrameBuffer::new(len),
        }
    }

    /// Returns a buffer after its loan ended. Buffers beyond capacity are freed.
    pub fn recycle(&self, buf: FrameBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Buffers currently waiting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn clear(&self) {
        self.free.lock().clear();
    }
}
