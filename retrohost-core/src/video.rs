//! Video frame normalization for retrohost-core.
//!
//! A core hands the host one raw frame per run call: a pointer into memory it
//! owns, plus width/height, a pitch (bytes per row, possibly padded), and the
//! pixel encoding negotiated earlier through the environment callback. That
//! memory is only valid for the duration of the video callback, so the host
//! copies the pixels out into a contiguous, host-owned buffer before
//! returning.
//!
//! Copy policy, with `row_bytes = width * bytes_per_pixel`:
//! - `pitch == row_bytes`: one bulk copy of `height * pitch` bytes.
//! - `pitch > row_bytes`: copy `row_bytes` from each row, dropping the
//!   padding the core left at the end of every row.
//! - `pitch < row_bytes`: invalid geometry, the frame is rejected.
//!
//! A rejected frame never disturbs the previously published buffer; the
//! presentation side keeps showing the last good frame. Rejections are logged
//! once per cause rather than per frame.
//!
//! Colorspace is untouched here: the normalized buffer keeps the negotiated
//! encoding, and converting 0RGB1555/RGB565/XRGB8888 to a display format is
//! the renderer's job.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Pixel encodings a core may negotiate via `ENVIRONMENT_SET_PIXEL_FORMAT`.
///
/// The discriminants are the libretro wire values.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    /// Packed 15-bit RGB, high bit unused (2 bytes per pixel).
    Argb1555 = 0,
    /// Packed 32-bit RGB, high byte unused (4 bytes per pixel).
    Xrgb8888 = 1,
    /// Packed 16-bit RGB (2 bytes per pixel).
    Rgb565 = 2,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Argb1555 | PixelFormat::Rgb565 => 2,
            PixelFormat::Xrgb8888 => 4,
        }
    }

    /// Map a raw wire value to a known encoding.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            x if x == PixelFormat::Argb1555 as u32 => Some(PixelFormat::Argb1555),
            x if x == PixelFormat::Xrgb8888 as u32 => Some(PixelFormat::Xrgb8888),
            x if x == PixelFormat::Rgb565 as u32 => Some(PixelFormat::Rgb565),
            _ => None,
        }
    }
}

/// One raw frame as delivered by the core's video callback.
///
/// Borrowed: the pixel bytes belong to the core and are only valid while the
/// callback is on the stack. [`convert_frame`] copies everything it needs.
#[derive(Clone, Copy, Debug)]
pub struct FrameDescriptor<'a> {
    /// `height * pitch` bytes of source pixels.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per source row, including any trailing padding.
    pub pitch: usize,
    /// Raw pixel-format wire value (see [`PixelFormat::from_raw`]).
    pub format: u32,
}

/// Host-owned, contiguous copy of a frame, ready for presentation.
///
/// `bytes.len()` is always `width * height * format.bytes_per_pixel()`; there
/// is no row padding in a normalized buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes: Vec<u8>,
}

impl FrameBuffer {
    /// Bytes per row of the normalized buffer.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// Errors from frame normalization.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame geometry: {width}x{height} with pitch {pitch} (row is {row_bytes} bytes)")]
    Geometry {
        width: u32,
        height: u32,
        pitch: usize,
        row_bytes: usize,
    },
    #[error("unsupported source pixel format code {code}")]
    UnsupportedFormat { code: u32 },
}

/// Normalize one raw frame into a contiguous host-owned buffer.
///
/// Pure: does not touch any published frame state. Callers that want the
/// keep-last-good-frame behavior go through [`FrameConverter::deliver`].
pub fn convert_frame(desc: &FrameDescriptor<'_>) -> Result<FrameBuffer, FrameError> {
    let format = PixelFormat::from_raw(desc.format)
        .ok_or(FrameError::UnsupportedFormat { code: desc.format })?;

    let row_bytes = (desc.width as usize)
        .checked_mul(format.bytes_per_pixel())
        .unwrap_or(usize::MAX);
    let geometry_err = || FrameError::Geometry {
        width: desc.width,
        height: desc.height,
        pitch: desc.pitch,
        row_bytes,
    };

    if desc.width == 0 || desc.height == 0 || desc.pitch < row_bytes {
        return Err(geometry_err());
    }

    // The descriptor must cover `height` rows of `pitch` bytes.
    let source_len = (desc.height as usize)
        .checked_mul(desc.pitch)
        .ok_or_else(geometry_err)?;
    if desc.data.len() < source_len {
        return Err(geometry_err());
    }

    let height = desc.height as usize;
    let mut bytes = Vec::with_capacity(height * row_bytes);
    if desc.pitch == row_bytes {
        // Contiguous source: single bulk copy.
        bytes.extend_from_slice(&desc.data[..source_len]);
    } else {
        // Padded rows: copy the pixel bytes of each row, skip the padding.
        for row in 0..height {
            let start = row * desc.pitch;
            bytes.extend_from_slice(&desc.data[start..start + row_bytes]);
        }
    }

    Ok(FrameBuffer {
        width: desc.width,
        height: desc.height,
        format,
        bytes,
    })
}

/// Latest-frame handoff cell between the tick thread and a presentation
/// thread.
///
/// The tick thread publishes a fully populated buffer; readers poll
/// [`FrameSlot::latest`] and get a cheap `Arc` clone of whatever was most
/// recently published. A buffer is never replaced until its successor is
/// complete.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<FrameBuffer>>>,
}

impl FrameSlot {
    /// Swap in a new frame, discarding the previous one.
    pub fn publish(&self, frame: FrameBuffer) {
        let mut slot = self.latest.lock().unwrap();
        *slot = Some(Arc::new(frame));
    }

    /// The most recently published frame, if any.
    pub fn latest(&self) -> Option<Arc<FrameBuffer>> {
        self.latest.lock().unwrap().clone()
    }

    /// Drop the published frame (used when the session tears down).
    pub fn clear(&self) {
        let mut slot = self.latest.lock().unwrap();
        *slot = None;
    }
}

/// Stateful conversion front end: normalizes frames, publishes good ones,
/// drops bad ones while keeping the last good frame visible.
#[derive(Default)]
pub(crate) struct FrameConverter {
    warned_geometry: bool,
    warned_format: bool,
}

impl FrameConverter {
    /// Convert and publish one frame. On failure the slot is left untouched
    /// and the cause is logged the first time it occurs.
    pub(crate) fn deliver(&mut self, desc: &FrameDescriptor<'_>, slot: &FrameSlot) {
        match convert_frame(desc) {
            Ok(frame) => slot.publish(frame),
            Err(err @ FrameError::Geometry { .. }) => {
                if !self.warned_geometry {
                    self.warned_geometry = true;
                    tracing::warn!(%err, "dropping video frame; keeping last good frame");
                }
            }
            Err(err @ FrameError::UnsupportedFormat { .. }) => {
                if !self.warned_format {
                    self.warned_format = true;
                    tracing::warn!(%err, "dropping video frame; keeping last good frame");
                }
            }
        }
    }
}
