//! Audio batch relay for retrohost-core.
//!
//! Cores deliver interleaved stereo i16 PCM through two callbacks: a batch
//! callback (`data`, `frames`) and a single-frame callback (`left`, `right`).
//! Both point at memory that is only valid for the duration of the call, so
//! the relay hands the samples to the [`AudioSink`] synchronously, before
//! returning control to the core.
//!
//! No resampling, mixing, or format conversion happens here. A batch that
//! violates the ABI contract (null sample pointer, sample count that cannot
//! be addressed) is dropped with a warning instead of forwarding garbage;
//! the warning fires once, not per batch.

/// Audio collaborator fed by the relay.
///
/// `samples` is interleaved stereo i16 PCM: `frames * 2` entries, left first.
pub trait AudioSink: Send {
    fn play(&mut self, samples: &[i16], frames: usize);
}

/// Sink that discards everything (headless hosts, tests).
#[derive(Default)]
pub struct NullAudio;

impl AudioSink for NullAudio {
    fn play(&mut self, _samples: &[i16], _frames: usize) {}
}

pub(crate) struct AudioRelay {
    sink: Box<dyn AudioSink>,
    warned_contract: bool,
}

impl AudioRelay {
    pub(crate) fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            warned_contract: false,
        }
    }

    /// Forward one batch to the sink.
    pub(crate) fn deliver(&mut self, samples: &[i16]) {
        debug_assert_eq!(samples.len() % 2, 0);
        let frames = samples.len() / 2;
        if frames == 0 {
            return;
        }
        self.sink.play(samples, frames);
    }

    /// Drop a malformed batch, warning the first time.
    pub(crate) fn reject(&mut self, reason: &str) {
        if !self.warned_contract {
            self.warned_contract = true;
            tracing::warn!(reason, "dropping audio batch that violates the ABI contract");
        }
    }
}
