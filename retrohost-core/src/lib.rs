//! retrohost-core: a host-side libretro runtime.
//!
//! This crate loads an emulation core (a dynamic library implementing the
//! libretro C ABI), negotiates capabilities with it, and pumps it one frame
//! at a time, turning whatever the core emits into host-consumable data:
//!
//! - video frames are copied out of core memory and normalized into
//!   contiguous, format-tagged buffers (`crate::video`);
//! - audio batches are relayed synchronously to an [`AudioSink`]
//!   (`crate::audio`);
//! - input queries are answered from a per-tick snapshot of an
//!   [`InputSource`] (`crate::input`).
//!
//! The [`Session`] drives the strict lifecycle
//! `load -> negotiate -> load_content -> tick.. -> unload`; see
//! `crate::session` for the state machine and `crate::environment` for the
//! command protocol cores use to talk back to the host.
//!
//! What this crate is *not*: a renderer, an audio device, an input reader, or
//! a content catalog. Those are collaborators behind the [`AudioSink`] /
//! [`InputSource`] traits and the polled [`FrameSlot`]; ticks come from
//! whatever timer the embedder runs.
//!
//! The C-side types and constants come from `libretro-sys`, re-exported as
//! [`sys`] so embedders can name device and button ids without an extra
//! dependency.

mod audio;
mod callbacks;
mod environment;
mod input;
mod loader;
mod module;
mod options;
mod session;
mod state;
mod video;

pub use libretro_sys as sys;

pub use audio::{AudioSink, NullAudio};
pub use input::{InputId, InputSnapshot, InputSource, NullInput};
pub use loader::ModuleLoadError;
pub use options::CoreOption;
pub use session::{
    Capabilities, ContentError, CoreState, Geometry, Session, SessionConfig, StateError,
    TickError, Timing,
};
pub use video::{
    FrameBuffer, FrameDescriptor, FrameError, FrameSlot, PixelFormat, convert_frame,
};
