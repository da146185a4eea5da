//! Host-side shared state.
//!
//! This module owns the state that bridges the core's C callbacks and the
//! session driving it. The libretro callbacks carry no userdata pointer, so
//! the trampolines in `crate::callbacks` route through a process-wide slot
//! holding the active session's state.
//!
//! Design goals:
//! - Exactly one active host per process; claiming the slot twice fails,
//!   which is also what enforces the one-live-module invariant.
//! - Trampolines take the slot lock only long enough to clone the `Arc`,
//!   then lock the state itself, so a re-entrant environment call during
//!   `retro_init` never deadlocks against the lifecycle.
//! - The lifecycle never holds the state lock across a module entry-point
//!   call.

use std::ffi::CString;
use std::sync::{Arc, Mutex, OnceLock};

use crate::audio::{AudioRelay, AudioSink};
use crate::environment::EnvState;
use crate::input::{InputSource, InputTable};
use crate::session::SessionConfig;
use crate::video::{FrameConverter, FrameSlot};

/// Everything the core's callbacks touch.
pub(crate) struct HostState {
    pub(crate) env: EnvState,
    pub(crate) converter: FrameConverter,
    pub(crate) frames: Arc<FrameSlot>,
    pub(crate) audio: AudioRelay,
    pub(crate) input: InputTable,
}

impl HostState {
    pub(crate) fn new(
        config: &SessionConfig,
        audio: Box<dyn AudioSink>,
        input: Box<dyn InputSource>,
        frames: Arc<FrameSlot>,
    ) -> Self {
        let mut env = EnvState::new(
            path_cstring(config.system_dir.as_deref()),
            path_cstring(config.save_dir.as_deref()),
        );
        for (key, value) in &config.variables {
            env.options.seed(key, value);
        }
        Self {
            env,
            converter: FrameConverter::default(),
            frames,
            audio: AudioRelay::new(audio),
            input: InputTable::new(input),
        }
    }

    /// Fresh negotiation state for a new load; sinks and the frame slot stay.
    pub(crate) fn reset_negotiation(&mut self, config: &SessionConfig) {
        self.env = EnvState::new(
            path_cstring(config.system_dir.as_deref()),
            path_cstring(config.save_dir.as_deref()),
        );
        for (key, value) in &config.variables {
            self.env.options.seed(key, value);
        }
        self.converter = FrameConverter::default();
    }
}

fn path_cstring(path: Option<&std::path::Path>) -> Option<CString> {
    path.and_then(|p| CString::new(p.to_string_lossy().as_bytes()).ok())
}

type Slot = Mutex<Option<Arc<Mutex<HostState>>>>;

static ACTIVE: OnceLock<Slot> = OnceLock::new();

fn slot() -> &'static Slot {
    ACTIVE.get_or_init(|| Mutex::new(None))
}

/// Install a host as the callback target. Fails when another host is live.
pub(crate) fn claim(host: &Arc<Mutex<HostState>>) -> bool {
    let mut active = slot().lock().unwrap();
    if active.is_some() {
        return false;
    }
    *active = Some(Arc::clone(host));
    true
}

/// Release the slot, but only for the host that claimed it.
pub(crate) fn release(host: &Arc<Mutex<HostState>>) {
    let mut active = slot().lock().unwrap();
    if let Some(current) = active.as_ref() {
        if Arc::ptr_eq(current, host) {
            *active = None;
        }
    }
}

/// The currently active host, if any. Trampolines use this and answer with
/// defaults when nothing is active (a stray callback after unload).
pub(crate) fn active() -> Option<Arc<Mutex<HostState>>> {
    slot().lock().unwrap().clone()
}
