//! The module boundary.
//!
//! [`CoreModule`] is the seam between the lifecycle and the loaded core: a
//! held table of typed entry points rather than anything resembling
//! inheritance. The dylib-backed [`LoadedModule`] is the production
//! implementation; lifecycle tests drive a recording fake through the same
//! trait.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::PathBuf;

use libloading::Library;
use libretro_sys::{
    AudioSampleBatchFn, AudioSampleFn, EnvironmentFn, GameGeometry, GameInfo, InputPollFn,
    InputStateFn, SystemAvInfo, SystemTiming, VideoRefreshFn,
};

use crate::loader::CoreSymbols;
use crate::session::{Geometry, Timing};

/// Content handed to the module's load-content entry point.
pub(crate) struct ContentSource {
    pub(crate) path: PathBuf,
    /// File bytes, read up front unless the module wants a full path only.
    pub(crate) data: Option<Vec<u8>>,
}

/// Operations the lifecycle invokes on a module, in the order it invokes
/// them. Every method maps to exactly one entry point of the C ABI.
pub(crate) trait CoreModule: Send {
    fn install_environment(&mut self, callback: EnvironmentFn);
    fn install_av_callbacks(
        &mut self,
        video: VideoRefreshFn,
        audio_sample: AudioSampleFn,
        audio_batch: AudioSampleBatchFn,
        input_poll: InputPollFn,
        input_state: InputStateFn,
    );
    fn init(&mut self);
    fn deinit(&mut self);
    /// `None` content is the content-less load (`retro_load_game(NULL)`).
    fn load_game(&mut self, content: Option<&ContentSource>) -> bool;
    fn unload_game(&mut self);
    /// Geometry and timing, valid only after a successful content load.
    fn av_info(&mut self) -> (Geometry, Timing);
    fn run(&mut self);
    /// False when the module has no reset entry point.
    fn reset(&mut self) -> bool;
    /// `None` when the module has no serialization support (or reports a
    /// zero snapshot size).
    fn serialize(&mut self) -> Option<Vec<u8>>;
    /// `None` when unsupported; otherwise whether the module accepted it.
    fn unserialize(&mut self, bytes: &[u8]) -> Option<bool>;
}

/// A dylib core behind the [`CoreModule`] seam.
///
/// The library handle and the resolved table are one unit: both live until
/// the module is dropped, and dropping closes the library.
pub(crate) struct LoadedModule {
    symbols: CoreSymbols,
    _lib: Library,
}

impl LoadedModule {
    pub(crate) fn new(lib: Library, symbols: CoreSymbols) -> Self {
        Self { symbols, _lib: lib }
    }
}

impl CoreModule for LoadedModule {
    fn install_environment(&mut self, callback: EnvironmentFn) {
        // SAFETY: entry point resolved from the live library.
        unsafe { (self.symbols.set_environment)(callback) }
    }

    fn install_av_callbacks(
        &mut self,
        video: VideoRefreshFn,
        audio_sample: AudioSampleFn,
        audio_batch: AudioSampleBatchFn,
        input_poll: InputPollFn,
        input_state: InputStateFn,
    ) {
        // SAFETY: entry points resolved from the live library.
        unsafe {
            (self.symbols.set_video_refresh)(video);
            (self.symbols.set_audio_sample)(audio_sample);
            (self.symbols.set_audio_sample_batch)(audio_batch);
            (self.symbols.set_input_poll)(input_poll);
            (self.symbols.set_input_state)(input_state);
        }
    }

    fn init(&mut self) {
        // SAFETY: callbacks are installed before init per the ABI handshake.
        unsafe { (self.symbols.init)() }
    }

    fn deinit(&mut self) {
        // SAFETY: entry point resolved from the live library.
        unsafe { (self.symbols.deinit)() }
    }

    fn load_game(&mut self, content: Option<&ContentSource>) -> bool {
        let Some(content) = content else {
            // SAFETY: NULL game info is the content-less load.
            return unsafe { (self.symbols.load_game)(std::ptr::null()) };
        };

        let Ok(path) = CString::new(content.path.to_string_lossy().as_bytes()) else {
            return false;
        };
        let info = GameInfo {
            path: path.as_ptr(),
            data: content
                .data
                .as_ref()
                .map_or(std::ptr::null(), |d| d.as_ptr() as *const c_void),
            size: content.data.as_ref().map_or(0, Vec::len),
            meta: std::ptr::null(),
        };
        // SAFETY: `info` and the strings it points at outlive this call; the
        // module copies what it keeps.
        unsafe { (self.symbols.load_game)(&info) }
    }

    fn unload_game(&mut self) {
        // SAFETY: entry point resolved from the live library.
        unsafe { (self.symbols.unload_game)() }
    }

    fn av_info(&mut self) -> (Geometry, Timing) {
        let mut raw = SystemAvInfo {
            geometry: GameGeometry {
                base_width: 0,
                base_height: 0,
                max_width: 0,
                max_height: 0,
                aspect_ratio: 0.0,
            },
            timing: SystemTiming {
                fps: 0.0,
                sample_rate: 0.0,
            },
        };
        // SAFETY: the struct outlives the call; the module fills it in.
        unsafe { (self.symbols.get_system_av_info)(&mut raw) };
        (
            Geometry {
                base_width: raw.geometry.base_width,
                base_height: raw.geometry.base_height,
                max_width: raw.geometry.max_width,
                max_height: raw.geometry.max_height,
                aspect_ratio: raw.geometry.aspect_ratio,
            },
            Timing {
                fps: raw.timing.fps,
                sample_rate: raw.timing.sample_rate,
            },
        )
    }

    fn run(&mut self) {
        // SAFETY: only invoked by the session once content is loaded.
        unsafe { (self.symbols.run)() }
    }

    fn reset(&mut self) -> bool {
        match self.symbols.reset {
            Some(reset) => {
                // SAFETY: entry point resolved from the live library.
                unsafe { reset() };
                true
            }
            None => false,
        }
    }

    fn serialize(&mut self) -> Option<Vec<u8>> {
        let size_fn = self.symbols.serialize_size?;
        let serialize = self.symbols.serialize?;
        // SAFETY: entry points resolved from the live library.
        let size = unsafe { size_fn() };
        if size == 0 {
            return None;
        }
        let mut snapshot = vec![0u8; size];
        // SAFETY: the buffer is exactly the size the module asked for.
        unsafe { serialize(snapshot.as_mut_ptr() as *mut c_void, size) }.then_some(snapshot)
    }

    fn unserialize(&mut self, bytes: &[u8]) -> Option<bool> {
        let unserialize = self.symbols.unserialize?;
        // SAFETY: the module only reads `bytes.len()` bytes.
        Some(unsafe { unserialize(bytes.as_ptr() as *const c_void, bytes.len()) })
    }
}
