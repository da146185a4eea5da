//! Core lifecycle and frame pump.
//!
//! A [`Session`] owns exactly one loaded module at a time and drives it
//! through the state machine
//! `Unloaded -> Loaded -> ContentLoaded -> Running -> Unloaded`:
//!
//! - [`Session::load`] resolves the module, installs the environment
//!   callback, runs `retro_init`, then installs the video/audio/input
//!   callbacks. The environment callback goes in before init because cores
//!   negotiate (pixel format, variables, no-game support) from inside their
//!   own init.
//! - [`Session::load_content`] feeds content (or none, for cores that
//!   declared no-game support) and freezes the capability set with the
//!   module's reported geometry and timing.
//! - [`Session::tick`] runs the module for exactly one frame. The tick is
//!   driven externally (display link, timer, test loop); the session never
//!   schedules itself.
//! - [`Session::unload`] tears everything down in reverse order and is
//!   idempotent.
//!
//! Ticks arrive on one thread and run to completion, including every
//! re-entrant video/audio/input callback the module makes. A second tick
//! while one is in flight is refused with [`TickError::ConcurrentTick`];
//! unload blocks until an in-flight tick finishes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::audio::AudioSink;
use crate::callbacks;
use crate::input::InputSource;
use crate::loader::{self, ModuleLoadError, SystemFacts};
use crate::module::{ContentSource, CoreModule, LoadedModule};
use crate::options::CoreOption;
use crate::state::{self, HostState};
use crate::video::{FrameSlot, PixelFormat};

/// Where the session is in the module lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoreState {
    Unloaded,
    Loaded,
    ContentLoaded,
    Running,
}

/// Base/maximum frame dimensions and aspect reported by the module.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Geometry {
    pub base_width: u32,
    pub base_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub aspect_ratio: f32,
}

/// Nominal frame rate and audio sample rate reported by the module.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    pub fps: f64,
    pub sample_rate: f64,
}

/// Negotiated facts about the loaded module.
///
/// Populated incrementally: the static fields right after load, geometry and
/// timing once content is in. Immutable after that point; changing the pixel
/// format again requires a full reload.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub library_name: String,
    pub library_version: String,
    /// Content file extensions the module claims to handle.
    pub valid_extensions: Vec<String>,
    /// Module wants a path to the content instead of its bytes.
    pub need_fullpath: bool,
    /// Module can run without any content loaded.
    pub support_no_game: bool,
    /// Pixel encoding of every video frame the module will deliver.
    pub pixel_format: PixelFormat,
    pub geometry: Option<Geometry>,
    pub timing: Option<Timing>,
}

impl Capabilities {
    /// Nominal duration of one frame, once timing is known.
    pub fn target_frame_duration(&self) -> Option<Duration> {
        let timing = self.timing?;
        if timing.fps > 0.0 {
            Some(Duration::from_secs_f64(1.0 / timing.fps))
        } else {
            None
        }
    }
}

/// Host-side configuration, fixed for the lifetime of the session.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Answer to the module's system-directory query (BIOS files and such).
    pub system_dir: Option<PathBuf>,
    /// Answer to the module's save-directory query.
    pub save_dir: Option<PathBuf>,
    /// Core option values to seed before the module defines its options.
    pub variables: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("module requires content but none was provided")]
    ContentRequired,
    #[error("module rejected the provided content")]
    Rejected,
    #[error("failed to read content file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no module is loaded")]
    NoModule,
    #[error("content is already loaded; unload first")]
    AlreadyLoaded,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("tick is not valid in the {0:?} state")]
    InvalidState(CoreState),
    #[error("a tick is already in progress")]
    ConcurrentTick,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("operation requires loaded content (state is {0:?})")]
    InvalidState(CoreState),
    #[error("module does not support this operation")]
    Unsupported,
    #[error("module rejected the state snapshot")]
    Rejected,
}

/// Non-reentrant gate around the module's run entry point.
#[derive(Default)]
struct TickGate {
    busy: AtomicBool,
}

struct TickPass<'a> {
    gate: &'a TickGate,
}

impl TickGate {
    fn try_enter(&self) -> Option<TickPass<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(TickPass { gate: self })
    }

    /// Spin until no tick is in flight. Only ever contended when an embedder
    /// unloads from a different thread than the one driving ticks.
    fn wait_idle(&self) {
        while self.busy.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }
}

impl Drop for TickPass<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// One core-hosting session. See the module docs for the state machine.
pub struct Session {
    core_state: CoreState,
    module: Option<Box<dyn CoreModule>>,
    caps: Option<Capabilities>,
    config: SessionConfig,
    host: Arc<Mutex<HostState>>,
    frames: Arc<FrameSlot>,
    gate: TickGate,
}

impl Session {
    pub fn new(config: SessionConfig, audio: Box<dyn AudioSink>, input: Box<dyn InputSource>) -> Self {
        let frames = Arc::new(FrameSlot::default());
        let host = Arc::new(Mutex::new(HostState::new(
            &config,
            audio,
            input,
            Arc::clone(&frames),
        )));
        Self {
            core_state: CoreState::Unloaded,
            module: None,
            caps: None,
            config,
            host,
            frames,
            gate: TickGate::default(),
        }
    }

    /// Load a core module from a dynamic library and run the handshake.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Capabilities, ModuleLoadError> {
        if self.core_state != CoreState::Unloaded {
            return Err(ModuleLoadError::AlreadyLoaded);
        }
        let (lib, symbols, facts) = loader::open(path.as_ref())?;
        self.finish_load(Box::new(LoadedModule::new(lib, symbols)), facts)
    }

    /// Second half of [`Session::load`], split at the module seam so the
    /// lifecycle can be exercised against a fake module.
    fn finish_load(
        &mut self,
        mut module: Box<dyn CoreModule>,
        facts: SystemFacts,
    ) -> Result<Capabilities, ModuleLoadError> {
        if self.core_state != CoreState::Unloaded {
            return Err(ModuleLoadError::AlreadyLoaded);
        }
        self.host.lock().unwrap().reset_negotiation(&self.config);
        if !state::claim(&self.host) {
            return Err(ModuleLoadError::HostBusy);
        }

        // From the first install call on, the module may re-enter the host
        // at any time; the environment callback must be live before init.
        module.install_environment(callbacks::environment);
        module.init();
        module.install_av_callbacks(
            callbacks::video_refresh,
            callbacks::audio_sample,
            callbacks::audio_sample_batch,
            callbacks::input_poll,
            callbacks::input_state,
        );

        let caps = {
            let host = self.host.lock().unwrap();
            Capabilities {
                library_name: facts.library_name,
                library_version: facts.library_version,
                valid_extensions: facts.valid_extensions,
                need_fullpath: facts.need_fullpath,
                support_no_game: host.env.support_no_game,
                pixel_format: host.env.pixel_format,
                geometry: None,
                timing: None,
            }
        };
        tracing::info!(
            name = %caps.library_name,
            format = ?caps.pixel_format,
            no_game = caps.support_no_game,
            "core initialized"
        );

        self.caps = Some(caps.clone());
        self.module = Some(module);
        self.core_state = CoreState::Loaded;
        Ok(caps)
    }

    /// Load content into the module, or start it content-less with `None`.
    ///
    /// On failure the session stays at `Loaded`; the caller may retry with
    /// different content.
    pub fn load_content(&mut self, content: Option<&Path>) -> Result<(), ContentError> {
        match self.core_state {
            CoreState::Loaded => {}
            CoreState::Unloaded => return Err(ContentError::NoModule),
            CoreState::ContentLoaded | CoreState::Running => return Err(ContentError::AlreadyLoaded),
        }
        let Some(module) = self.module.as_mut() else {
            return Err(ContentError::NoModule);
        };

        let source = match content {
            None => {
                // No-game support can be declared any time up to now; read
                // the live negotiated value, not the load-time snapshot.
                let support_no_game = self.host.lock().unwrap().env.support_no_game;
                if !support_no_game {
                    return Err(ContentError::ContentRequired);
                }
                None
            }
            Some(path) => {
                let need_fullpath = self.caps.as_ref().is_some_and(|c| c.need_fullpath);
                let data = if need_fullpath {
                    None
                } else {
                    Some(std::fs::read(path).map_err(|source| ContentError::Io {
                        path: path.to_owned(),
                        source,
                    })?)
                };
                Some(ContentSource {
                    path: path.to_owned(),
                    data,
                })
            }
        };

        if !module.load_game(source.as_ref()) {
            tracing::warn!(content = ?content, "module rejected content");
            return Err(ContentError::Rejected);
        }

        let (geometry, timing) = module.av_info();
        {
            let mut host = self.host.lock().unwrap();
            host.env.content_loaded = true;
            if let Some(caps) = self.caps.as_mut() {
                caps.support_no_game = host.env.support_no_game;
                caps.pixel_format = host.env.pixel_format;
                caps.geometry = Some(geometry);
                caps.timing = Some(timing);
            }
        }
        tracing::info!(
            width = geometry.base_width,
            height = geometry.base_height,
            fps = timing.fps,
            "content loaded"
        );
        self.core_state = CoreState::ContentLoaded;
        Ok(())
    }

    /// Run the module for exactly one frame.
    ///
    /// Synchronous: every video/audio/input callback the module makes
    /// happens inside this call.
    pub fn tick(&mut self) -> Result<(), TickError> {
        match self.core_state {
            CoreState::ContentLoaded | CoreState::Running => {}
            other => return Err(TickError::InvalidState(other)),
        }
        let Some(_pass) = self.gate.try_enter() else {
            return Err(TickError::ConcurrentTick);
        };
        let Some(module) = self.module.as_mut() else {
            return Err(TickError::InvalidState(self.core_state));
        };
        self.core_state = CoreState::Running;
        module.run();
        Ok(())
    }

    /// Reset the emulated system, when the module supports it.
    pub fn reset(&mut self) -> Result<(), StateError> {
        let module = self.module_with_content()?;
        if module.reset() {
            Ok(())
        } else {
            Err(StateError::Unsupported)
        }
    }

    /// Snapshot the module's internal state.
    pub fn save_state(&mut self) -> Result<Vec<u8>, StateError> {
        let module = self.module_with_content()?;
        module.serialize().ok_or(StateError::Unsupported)
    }

    /// Restore a snapshot produced by [`Session::save_state`].
    pub fn restore_state(&mut self, snapshot: &[u8]) -> Result<(), StateError> {
        let module = self.module_with_content()?;
        match module.unserialize(snapshot) {
            None => Err(StateError::Unsupported),
            Some(false) => Err(StateError::Rejected),
            Some(true) => Ok(()),
        }
    }

    fn module_with_content(&mut self) -> Result<&mut Box<dyn CoreModule>, StateError> {
        match self.core_state {
            CoreState::ContentLoaded | CoreState::Running => {}
            other => return Err(StateError::InvalidState(other)),
        }
        self.module
            .as_mut()
            .ok_or(StateError::InvalidState(CoreState::Unloaded))
    }

    /// Tear down in reverse order of construction. Idempotent; a no-op on an
    /// unloaded session. After this returns, no module entry point is ever
    /// invoked again.
    pub fn unload(&mut self) {
        if self.module.is_none() {
            self.core_state = CoreState::Unloaded;
            return;
        }
        // Never pull the module out from under an in-flight tick.
        self.gate.wait_idle();

        if let Some(module) = self.module.as_mut() {
            if matches!(self.core_state, CoreState::ContentLoaded | CoreState::Running) {
                module.unload_game();
            }
            module.deinit();
        }
        // Dropping the module closes the library; the handle and the symbol
        // table go away together.
        self.module = None;
        state::release(&self.host);
        self.host.lock().unwrap().reset_negotiation(&self.config);
        self.frames.clear();
        self.caps = None;
        self.core_state = CoreState::Unloaded;
        tracing::info!("core unloaded");
    }

    pub fn state(&self) -> CoreState {
        self.core_state
    }

    /// Negotiated capabilities of the loaded module, if one is loaded.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.caps.as_ref()
    }

    /// Shared handle the presentation side polls for the latest frame.
    pub fn frame_slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.frames)
    }

    /// Whether the module asked the host to shut the session down.
    pub fn shutdown_requested(&self) -> bool {
        self.host.lock().unwrap().env.shutdown_requested
    }

    /// Change a core option mid-session; the module picks it up through its
    /// next variable-update query.
    pub fn set_variable(&mut self, key: &str, value: &str) {
        self.host.lock().unwrap().env.options.set_value(key, value);
    }

    /// Current core options (definitions arrive during load).
    pub fn options(&self) -> Vec<CoreOption> {
        self.host.lock().unwrap().env.options.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSink;
    use crate::input::{InputSnapshot, InputSource, NullInput};
    use crate::audio::NullAudio;
    use libretro_sys::{
        DEVICE_ID_JOYPAD_A, DEVICE_JOYPAD, ENVIRONMENT_SET_PIXEL_FORMAT,
        ENVIRONMENT_SET_SUPPORT_NO_GAME,
    };
    use std::io::Write;
    use std::os::raw::{c_uint, c_void};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

    /// The callback slot is process-global, so lifecycle tests run one at a
    /// time.
    fn serial() -> MutexGuard<'static, ()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn facts() -> SystemFacts {
        SystemFacts {
            library_name: "FakeCore".into(),
            library_version: "0.9".into(),
            valid_extensions: vec!["bin".into()],
            need_fullpath: false,
        }
    }

    /// What the fake does inside `run`, mimicking a real core's callbacks.
    #[derive(Default)]
    struct RunPlan {
        frame: Option<(u32, u32, usize, Vec<u8>)>,
        audio: Option<Vec<i16>>,
        read_input: bool,
    }

    #[derive(Default)]
    struct FakeModule {
        log: Arc<Mutex<Vec<&'static str>>>,
        runs: Arc<AtomicU32>,
        /// Declared via the real environment trampoline during init.
        no_game: bool,
        pixel_format: Option<c_uint>,
        accept_content: Arc<AtomicBool>,
        plan: RunPlan,
        observed_input: Arc<Mutex<i16>>,
        snapshot: Option<Vec<u8>>,
    }

    impl FakeModule {
        fn push(&self, entry: &'static str) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl CoreModule for FakeModule {
        fn install_environment(&mut self, _callback: libretro_sys::EnvironmentFn) {
            self.push("install_environment");
        }

        fn install_av_callbacks(
            &mut self,
            _video: libretro_sys::VideoRefreshFn,
            _audio_sample: libretro_sys::AudioSampleFn,
            _audio_batch: libretro_sys::AudioSampleBatchFn,
            _input_poll: libretro_sys::InputPollFn,
            _input_state: libretro_sys::InputStateFn,
        ) {
            self.push("install_av_callbacks");
        }

        fn init(&mut self) {
            self.push("init");
            // Negotiate through the real trampolines, like a dylib core
            // re-entering the host from inside retro_init.
            if self.no_game {
                let mut flag = true;
                let ok = unsafe {
                    callbacks::environment(
                        ENVIRONMENT_SET_SUPPORT_NO_GAME,
                        &mut flag as *mut bool as *mut c_void,
                    )
                };
                assert!(ok, "environment must be reachable during init");
            }
            if let Some(mut code) = self.pixel_format {
                let ok = unsafe {
                    callbacks::environment(
                        ENVIRONMENT_SET_PIXEL_FORMAT,
                        &mut code as *mut c_uint as *mut c_void,
                    )
                };
                assert!(ok);
            }
        }

        fn deinit(&mut self) {
            self.push("deinit");
        }

        fn load_game(&mut self, _content: Option<&ContentSource>) -> bool {
            self.push("load_game");
            self.accept_content.load(Ordering::SeqCst)
        }

        fn unload_game(&mut self) {
            self.push("unload_game");
        }

        fn av_info(&mut self) -> (Geometry, Timing) {
            (
                Geometry {
                    base_width: 256,
                    base_height: 240,
                    max_width: 256,
                    max_height: 240,
                    aspect_ratio: 4.0 / 3.0,
                },
                Timing {
                    fps: 60.0,
                    sample_rate: 44_100.0,
                },
            )
        }

        fn run(&mut self) {
            self.push("run");
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some((width, height, pitch, bytes)) = &self.plan.frame {
                unsafe {
                    callbacks::video_refresh(
                        bytes.as_ptr() as *const c_void,
                        *width,
                        *height,
                        *pitch,
                    )
                };
            }
            if let Some(samples) = &self.plan.audio {
                let consumed = unsafe {
                    callbacks::audio_sample_batch(samples.as_ptr(), samples.len() / 2)
                };
                assert_eq!(consumed, samples.len() / 2);
            }
            if self.plan.read_input {
                unsafe { callbacks::input_poll() };
                let level =
                    unsafe { callbacks::input_state(0, DEVICE_JOYPAD, 0, DEVICE_ID_JOYPAD_A) };
                *self.observed_input.lock().unwrap() = level;
            }
        }

        fn reset(&mut self) -> bool {
            self.push("reset");
            true
        }

        fn serialize(&mut self) -> Option<Vec<u8>> {
            self.snapshot.clone()
        }

        fn unserialize(&mut self, bytes: &[u8]) -> Option<bool> {
            self.snapshot.as_ref().map(|s| s == bytes)
        }
    }

    fn accepting() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn load_orders_the_handshake_and_unload_reverses_it() {
        let _serial = serial();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let fake = FakeModule {
            log: Arc::clone(&log),
            no_game: true,
            accept_content: accepting(),
            ..FakeModule::default()
        };

        session.finish_load(Box::new(fake), facts()).unwrap();
        assert_eq!(session.state(), CoreState::Loaded);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["install_environment", "init", "install_av_callbacks"],
        );

        session.load_content(None).unwrap();
        assert_eq!(session.state(), CoreState::ContentLoaded);

        session.tick().unwrap();
        assert_eq!(session.state(), CoreState::Running);

        session.unload();
        assert_eq!(session.state(), CoreState::Unloaded);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "install_environment",
                "init",
                "install_av_callbacks",
                "load_game",
                "run",
                "unload_game",
                "deinit",
            ],
        );
    }

    #[test]
    fn contentless_load_requires_declared_support() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let fake = FakeModule {
            log: Arc::clone(&log),
            no_game: false,
            accept_content: accepting(),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();

        let err = session.load_content(None).unwrap_err();
        assert!(matches!(err, ContentError::ContentRequired));
        assert_eq!(session.state(), CoreState::Loaded);
        assert!(
            !log.lock().unwrap().contains(&"load_game"),
            "a refused content-less load must not reach the module"
        );
        session.unload();
    }

    #[test]
    fn tick_before_content_fails_without_running_the_module() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let runs = Arc::new(AtomicU32::new(0));
        let fake = FakeModule {
            runs: Arc::clone(&runs),
            accept_content: accepting(),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();

        assert!(matches!(
            session.tick(),
            Err(TickError::InvalidState(CoreState::Loaded))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        session.unload();
    }

    #[test]
    fn tick_pumps_one_frame_through_conversion_audio_and_input() {
        let _serial = serial();

        #[derive(Clone, Default)]
        struct CountingSink {
            frames: Arc<AtomicU32>,
        }
        impl AudioSink for CountingSink {
            fn play(&mut self, samples: &[i16], frames: usize) {
                assert_eq!(samples.len(), frames * 2);
                self.frames.fetch_add(frames as u32, Ordering::SeqCst);
            }
        }

        struct HeldA;
        impl InputSource for HeldA {
            fn poll(&mut self) -> InputSnapshot {
                let mut snap = InputSnapshot::default();
                snap.set_joypad(0, DEVICE_ID_JOYPAD_A, true);
                snap
            }
        }

        let sink = CountingSink::default();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(sink.clone()),
            Box::new(HeldA),
        );

        let observed_input = Arc::new(Mutex::new(0i16));
        // 256x240 RGB565, contiguous pitch.
        let (width, height, pitch) = (256u32, 240u32, 512usize);
        let fake = FakeModule {
            no_game: true,
            pixel_format: Some(PixelFormat::Rgb565 as c_uint),
            accept_content: accepting(),
            plan: RunPlan {
                frame: Some((width, height, pitch, vec![0x5A; height as usize * pitch])),
                audio: Some(vec![100, -100, 200, -200, 300, -300]),
                read_input: true,
            },
            observed_input: Arc::clone(&observed_input),
            ..FakeModule::default()
        };

        let caps = session.finish_load(Box::new(fake), facts()).unwrap();
        assert_eq!(caps.pixel_format, PixelFormat::Rgb565);
        assert!(caps.support_no_game);

        session.load_content(None).unwrap();
        let caps = session.capabilities().unwrap();
        assert_eq!(caps.geometry.unwrap().base_width, 256);
        assert_eq!(caps.timing.unwrap().fps, 60.0);
        assert_eq!(
            caps.target_frame_duration(),
            Some(Duration::from_secs_f64(1.0 / 60.0))
        );

        session.tick().unwrap();

        let frame = session.frame_slot().latest().expect("frame published");
        assert_eq!(frame.width, 256);
        assert_eq!(frame.height, 240);
        assert_eq!(frame.format, PixelFormat::Rgb565);
        assert_eq!(frame.bytes.len(), 256 * 240 * 2);

        assert_eq!(sink.frames.load(Ordering::SeqCst), 3);
        assert_eq!(*observed_input.lock().unwrap(), 1);

        session.unload();
    }

    #[test]
    fn concurrent_tick_is_refused_without_running_the_module() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let runs = Arc::new(AtomicU32::new(0));
        let fake = FakeModule {
            runs: Arc::clone(&runs),
            no_game: true,
            accept_content: accepting(),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();
        session.load_content(None).unwrap();

        // Simulate a tick in flight, then try to tick again. Mark the gate
        // busy directly (equivalent to holding a TickPass) so the guard does
        // not borrow `session` across the `session.tick()` mutable call.
        session.gate.busy.store(true, Ordering::Release);
        assert!(matches!(session.tick(), Err(TickError::ConcurrentTick)));
        assert_eq!(runs.load(Ordering::SeqCst), 0, "run must not be entered twice");
        session.gate.busy.store(false, Ordering::Release);

        session.tick().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        session.unload();
    }

    #[test]
    fn unload_is_idempotent_and_nothing_runs_afterwards() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicU32::new(0));
        let fake = FakeModule {
            log: Arc::clone(&log),
            runs: Arc::clone(&runs),
            no_game: true,
            accept_content: accepting(),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();
        session.load_content(None).unwrap();
        session.tick().unwrap();

        session.unload();
        let after_first = log.lock().unwrap().clone();
        assert_eq!(session.state(), CoreState::Unloaded);

        session.unload();
        assert_eq!(*log.lock().unwrap(), after_first, "second unload must be a no-op");

        assert!(matches!(
            session.tick(),
            Err(TickError::InvalidState(CoreState::Unloaded))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(session.capabilities().is_none());
        assert!(session.frame_slot().latest().is_none());

        // Stray callbacks after unload hit no host and answer defaults.
        assert!(!unsafe { callbacks::environment(ENVIRONMENT_SET_SUPPORT_NO_GAME, std::ptr::null_mut()) });
    }

    #[test]
    fn unloading_on_an_unloaded_session_is_a_no_op() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        session.unload();
        assert_eq!(session.state(), CoreState::Unloaded);
    }

    #[test]
    fn only_one_session_may_hold_a_module() {
        let _serial = serial();
        let mut first = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let mut second = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        first
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap();

        let err = second
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap_err();
        assert!(matches!(err, ModuleLoadError::HostBusy));

        first.unload();
        // The slot frees up once the first session lets go.
        second
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap();
        second.unload();
    }

    #[test]
    fn rejected_content_keeps_the_session_loaded_for_a_retry() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let accept = Arc::new(AtomicBool::new(false));
        let fake = FakeModule {
            accept_content: Arc::clone(&accept),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();

        let mut rom = tempfile::NamedTempFile::new().unwrap();
        rom.write_all(b"\x00\x01\x02\x03").unwrap();
        rom.flush().unwrap();

        let err = session.load_content(Some(rom.path())).unwrap_err();
        assert!(matches!(err, ContentError::Rejected));
        assert_eq!(session.state(), CoreState::Loaded);

        accept.store(true, Ordering::SeqCst);
        session.load_content(Some(rom.path())).unwrap();
        assert_eq!(session.state(), CoreState::ContentLoaded);
        session.unload();
    }

    #[test]
    fn missing_content_file_reports_io_error() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        session
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap();

        let err = session
            .load_content(Some(Path::new("/nonexistent/game.bin")))
            .unwrap_err();
        assert!(matches!(err, ContentError::Io { .. }));
        assert_eq!(session.state(), CoreState::Loaded);
        session.unload();
    }

    #[test]
    fn save_and_restore_round_trip_when_the_module_supports_them() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let fake = FakeModule {
            no_game: true,
            accept_content: accepting(),
            snapshot: Some(vec![9, 9, 9]),
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();

        // State operations need loaded content.
        assert!(matches!(
            session.save_state(),
            Err(StateError::InvalidState(CoreState::Loaded))
        ));

        session.load_content(None).unwrap();
        let snapshot = session.save_state().unwrap();
        assert_eq!(snapshot, vec![9, 9, 9]);
        session.restore_state(&snapshot).unwrap();
        assert!(matches!(
            session.restore_state(&[1, 2]),
            Err(StateError::Rejected)
        ));
        session.reset().unwrap();
        session.unload();
    }

    #[test]
    fn state_operations_without_support_report_unsupported() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        let fake = FakeModule {
            no_game: true,
            accept_content: accepting(),
            snapshot: None,
            ..FakeModule::default()
        };
        session.finish_load(Box::new(fake), facts()).unwrap();
        session.load_content(None).unwrap();

        assert!(matches!(session.save_state(), Err(StateError::Unsupported)));
        assert!(matches!(
            session.restore_state(&[0]),
            Err(StateError::Unsupported)
        ));
        session.unload();
    }

    #[test]
    fn loading_twice_without_unloading_is_refused() {
        let _serial = serial();
        let mut session = Session::new(
            SessionConfig::default(),
            Box::new(NullAudio),
            Box::new(NullInput),
        );
        session
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap();

        let err = session
            .finish_load(
                Box::new(FakeModule {
                    accept_content: accepting(),
                    ..FakeModule::default()
                }),
                facts(),
            )
            .unwrap_err();
        assert!(matches!(err, ModuleLoadError::AlreadyLoaded));
        session.unload();
    }
}
