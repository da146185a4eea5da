//! Dynamic module loading for retrohost-core.
//!
//! Responsibilities:
//! - Open a core's dynamic library from a filesystem path.
//! - Resolve the fixed libretro entry-point table: every mandatory symbol
//!   must be present, optional ones (save states, reset) may be absent.
//! - Check the core's reported API version against the host's.
//! - Read the core's static system info (name, version, extensions,
//!   full-path requirement) as the seed of the capability set.
//!
//! Loading never partially succeeds: either a fully resolved
//! [`CoreSymbols`] table comes back, or the library handle is dropped and
//! closed on the way out. Policy (when to load, what to do with the module)
//! lives in `crate::session`.

use std::ffi::CStr;
use std::os::raw::{c_char, c_uint, c_void};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use libretro_sys::{
    API_VERSION, AudioSampleBatchFn, AudioSampleFn, EnvironmentFn, GameInfo, InputPollFn,
    InputStateFn, SystemAvInfo, SystemInfo, VideoRefreshFn,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleLoadError {
    #[error("failed to open module library {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("module is missing mandatory entry point `{symbol}`")]
    MissingSymbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
    #[error("module speaks libretro API v{module}, host expects v{host}")]
    ApiVersionMismatch { module: u32, host: u32 },
    #[error("another module is already active in this process")]
    HostBusy,
    #[error("this session already has a loaded module")]
    AlreadyLoaded,
}

/// Resolved entry-point table of a loaded core.
///
/// Field order mirrors the handshake: callback installers first, then
/// lifecycle, then content and the per-frame run call.
#[derive(Debug)]
pub(crate) struct CoreSymbols {
    pub(crate) set_environment: unsafe extern "C" fn(EnvironmentFn),
    pub(crate) set_video_refresh: unsafe extern "C" fn(VideoRefreshFn),
    pub(crate) set_audio_sample: unsafe extern "C" fn(AudioSampleFn),
    pub(crate) set_audio_sample_batch: unsafe extern "C" fn(AudioSampleBatchFn),
    pub(crate) set_input_poll: unsafe extern "C" fn(InputPollFn),
    pub(crate) set_input_state: unsafe extern "C" fn(InputStateFn),

    pub(crate) init: unsafe extern "C" fn(),
    pub(crate) deinit: unsafe extern "C" fn(),
    pub(crate) get_system_av_info: unsafe extern "C" fn(*mut SystemAvInfo),

    pub(crate) load_game: unsafe extern "C" fn(*const GameInfo) -> bool,
    pub(crate) unload_game: unsafe extern "C" fn(),
    pub(crate) run: unsafe extern "C" fn(),

    // Optional surface.
    pub(crate) reset: Option<unsafe extern "C" fn()>,
    pub(crate) serialize_size: Option<unsafe extern "C" fn() -> usize>,
    pub(crate) serialize: Option<unsafe extern "C" fn(*mut c_void, usize) -> bool>,
    pub(crate) unserialize: Option<unsafe extern "C" fn(*const c_void, usize) -> bool>,
}

/// Static facts read from the module before any other call.
#[derive(Clone, Debug)]
pub(crate) struct SystemFacts {
    pub(crate) library_name: String,
    pub(crate) library_version: String,
    pub(crate) valid_extensions: Vec<String>,
    pub(crate) need_fullpath: bool,
}

/// Open a core library and resolve its entry points.
pub(crate) fn open(path: &Path) -> Result<(Library, CoreSymbols, SystemFacts), ModuleLoadError> {
    // SAFETY: loading and running foreign library initializers is inherently
    // unsafe; the caller chose to trust this module.
    let lib = unsafe { Library::new(path) }.map_err(|source| ModuleLoadError::Open {
        path: path.to_owned(),
        source,
    })?;

    let api_version: unsafe extern "C" fn() -> c_uint =
        unsafe { mandatory(&lib, "retro_api_version") }?;
    // SAFETY: symbol freshly resolved from this library.
    let module_version = unsafe { api_version() };
    if module_version != API_VERSION {
        return Err(ModuleLoadError::ApiVersionMismatch {
            module: module_version,
            host: API_VERSION,
        });
    }

    let get_system_info: unsafe extern "C" fn(*mut SystemInfo) =
        unsafe { mandatory(&lib, "retro_get_system_info") }?;

    let symbols = unsafe {
        CoreSymbols {
            set_environment: mandatory(&lib, "retro_set_environment")?,
            set_video_refresh: mandatory(&lib, "retro_set_video_refresh")?,
            set_audio_sample: mandatory(&lib, "retro_set_audio_sample")?,
            set_audio_sample_batch: mandatory(&lib, "retro_set_audio_sample_batch")?,
            set_input_poll: mandatory(&lib, "retro_set_input_poll")?,
            set_input_state: mandatory(&lib, "retro_set_input_state")?,
            init: mandatory(&lib, "retro_init")?,
            deinit: mandatory(&lib, "retro_deinit")?,
            get_system_av_info: mandatory(&lib, "retro_get_system_av_info")?,
            load_game: mandatory(&lib, "retro_load_game")?,
            unload_game: mandatory(&lib, "retro_unload_game")?,
            run: mandatory(&lib, "retro_run")?,
            reset: optional(&lib, "retro_reset"),
            serialize_size: optional(&lib, "retro_serialize_size"),
            serialize: optional(&lib, "retro_serialize"),
            unserialize: optional(&lib, "retro_unserialize"),
        }
    };

    // retro_get_system_info is defined to be callable before retro_init.
    let mut raw = SystemInfo {
        library_name: std::ptr::null(),
        library_version: std::ptr::null(),
        valid_extensions: std::ptr::null(),
        need_fullpath: false,
        block_extract: false,
    };
    // SAFETY: symbol freshly resolved; the struct outlives the call.
    unsafe { get_system_info(&mut raw) };
    let facts = SystemFacts {
        library_name: copy_c_str(raw.library_name),
        library_version: copy_c_str(raw.library_version),
        valid_extensions: copy_c_str(raw.valid_extensions)
            .split('|')
            .filter(|ext| !ext.is_empty())
            .map(str::to_owned)
            .collect(),
        need_fullpath: raw.need_fullpath,
    };

    tracing::info!(
        name = %facts.library_name,
        version = %facts.library_version,
        path = %path.display(),
        "resolved core module"
    );

    Ok((lib, symbols, facts))
}

/// Resolve a mandatory entry point, failing the whole load when absent.
///
/// # Safety
/// `T` must be the exact function-pointer type of the named export.
unsafe fn mandatory<T: Copy>(lib: &Library, name: &'static str) -> Result<T, ModuleLoadError> {
    let symbol: Symbol<'_, T> = unsafe { lib.get(name.as_bytes()) }
        .map_err(|source| ModuleLoadError::MissingSymbol {
            symbol: name,
            source,
        })?;
    Ok(*symbol)
}

/// Resolve an optional entry point.
///
/// # Safety
/// `T` must be the exact function-pointer type of the named export.
unsafe fn optional<T: Copy>(lib: &Library, name: &'static str) -> Option<T> {
    unsafe { lib.get::<T>(name.as_bytes()) }.ok().map(|symbol| *symbol)
}

/// Copy a borrowed C string out of module memory; null becomes empty.
fn copy_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: the module hands out NUL-terminated static strings.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_fails_to_open() {
        let err = open(Path::new("/nonexistent/retrohost/fake_core.so")).unwrap_err();
        assert!(matches!(err, ModuleLoadError::Open { .. }));
    }

    #[test]
    fn non_library_file_fails_to_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a shared object").unwrap();
        file.flush().unwrap();

        let err = open(file.path()).unwrap_err();
        assert!(matches!(err, ModuleLoadError::Open { .. }));
    }
}
