//! Environment negotiation between host and core.
//!
//! The environment callback is the core's side-channel into the host: a
//! single entry point dispatching on a command id, with a command-specific
//! payload behind a `void` pointer. Cores call it at any moment after
//! `retro_set_environment` — including from inside their own `retro_init` —
//! so everything here must be callable re-entrantly while the lifecycle is
//! mid-load, and every answer is produced synchronously.
//!
//! Commands the host does not recognize answer `false` (unsupported). That is
//! the normal protocol outcome, not an error: cores probe for capabilities
//! and fall back on their own.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uint, c_void};

use libretro_sys::{
    ENVIRONMENT_GET_CAN_DUPE, ENVIRONMENT_GET_LOG_INTERFACE, ENVIRONMENT_GET_SAVE_DIRECTORY,
    ENVIRONMENT_GET_SYSTEM_DIRECTORY, ENVIRONMENT_GET_VARIABLE, ENVIRONMENT_GET_VARIABLE_UPDATE,
    ENVIRONMENT_SET_MESSAGE, ENVIRONMENT_SET_PIXEL_FORMAT, ENVIRONMENT_SET_SUPPORT_NO_GAME,
    ENVIRONMENT_SET_VARIABLES, ENVIRONMENT_SHUTDOWN, Message, Variable,
};

use crate::options::OptionTable;
use crate::state::HostState;
use crate::video::PixelFormat;

/// Negotiated facts and host-provided answers, owned by [`HostState`].
pub(crate) struct EnvState {
    /// Pixel encoding the core will use for video frames. libretro defaults
    /// to 0RGB1555 when a core never proposes anything else.
    pub(crate) pixel_format: PixelFormat,
    pub(crate) system_dir: Option<CString>,
    pub(crate) save_dir: Option<CString>,
    pub(crate) options: OptionTable,
    pub(crate) support_no_game: bool,
    pub(crate) shutdown_requested: bool,
    /// Once content is loaded the capability set is frozen; later pixel
    /// format proposals are refused (a full reload renegotiates).
    pub(crate) content_loaded: bool,
}

impl EnvState {
    pub(crate) fn new(system_dir: Option<CString>, save_dir: Option<CString>) -> Self {
        Self {
            pixel_format: PixelFormat::Argb1555,
            system_dir,
            save_dir,
            options: OptionTable::default(),
            support_no_game: false,
            shutdown_requested: false,
            content_loaded: false,
        }
    }
}

/// Handle one environment command.
///
/// # Safety
/// `data` must be the payload the libretro ABI defines for `cmd`; pointers
/// inside it are only dereferenced for the duration of this call.
pub(crate) unsafe fn dispatch(host: &mut HostState, cmd: c_uint, data: *mut c_void) -> bool {
    match cmd {
        ENVIRONMENT_SET_PIXEL_FORMAT => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is a pointer to the proposed format code.
            let raw = unsafe { *(data as *const c_uint) };
            set_pixel_format(&mut host.env, raw)
        }

        ENVIRONMENT_GET_SYSTEM_DIRECTORY => {
            unsafe { answer_directory(data, host.env.system_dir.as_deref()) }
        }
        ENVIRONMENT_GET_SAVE_DIRECTORY => {
            unsafe { answer_directory(data, host.env.save_dir.as_deref()) }
        }

        ENVIRONMENT_GET_VARIABLE => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is a retro_variable with the key filled in.
            let var = unsafe { &mut *(data as *mut Variable) };
            if var.key.is_null() {
                return false;
            }
            // SAFETY: the core provides a NUL-terminated key.
            let key = unsafe { CStr::from_ptr(var.key) }.to_string_lossy();
            match host.env.options.value_ptr(&key) {
                Some(ptr) => {
                    var.value = ptr;
                    true
                }
                None => {
                    var.value = std::ptr::null();
                    false
                }
            }
        }

        ENVIRONMENT_SET_VARIABLES => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is an array of retro_variable terminated by a
            // null key; each entry carries NUL-terminated strings.
            unsafe { define_variables(&mut host.env.options, data as *const Variable) };
            true
        }

        ENVIRONMENT_GET_VARIABLE_UPDATE => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is a pointer to a bool the core owns.
            unsafe { *(data as *mut bool) = host.env.options.take_updated() };
            true
        }

        ENVIRONMENT_SET_SUPPORT_NO_GAME => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is a pointer to a bool.
            host.env.support_no_game = unsafe { *(data as *const bool) };
            true
        }

        ENVIRONMENT_GET_CAN_DUPE => {
            if data.is_null() {
                return false;
            }
            // A null video-refresh pointer repeats the previous frame, which
            // the frame slot supports natively.
            // SAFETY: payload is a pointer to a bool.
            unsafe { *(data as *mut bool) = true };
            true
        }

        ENVIRONMENT_SET_MESSAGE => {
            if data.is_null() {
                return false;
            }
            // SAFETY: payload is a retro_message with a NUL-terminated text.
            let message = unsafe { &*(data as *const Message) };
            if !message.msg.is_null() {
                let text = unsafe { CStr::from_ptr(message.msg) }.to_string_lossy();
                tracing::info!(frames = message.frames, "core message: {text}");
            }
            true
        }

        ENVIRONMENT_SHUTDOWN => {
            host.env.shutdown_requested = true;
            tracing::info!("core requested shutdown");
            true
        }

        ENVIRONMENT_GET_LOG_INTERFACE => {
            // The printf-style log callback is C-variadic, which stable Rust
            // cannot define; cores fall back to their own logging and host
            // events still reach the tracing sink.
            tracing::debug!("core asked for the log interface (not provided)");
            false
        }

        other => {
            tracing::trace!(cmd = other, "unsupported environment command");
            false
        }
    }
}

/// Accept or refuse a pixel format proposal.
fn set_pixel_format(env: &mut EnvState, raw: c_uint) -> bool {
    if env.content_loaded {
        tracing::warn!(
            code = raw,
            "refusing pixel format change after content load; reload to renegotiate"
        );
        return false;
    }
    match PixelFormat::from_raw(raw) {
        Some(format) => {
            env.pixel_format = format;
            tracing::debug!(?format, "core set pixel format");
            true
        }
        None => {
            tracing::warn!(code = raw, "core proposed an unsupported pixel format");
            false
        }
    }
}

/// Write a directory answer (`*mut *const c_char` payload).
///
/// # Safety
/// `data` must be null or point at a writable `*const c_char`.
unsafe fn answer_directory(data: *mut c_void, dir: Option<&CStr>) -> bool {
    if data.is_null() {
        return false;
    }
    let out = data as *mut *const c_char;
    match dir {
        Some(path) => {
            // SAFETY: checked non-null above; the CString lives in host state.
            unsafe { *out = path.as_ptr() };
            true
        }
        None => {
            // SAFETY: checked non-null above.
            unsafe { *out = std::ptr::null() };
            false
        }
    }
}

/// Walk a null-key-terminated retro_variable array into the option table.
///
/// # Safety
/// `first` must point at such an array with NUL-terminated strings.
unsafe fn define_variables(options: &mut OptionTable, first: *const Variable) {
    let mut cursor = first;
    loop {
        // SAFETY: caller guarantees the array layout; the null key terminates.
        let var = unsafe { &*cursor };
        if var.key.is_null() {
            break;
        }
        let key = unsafe { CStr::from_ptr(var.key) }.to_string_lossy();
        let value_string = if var.value.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(var.value) }.to_string_lossy().into_owned()
        };
        options.define(&key, &value_string);
        cursor = unsafe { cursor.add(1) };
    }
}
