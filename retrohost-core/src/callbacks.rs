//! C trampolines installed into the core.
//!
//! These are the actual function pointers handed to `retro_set_environment`,
//! `retro_set_video_refresh`, `retro_set_audio_sample`,
//! `retro_set_audio_sample_batch`, `retro_set_input_poll` and
//! `retro_set_input_state`. Each one resolves the active host (see
//! `crate::state`), decodes the raw arguments, and delegates to the safe
//! handler in the owning module.
//!
//! A trampoline that fires with no active host answers the protocol's
//! "nothing" value (false / 0 / no-op) rather than panicking across the FFI
//! boundary.

use std::os::raw::{c_uint, c_void};

use crate::environment;
use crate::state;
use crate::video::FrameDescriptor;

pub(crate) unsafe extern "C" fn environment(cmd: c_uint, data: *mut c_void) -> bool {
    let Some(host) = state::active() else {
        return false;
    };
    let mut host = host.lock().unwrap();
    // SAFETY: the core passes the payload the ABI defines for `cmd`.
    unsafe { environment::dispatch(&mut host, cmd, data) }
}

pub(crate) unsafe extern "C" fn video_refresh(
    data: *const c_void,
    width: c_uint,
    height: c_uint,
    pitch: usize,
) {
    let Some(host) = state::active() else {
        return;
    };
    let mut host = host.lock().unwrap();

    // Null data is an intentional frame dupe (GET_CAN_DUPE answered true):
    // the previously published frame simply stays current.
    if data.is_null() {
        return;
    }
    let Some(len) = (height as usize).checked_mul(pitch) else {
        return;
    };

    // SAFETY: the ABI guarantees `height * pitch` readable bytes at `data`
    // for the duration of this call.
    let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, len) };
    let descriptor = FrameDescriptor {
        data: bytes,
        width,
        height,
        pitch,
        format: host.env.pixel_format as u32,
    };

    let host = &mut *host;
    host.converter.deliver(&descriptor, &host.frames);
}

pub(crate) unsafe extern "C" fn audio_sample(left: i16, right: i16) {
    let Some(host) = state::active() else {
        return;
    };
    host.lock().unwrap().audio.deliver(&[left, right]);
}

pub(crate) unsafe extern "C" fn audio_sample_batch(data: *const i16, frames: usize) -> usize {
    let Some(host) = state::active() else {
        return 0;
    };
    let mut host = host.lock().unwrap();

    if frames == 0 {
        return 0;
    }
    if data.is_null() {
        host.audio.reject("null sample pointer with a nonzero frame count");
        return 0;
    }
    let Some(samples) = frames.checked_mul(2) else {
        host.audio.reject("frame count overflows the sample address space");
        return 0;
    };

    // SAFETY: the ABI guarantees `frames` interleaved stereo frames at `data`
    // for the duration of this call.
    let batch = unsafe { std::slice::from_raw_parts(data, samples) };
    host.audio.deliver(batch);
    frames
}

pub(crate) unsafe extern "C" fn input_poll() {
    let Some(host) = state::active() else {
        return;
    };
    host.lock().unwrap().input.poll();
}

pub(crate) unsafe extern "C" fn input_state(
    port: c_uint,
    device: c_uint,
    index: c_uint,
    id: c_uint,
) -> i16 {
    let Some(host) = state::active() else {
        return 0;
    };
    host.lock().unwrap().input.query(port, device, index, id)
}
