//! Input state for retrohost-core.
//!
//! The core polls input once per run call (`retro_input_poll`) and then
//! queries individual button/axis levels (`retro_input_state`) as many times
//! as it likes, speculatively probing ports and devices it does not know are
//! connected. Two rules fall out of that:
//!
//! - Poll takes a snapshot of the external [`InputSource`]; every query in
//!   the same tick is answered from that snapshot, so repeated queries are
//!   idempotent even if the real input changes mid-tick.
//! - Unknown (port, device, index, id) combinations answer 0 — the released
//!   level — instead of failing.
//!
//! Joypad device and button id constants come from `libretro_sys`
//! (`DEVICE_JOYPAD`, `DEVICE_ID_JOYPAD_*`).

use std::collections::HashMap;

use libretro_sys::DEVICE_JOYPAD;

/// Address of one logical control, as the core queries it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InputId {
    pub port: u32,
    pub device: u32,
    pub index: u32,
    pub id: u32,
}

impl InputId {
    /// A joypad button on the given port (index is unused for joypads).
    pub const fn joypad(port: u32, button: u32) -> Self {
        Self {
            port,
            device: DEVICE_JOYPAD,
            index: 0,
            id: button,
        }
    }
}

/// Frozen input levels for one tick.
#[derive(Clone, Debug, Default)]
pub struct InputSnapshot {
    levels: HashMap<InputId, i16>,
}

impl InputSnapshot {
    pub fn set(&mut self, id: InputId, level: i16) {
        self.levels.insert(id, level);
    }

    /// Mark a joypad button pressed (1) or released (removed).
    pub fn set_joypad(&mut self, port: u32, button: u32, pressed: bool) {
        let id = InputId::joypad(port, button);
        if pressed {
            self.levels.insert(id, 1);
        } else {
            self.levels.remove(&id);
        }
    }

    /// Level for a control; 0 (released) when nothing was recorded for it.
    pub fn level(&self, id: &InputId) -> i16 {
        self.levels.get(id).copied().unwrap_or(0)
    }
}

/// External input collaborator, polled once per tick.
pub trait InputSource: Send {
    fn poll(&mut self) -> InputSnapshot;
}

/// Input source that never reports anything pressed.
#[derive(Default)]
pub struct NullInput;

impl InputSource for NullInput {
    fn poll(&mut self) -> InputSnapshot {
        InputSnapshot::default()
    }
}

/// Host-side table the input callbacks read from.
pub(crate) struct InputTable {
    source: Box<dyn InputSource>,
    snapshot: InputSnapshot,
}

impl InputTable {
    pub(crate) fn new(source: Box<dyn InputSource>) -> Self {
        Self {
            source,
            snapshot: InputSnapshot::default(),
        }
    }

    /// Snapshot the external source. Called from the core's poll callback.
    pub(crate) fn poll(&mut self) {
        self.snapshot = self.source.poll();
    }

    /// Serve a query from the current snapshot.
    pub(crate) fn query(&self, port: u32, device: u32, index: u32, id: u32) -> i16 {
        self.snapshot.level(&InputId {
            port,
            device,
            index,
            id,
        })
    }
}
