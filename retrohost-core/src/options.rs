//! Core option (variable) table.
//!
//! Cores publish their options through `ENVIRONMENT_SET_VARIABLES` using the
//! libretro value encoding `"Description; first|second|third"`, where the
//! first listed value is the default. The host may seed values before load;
//! a seeded value survives the definition as long as the definition allows
//! it. Reads through `ENVIRONMENT_GET_VARIABLE` answer from this table.

use std::ffi::CString;

/// One core option as exposed to embedders.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreOption {
    pub key: String,
    /// Human-readable description from the core's definition (empty until the
    /// core defines the option).
    pub description: String,
    /// Allowed values in definition order; empty until defined.
    pub values: Vec<String>,
    /// Current value.
    pub value: String,
}

struct Entry {
    option: CoreOption,
    /// Cached NUL-terminated value handed back through `GET_VARIABLE`.
    c_value: CString,
}

fn c_value(value: &str) -> CString {
    // Core option values never contain NUL; fall back to empty if one does.
    CString::new(value).unwrap_or_default()
}

/// Key-value table behind the variable environment commands.
#[derive(Default)]
pub(crate) struct OptionTable {
    entries: Vec<Entry>,
    updated: bool,
}

impl OptionTable {
    /// Seed a value before the core defines its options.
    pub(crate) fn seed(&mut self, key: &str, value: &str) {
        self.set_value(key, value);
        // Seeding is host configuration, not a mid-session change.
        self.updated = false;
    }

    /// Record a definition from `SET_VARIABLES`.
    ///
    /// An existing (seeded) value is kept when the definition lists it;
    /// otherwise the option resets to the definition's default.
    pub(crate) fn define(&mut self, key: &str, value_string: &str) {
        let (description, values) = parse_value_string(value_string);
        let default = values.first().cloned().unwrap_or_default();

        if let Some(entry) = self.entries.iter_mut().find(|e| e.option.key == key) {
            entry.option.description = description;
            if !values.contains(&entry.option.value) {
                entry.option.value = default;
                entry.c_value = c_value(&entry.option.value);
            }
            entry.option.values = values;
        } else {
            let option = CoreOption {
                key: key.to_owned(),
                description,
                values,
                value: default,
            };
            self.entries.push(Entry {
                c_value: c_value(&option.value),
                option,
            });
        }
    }

    /// Change a value mid-session. The core observes this through
    /// `GET_VARIABLE_UPDATE` on its next query.
    pub(crate) fn set_value(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.option.key == key) {
            entry.option.value = value.to_owned();
            entry.c_value = c_value(value);
        } else {
            self.entries.push(Entry {
                option: CoreOption {
                    key: key.to_owned(),
                    description: String::new(),
                    values: Vec::new(),
                    value: value.to_owned(),
                },
                c_value: c_value(value),
            });
        }
        self.updated = true;
    }

    /// Pointer to the stored value for `GET_VARIABLE`, or `None` when the key
    /// was never seeded or defined ("not set", not an error).
    ///
    /// The pointer stays valid until the value is next replaced; the core is
    /// expected to copy it out during the environment call.
    pub(crate) fn value_ptr(&self, key: &str) -> Option<*const std::os::raw::c_char> {
        self.entries
            .iter()
            .find(|e| e.option.key == key)
            .map(|e| e.c_value.as_ptr())
    }

    /// Whether any value changed since the last check; clears the flag.
    pub(crate) fn take_updated(&mut self) -> bool {
        std::mem::replace(&mut self.updated, false)
    }

    /// Snapshot of all options for embedder UIs.
    pub(crate) fn snapshot(&self) -> Vec<CoreOption> {
        self.entries.iter().map(|e| e.option.clone()).collect()
    }
}

/// Split a libretro option value string into description and allowed values.
fn parse_value_string(value_string: &str) -> (String, Vec<String>) {
    match value_string.split_once(';') {
        Some((description, rest)) => {
            let values = rest
                .trim_start()
                .split('|')
                .map(|v| v.to_owned())
                .filter(|v| !v.is_empty())
                .collect();
            (description.to_owned(), values)
        }
        // No description separator: the whole string is the value list.
        None => (
            String::new(),
            value_string
                .split('|')
                .map(|v| v.to_owned())
                .filter(|v| !v.is_empty())
                .collect(),
        ),
    }
}
