//! Published status and readback enums.
//!
//! `MachineStatus` is the fixed alphabet of the per-machine `Status-Sts`
//! channel. `ValvePosition` is the discrete readback of a valve device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-machine status word published on `Status-Sts`.
///
/// Exactly one machine may be `Busy` at a time; every machine other than
/// the selected one is `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MachineStatus {
    /// Held in a state, all bound devices inside their windows.
    Idle = 0,
    /// A transition is executing.
    Busy = 1,
    /// Not the selected machine, or the Governor is inactive.
    Disabled = 2,
    /// A device failed or drifted out of its window; parked in the
    /// initial state until the operator recovers.
    Fault = 3,
}

impl MachineStatus {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Busy),
            2 => Some(Self::Disabled),
            3 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Label used on the PV bus.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Busy => "Busy",
            Self::Disabled => "Disabled",
            Self::Fault => "FAULT",
        }
    }
}

impl Default for MachineStatus {
    fn default() -> Self {
        Self::Disabled
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Discrete valve readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValvePosition {
    /// Fully open.
    Open = 0,
    /// Fully closed.
    Closed = 1,
    /// Between states, actuation in progress.
    Moving = 2,
    /// Status word unreadable or inconsistent.
    Unknown = 3,
}

impl ValvePosition {
    /// Parse a valve target name as written in state bindings.
    pub fn from_target(name: &str) -> Option<Self> {
        match name {
            "Open" => Some(Self::Open),
            "Closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Label used on the PV bus.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Moving => "Moving",
            Self::Unknown => "Unknown",
        }
    }
}

impl Default for ValvePosition {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
