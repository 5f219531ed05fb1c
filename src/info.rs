//! Static descriptors for devices, channels and signals.
//!
//! Descriptors never change for the lifetime of a device, so every hardware
//! model keeps them in `static` tables and hands out `&'static` references.

use std::fmt;

use bitflags::bitflags;

use crate::error::{Result, SmuError};

/// Descriptor type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    /// CEE (Current-Experimental-Environment) device
    DeviceCee,
    /// ADALM1000 device
    DeviceM1000,
    /// Source-measure channel
    ChannelSmu,
    /// Voltage or current signal
    Signal,
}

/// Operating mode of one SMU channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Mode {
    /// Output stage off, channel floating
    #[default]
    Disabled = 0,
    /// Source voltage, measure current
    Svmi = 1,
    /// Source current, measure voltage
    Simv = 2,
}

impl Mode {
    /// All modes in index order.
    pub const ALL: [Mode; 3] = [Mode::Disabled, Mode::Svmi, Mode::Simv];

    /// Convert a raw mode index into a [`Mode`].
    pub fn from_index(channel: usize, index: u32) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or(SmuError::InvalidMode {
                channel,
                mode: index,
                max: Self::ALL.len() as u32,
            })
    }

    /// Raw mode index.
    pub fn index(self) -> u32 {
        self as u32
    }

    /// The single-bit [`ModeSet`] for this mode.
    pub fn as_set(self) -> ModeSet {
        match self {
            Self::Disabled => ModeSet::DISABLED,
            Self::Svmi => ModeSet::SVMI,
            Self::Simv => ModeSet::SIMV,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Svmi => write!(f, "SVMI"),
            Self::Simv => write!(f, "SIMV"),
        }
    }
}

bitflags! {
    /// Bitmask of channel modes, one bit per [`Mode`] index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeSet: u32 {
        /// Channel disabled
        const DISABLED = 1 << 0;
        /// Source voltage, measure current
        const SVMI = 1 << 1;
        /// Source current, measure voltage
        const SIMV = 1 << 2;
    }
}

/// Physical unit as a vector of SI base-unit exponents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unit {
    /// metre
    pub m: i8,
    /// kilogram
    pub kg: i8,
    /// second
    pub s: i8,
    /// ampere
    pub a: i8,
    /// kelvin
    pub k: i8,
    /// mole
    pub mol: i8,
    /// candela
    pub cd: i8,
}

impl Unit {
    /// Volt: m² kg s⁻³ A⁻¹
    pub const VOLT: Unit = Unit {
        m: 2,
        kg: 1,
        s: -3,
        a: -1,
        k: 0,
        mol: 0,
        cd: 0,
    };

    /// Ampere
    pub const AMPERE: Unit = Unit {
        m: 0,
        kg: 0,
        s: 0,
        a: 1,
        k: 0,
        mol: 0,
        cd: 0,
    };
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::VOLT {
            write!(f, "V")
        } else if *self == Self::AMPERE {
            write!(f, "A")
        } else {
            write!(
                f,
                "m^{} kg^{} s^{} A^{} K^{} mol^{} cd^{}",
                self.m, self.kg, self.s, self.a, self.k, self.mol, self.cd
            )
        }
    }
}

/// Descriptor of a signal (one measurable / sourceable quantity on a channel).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInfo {
    /// Descriptor type
    pub kind: DescriptorType,
    /// Human-readable label ("Voltage", "Current")
    pub label: &'static str,
    /// Modes in which this signal is measured
    pub input_modes: ModeSet,
    /// Modes in which this signal is sourced
    pub output_modes: ModeSet,
    /// Physical unit
    pub unit: Unit,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Smallest distinguishable step
    pub resolution: f64,
}

impl SignalInfo {
    /// Whether this signal is the sourced quantity in `mode`.
    pub fn is_output_in(&self, mode: Mode) -> bool {
        self.output_modes.contains(mode.as_set())
    }

    /// Whether this signal is measured in `mode`.
    pub fn is_input_in(&self, mode: Mode) -> bool {
        self.input_modes.contains(mode.as_set())
    }
}

/// Descriptor of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Descriptor type
    pub kind: DescriptorType,
    /// Channel label ("A", "B")
    pub label: &'static str,
    /// Number of supported modes
    pub mode_count: usize,
    /// Number of signals on the channel
    pub signal_count: usize,
}

/// Descriptor of a device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Descriptor type
    pub kind: DescriptorType,
    /// Model label
    pub label: &'static str,
    /// Number of channels
    pub channel_count: usize,
}
