//! Symbolic values carried by bus frames and message-bus payloads.
//!
//! Each enum maps both ways: to the byte code used on the RS-485 bus and to
//! the lowercase payload string used by the home-automation side. Inbound
//! codes that the bus documentation doesn't cover fall back explicitly
//! (`Action` -> `Status`, `FanSpeed` -> `Low`, `OpMode` -> none).

use strum_macros::{Display, EnumIter, EnumString};

/// Frame action byte: what the exchange asks the unit to do (or reports).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Scan,
    Status,
    Off,
    On,
    LockOn,
    LockOff,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::Scan => 0x00,
            Action::Status => 0x01,
            Action::Off => 0x02,
            Action::On => 0x03,
            Action::LockOn => 0x06,
            Action::LockOff => 0x07,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Action::Scan),
            0x01 => Some(Action::Status),
            0x02 => Some(Action::Off),
            0x03 => Some(Action::On),
            0x06 => Some(Action::LockOn),
            0x07 => Some(Action::LockOff),
            _ => None,
        }
    }
}

/// Operating mode, low 3 bits of the mode byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum OpMode {
    Cool,
    Dry,
    FanOnly,
    Auto,
    Heat,
}

impl OpMode {
    pub fn code(self) -> u8 {
        match self {
            OpMode::Cool => 0,
            OpMode::Dry => 1,
            OpMode::FanOnly => 2,
            OpMode::Auto => 3,
            OpMode::Heat => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OpMode::Cool),
            1 => Some(OpMode::Dry),
            2 => Some(OpMode::FanOnly),
            3 => Some(OpMode::Auto),
            4 => Some(OpMode::Heat),
            _ => None,
        }
    }
}

/// Fan speed, bits 4-6 of the mode byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FanSpeed {
    Low,
    Medium,
    High,
    Auto,
    Silent,
    Power,
}

impl FanSpeed {
    pub fn code(self) -> u8 {
        match self {
            FanSpeed::Low => 1,
            FanSpeed::Medium => 2,
            FanSpeed::High => 3,
            FanSpeed::Auto => 4,
            FanSpeed::Silent => 5,
            FanSpeed::Power => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FanSpeed::Low),
            2 => Some(FanSpeed::Medium),
            3 => Some(FanSpeed::High),
            4 => Some(FanSpeed::Auto),
            5 => Some(FanSpeed::Silent),
            6 => Some(FanSpeed::Power),
            _ => None,
        }
    }
}

/// Fan sweep, bit 0x08 of the mode byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Sweep {
    #[default]
    Fixed,
    Swing,
}
