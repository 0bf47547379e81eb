use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::protocol::frame::DecodedStatus;
use crate::protocol::values::{Action, FanSpeed, OpMode, Sweep};

/// Requested (or last observed) state of one indoor unit.
///
/// `None` fields mean "don't care" in a request and encode as zero on
/// the wire; decoded bus statuses always carry concrete values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Status {
    pub action: Option<Action>,
    pub opmode: Option<OpMode>,
    pub sweep: Sweep,
    pub fan_speed: Option<FanSpeed>,
    pub current_temp: f64,
    pub target_temp: u8,
}

impl Status {
    /// A pure status query: asks the unit to report without changing
    /// any setting.
    pub fn query() -> Self {
        Status {
            action: Some(Action::Status),
            opmode: None,
            sweep: Sweep::Fixed,
            fan_speed: None,
            current_temp: 25.0,
            target_temp: 25,
        }
    }
}

impl From<&DecodedStatus> for Status {
    fn from(decoded: &DecodedStatus) -> Self {
        Status {
            action: Some(decoded.action),
            opmode: decoded.opmode,
            sweep: decoded.sweep,
            fan_speed: Some(decoded.fan_speed),
            current_temp: decoded.current_temp,
            target_temp: decoded.set_temp,
        }
    }
}

/// One indoor unit on the bus, keyed by its group/unit id byte.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: u8,
    pub room: String,
    pub status: Status,
    pub last_scan: Option<Instant>,
    pub last_availability: Option<bool>,
}

impl Device {
    pub fn new(id: u8, room: impl Into<String>) -> Self {
        Device {
            id,
            room: room.into(),
            status: Status {
                action: None,
                opmode: None,
                sweep: Sweep::Fixed,
                fan_speed: None,
                current_temp: 27.0,
                target_temp: 27,
            },
            last_scan: None,
            last_availability: None,
        }
    }

    /// Whether the periodic scan should poll this unit again.
    pub fn is_scan_due(&self, interval: Duration, now: Instant) -> bool {
        match self.last_scan {
            None => true,
            Some(at) => now.duration_since(at) >= interval,
        }
    }

    pub fn mark_scanned(&mut self, now: Instant) {
        self.last_scan = Some(now);
    }

    /// Record an availability observation. Returns `Some(state)` when
    /// the state changed (or was seen for the first time) and should be
    /// republished, `None` when it is unchanged.
    pub fn availability_transition(&mut self, online: bool) -> Option<bool> {
        if self.last_availability == Some(online) {
            return None;
        }
        self.last_availability = Some(online);
        Some(online)
    }
}

/// All units the bridge manages, ordered by unit id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Build the registry from the configured room table, which maps a
    /// hex unit id (e.g. `"0x01"` or `"01"`) to a human room name.
    pub fn from_rooms(rooms: &HashMap<String, String>) -> Self {
        let mut devices: Vec<Device> = rooms
            .iter()
            .map(|(id, room)| {
                let id = parse_hex_id(id).unwrap_or_else(|| {
                    warn!("unparseable unit id {:?} for room {:?}, using 0", id, room);
                    0
                });
                Device::new(id, room.clone())
            })
            .collect();
        devices.sort_by_key(|d| d.id);
        DeviceRegistry { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.devices.iter().map(|d| d.id).collect()
    }

    pub fn get(&self, id: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, device: Device) {
        match self.devices.binary_search_by_key(&device.id, |d| d.id) {
            Ok(pos) => self.devices[pos] = device,
            Err(pos) => self.devices.insert(pos, device),
        }
    }

    /// Resolve a room name back to its unit. Topic segments replace
    /// spaces with underscores, so match either spelling.
    pub fn by_room(&self, room: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.room == room || d.room.replace(' ', "_") == room)
    }

    pub fn by_room_mut(&mut self, room: &str) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.room == room || d.room.replace(' ', "_") == room)
    }
}

fn parse_hex_id(id: &str) -> Option<u8> {
    let digits = id
        .trim()
        .strip_prefix("0x")
        .or_else(|| id.trim().strip_prefix("0X"))
        .unwrap_or_else(|| id.trim());
    u8::from_str_radix(digits, 16).ok()
}
