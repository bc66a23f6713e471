//! Fixed-size on-EEPROM tank record layout.
//!
//! Every tank's EEPROM holds exactly one [`TankRecord`] in the 128-byte
//! layout the external interface fixes: 96 data bytes followed by the
//! 32-byte Reed-Solomon parity computed by
//! [`crate::devices::hardware::rs_codec`]. The layout is little-endian and
//! packed with explicit byte writes rather than relying on any struct
//! packing the compiler might choose - the record has to round-trip
//! byte-for-byte through a UART link and a third party's microcontroller.

use crate::devices::hardware::rs_codec::DATA;

/// Bytes of `name` a record can hold, including its null terminator.
pub const NAME_FIELD_LEN: usize = 80;
/// Sentinel `last_bus_index` meaning "this tank has never been placed".
pub const NEVER_PLACED_BUS: u8 = 0xFF;
/// Calibrated-neutral bounds a servo idle pulse must fall within to be
/// considered structurally sane.
pub const SERVO_IDLE_BOUNDS_US: std::ops::RangeInclusive<u16> = 500..=2500;

/// The 96-byte data payload stored (Reed-Solomon protected) in a tank's
/// EEPROM. Density and capacity are the external, wire-facing units (g/L,
/// mL) - the internal kg/L, L units `TankInfo` works in are a boundary
/// conversion, never mixed with this struct's fields directly (see
/// spec section 9's g/L-external/kg/L-internal note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TankRecord {
    pub last_base_mac: [u8; 6],
    /// 0..=5, or [`NEVER_PLACED_BUS`] if this tank has never been placed.
    pub last_bus_index: u8,
    /// Bytes of `name` populated, including the null terminator. Must be
    /// `<= NAME_FIELD_LEN`.
    pub name_length: u8,
    pub capacity_ml: u16,
    pub density_g_per_l: u16,
    pub servo_idle_us: u16,
    pub remaining_grams: u16,
    pub name: [u8; NAME_FIELD_LEN],
}

impl TankRecord {
    /// The record a freshly detected or integrity-failed tank is rewritten
    /// with: a zeroed, clearly-labelled placeholder so the tank stays
    /// visible to the user rather than disappearing.
    pub fn new_tank_default() -> Self {
        TankRecord::with_name("New Tank", 1500)
    }

    fn with_name(name: &str, servo_idle_us: u16) -> Self {
        let mut packed = [0u8; NAME_FIELD_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_FIELD_LEN - 1);
        packed[..n].copy_from_slice(&bytes[..n]);
        TankRecord {
            last_base_mac: [0; 6],
            last_bus_index: NEVER_PLACED_BUS,
            name_length: (n + 1) as u8,
            capacity_ml: 0,
            density_g_per_l: 0,
            servo_idle_us,
            remaining_grams: 0,
            name: packed,
        }
    }

    pub fn name_str(&self) -> String {
        let len = (self.name_length as usize).saturating_sub(1).min(NAME_FIELD_LEN);
        let end = self.name[..len].iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) {
        let mut packed = [0u8; NAME_FIELD_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_FIELD_LEN - 1);
        packed[..n].copy_from_slice(&bytes[..n]);
        self.name = packed;
        self.name_length = (n + 1) as u8;
    }

    /// The record's integrity procedure's structural-bounds half (the other
    /// half being the ECC decode itself, which lives in `rs_codec`).
    pub fn bounds_ok(&self) -> bool {
        self.name_length as usize <= NAME_FIELD_LEN
            && (self.last_bus_index <= 6 || self.last_bus_index == NEVER_PLACED_BUS)
            && SERVO_IDLE_BOUNDS_US.contains(&self.servo_idle_us)
    }

    /// Packs the record into the 96-byte data payload the Reed-Solomon
    /// codec expects, exactly per the external interface's offset table.
    pub fn to_bytes(&self) -> [u8; DATA] {
        let mut buf = [0u8; DATA];
        buf[0..6].copy_from_slice(&self.last_base_mac);
        buf[6] = self.last_bus_index;
        buf[7] = self.name_length;
        buf[8..10].copy_from_slice(&self.capacity_ml.to_le_bytes());
        buf[10..12].copy_from_slice(&self.density_g_per_l.to_le_bytes());
        buf[12..14].copy_from_slice(&self.servo_idle_us.to_le_bytes());
        buf[14..16].copy_from_slice(&self.remaining_grams.to_le_bytes());
        buf[16..16 + NAME_FIELD_LEN].copy_from_slice(&self.name);
        buf
    }

    /// Unpacks a data payload into a [`TankRecord`]. Does not itself check
    /// [`Self::bounds_ok`] - callers run that (and the ECC decode) as part
    /// of the record integrity procedure before trusting the result.
    pub fn from_bytes(buf: &[u8; DATA]) -> Self {
        let mut last_base_mac = [0u8; 6];
        last_base_mac.copy_from_slice(&buf[0..6]);
        let mut name = [0u8; NAME_FIELD_LEN];
        name.copy_from_slice(&buf[16..16 + NAME_FIELD_LEN]);
        TankRecord {
            last_base_mac,
            last_bus_index: buf[6],
            name_length: buf[7],
            capacity_ml: u16::from_le_bytes([buf[8], buf[9]]),
            density_g_per_l: u16::from_le_bytes([buf[10], buf[11]]),
            servo_idle_us: u16::from_le_bytes([buf[12], buf[13]]),
            remaining_grams: u16::from_le_bytes([buf[14], buf[15]]),
            name,
        }
    }
}

/// Runtime view of a tank. `full_info = false` marks a bare presence
/// witness (UID and bus index only, EEPROM not yet read); everything else
/// is zeroed/defaulted until a refresh populates it.
#[derive(Debug, Clone, PartialEq)]
pub struct TankInfo {
    pub uid: u64,
    /// -1 once logically detached during reconciliation; 0..=5 while
    /// occupying a bus.
    pub bus_index: i8,
    pub name: String,
    pub capacity_l: f32,
    pub density_kg_per_l: f32,
    pub remaining_weight_g: f32,
    pub servo_idle_us: u16,
    pub last_base_mac: [u8; 6],
    pub full_info: bool,
}

impl TankInfo {
    /// A bare presence witness: only the UID and the bus it was seen on are
    /// known.
    pub fn witness(uid: u64, bus_index: i8) -> Self {
        TankInfo {
            uid,
            bus_index,
            name: String::new(),
            capacity_l: 0.0,
            density_kg_per_l: 0.0,
            remaining_weight_g: 0.0,
            servo_idle_us: 1500,
            last_base_mac: [0; 6],
            full_info: false,
        }
    }

    /// Populates `self` from a validated EEPROM record, performing the
    /// mL->L and g/L->kg/L unit conversions at this boundary (spec section
    /// 9's canonical-boundary rule: g/L and mL on the wire, kg/L and L in
    /// memory).
    pub fn fill_from_record(&mut self, record: &TankRecord) {
        self.name = record.name_str();
        self.capacity_l = record.capacity_ml as f32 / 1000.0;
        self.density_kg_per_l = record.density_g_per_l as f32 / 1000.0;
        self.remaining_weight_g = record.remaining_grams as f32;
        self.servo_idle_us = record.servo_idle_us;
        self.last_base_mac = record.last_base_mac;
        self.full_info = true;
    }

    /// Builds the EEPROM record this `TankInfo` would write, overlaying
    /// `existing`'s fields with whatever differs and recomputing
    /// `last_base_mac`/`last_bus_index` against `host_mac`. Returns the
    /// record plus the set of field names that actually changed - used by
    /// [`crate::components::dispenser::registry::TankRegistry::commit`] for
    /// logging, never for control flow.
    pub fn to_record_diff(&self, existing: &TankRecord, host_mac: [u8; 6]) -> (TankRecord, Vec<&'static str>) {
        let bus_index_byte = if self.bus_index >= 0 {
            self.bus_index as u8
        } else {
            existing.last_bus_index
        };
        let capacity_ml = (self.capacity_l * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16;
        let density_g_per_l = (self.density_kg_per_l * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16;
        let remaining_grams = self.remaining_weight_g.round().clamp(0.0, u16::MAX as f32) as u16;

        let mut next = *existing;
        next.last_base_mac = host_mac;
        next.last_bus_index = bus_index_byte;
        next.set_name(&self.name);
        next.capacity_ml = capacity_ml;
        next.density_g_per_l = density_g_per_l;
        next.servo_idle_us = self.servo_idle_us;
        next.remaining_grams = remaining_grams;

        let mut changed = Vec::new();
        if next.last_base_mac != existing.last_base_mac {
            changed.push("last_base_mac");
        }
        if next.last_bus_index != existing.last_bus_index {
            changed.push("last_bus_index");
        }
        if next.name_str() != existing.name_str() {
            changed.push("name");
        }
        if next.capacity_ml != existing.capacity_ml {
            changed.push("capacity_ml");
        }
        if next.density_g_per_l != existing.density_g_per_l {
            changed.push("density_g_per_l");
        }
        if next.servo_idle_us != existing.servo_idle_us {
            changed.push("servo_idle_us");
        }
        if next.remaining_grams != existing.remaining_grams {
            changed.push("remaining_grams");
        }
        (next, changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_bytes() {
        let mut record = TankRecord::new_tank_default();
        record.set_name("chicken-kibble");
        record.capacity_ml = 5000;
        record.density_g_per_l = 1200;
        let bytes = record.to_bytes();
        let decoded = TankRecord::from_bytes(&bytes);
        assert_eq!(decoded, record);
        assert_eq!(decoded.name_str(), "chicken-kibble");
    }

    #[test]
    fn default_new_tank_passes_bounds_check() {
        assert!(TankRecord::new_tank_default().bounds_ok());
    }

    #[test]
    fn name_length_over_max_fails_bounds_check() {
        let mut record = TankRecord::new_tank_default();
        record.name_length = 0xFF;
        assert!(!record.bounds_ok());
    }

    #[test]
    fn servo_idle_outside_range_fails_bounds_check() {
        let mut record = TankRecord::new_tank_default();
        record.servo_idle_us = 100;
        assert!(!record.bounds_ok());
    }

    #[test]
    fn fill_from_record_converts_units_at_the_boundary() {
        let mut record = TankRecord::new_tank_default();
        record.capacity_ml = 2000;
        record.density_g_per_l = 550;
        record.remaining_grams = 300;
        let mut info = TankInfo::witness(1, 0);
        info.fill_from_record(&record);
        assert_eq!(info.capacity_l, 2.0);
        assert_eq!(info.density_kg_per_l, 0.55);
        assert_eq!(info.remaining_weight_g, 300.0);
    }

    #[test]
    fn to_record_diff_reports_no_changes_on_an_identical_commit() {
        let mut record = TankRecord::new_tank_default();
        record.last_bus_index = 0;
        let mut info = TankInfo::witness(1, 0);
        info.fill_from_record(&record);
        info.bus_index = 0;
        let (_next, changed) = info.to_record_diff(&record, [0; 6]);
        assert!(changed.is_empty(), "unexpected changes: {changed:?}");
    }

    #[test]
    fn to_record_diff_reports_the_fields_that_changed() {
        let record = TankRecord::new_tank_default();
        let mut info = TankInfo::witness(1, 0);
        info.fill_from_record(&record);
        info.name = "duck".into();
        info.remaining_weight_g = 42.0;
        let (next, changed) = info.to_record_diff(&record, [1, 2, 3, 4, 5, 6]);
        assert!(changed.contains(&"name"));
        assert!(changed.contains(&"remaining_grams"));
        assert!(changed.contains(&"last_base_mac"));
        assert_eq!(next.name_str(), "duck");
        assert_eq!(next.remaining_grams, 42);
    }
}
