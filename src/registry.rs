//! GATT format registry
//!
//! Declarative descriptions of the services and characteristics this crate
//! understands. A characteristic is either decoded from a [`FieldLayout`]
//! sequence (read and notify characteristics) or driven through a table of
//! [`CommandDefinition`]s (write characteristics). The actual tables live in
//! [`crate::profiles`]; this module holds the descriptor types and the
//! lookup functions used by the session.

use crate::profiles::{CHARACTERISTICS, SERVICES};
use crate::types::{Endian, NumberFormat, Result, TrainerError};

/// Suffix shared by every UUID derived from the Bluetooth base UUID
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Bit mask with only bit `n` set
pub const fn bit(n: u32) -> u32 {
    1 << n
}

/// A GATT service this crate recognizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceDescriptor {
    pub short_id: u16,
    pub full_id: &'static str,
    pub name: &'static str,
}

/// Condition under which a field is present in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Always transmitted
    Always,
    /// Transmitted only when any bit of the mask is set in the flag word
    WhenSet(u32),
    /// Transmitted only when the masked bits are clear in the flag word
    WhenClear(u32),
}

impl Presence {
    /// Whether a field with this presence rule is in a frame carrying `flags`
    pub fn is_present(self, flags: u32) -> bool {
        match self {
            Presence::Always => true,
            Presence::WhenSet(mask) => flags & mask != 0,
            Presence::WhenClear(mask) => flags & mask == 0,
        }
    }
}

/// A named bit of a feature bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagBit {
    pub name: &'static str,
    pub mask: u32,
}

impl FlagBit {
    pub const fn new(name: &'static str, n: u32) -> Self {
        Self { name, mask: bit(n) }
    }
}

/// Transformation applied to a raw field value after it is read
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Modifier {
    /// Multiply by a constant (unit resolution)
    Scale(f64),
    /// Expand a bitfield into named booleans
    Flags(&'static [FlagBit]),
}

/// Layout of one value inside a read/notify payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldLayout {
    pub name: &'static str,
    pub format: NumberFormat,
    /// Bytes consumed from the frame, normally the width of `format`
    pub byte_size: usize,
    pub unit: &'static str,
    pub presence: Presence,
    pub modifier: Option<Modifier>,
}

impl FieldLayout {
    /// Name that marks the leading flag word of a frame
    pub const FLAGS: &'static str = "flags";

    /// An always-present field consuming the full width of `format`
    pub const fn new(name: &'static str, format: NumberFormat, unit: &'static str) -> Self {
        Self {
            name,
            format,
            byte_size: format.width(),
            unit,
            presence: Presence::Always,
            modifier: None,
        }
    }

    /// The leading flag word of a frame
    pub const fn flags(format: NumberFormat) -> Self {
        Self::new(Self::FLAGS, format, "struct")
    }

    /// Present only when `mask` is set in the flag word
    pub const fn when_set(mut self, mask: u32) -> Self {
        self.presence = Presence::WhenSet(mask);
        self
    }

    /// Present only when `mask` is clear in the flag word
    pub const fn when_clear(mut self, mask: u32) -> Self {
        self.presence = Presence::WhenClear(mask);
        self
    }

    /// Multiply the raw value by `factor`
    pub const fn scaled(mut self, factor: f64) -> Self {
        self.modifier = Some(Modifier::Scale(factor));
        self
    }

    /// Expand the raw value into named flags
    pub const fn flag_map(mut self, bits: &'static [FlagBit]) -> Self {
        self.modifier = Some(Modifier::Flags(bits));
        self
    }

    /// Packed integer occupying fewer bytes than its format (e.g. uint24)
    pub const fn packed(mut self, byte_size: usize) -> Self {
        self.byte_size = byte_size;
        self
    }

    pub fn is_flags(&self) -> bool {
        self.name == Self::FLAGS
    }
}

/// Where an output field's value comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueSource {
    /// Fixed value, e.g. an op code
    Constant(f64),
    /// Numeric input supplied by the caller
    Input(&'static str),
    /// Numeric input rounded to the nearest integer
    RoundedInput(&'static str),
    /// Text input mapped through a fixed table
    Choice {
        input: &'static str,
        options: &'static [(&'static str, f64)],
    },
}

/// One value written into a command buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputField {
    pub name: &'static str,
    pub format: NumberFormat,
    pub value: ValueSource,
    pub endian: Endian,
}

impl OutputField {
    /// A big-endian field
    pub const fn new(name: &'static str, format: NumberFormat, value: ValueSource) -> Self {
        Self {
            name,
            format,
            value,
            endian: Endian::Big,
        }
    }

    /// The same field stored little-endian
    pub const fn little_endian(mut self) -> Self {
        self.endian = Endian::Little;
        self
    }
}

/// Outcome of checking one response field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Failed without a specific explanation
    Fail,
    /// Failed with a human-readable reason
    FailWith(String),
}

/// Validation rule for one response field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseCheck {
    /// Value must equal the expected constant
    Equals(f64),
    /// Value is a Fitness Machine Control Point result code
    ResultCode,
}

impl ResponseCheck {
    /// Apply the rule to a value read from a response
    pub fn check(&self, value: f64) -> Verdict {
        match self {
            ResponseCheck::Equals(expected) => {
                if value == *expected {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                }
            }
            ResponseCheck::ResultCode => match value as u8 {
                0x01 => Verdict::Pass,
                0x00 => Verdict::FailWith("Reserved.".to_string()),
                0x02 => Verdict::FailWith("Not supported.".to_string()),
                0x03 => Verdict::FailWith("Incorrect parameter.".to_string()),
                0x04 => Verdict::FailWith("Operation failed.".to_string()),
                0x05 => Verdict::FailWith("Control is not allowed.".to_string()),
                other => Verdict::FailWith(format!("Unknown result code 0x{:02X}.", other)),
            },
        }
    }
}

/// One value read back from a command response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseField {
    pub name: &'static str,
    pub format: NumberFormat,
    pub check: ResponseCheck,
}

/// Layout of a command buffer and the response that acknowledges it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandDefinition {
    pub buffer_size: usize,
    pub fields: &'static [OutputField],
    pub response: &'static [ResponseField],
}

/// Commands accepted by a write characteristic, keyed by name
pub type CommandTable = &'static [(&'static str, CommandDefinition)];

/// How the session handles a characteristic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CharacteristicRole {
    Read(&'static [FieldLayout]),
    Notify(&'static [FieldLayout]),
    Write(CommandTable),
}

impl CharacteristicRole {
    pub fn kind(&self) -> &'static str {
        match self {
            CharacteristicRole::Read(_) => "read",
            CharacteristicRole::Notify(_) => "notify",
            CharacteristicRole::Write(_) => "write",
        }
    }
}

/// A GATT characteristic this crate recognizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacteristicDescriptor {
    pub short_id: u16,
    pub full_id: &'static str,
    pub name: &'static str,
    pub role: CharacteristicRole,
}

impl CharacteristicDescriptor {
    /// Field layout for read and notify characteristics
    pub fn layout(&self) -> Option<&'static [FieldLayout]> {
        match self.role {
            CharacteristicRole::Read(layout) | CharacteristicRole::Notify(layout) => Some(layout),
            CharacteristicRole::Write(_) => None,
        }
    }

    /// Look up a command by name on a write characteristic
    pub fn command(&self, name: &str) -> Option<&'static CommandDefinition> {
        match self.role {
            CharacteristicRole::Write(commands) => commands
                .iter()
                .find(|(command, _)| *command == name)
                .map(|(_, definition)| definition),
            _ => None,
        }
    }
}

/// Device discovery filter: a device matches if it advertises any listed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<u16>,
}

impl ScanFilter {
    /// Full 128-bit UUIDs of the filtered services
    pub fn full_ids(&self) -> Vec<String> {
        self.services.iter().map(|id| short_id_to_full_id(*id)).collect()
    }
}

/// Expand a 16-bit assigned number into a full UUID string
pub fn short_id_to_full_id(short_id: u16) -> String {
    format!("0000{:04x}{}", short_id, BASE_UUID_SUFFIX)
}

/// Extract the 16-bit assigned number from a full UUID string
///
/// Takes the first hyphen-delimited segment, drops its leading four hex digits
/// and parses the remaining four.
pub fn full_id_to_short_id(full_id: &str) -> Result<u16> {
    let segment = full_id
        .split('-')
        .next()
        .filter(|segment| segment.len() == 8 && segment.is_ascii())
        .ok_or_else(|| TrainerError::InvalidUuid(full_id.to_string()))?;

    u16::from_str_radix(&segment[4..], 16)
        .map_err(|_| TrainerError::InvalidUuid(full_id.to_string()))
}

/// Look up a characteristic by its 16-bit id
pub fn lookup_characteristic(short_id: u16) -> Option<&'static CharacteristicDescriptor> {
    CHARACTERISTICS
        .iter()
        .find(|characteristic| characteristic.short_id == short_id)
}

/// Look up a service by its full UUID (case-insensitive)
pub fn lookup_service(full_id: &str) -> Option<&'static ServiceDescriptor> {
    SERVICES
        .iter()
        .find(|service| service.full_id.eq_ignore_ascii_case(full_id))
}

/// One filter per service, so a device advertising any of them matches
pub fn build_scan_filters(services: &[ServiceDescriptor]) -> Vec<ScanFilter> {
    services
        .iter()
        .map(|service| ScanFilter {
            services: vec![service.short_id],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{
        FITNESS_MACHINE_CONTROL_POINT, HEART_RATE_MEASUREMENT, INDOOR_BIKE_DATA,
    };

    #[test]
    fn test_short_id_round_trip() {
        let full = short_id_to_full_id(0x2ad2);
        assert_eq!(full, "00002ad2-0000-1000-8000-00805f9b34fb");
        assert_eq!(full_id_to_short_id(&full).unwrap(), 0x2ad2);
        assert_eq!(
            full_id_to_short_id("00002A37-0000-1000-8000-00805F9B34FB").unwrap(),
            0x2a37
        );
    }

    #[test]
    fn test_invalid_uuid() {
        assert!(full_id_to_short_id("").is_err());
        assert!(full_id_to_short_id("2a37").is_err());
        assert!(full_id_to_short_id("0000zzzz-0000-1000-8000-00805f9b34fb").is_err());
        assert!(full_id_to_short_id("aaa\u{e9}bbb-0000").is_err());
    }

    #[test]
    fn test_registry_ids_are_consistent() {
        for service in SERVICES.iter() {
            assert_eq!(service.full_id, short_id_to_full_id(service.short_id));
        }
        for characteristic in CHARACTERISTICS.iter() {
            assert_eq!(
                characteristic.full_id,
                short_id_to_full_id(characteristic.short_id),
                "{}",
                characteristic.name
            );
        }
    }

    #[test]
    fn test_lookup_characteristic() {
        let descriptor = lookup_characteristic(INDOOR_BIKE_DATA).unwrap();
        assert_eq!(descriptor.name, "indoor_bike_data");
        assert_eq!(descriptor.role.kind(), "notify");
        assert!(lookup_characteristic(HEART_RATE_MEASUREMENT).is_some());
        assert!(lookup_characteristic(0xFFFF).is_none());
    }

    #[test]
    fn test_lookup_service_ignores_case() {
        let service = lookup_service("0000180D-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(service.name, "heart_rate");
        assert!(lookup_service("0000feed-0000-1000-8000-00805f9b34fb").is_none());
    }

    #[test]
    fn test_build_scan_filters() {
        let filters = build_scan_filters(&SERVICES);
        assert_eq!(filters.len(), SERVICES.len());
        assert_eq!(filters[0].services, vec![0x180f]);
        assert_eq!(
            filters[1].full_ids(),
            vec!["00001826-0000-1000-8000-00805f9b34fb".to_string()]
        );
    }

    #[test]
    fn test_command_lookup() {
        let control_point = lookup_characteristic(FITNESS_MACHINE_CONTROL_POINT).unwrap();
        assert!(control_point.command("updateResistance").is_some());
        assert!(control_point.command("selfDestruct").is_none());
        assert!(control_point.layout().is_none());
    }

    #[test]
    fn test_presence() {
        assert!(Presence::Always.is_present(0));
        assert!(Presence::WhenSet(bit(3)).is_present(0b1000));
        assert!(!Presence::WhenSet(bit(3)).is_present(0b0100));
        assert!(Presence::WhenClear(bit(0)).is_present(0b10));
        assert!(!Presence::WhenClear(bit(0)).is_present(0b01));
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(ResponseCheck::ResultCode.check(1.0), Verdict::Pass);
        assert_eq!(
            ResponseCheck::ResultCode.check(5.0),
            Verdict::FailWith("Control is not allowed.".to_string())
        );
        assert_eq!(ResponseCheck::Equals(0x80 as f64).check(0x81 as f64), Verdict::Fail);
    }
}
