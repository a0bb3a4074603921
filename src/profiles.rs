//! Static GATT profile tables
//!
//! Layouts follow the Bluetooth SIG definitions for the Battery, Fitness
//! Machine (FTMS), Cycling Power, Cycling Speed and Cadence and Heart Rate
//! services. Characteristics that are declared with an empty layout are
//! enumerated and subscribed but not decoded.

use crate::registry::{
    bit, CharacteristicDescriptor, CharacteristicRole, CommandDefinition, FieldLayout, FlagBit,
    OutputField, ResponseCheck, ResponseField, ServiceDescriptor, ValueSource,
};
use crate::types::NumberFormat::{Int16, Uint16, Uint32, Uint8};

pub const BATTERY_SERVICE: u16 = 0x180f;
pub const FITNESS_MACHINE_SERVICE: u16 = 0x1826;
pub const CYCLING_POWER_SERVICE: u16 = 0x1818;
pub const CYCLING_SPEED_AND_CADENCE_SERVICE: u16 = 0x1816;
pub const HEART_RATE_SERVICE: u16 = 0x180d;

pub const BATTERY_LEVEL: u16 = 0x2a19;
pub const FITNESS_MACHINE_FEATURE: u16 = 0x2acc;
pub const FITNESS_MACHINE_CONTROL_POINT: u16 = 0x2ad9;
pub const TRAINING_STATUS: u16 = 0x2ad3;
pub const SUPPORTED_RESISTANCE_LEVEL_RANGE: u16 = 0x2ad6;
pub const SUPPORTED_POWER_RANGE: u16 = 0x2ad8;
pub const FITNESS_MACHINE_STATUS: u16 = 0x2ada;
pub const INDOOR_BIKE_DATA: u16 = 0x2ad2;
pub const CYCLING_POWER_MEASUREMENT: u16 = 0x2a63;
pub const CSC_MEASUREMENT: u16 = 0x2a5b;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
pub const BODY_SENSOR_LOCATION: u16 = 0x2a38;

/// Services used for discovery, in equipment-type priority order
pub static SERVICES: [ServiceDescriptor; 5] = [
    ServiceDescriptor {
        short_id: BATTERY_SERVICE,
        full_id: "0000180f-0000-1000-8000-00805f9b34fb",
        name: "battery_service",
    },
    ServiceDescriptor {
        short_id: FITNESS_MACHINE_SERVICE,
        full_id: "00001826-0000-1000-8000-00805f9b34fb",
        name: "fitness_machine",
    },
    ServiceDescriptor {
        short_id: CYCLING_POWER_SERVICE,
        full_id: "00001818-0000-1000-8000-00805f9b34fb",
        name: "cycling_power",
    },
    ServiceDescriptor {
        short_id: CYCLING_SPEED_AND_CADENCE_SERVICE,
        full_id: "00001816-0000-1000-8000-00805f9b34fb",
        name: "cycling_speed_and_cadence",
    },
    ServiceDescriptor {
        short_id: HEART_RATE_SERVICE,
        full_id: "0000180d-0000-1000-8000-00805f9b34fb",
        name: "heart_rate",
    },
];

/// Fitness Machine Feature field bits
pub static FITNESS_MACHINE_FEATURE_FLAGS: [FlagBit; 17] = [
    FlagBit::new("averageSpeedSupported", 0),
    FlagBit::new("cadenceSupported", 1),
    FlagBit::new("totalDistanceSupported", 2),
    FlagBit::new("inclinationSupported", 3),
    FlagBit::new("elevationGainSupported", 4),
    FlagBit::new("paceSupported", 5),
    FlagBit::new("stepCountSupported", 6),
    FlagBit::new("resistanceLevelSupported", 7),
    FlagBit::new("strideCountSupported", 8),
    FlagBit::new("expendedEnergySupported", 9),
    FlagBit::new("heartRateMeasurementSupported", 10),
    FlagBit::new("metabolicEquivalentSupported", 11),
    FlagBit::new("elapsedTimeSupported", 12),
    FlagBit::new("remainingTimeSupported", 13),
    FlagBit::new("powerMeasurementSupported", 14),
    FlagBit::new("forceOnBeltAndPowerOutputSupported", 15),
    FlagBit::new("userDataRetentionSupported", 16),
];

/// Target Setting Features field bits
pub static TARGET_SETTING_FEATURE_FLAGS: [FlagBit; 17] = [
    FlagBit::new("speedTargetSettingSupported", 0),
    FlagBit::new("inclinationTargetSettingSupported", 1),
    FlagBit::new("resistanceTargetSettingSupported", 2),
    FlagBit::new("powerTargetSettingSupported", 3),
    FlagBit::new("heartRateTargetSettingSupported", 4),
    FlagBit::new("targetedExpendedEnergyConfigurationSupported", 5),
    FlagBit::new("targetedStepNumberConfigurationSupported", 6),
    FlagBit::new("targetedStrideNumberConfigurationSupported", 7),
    FlagBit::new("targetedDistanceConfigurationSupported", 8),
    FlagBit::new("targetedTrainingTimeConfigurationSupported", 9),
    FlagBit::new("targetedTimeInTwoHeartRateZonesConfigurationSupported", 10),
    FlagBit::new("targetedTimeInThreeHeartRateZonesConfigurationSupported", 11),
    FlagBit::new("targetedTimeInFiveHeartRateZonesConfigurationSupported", 12),
    FlagBit::new("indoorBikeSimulationParametersSupported", 13),
    FlagBit::new("wheelCircumferenceConfigurationSupported", 14),
    FlagBit::new("spinDownControlSupported", 15),
    FlagBit::new("targetedCadenceConfigurationSupported", 16),
];

static BATTERY_LEVEL_LAYOUT: [FieldLayout; 1] =
    [FieldLayout::new("batteryLevel", Uint8, "percent")];

static FITNESS_MACHINE_FEATURE_LAYOUT: [FieldLayout; 2] = [
    FieldLayout::new("fitnessMachineFeature", Uint32, "struct")
        .flag_map(&FITNESS_MACHINE_FEATURE_FLAGS),
    FieldLayout::new("targetSettingFeature", Uint32, "struct")
        .flag_map(&TARGET_SETTING_FEATURE_FLAGS),
];

static SUPPORTED_RESISTANCE_LEVEL_RANGE_LAYOUT: [FieldLayout; 3] = [
    FieldLayout::new("minimumResistanceLevel", Int16, "").scaled(0.1),
    FieldLayout::new("maximumResistanceLevel", Int16, "").scaled(0.1),
    FieldLayout::new("minimumResistanceIncrement", Uint16, "").scaled(0.1),
];

static SUPPORTED_POWER_RANGE_LAYOUT: [FieldLayout; 3] = [
    FieldLayout::new("minimumPower", Int16, "w"),
    FieldLayout::new("maximumPower", Int16, "w"),
    FieldLayout::new("minimumPowerIncrement", Uint16, "w"),
];

// Bit 0 is "More Data": instantaneous speed is present when it is clear.
static INDOOR_BIKE_DATA_LAYOUT: [FieldLayout; 16] = [
    FieldLayout::flags(Uint16),
    FieldLayout::new("instantSpeed", Uint16, "km/h")
        .when_clear(bit(0))
        .scaled(0.01),
    FieldLayout::new("averageSpeed", Uint16, "km/h")
        .when_set(bit(1))
        .scaled(0.01),
    FieldLayout::new("instantCadence", Uint16, "rpm")
        .when_set(bit(2))
        .scaled(0.5),
    FieldLayout::new("averageCadence", Uint16, "rpm")
        .when_set(bit(3))
        .scaled(0.5),
    FieldLayout::new("totalDistance", Uint32, "m")
        .packed(3)
        .when_set(bit(4)),
    FieldLayout::new("resistanceLevel", Int16, "").when_set(bit(5)),
    FieldLayout::new("instantPower", Int16, "w").when_set(bit(6)),
    FieldLayout::new("averagePower", Int16, "w").when_set(bit(7)),
    FieldLayout::new("expendedEnergy", Uint16, "kcal").when_set(bit(8)),
    FieldLayout::new("energyPerHour", Uint16, "kcal/h").when_set(bit(8)),
    FieldLayout::new("energyPerMinute", Uint8, "kcal/min").when_set(bit(8)),
    FieldLayout::new("heartRate", Uint8, "bpm").when_set(bit(9)),
    FieldLayout::new("metabolicEquivalent", Uint8, "mets")
        .when_set(bit(10))
        .scaled(0.1),
    FieldLayout::new("elapsedTime", Uint16, "s").when_set(bit(11)),
    FieldLayout::new("remainingTime", Uint16, "s").when_set(bit(12)),
];

// The extreme angles are two 12-bit values packed into three bytes; they are
// reported as the raw packed word.
static CYCLING_POWER_MEASUREMENT_LAYOUT: [FieldLayout; 16] = [
    FieldLayout::flags(Uint16),
    FieldLayout::new("instantPower", Int16, "watt"),
    FieldLayout::new("pedalPowerBalance", Uint8, "percent")
        .when_set(bit(0))
        .scaled(0.5),
    FieldLayout::new("accumulatedTorque", Uint16, "newton_metre")
        .when_set(bit(2))
        .scaled(1.0 / 32.0),
    FieldLayout::new("cumulativeWheelRevolutions", Uint32, "unitless").when_set(bit(4)),
    FieldLayout::new("lastWheelEventTime", Uint16, "second")
        .when_set(bit(4))
        .scaled(1.0 / 2048.0),
    FieldLayout::new("cumulativeCrankRevolutions", Uint16, "unitless").when_set(bit(5)),
    FieldLayout::new("lastCrankEventTime", Uint16, "second")
        .when_set(bit(5))
        .scaled(1.0 / 1024.0),
    FieldLayout::new("maximumForceMagnitude", Int16, "newton").when_set(bit(6)),
    FieldLayout::new("minimumForceMagnitude", Int16, "newton").when_set(bit(6)),
    FieldLayout::new("maximumTorqueMagnitude", Int16, "newton_metre")
        .when_set(bit(7))
        .scaled(1.0 / 32.0),
    FieldLayout::new("minimumTorqueMagnitude", Int16, "newton_metre")
        .when_set(bit(7))
        .scaled(1.0 / 32.0),
    FieldLayout::new("extremeAngles", Uint32, "degree")
        .packed(3)
        .when_set(bit(8)),
    FieldLayout::new("topDeadSpotAngle", Uint16, "degree").when_set(bit(9)),
    FieldLayout::new("bottomDeadSpotAngle", Uint16, "degree").when_set(bit(10)),
    FieldLayout::new("accumulatedEnergy", Uint16, "kJ").when_set(bit(11)),
];

static CSC_MEASUREMENT_LAYOUT: [FieldLayout; 5] = [
    FieldLayout::flags(Uint8),
    FieldLayout::new("cumulativeWheelRevolutions", Uint32, "unitless").when_set(bit(0)),
    FieldLayout::new("lastWheelEventTime", Uint16, "second")
        .when_set(bit(0))
        .scaled(1.0 / 1024.0),
    FieldLayout::new("cumulativeCrankRevolutions", Uint16, "unitless").when_set(bit(1)),
    FieldLayout::new("lastCrankEventTime", Uint16, "second")
        .when_set(bit(1))
        .scaled(1.0 / 1024.0),
];

// Bit 0 selects an 8-bit or 16-bit rate; only the first RR interval is kept.
static HEART_RATE_MEASUREMENT_LAYOUT: [FieldLayout; 5] = [
    FieldLayout::flags(Uint8),
    FieldLayout::new("heartRate", Uint8, "bpm").when_clear(bit(0)),
    FieldLayout::new("heartRate", Uint16, "bpm").when_set(bit(0)),
    FieldLayout::new("energyExpended", Uint16, "kJ").when_set(bit(3)),
    FieldLayout::new("rrInterval", Uint16, "s")
        .when_set(bit(4))
        .scaled(1.0 / 1024.0),
];

static BODY_SENSOR_LOCATION_LAYOUT: [FieldLayout; 1] =
    [FieldLayout::new("sensorLocation", Uint8, "enum")];

const fn op_code(code: u8) -> OutputField {
    OutputField::new("opCode", Uint8, ValueSource::Constant(code as f64))
}

/// Response to every control point write: 0x80, echoed op code, result code
const fn ftms_response(code: u8) -> [ResponseField; 3] {
    [
        ResponseField {
            name: "responseCode",
            format: Uint8,
            check: ResponseCheck::Equals(0x80 as f64),
        },
        ResponseField {
            name: "requestCode",
            format: Uint8,
            check: ResponseCheck::Equals(code as f64),
        },
        ResponseField {
            name: "resultCode",
            format: Uint8,
            check: ResponseCheck::ResultCode,
        },
    ]
}

static CONTROL_POINT_COMMANDS: [(&str, CommandDefinition); 8] = [
    (
        "requestControl",
        CommandDefinition {
            buffer_size: 1,
            fields: &[op_code(0x00)],
            response: &ftms_response(0x00),
        },
    ),
    (
        "reset",
        CommandDefinition {
            buffer_size: 1,
            fields: &[op_code(0x01)],
            response: &ftms_response(0x01),
        },
    ),
    (
        "setTargetSpeed",
        CommandDefinition {
            buffer_size: 18,
            fields: &[
                op_code(0x02),
                OutputField::new("targetSpeed", Uint16, ValueSource::RoundedInput("targetSpeed"))
                    .little_endian(),
            ],
            response: &ftms_response(0x02),
        },
    ),
    (
        "setTargetInclination",
        CommandDefinition {
            buffer_size: 18,
            fields: &[
                op_code(0x03),
                OutputField::new(
                    "targetInclination",
                    Int16,
                    ValueSource::RoundedInput("targetInclination"),
                )
                .little_endian(),
            ],
            response: &ftms_response(0x03),
        },
    ),
    (
        "setTargetResistanceLevel",
        CommandDefinition {
            buffer_size: 18,
            fields: &[
                op_code(0x04),
                OutputField::new(
                    "targetResistanceLevel",
                    Uint8,
                    ValueSource::Input("targetResistanceLevel"),
                ),
            ],
            response: &ftms_response(0x04),
        },
    ),
    (
        "updateResistance",
        CommandDefinition {
            buffer_size: 18,
            fields: &[
                op_code(0x05),
                OutputField::new("resistance", Int16, ValueSource::RoundedInput("resistance"))
                    .little_endian(),
            ],
            response: &ftms_response(0x05),
        },
    ),
    (
        "startOrResume",
        CommandDefinition {
            buffer_size: 1,
            fields: &[op_code(0x07)],
            response: &ftms_response(0x07),
        },
    ),
    (
        "stopOrPause",
        CommandDefinition {
            buffer_size: 2,
            fields: &[
                op_code(0x08),
                OutputField::new(
                    "operation",
                    Uint8,
                    ValueSource::Choice {
                        input: "operation",
                        options: &[("stop", 0x01 as f64), ("pause", 0x02 as f64)],
                    },
                ),
            ],
            response: &ftms_response(0x08),
        },
    ),
];

/// Every characteristic the session knows how to handle
pub static CHARACTERISTICS: [CharacteristicDescriptor; 12] = [
    CharacteristicDescriptor {
        short_id: BATTERY_LEVEL,
        full_id: "00002a19-0000-1000-8000-00805f9b34fb",
        name: "battery_level",
        role: CharacteristicRole::Read(&BATTERY_LEVEL_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: FITNESS_MACHINE_FEATURE,
        full_id: "00002acc-0000-1000-8000-00805f9b34fb",
        name: "fitness_machine_feature",
        role: CharacteristicRole::Read(&FITNESS_MACHINE_FEATURE_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: FITNESS_MACHINE_CONTROL_POINT,
        full_id: "00002ad9-0000-1000-8000-00805f9b34fb",
        name: "fitness_machine_control_point",
        role: CharacteristicRole::Write(&CONTROL_POINT_COMMANDS),
    },
    CharacteristicDescriptor {
        short_id: TRAINING_STATUS,
        full_id: "00002ad3-0000-1000-8000-00805f9b34fb",
        name: "training_status",
        role: CharacteristicRole::Notify(&[]),
    },
    CharacteristicDescriptor {
        short_id: SUPPORTED_RESISTANCE_LEVEL_RANGE,
        full_id: "00002ad6-0000-1000-8000-00805f9b34fb",
        name: "supported_resistance_level_range",
        role: CharacteristicRole::Read(&SUPPORTED_RESISTANCE_LEVEL_RANGE_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: SUPPORTED_POWER_RANGE,
        full_id: "00002ad8-0000-1000-8000-00805f9b34fb",
        name: "supported_power_range",
        role: CharacteristicRole::Read(&SUPPORTED_POWER_RANGE_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: FITNESS_MACHINE_STATUS,
        full_id: "00002ada-0000-1000-8000-00805f9b34fb",
        name: "fitness_machine_status",
        role: CharacteristicRole::Notify(&[]),
    },
    CharacteristicDescriptor {
        short_id: INDOOR_BIKE_DATA,
        full_id: "00002ad2-0000-1000-8000-00805f9b34fb",
        name: "indoor_bike_data",
        role: CharacteristicRole::Notify(&INDOOR_BIKE_DATA_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: CYCLING_POWER_MEASUREMENT,
        full_id: "00002a63-0000-1000-8000-00805f9b34fb",
        name: "cycling_power_measurement",
        role: CharacteristicRole::Notify(&CYCLING_POWER_MEASUREMENT_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: CSC_MEASUREMENT,
        full_id: "00002a5b-0000-1000-8000-00805f9b34fb",
        name: "cycling_speed_and_cadence_measurement",
        role: CharacteristicRole::Notify(&CSC_MEASUREMENT_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: HEART_RATE_MEASUREMENT,
        full_id: "00002a37-0000-1000-8000-00805f9b34fb",
        name: "heart_rate_measurement",
        role: CharacteristicRole::Notify(&HEART_RATE_MEASUREMENT_LAYOUT),
    },
    CharacteristicDescriptor {
        short_id: BODY_SENSOR_LOCATION,
        full_id: "00002a38-0000-1000-8000-00805f9b34fb",
        name: "body_sensor_location",
        role: CharacteristicRole::Read(&BODY_SENSOR_LOCATION_LAYOUT),
    },
];
