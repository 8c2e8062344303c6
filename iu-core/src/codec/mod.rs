//! Register codecs
//!
//! Translate between configuration values and the bit layouts of the voltage
//! mailbox, the RAPL power limit registers and the temperature target.
//! Codecs never open or close handles.

pub mod power;
pub mod thermal;
pub mod undervolt;

pub use power::{
    apply_power_limit, decode_power_limit, decode_time_window, encode_power_limit,
    encode_time_window, PowerLimitReading, PowerLimitReport, PowerTermReading, RaplUnits,
};
pub use thermal::{apply_thermal_offset, decode_thermal_offset, encode_thermal_offset};
pub use undervolt::{
    apply_undervolt, apply_undervolts, decode_offset, encode_offset, UndervoltOutcome,
};
