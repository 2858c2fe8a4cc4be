// Contains types and constants restricting values related to the SCIP
// protocol and the sensor command set.
use std::{ops::RangeInclusive, time::Duration};

/// Maximum number of echoes a single step can carry in multi-echo mode.
pub const MAX_ECHO: usize = 3;

/// Scratch line buffer: the longest data line (64 payload bytes) plus
/// checksum and slack for the multi-echo markers.
pub(crate) const BUFFER_SIZE: usize = 64 + 2 + 5;

/// Timeout used while probing an unconfigured sensor.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(120);

/// Baudrates a URG sensor can be configured to, in probe order.
pub(crate) const TRY_BAUDRATES: [u32; 3] = [19_200, 38_400, 115_200];

pub(crate) const DEFAULT_BAUDRATE: u32 = 115_200;
pub(crate) const DEFAULT_TCP_PORT: u16 = 10_940;

// Minimum line counts (after the echoback) of the fixed-shape responses.
pub(crate) const PP_RESPONSE_LINES: usize = 10;
pub(crate) const VV_RESPONSE_LINES: usize = 7;
pub(crate) const II_RESPONSE_LINES: usize = 9;

pub(crate) const SKIP_SCAN_BOUNDS: RangeInclusive<u8> = 0..=9;
pub(crate) const SKIP_STEP_BOUNDS: RangeInclusive<i32> = 0..=99;

/// What a measurement request asks the sensor to report per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MeasurementType {
    /// Distance only.
    Distance,
    /// Distance plus reflected intensity.
    DistanceIntensity,
    /// Up to [`MAX_ECHO`] distance echoes per step.
    Multiecho,
    /// Up to [`MAX_ECHO`] distance and intensity echoes per step.
    MultiechoIntensity,
}

impl MeasurementType {
    pub(crate) fn is_intensity(self) -> bool {
        matches!(
            self,
            MeasurementType::DistanceIntensity | MeasurementType::MultiechoIntensity
        )
    }

    pub(crate) fn is_multiecho(self) -> bool {
        matches!(
            self,
            MeasurementType::Multiecho | MeasurementType::MultiechoIntensity
        )
    }
}

/// Number of characters a plain distance sample occupies on the wire.
/// Two-byte encoding caps the range at 4095 [mm] but shortens each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RangeDataByte {
    Two,
    Three,
}

impl RangeDataByte {
    pub(crate) fn size(self) -> usize {
        match self {
            RangeDataByte::Two => 2,
            RangeDataByte::Three => 3,
        }
    }
}

/// Physical connection to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ConnectionKind {
    Serial,
    Ethernet,
}

/// OSSD line states carried by the auxiliary block of a safety-mode
/// frame, plus whether its CRC matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyData {
    pub is_ossd1_1_on: bool,
    pub is_ossd1_2_on: bool,
    pub is_ossd2_1_on: bool,
    pub is_ossd2_2_on: bool,
    pub crc_valid: bool,
}
