//! Host-side driver for Hokuyo URG scanning range sensors speaking the
//! SCIP 2.0 text protocol.
//!
//! The `urg` crate opens a session with a sensor over a serial line or a
//! TCP socket, negotiates the baud rate and protocol revision, retrieves
//! the sensor intrinsics and drives one-shot or continuous measurement
//! streams. Decoded samples are written into caller-provided arrays as
//! millimetre distances, optionally with per-step intensity values or up
//! to three echoes per step.
//!
//! # Example
//! This example opens a sensor on a serial port, requests one distance
//! scan and prints the sample in front of the sensor.
//!
//! ```no_run
//! # fn example() -> urg::UrgResult<()> {
//! use urg::{MeasurementType, UrgBuilder};
//!
//! let mut urg = UrgBuilder::new().with_serial("/dev/ttyACM0").build()?;
//! let mut data = vec![0u32; urg.max_data_size()];
//! urg.start_measurement(MeasurementType::Distance, 1, 0)?;
//! let n = urg.get_distance(&mut data, None)?;
//! println!("{} steps, front: {} [mm]", n, data[urg.step_to_index(0)]);
//! # Ok(())
//! # }
//! ```
//! # Example
//! This example connects over ethernet (default port 10940) and streams
//! distance data until stopped.
//!
//! ```no_run
//! # fn example() -> urg::UrgResult<()> {
//! use urg::{MeasurementType, UrgBuilder};
//!
//! let mut urg = UrgBuilder::new().with_ethernet("192.168.0.10")?.build()?;
//! let mut data = vec![0u32; urg.max_data_size()];
//! urg.start_measurement(MeasurementType::Distance, 0, 0)?;
//! for _ in 0..10 {
//!     let n = urg.get_distance(&mut data, None)?;
//!     println!("{} steps", n);
//! }
//! urg.stop_measurement()?;
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod builder;
pub mod config;
pub(crate) mod crc;
pub(crate) mod scip;
pub mod sensor;
pub(crate) mod transport;

pub use builder::UrgBuilder;
pub use config::{ConnectionKind, MeasurementType, RangeDataByte, SafetyData};
pub use sensor::Urg;

/// Errors for the sensor session api.
///
/// Every variant maps to a stable numeric code via [`Error::code`], so
/// callers that mirror the C driver's errno convention keep working.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not connected")]
    NotConnected,
    #[error("could not open serial device")]
    SerialOpen(#[source] std::io::Error),
    #[error("could not open ethernet connection")]
    EthernetOpen(#[source] std::io::Error),
    #[error("send error")]
    Send,
    #[error("no response from sensor")]
    NoResponse,
    #[error("invalid response")]
    InvalidResponse,
    #[error("checksum mismatch")]
    Checksum,
    #[error("could not detect sensor baudrate")]
    BaudrateNotDetected,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("receive error")]
    Receive,
    #[error("scanning parameter out of range")]
    ScanningParameter,
    #[error("data size parameter out of range")]
    DataSize,
    #[error("unknown error")]
    Unknown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The stable numeric error code, in the ordering of the original
    /// urg_errno table. `0` is reserved for "no error".
    pub fn code(&self) -> i32 {
        match self {
            Error::Unknown => -1,
            Error::NotConnected => -2,
            Error::InvalidResponse => -4,
            Error::NoResponse => -5,
            Error::Send => -6,
            Error::Receive => -7,
            Error::Checksum => -8,
            Error::InvalidParameter => -9,
            Error::BaudrateNotDetected => -10,
            Error::SerialOpen(_) => -11,
            Error::EthernetOpen(_) => -12,
            Error::ScanningParameter => -13,
            Error::DataSize => -14,
            Error::Io(_) => -1,
        }
    }

    /// Static message for a stored error code, for sessions that report
    /// their last error after the fact.
    pub(crate) fn message(code: i32) -> &'static str {
        match code {
            0 => "no error",
            -2 => "not connected",
            -4 => "invalid response",
            -5 => "no response from sensor",
            -6 => "send error",
            -7 => "receive error",
            -8 => "checksum mismatch",
            -9 => "invalid parameter",
            -10 => "could not detect sensor baudrate",
            -11 => "could not open serial device",
            -12 => "could not open ethernet connection",
            -13 => "scanning parameter out of range",
            -14 => "data size parameter out of range",
            _ => "unknown error",
        }
    }
}

pub type UrgResult<T> = std::result::Result<T, Error>;
