/* Defines the builder functionality for the sensor session with serial
and ethernet transport. */

use crate::config::{ConnectionKind, DEFAULT_BAUDRATE, DEFAULT_TCP_PORT};
use crate::sensor::Urg;
use crate::transport::Connection;
use crate::{Error, UrgResult};
use serial2::SerialPort;
use std::{
    marker::PhantomData,
    net::{SocketAddrV4, TcpStream},
    str::FromStr,
    time::Duration,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// Type-state builder states for the UrgBuilder
pub struct Init;
pub struct Serial;
pub struct Ethernet;

/// Type-state builder for a sensor session based on connection mode.
pub struct UrgBuilder<T> {
    device: Option<String>,
    addr: Option<SocketAddrV4>,
    baudrate: Option<u32>,
    _marker: PhantomData<T>,
}

impl UrgBuilder<Init> {
    /// Starts the type-state builder pattern
    pub fn new() -> UrgBuilder<Init> {
        Self {
            device: None,
            addr: None,
            baudrate: None,
            _marker: PhantomData,
        }
    }

    /// Continues in the path to open the sensor on a serial device.
    pub fn with_serial(self, device: &str) -> UrgBuilder<Serial> {
        UrgBuilder {
            device: Some(device.into()),
            addr: None,
            baudrate: Some(DEFAULT_BAUDRATE),
            _marker: PhantomData,
        }
    }

    /// Continues in the path to open the sensor over ethernet, on the
    /// default SCIP port.
    pub fn with_ethernet(self, v4_addr: &str) -> UrgResult<UrgBuilder<Ethernet>> {
        let addr = SocketAddrV4::from_str(&format!("{}:{}", v4_addr, DEFAULT_TCP_PORT))
            .map_err(|_| Error::InvalidParameter)?;
        Ok(UrgBuilder {
            device: None,
            addr: Some(addr),
            baudrate: None,
            _marker: PhantomData,
        })
    }
}

impl Default for UrgBuilder<Init> {
    fn default() -> Self {
        Self::new()
    }
}

impl UrgBuilder<Serial> {
    /// Baudrate the sensor is moved to once detected.
    pub fn baud(mut self, baudrate: u32) -> Self {
        self.baudrate = Some(baudrate);
        self
    }

    /// Opens the device, runs the baudrate handshake and retrieves the
    /// sensor parameters.
    pub fn build(self) -> UrgResult<Urg> {
        let device = self
            .device
            .expect("device required to get to serial build method.");
        let baudrate = self
            .baudrate
            .expect("baudrate required to get to serial build method.");
        let port = SerialPort::open(&device, baudrate).map_err(Error::SerialOpen)?;

        let conn = Connection::new(port);
        Urg::open_with(Box::new(conn), ConnectionKind::Serial, baudrate)
    }
}

impl UrgBuilder<Ethernet> {
    /// Overrides the default TCP port.
    pub fn port(mut self, port: u16) -> Self {
        if let Some(addr) = self.addr.as_mut() {
            addr.set_port(port);
        }
        self
    }

    /// Connects to the sensor and retrieves its parameters. Ethernet
    /// sensors always speak SCIP 2.0, so no handshake is needed.
    pub fn build(self) -> UrgResult<Urg> {
        let addr = self
            .addr
            .expect("address required to get to ethernet build method.");
        let stream = TcpStream::connect_timeout(&addr.into(), CONNECT_TIMEOUT)
            .map_err(Error::EthernetOpen)?;

        let conn = Connection::new(stream);
        Urg::open_with(Box::new(conn), ConnectionKind::Ethernet, 0)
    }
}
