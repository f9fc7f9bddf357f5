//! Modbus-TCP access to the field device.
//!
//! [`ModbusSession`] is the seam the poll loop talks to. [`TransientSession`]
//! opens a fresh connection for every request; [`RobustSession`] keeps one
//! connection open and reconnects after failures.

mod registers;
mod robust;
mod transient;

pub use robust::RobustSession;
pub use transient::TransientSession;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio_modbus::{Address, ExceptionCode, Quantity};

pub use crate::codec::Word;
pub type Coil = bool;

pub const MODBUS_TCP_PORT: u16 = 502;

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("connecting to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{operation} on {addr} timed out after {timeout:?}")]
    Timeout {
        addr: SocketAddr,
        operation: &'static str,
        timeout: Duration,
    },
    #[error("transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("device exception: {0}")]
    Exception(ExceptionCode),
    #[error("device returned {actual} items, {expected} requested")]
    UnexpectedLength { expected: usize, actual: usize },
    #[error("refusing to write an empty block")]
    EmptyWrite,
}

impl From<ExceptionCode> for ModbusError {
    fn from(code: ExceptionCode) -> Self {
        ModbusError::Exception(code)
    }
}

/// One read/write target on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress {
    pub socket_addr: SocketAddr,
    pub unit: u8,
    pub offset: Address,
}

impl EndpointAddress {
    pub fn new(socket_addr: SocketAddr, unit: u8, offset: Address) -> Self {
        Self {
            socket_addr,
            unit,
            offset,
        }
    }

    /// Resolve `host` (`ip`, `name`, `ip:port` or `name:port`), defaulting to
    /// the standard Modbus-TCP port.
    pub fn resolve(host: &str, unit: u8, offset: Address) -> io::Result<Self> {
        let mut addrs = match host.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => (host, MODBUS_TCP_PORT).to_socket_addrs()?,
        };
        let socket_addr = addrs.next().ok_or(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "cannot resolve hostname",
        ))?;

        Ok(Self::new(socket_addr, unit, offset))
    }
}

/// Acknowledgement of a completed block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub address: Address,
    pub quantity: Quantity,
}

#[allow(async_fn_in_trait)]
pub trait ModbusSession {
    /// Read holding registers (0x03) starting at the endpoint offset.
    async fn read_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError>;

    /// Read input registers (0x04) starting at the endpoint offset.
    async fn read_input_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError>;

    /// Read discrete inputs (0x02) starting at the endpoint offset.
    async fn read_discrete_inputs(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError>;

    /// Read coils (0x01) starting at the endpoint offset.
    async fn read_coils(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError>;

    /// Write a block of holding registers (0x10) starting at the endpoint offset.
    async fn write_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Word],
    ) -> Result<WriteAck, ModbusError>;

    /// Write a block of coils (0x0F) starting at the endpoint offset.
    async fn write_coils(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Coil],
    ) -> Result<WriteAck, ModbusError>;
}

/// Session selected at startup by `MODBUS_CONNECTION`.
#[derive(Debug)]
pub enum Session {
    PerCall(TransientSession),
    Pooled(RobustSession),
}

impl ModbusSession for Session {
    async fn read_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError> {
        match self {
            Session::PerCall(s) => s.read_holding_registers(endpoint, count).await,
            Session::Pooled(s) => s.read_holding_registers(endpoint, count).await,
        }
    }

    async fn read_input_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError> {
        match self {
            Session::PerCall(s) => s.read_input_registers(endpoint, count).await,
            Session::Pooled(s) => s.read_input_registers(endpoint, count).await,
        }
    }

    async fn read_discrete_inputs(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError> {
        match self {
            Session::PerCall(s) => s.read_discrete_inputs(endpoint, count).await,
            Session::Pooled(s) => s.read_discrete_inputs(endpoint, count).await,
        }
    }

    async fn read_coils(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError> {
        match self {
            Session::PerCall(s) => s.read_coils(endpoint, count).await,
            Session::Pooled(s) => s.read_coils(endpoint, count).await,
        }
    }

    async fn write_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Word],
    ) -> Result<WriteAck, ModbusError> {
        match self {
            Session::PerCall(s) => s.write_holding_registers(endpoint, values).await,
            Session::Pooled(s) => s.write_holding_registers(endpoint, values).await,
        }
    }

    async fn write_coils(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Coil],
    ) -> Result<WriteAck, ModbusError> {
        match self {
            Session::PerCall(s) => s.write_coils(endpoint, values).await,
            Session::Pooled(s) => s.write_coils(endpoint, values).await,
        }
    }
}
