use std::net::SocketAddr;
use std::time::Duration;
use tokio::time;
use tokio_modbus::prelude::*;
use tokio_modbus::Quantity;
use tokio_retry::strategy::{jitter, FixedInterval};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use super::registers::{
    Coils, DiscreteInputs, HoldingRegisters, InputRegisters, Request, WriteCoils,
    WriteHoldingRegisters,
};
use super::{Coil, EndpointAddress, ModbusError, ModbusSession, Word, WriteAck};

#[derive(Debug)]
struct Connection {
    addr: SocketAddr,
    unit: u8,
    ctx: client::Context,
}

impl Connection {
    async fn open(addr: SocketAddr, unit: u8, timeout: Duration) -> Result<Self, ModbusError> {
        debug!("trying to connect modbus {} (unit {})", addr, unit);
        let ctx = time::timeout(timeout, tcp::connect_slave(addr, Slave(unit)))
            .await
            .map_err(|_| ModbusError::Timeout {
                addr,
                operation: "connect",
                timeout,
            })?
            .map_err(|source| ModbusError::Connect { addr, source })?;

        Ok(Self { addr, unit, ctx })
    }

    fn select_unit(&mut self, unit: u8) {
        if self.unit != unit {
            self.ctx.set_slave(Slave(unit));
            self.unit = unit;
        }
    }

    async fn close(mut self, timeout: Duration) {
        match time::timeout(timeout, self.ctx.disconnect()).await {
            Ok(Err(e)) => debug!("closing connection to {} failed: {}", self.addr, e),
            Err(_) => debug!("closing connection to {} timed out", self.addr),
            Ok(_) => debug!("disconnected from {}", self.addr),
        }
    }
}

/// Keeps one connection to the device open across calls.
///
/// A failed request drops the connection; the next call reconnects, retrying
/// the connect a few times. All connect attempts together share one
/// `timeout`, so a reconnect never holds a call longer than a single connect
/// would. Requests themselves are never retried. Device exception responses
/// leave the connection in place.
#[derive(Debug)]
pub struct RobustSession {
    timeout: Duration,
    connection: Option<Connection>,
}

impl RobustSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connection: None,
        }
    }

    fn retry_strategy_connect() -> impl Iterator<Item = Duration> {
        FixedInterval::from_millis(10).map(jitter).take(3)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close(self.timeout).await;
        }
    }

    async fn connection_for(&mut self, endpoint: &EndpointAddress) -> Result<Connection, ModbusError> {
        match self.connection.take() {
            Some(conn) if conn.addr == endpoint.socket_addr => return Ok(conn),
            Some(stale) => stale.close(self.timeout).await,
            None => {}
        }

        let (addr, unit, timeout) = (endpoint.socket_addr, endpoint.unit, self.timeout);
        let action = || Connection::open(addr, unit, timeout);
        let attempts = time::timeout(timeout, Retry::spawn(Self::retry_strategy_connect(), action))
            .await
            .unwrap_or(Err(ModbusError::Timeout {
                addr,
                operation: "connect",
                timeout,
            }));
        match attempts {
            Ok(conn) => {
                info!("successfully connected modbus {}", addr);
                Ok(conn)
            }
            Err(e) => {
                warn!("could not connect modbus {}: {}", addr, e);
                Err(e)
            }
        }
    }

    async fn execute<R: Request>(
        &mut self,
        endpoint: &EndpointAddress,
        request: R,
    ) -> Result<R::Output, ModbusError> {
        let mut conn = self.connection_for(endpoint).await?;
        conn.select_unit(endpoint.unit);

        match time::timeout(self.timeout, request.send(&mut conn.ctx)).await {
            Ok(Ok(output)) => {
                self.connection = Some(conn);
                Ok(output)
            }
            Ok(Err(ModbusError::Exception(code))) => {
                self.connection = Some(conn);
                Err(ModbusError::Exception(code))
            }
            Ok(Err(e)) => {
                warn!("dropping modbus connection to {}: {}", conn.addr, e);
                conn.close(self.timeout).await;
                Err(e)
            }
            Err(_) => {
                warn!("dropping modbus connection to {}: {} timed out", conn.addr, R::NAME);
                conn.close(self.timeout).await;
                Err(ModbusError::Timeout {
                    addr: endpoint.socket_addr,
                    operation: R::NAME,
                    timeout: self.timeout,
                })
            }
        }
    }
}

impl ModbusSession for RobustSession {
    async fn read_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError> {
        let request = HoldingRegisters {
            addr: endpoint.offset,
            cnt: count,
        };
        self.execute(endpoint, request).await
    }

    async fn read_input_registers(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Word>, ModbusError> {
        let request = InputRegisters {
            addr: endpoint.offset,
            cnt: count,
        };
        self.execute(endpoint, request).await
    }

    async fn read_discrete_inputs(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError> {
        let request = DiscreteInputs {
            addr: endpoint.offset,
            cnt: count,
        };
        self.execute(endpoint, request).await
    }

    async fn read_coils(
        &mut self,
        endpoint: &EndpointAddress,
        count: Quantity,
    ) -> Result<Vec<Coil>, ModbusError> {
        let request = Coils {
            addr: endpoint.offset,
            cnt: count,
        };
        self.execute(endpoint, request).await
    }

    async fn write_holding_registers(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Word],
    ) -> Result<WriteAck, ModbusError> {
        if values.is_empty() {
            return Err(ModbusError::EmptyWrite);
        }
        let request = WriteHoldingRegisters {
            addr: endpoint.offset,
            data: values,
        };
        self.execute(endpoint, request).await
    }

    async fn write_coils(
        &mut self,
        endpoint: &EndpointAddress,
        values: &[Coil],
    ) -> Result<WriteAck, ModbusError> {
        if values.is_empty() {
            return Err(ModbusError::EmptyWrite);
        }
        let request = WriteCoils {
            addr: endpoint.offset,
            data: values,
        };
        self.execute(endpoint, request).await
    }
}
