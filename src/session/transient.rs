use std::time::Duration;
use tokio::time;
use tokio_modbus::prelude::*;
use tokio_modbus::Quantity;
use tracing::debug;

use super::registers::{
    Coils, DiscreteInputs, HoldingRegisters, InputRegisters, Request, WriteCoils,
    WriteHoldingRegisters,
};
use super::{Coil, EndpointAddress, ModbusError, ModbusSession, Word, WriteAck};

/// Connects, sends one request and disconnects, on every call.
///
/// Connecting and the request itself are each bounded by `timeout`. The
/// connection is closed whether or not the request succeeded, and dropping
/// an in-flight call closes the socket as well.
#[derive(Debug, Clone)]
pub struct TransientSession {
    timeout: Duration,
}

impl TransientSession {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn execute<R: Request>(
        &self,
        endpoint: &EndpointAddress,
        request: R,
    ) -> Result<R::Output, ModbusError> {
        let addr = endpoint.socket_addr;

        debug!("connecting to {} (unit {})", addr, endpoint.unit);
        let mut ctx = time::timeout(self.timeout, tcp::connect_slave(addr, Slave(endpoint.unit)))
            .await
            .map_err(|_| ModbusError::Timeout {
                addr,
                operation: "connect",
                timeout: self.timeout,
            })?
            .map_err(|source| ModbusError::Connect { addr, source })?;

        let result = match time::timeout(self.timeout, request.send(&mut ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::Timeout {
                addr,
                operation: R::NAME,
                timeout: self.timeout,
            }),
        };

        match time::timeout(self.timeout, ctx.disconnect()).await {
            Ok(Err(e)) => debug!("closing connection to {} failed: {}", addr, e),
            Err(_) => debug!("closing connection to {} timed out", addr),
            Ok(_) => debug!("disconnected from {}", addr),
        }

        result
    }
}

impl ModbusSession for TransientSession {
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
