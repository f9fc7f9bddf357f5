use tokio_modbus::prelude::*;
use tokio_modbus::{Address, Quantity};

use super::{Coil, ModbusError, Word, WriteAck};

/// A single Modbus request, sent over an already open context.
pub(crate) trait Request {
    type Output;

    const NAME: &'static str;

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError>;
}

pub(crate) struct Coils {
    pub addr: Address,
    pub cnt: Quantity,
}

pub(crate) struct DiscreteInputs {
    pub addr: Address,
    pub cnt: Quantity,
}

pub(crate) struct HoldingRegisters {
    pub addr: Address,
    pub cnt: Quantity,
}

pub(crate) struct InputRegisters {
    pub addr: Address,
    pub cnt: Quantity,
}

pub(crate) struct WriteHoldingRegisters<'a> {
    pub addr: Address,
    pub data: &'a [Word],
}

pub(crate) struct WriteCoils<'a> {
    pub addr: Address,
    pub data: &'a [Coil],
}

fn exact<T>(items: Vec<T>, cnt: Quantity) -> Result<Vec<T>, ModbusError> {
    if items.len() == usize::from(cnt) {
        Ok(items)
    } else {
        Err(ModbusError::UnexpectedLength {
            expected: usize::from(cnt),
            actual: items.len(),
        })
    }
}

impl Request for Coils {
    type Output = Vec<Coil>;
    const NAME: &'static str = "read coils";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        exact(ctx.read_coils(self.addr, self.cnt).await??, self.cnt)
    }
}

impl Request for DiscreteInputs {
    type Output = Vec<Coil>;
    const NAME: &'static str = "read discrete inputs";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        exact(ctx.read_discrete_inputs(self.addr, self.cnt).await??, self.cnt)
    }
}

impl Request for HoldingRegisters {
    type Output = Vec<Word>;
    const NAME: &'static str = "read holding registers";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        exact(ctx.read_holding_registers(self.addr, self.cnt).await??, self.cnt)
    }
}

impl Request for InputRegisters {
    type Output = Vec<Word>;
    const NAME: &'static str = "read input registers";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        exact(ctx.read_input_registers(self.addr, self.cnt).await??, self.cnt)
    }
}

impl Request for WriteHoldingRegisters<'_> {
    type Output = WriteAck;
    const NAME: &'static str = "write holding registers";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        ctx.write_multiple_registers(self.addr, self.data).await??;
        Ok(WriteAck {
            address: self.addr,
            quantity: self.data.len() as Quantity,
        })
    }
}

impl Request for WriteCoils<'_> {
    type Output = WriteAck;
    const NAME: &'static str = "write coils";

    async fn send(self, ctx: &mut client::Context) -> Result<Self::Output, ModbusError> {
        ctx.write_multiple_coils(self.addr, self.data).await??;
        Ok(WriteAck {
            address: self.addr,
            quantity: self.data.len() as Quantity,
        })
    }
}
