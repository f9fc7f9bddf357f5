//! Session tests against an in-process Modbus-TCP server.

use std::collections::HashMap;
use std::future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

use plc_pg_bridge::codec::{self, ByteOrder, DataType, DecodedValue, WordOrder};
use plc_pg_bridge::session::{
    EndpointAddress, ModbusError, ModbusSession, RobustSession, TransientSession, WriteAck,
};

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Default)]
struct Plc {
    holding: Arc<Mutex<HashMap<u16, u16>>>,
    input: Arc<Mutex<HashMap<u16, u16>>>,
    coils: Arc<Mutex<HashMap<u16, bool>>>,
    discrete: Arc<Mutex<HashMap<u16, bool>>>,
}

impl Plc {
    fn seeded() -> Self {
        let plc = Plc::default();
        {
            let mut holding = plc.holding.lock().unwrap();
            holding.insert(1700, 0x0000);
            holding.insert(1701, 0x00FF);
            for addr in 10..14 {
                holding.insert(addr, 0);
            }
            plc.input.lock().unwrap().insert(0, 0x0102);
            let mut coils = plc.coils.lock().unwrap();
            for addr in 0..8 {
                coils.insert(addr, false);
            }
            let mut discrete = plc.discrete.lock().unwrap();
            discrete.insert(0, true);
            discrete.insert(1, false);
        }
        plc
    }
}

fn read_block<T: Copy>(
    table: &HashMap<u16, T>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<T>, ExceptionCode> {
    (0..cnt)
        .map(|i| {
            table
                .get(&addr.wrapping_add(i))
                .copied()
                .ok_or(ExceptionCode::IllegalDataAddress)
        })
        .collect()
}

fn write_block<T: Copy>(
    table: &mut HashMap<u16, T>,
    addr: u16,
    values: &[T],
) -> Result<(), ExceptionCode> {
    for (i, value) in values.iter().enumerate() {
        let target = addr.wrapping_add(i as u16);
        if !table.contains_key(&target) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        table.insert(target, *value);
    }
    Ok(())
}

impl tokio_modbus::server::Service for Plc {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                read_block(&self.holding.lock().unwrap(), addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                read_block(&self.input.lock().unwrap(), addr, cnt)
                    .map(Response::ReadInputRegisters)
            }
            Request::ReadCoils(addr, cnt) => {
                read_block(&self.coils.lock().unwrap(), addr, cnt).map(Response::ReadCoils)
            }
            Request::ReadDiscreteInputs(addr, cnt) => {
                read_block(&self.discrete.lock().unwrap(), addr, cnt)
                    .map(Response::ReadDiscreteInputs)
            }
            Request::WriteMultipleRegisters(addr, values) => {
                write_block(&mut self.holding.lock().unwrap(), addr, &*values)
                    .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16))
            }
            Request::WriteMultipleCoils(addr, values) => {
                write_block(&mut self.coils.lock().unwrap(), addr, &*values)
                    .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

async fn start_plc() -> (SocketAddr, Plc) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    let plc = Plc::seeded();

    let server = Server::new(listener);
    let service = plc.clone();
    let on_connected = move |stream, socket_addr| {
        let service = service.clone();
        async move { accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(service.clone()))) }
    };

    tokio::spawn(async move {
        if let Err(e) = server
            .serve(&on_connected, |err| eprintln!("server error: {err}"))
            .await
        {
            eprintln!("server stopped: {e}");
        }
    });

    (socket_addr, plc)
}

/// Accepts connections and never answers.
async fn start_silent_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    socket_addr
}

async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Every session mode must behave the same against a healthy device.
async fn exercise_all_operations<S: ModbusSession>(session: &mut S, addr: SocketAddr, plc: &Plc) {
    let endpoint = EndpointAddress::new(addr, 1, 1700);
    let words = session.read_holding_registers(&endpoint, 2).await.unwrap();
    assert_eq!(words, vec![0x0000, 0x00FF]);
    let values = codec::decode(&words, DataType::Int32, ByteOrder::Big, WordOrder::Big, 4).unwrap();
    assert_eq!(values, vec![DecodedValue::I32(255)]);

    let endpoint = EndpointAddress::new(addr, 1, 0);
    let words = session.read_input_registers(&endpoint, 1).await.unwrap();
    assert_eq!(words, vec![0x0102]);

    let bits = session.read_discrete_inputs(&endpoint, 2).await.unwrap();
    assert_eq!(bits, vec![true, false]);

    let ack = session
        .write_coils(&endpoint, &[true, false, true])
        .await
        .unwrap();
    assert_eq!(
        ack,
        WriteAck {
            address: 0,
            quantity: 3
        }
    );
    let bits = session.read_coils(&endpoint, 4).await.unwrap();
    assert_eq!(bits, vec![true, false, true, false]);

    let endpoint = EndpointAddress::new(addr, 1, 10);
    let block = codec::encode(&[DecodedValue::F32(230.4)], ByteOrder::Big, WordOrder::Little);
    let ack = session
        .write_holding_registers(&endpoint, &block)
        .await
        .unwrap();
    assert_eq!(
        ack,
        WriteAck {
            address: 10,
            quantity: 2
        }
    );
    let stored = session.read_holding_registers(&endpoint, 2).await.unwrap();
    assert_eq!(stored, block);
    assert_eq!(plc.holding.lock().unwrap()[&10], block[0]);
}

#[tokio::test]
async fn transient_session_covers_all_operations() {
    let (addr, plc) = start_plc().await;
    let mut session = TransientSession::new(TIMEOUT);

    exercise_all_operations(&mut session, addr, &plc).await;
}

#[tokio::test]
async fn robust_session_covers_all_operations() {
    let (addr, plc) = start_plc().await;
    let mut session = RobustSession::new(TIMEOUT);

    exercise_all_operations(&mut session, addr, &plc).await;
    assert!(session.is_connected());

    session.disconnect().await;
    assert!(!session.is_connected());
}

#[tokio::test]
async fn device_exception_is_reported() {
    let (addr, _plc) = start_plc().await;
    let endpoint = EndpointAddress::new(addr, 1, 4000);

    let mut transient = TransientSession::new(TIMEOUT);
    let err = transient
        .read_holding_registers(&endpoint, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalDataAddress)
    ));

    let mut robust = RobustSession::new(TIMEOUT);
    let err = robust.read_holding_registers(&endpoint, 2).await.unwrap_err();
    assert!(matches!(err, ModbusError::Exception(_)));
    // the device answered, so the link stays up
    assert!(robust.is_connected());
}

#[tokio::test]
async fn unreachable_device_fails_without_panicking() {
    let endpoint = EndpointAddress::new(unused_addr().await, 1, 1700);

    let mut transient = TransientSession::new(TIMEOUT);
    let err = transient
        .read_holding_registers(&endpoint, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Connect { .. } | ModbusError::Timeout { .. }
    ));

    let mut robust = RobustSession::new(TIMEOUT);
    let err = robust.read_holding_registers(&endpoint, 2).await.unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Connect { .. } | ModbusError::Timeout { .. }
    ));
    assert!(!robust.is_connected());
}

#[tokio::test]
async fn empty_writes_are_rejected_before_connecting() {
    let endpoint = EndpointAddress::new(unused_addr().await, 1, 0);

    let mut transient = TransientSession::new(TIMEOUT);
    assert!(matches!(
        transient.write_holding_registers(&endpoint, &[]).await,
        Err(ModbusError::EmptyWrite)
    ));
    let mut robust = RobustSession::new(TIMEOUT);
    assert!(matches!(
        robust.write_coils(&endpoint, &[]).await,
        Err(ModbusError::EmptyWrite)
    ));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let timeout = Duration::from_millis(200);
    let endpoint = EndpointAddress::new(start_silent_peer().await, 1, 1700);

    let mut transient = TransientSession::new(timeout);
    let err = transient
        .read_holding_registers(&endpoint, 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Timeout {
            operation: "read holding registers",
            ..
        }
    ));

    let mut robust = RobustSession::new(timeout);
    let err = robust.read_holding_registers(&endpoint, 2).await.unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Timeout {
            operation: "read holding registers",
            ..
        }
    ));
}

#[tokio::test]
async fn robust_session_reconnects_after_timeout() {
    let timeout = Duration::from_millis(200);
    let (healthy, _plc) = start_plc().await;
    let healthy = EndpointAddress::new(healthy, 1, 1700);
    let silent = EndpointAddress::new(start_silent_peer().await, 1, 1700);
    let mut session = RobustSession::new(timeout);

    session.read_holding_registers(&healthy, 2).await.unwrap();
    assert!(session.is_connected());

    let err = session.read_holding_registers(&silent, 2).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert!(!session.is_connected());

    let words = session.read_holding_registers(&healthy, 2).await.unwrap();
    assert_eq!(words, vec![0x0000, 0x00FF]);
    assert!(session.is_connected());
}

#[tokio::test]
async fn robust_connect_retries_stay_within_one_timeout() {
    let timeout = Duration::from_millis(500);
    let endpoint = EndpointAddress::new(unused_addr().await, 1, 1700);
    let mut session = RobustSession::new(timeout);

    let started = tokio::time::Instant::now();
    assert!(session.read_coils(&endpoint, 1).await.is_err());
    assert!(started.elapsed() < timeout + Duration::from_millis(250));
    assert!(!session.is_connected());
}
