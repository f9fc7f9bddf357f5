//! Bridge between one Modbus-TCP PLC and a PostgreSQL table.
//!
//! A register block is read at a fixed interval, decoded into typed values
//! and inserted as one row per reading.

pub mod codec;
pub mod config;
pub mod db;
pub mod poller;
pub mod session;
