//! CAN database: message/signal metadata and DBC loading

pub mod database;
pub mod dbc;

pub use database::{
    BusSpec, ByteOrder, Database, DatabaseStats, MessageSpec, SendType, SignalGroupSpec,
    SignalSpec, ValueType,
};
pub use dbc::load_dbc_file;
