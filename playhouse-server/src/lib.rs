//! Client gateway and server lifecycle (C3, C14). `playhouse-core` owns the
//! mesh, stages, and dispatchers; this crate wires them to real sockets.

pub mod admin;
pub mod bootstrap;
pub mod framing;
pub mod gateway;
pub mod listener;
pub mod session;
pub mod session_tls;
pub mod session_ws;
