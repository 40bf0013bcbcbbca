//! TCP bridge between the orchestrator and agent worker processes.
//!
//! This module provides the wire protocol, codec and connection wrapper shared by
//! both ends.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request/Response, AgentStatus, Decision)
//! - **codec**: Length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **connection**: One framed TCP connection plus raw byte access

pub mod codec;
pub mod connection;
pub mod protocol;
