//! Parking Daemon - streaming sessions, subscriber fan-out and reservations
//!
//! This crate provides the core infrastructure for the parking daemon:
//! - `session` - Write and duplex streaming-session state machines
//! - `reactor` - Completion queue that owns and ticks the sessions
//! - `subscribers` - Registries fanning published messages out to streams
//! - `coordinator` - Space state machine, plate verification and expiry
//! - `storage` - Space records in memory or SQLite
//! - `server` - Unix socket server for client connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        parkd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  unary  ┌─────────────────────────┐    │
//! │  │  ParkingServer  │────────▶│      Coordinator        │    │
//! │  │ (Unix Socket)   │         │ (space state owner)     │    │
//! │  └────────┬────────┘         └──────┬───────────┬──────┘    │
//! │           │ streams                 │ publish   │           │
//! │           ▼                         ▼           ▼           │
//! │  ┌─────────────────┐   ┌────────────────┐  ┌──────────┐     │
//! │  │  ReactorActor   │──▶│  Subscribers   │  │ Database │     │
//! │  │ (session arena) │   │ (fan-out)      │  └──────────┘     │
//! │  └─────────────────┘   └────────────────┘                   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Poisoned locks are recovered; channel closure is handled gracefully

pub mod actuator;
pub mod config;
pub mod coordinator;
pub mod reactor;
pub mod server;
pub mod session;
pub mod storage;
pub mod subscribers;
