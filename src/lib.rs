//! cometd - comet IRC daemon.
//!
//! A single-reactor IRCv3 server core: the wire protocol lives in
//! `comet-proto`; this crate owns the state graph, command dispatch,
//! hook bus, capability and mode registries, sending engine, module
//! loader and the async network shell.

pub mod caps;
pub mod commands;
pub mod config;
pub mod error;
pub mod hooks;
pub mod modes;
pub mod modules;
pub mod network;
pub mod reactor;
pub mod send;
pub mod state;
pub mod telemetry;
pub mod util;
