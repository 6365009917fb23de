//! Capmon - live capture monitor for a remote traffic-capture service.
//!
//! The capture engine runs remotely on the traffic generator and retains
//! matching packets in per-session buffers. This crate is the console side:
//! it starts sessions over a shared RPC channel, drains cyclic sessions in a
//! background worker and streams the packets to a console or named-pipe sink.

pub mod error;
pub mod manager;
pub mod monitor;
pub mod pcap;
pub mod service;
pub mod writer;
