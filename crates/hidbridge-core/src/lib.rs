//! Core HidBridge helper-peer logic, free of any I/O:
//!
//! - Signaling wire types (envelope / message / payload kinds)
//! - Configuration parsing with defaults and clamping
//! - Adaptive bitrate controller with hysteresis gates
//! - Encoder pipeline argument matrix
//! - Command-line splitting and DirectShow device-name repair
//! - Single-active-peer pairing

#![forbid(unsafe_code)]

pub mod abr;
pub mod cmdline;
pub mod config;
pub mod pairing;
pub mod pipeline;
pub mod protocol;
