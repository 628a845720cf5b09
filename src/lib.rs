//! Rendezvous - peer-to-peer media and data sessions over a signaling relay
//!
//! This crate negotiates WebRTC sessions between one host and any number of
//! watchers that meet on a named signaling channel.

pub mod config;
pub mod error;
pub mod events;
pub mod utils;
pub mod webrtc;

pub use error::{AppError, Result};
