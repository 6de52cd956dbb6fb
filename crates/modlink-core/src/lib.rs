//! Modbus protocol engine in pure Rust.
//!
//! `modlink-core` provides zero-copy, `no_std`-compatible encoding and decoding
//! of Modbus PDUs, the TCP/UDP (MBAP), RTU and ASCII frame variants, the CRC16
//! and LRC checksums, and the register codec that maps 16-bit words to typed
//! scalars.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod checksum;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod pdu;

pub use codec::{RegisterValue, ScalarKind, WordOrder};
#[cfg(feature = "alloc")]
pub use codec::Value;
pub use error::{DecodeError, EncodeError};
pub use frame::Transport;
