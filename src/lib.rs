//! airlink: IEEE 802.11 station-mode MAC core.
//!
//! Sits between a radio driver (raw frames to and from the air) and a
//! network stack (layer-3 packets to and from sockets) and owns everything
//! that makes the radio a usable wireless link: scanning for access
//! points, authenticating and associating with one, driving the WPA2/CCMP
//! key-handshake glue, and encapsulating the data path. The radio, the
//! network stack, and the cipher primitive stay outside, reached through
//! the traits in [`device`]; the whole crate is testable on any host with
//! `cargo test`.
//!
//! The code is organized in two layers:
//! - **Codec**: [`frame`], [`ie`], pure byte-level 802.11 frame and
//!   element logic with no link state.
//! - **Machinery**: [`bss`], [`key`], [`scan`], [`state`], [`data`],
//!   [`link`], the BSS registry, the connection state machine, and the
//!   transmit/receive paths, sharing one link-level lock.

pub mod bss;
pub mod data;
pub mod defaults;
pub mod device;
pub mod error;
pub mod frame;
pub mod ie;
pub mod key;
pub mod link;
pub mod scan;
pub mod state;
mod timer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use data::{TxFlags, TxPacket};
pub use error::{DriverStatus, Error, Result};
pub use link::{Link, LinkProperties};
pub use scan::{ScanFlags, ScanRequest};
pub use state::LinkState;
