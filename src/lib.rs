//! Lock-step TFTP (RFC 1350) client engine.
//!
//! The pieces, bottom up:
//! - [`packet`]    : wire format of the five packet kinds
//! - [`stream`]    : what an upload reads from and a download writes to
//! - [`retransmit`]: the single outstanding packet and its retry timer
//! - [`session`]   : connection state machine, sans I/O
//! - [`transport`] : UDP socket, host lookup and the event loop behind [`Client`]

mod cli;
pub mod config;
pub mod error;
pub mod packet;
pub mod retransmit;
pub mod session;
pub mod stream;
pub mod transport;

pub use crate::cli::{Cli, ModeArg, Op};
pub use crate::config::Config;
pub use crate::error::{ErrorCode, TftpError};
pub use crate::packet::{DecodeError, Mode, PeerErrorCode, TftpPacket};
pub use crate::session::{Command, Event, Session, State};
pub use crate::transport::{Client, Transport};

pub const DEF_BLOCK_SIZE: u16 = 512; // RFC 1350
