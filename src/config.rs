use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::packet::Mode;

pub const DEF_LOCAL_PORT: u16 = 7755;
pub const DEF_SERVER_PORT: u16 = 69;
pub const DEF_TIMEOUT_MS: u64 = 2500;
pub const MAX_RETRY_COUNT: u8 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the datagram socket is bound to.
    pub bind_ip: IpAddr,
    /// Fixed receive port; 0 lets the OS pick one.
    pub local_port: u16,
    /// Retransmission interval.
    pub timeout: Duration,
    /// Resends after the first transmission before giving up.
    pub max_retries: u8,
    pub mode: Mode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: DEF_LOCAL_PORT,
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
            max_retries: MAX_RETRY_COUNT,
            mode: Mode::Octet,
        }
    }
}
