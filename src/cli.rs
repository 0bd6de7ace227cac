use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, DEF_LOCAL_PORT, DEF_SERVER_PORT, DEF_TIMEOUT_MS, MAX_RETRY_COUNT};
use crate::packet::Mode;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftp-client")]
#[command(about = "A simple TFTP client", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Local ip
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Local port (0 = any)
    #[arg(short, long, default_value_t = DEF_LOCAL_PORT)]
    pub local_port: u16,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = MAX_RETRY_COUNT)]
    pub retry: u8,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub op: Op,
}

#[derive(Subcommand, Debug)]
pub enum Op {
    /// Download a file
    Get {
        host: String,
        remote: String,
        /// Defaults to the remote file name
        local: Option<PathBuf>,
        /// Server port
        #[arg(short, long, default_value_t = DEF_SERVER_PORT)]
        port: u16,
        #[arg(short, long, value_enum, default_value_t = ModeArg::Octet)]
        mode: ModeArg,
    },
    /// Upload a file
    Put {
        host: String,
        local: PathBuf,
        /// Defaults to the local file name
        remote: Option<String>,
        /// Server port
        #[arg(short, long, default_value_t = DEF_SERVER_PORT)]
        port: u16,
        #[arg(short, long, value_enum, default_value_t = ModeArg::Octet)]
        mode: ModeArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ModeArg {
    Octet,
    Netascii,
    Mail,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Octet => Mode::Octet,
            ModeArg::Netascii => Mode::NetAscii,
            ModeArg::Mail => Mode::Mail,
        }
    }
}

impl Cli {
    pub fn config(&self) -> Config {
        let mode = match &self.op {
            Op::Get { mode, .. } | Op::Put { mode, .. } => Mode::from(*mode),
        };
        Config {
            bind_ip: self.bind,
            local_port: self.local_port,
            timeout: Duration::from_millis(self.timeout),
            max_retries: self.retry,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["tftp-client", "put", "192.168.0.90", "image.bin"]);
        let config = cli.config();
        assert_eq!(config.local_port, 7755);
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.mode, Mode::Octet);
        match cli.op {
            Op::Put { port, remote, .. } => {
                assert_eq!(port, 69);
                assert_eq!(remote, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_get_options() {
        let cli = Cli::parse_from([
            "tftp-client",
            "-l",
            "0",
            "get",
            "device",
            "firmware.bin",
            "out.bin",
            "--port",
            "6969",
            "--mode",
            "netascii",
        ]);
        assert_eq!(cli.config().local_port, 0);
        assert_eq!(cli.config().mode, Mode::NetAscii);
        assert!(matches!(cli.op, Op::Get { port: 6969, .. }));
    }
}
