//! Client-side TFTP connection state machine.
//!
//! [`Session`] performs no I/O of its own: outbound datagrams go through a
//! [`Transport`], timer deadlines are read back by the driver via
//! [`Session::next_deadline`], and everything a front end needs to observe is
//! pushed onto an [`Event`] channel.

use std::io::{self, SeekFrom};
use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorCode, TftpError};
use crate::packet::{Mode, PeerErrorCode, TftpPacket};
use crate::retransmit::{Expiry, Retransmitter};
use crate::stream::{read_block, stream_len, Sink, Source};
use crate::transport::Transport;
use crate::DEF_BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// No socket bound.
    Idle,
    /// Socket bound, no peer known.
    Unconnected,
    HostLookup,
    /// Peer known, no transfer past its request.
    Connected,
    Transferring,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Read,
    Write,
}

/// Notifications for whoever drives the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChanged(State),
    Progress { done: u64, total: Option<u64> },
    Done { success: bool },
    Error { code: ErrorCode, message: String },
}

enum Transfer {
    Upload {
        source: Box<dyn Source>,
        total: u64,
        sent: u64,
        final_sent: bool,
    },
    Download {
        sink: Box<dyn Sink>,
        written: u64,
    },
}

pub struct Session {
    state: State,
    command: Command,
    block: u16,
    port: u16,
    server: Option<SocketAddr>,
    /// Endpoint the server answered from, fixed by the first valid response.
    peer: Option<SocketAddr>,
    transfer: Option<Transfer>,
    retransmit: Retransmitter,
    lookup_id: u64,
    last_error: (ErrorCode, String),
    events: UnboundedSender<Event>,
}

impl Session {
    pub fn new(config: &Config, events: UnboundedSender<Event>) -> Self {
        Self {
            state: State::Idle,
            command: Command::None,
            block: 0,
            port: crate::config::DEF_SERVER_PORT,
            server: None,
            peer: None,
            transfer: None,
            retransmit: Retransmitter::new(config.timeout, config.max_retries),
            lookup_id: 0,
            last_error: (ErrorCode::NoError, String::new()),
            events,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Block number expected in the next valid ACK (upload) or DATA (download).
    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn last_error(&self) -> (ErrorCode, &str) {
        (self.last_error.0, &self.last_error.1)
    }

    pub fn is_busy(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn retransmitter(&self) -> &Retransmitter {
        &self.retransmit
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.retransmit.deadline()
    }

    /// The driver has bound its socket.
    pub fn socket_bound(&mut self) {
        if self.state == State::Idle {
            self.change_state(State::Unconnected);
        }
    }

    /// Start resolving `host`. The returned ticket must be passed back to
    /// [`Session::on_lookup`] with the result.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<u64, TftpError> {
        match self.state {
            State::Idle | State::Closing => return Err(TftpError::NotConnected),
            State::Transferring => return Err(TftpError::TransferInProgress),
            _ if self.transfer.is_some() => return Err(TftpError::TransferInProgress),
            _ => {}
        }
        self.lookup_id += 1;
        self.port = port;
        self.server = None;
        debug!("looking up {host}:{port}");
        self.change_state(State::HostLookup);
        Ok(self.lookup_id)
    }

    pub fn on_lookup(&mut self, ticket: u64, result: io::Result<IpAddr>) {
        if ticket != self.lookup_id || self.state != State::HostLookup {
            debug!("ignoring stale lookup #{ticket}");
            return;
        }
        match result {
            Ok(ip) => {
                let server = SocketAddr::new(ip, self.port);
                info!("connected to {server}");
                self.server = Some(server);
                self.change_state(State::Connected);
            }
            Err(e) => {
                self.report(&TftpError::HostNotFound(e.to_string()));
                self.change_state(State::Unconnected);
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.state <= State::Unconnected {
            return;
        }
        if self.transfer.is_some() {
            self.fail(TftpError::AbortedByUser);
        }
        self.retransmit.disarm();
        self.lookup_id += 1;
        self.server = None;
        self.change_state(State::Unconnected);
    }

    /// Tear everything down. The driver drops its socket afterwards.
    pub fn close(&mut self) {
        if self.state == State::Idle {
            return;
        }
        self.change_state(State::Closing);
        if self.transfer.is_some() {
            self.fail(TftpError::AbortedByUser);
        }
        self.retransmit.disarm();
        self.lookup_id += 1;
        self.server = None;
        self.change_state(State::Idle);
    }

    pub fn abort(&mut self) {
        if self.transfer.is_some() {
            self.fail(TftpError::AbortedByUser);
        } else {
            self.retransmit.disarm();
        }
    }

    pub fn upload<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        mut source: Box<dyn Source>,
        remote: &str,
        mode: Mode,
    ) -> Result<(), TftpError> {
        let server = self.ready_for_transfer(mode)?;
        let total = stream_len(&mut source)?;

        info!("put {remote} ({total} bytes) to {server}");
        self.begin(Command::Write, 0);
        self.transfer = Some(Transfer::Upload {
            source,
            total,
            sent: 0,
            final_sent: false,
        });
        let wrq = TftpPacket::WRQ {
            filename: remote.to_string(),
            mode: mode.as_str().to_string(),
        };
        self.retransmit.arm(transport, wrq.serialize(), server);
        Ok(())
    }

    pub fn download<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        remote: &str,
        sink: Box<dyn Sink>,
        mode: Mode,
    ) -> Result<(), TftpError> {
        let server = self.ready_for_transfer(mode)?;

        info!("get {remote} from {server}");
        self.begin(Command::Read, 1);
        self.transfer = Some(Transfer::Download { sink, written: 0 });
        let rrq = TftpPacket::RRQ {
            filename: remote.to_string(),
            mode: mode.as_str().to_string(),
        };
        self.retransmit.arm(transport, rrq.serialize(), server);
        Ok(())
    }

    /// Feed one inbound datagram.
    pub fn on_datagram<T: Transport + ?Sized>(&mut self, transport: &T, buf: &[u8], from: SocketAddr) {
        let pkt = match TftpPacket::deserialize(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("{from} malformed packet: {e}");
                return;
            }
        };
        debug!("{from} {pkt:?}");

        if self.transfer.is_none() {
            debug!("no transfer active, discarding");
            return;
        }
        if !self.is_transfer_peer(from) {
            warn!("{from} unknown transfer ID, discarding");
            let err = TftpPacket::ERROR {
                code: PeerErrorCode::UnknownTransferId.into(),
                msg: "Unknown transfer ID".to_string(),
            };
            if let Err(e) = transport.send_to(&err.serialize(), from) {
                warn!("send to {from} failed: {e}");
            }
            return;
        }

        match pkt {
            TftpPacket::ACK(block) if self.command == Command::Write => {
                self.handle_ack(transport, block, from)
            }
            TftpPacket::DATA { block, data } if self.command == Command::Read => {
                self.handle_data(transport, block, &data, from)
            }
            TftpPacket::ERROR { code, msg } => self.fail(TftpError::ProtocolError { code, message: msg }),
            TftpPacket::RRQ { .. } | TftpPacket::WRQ { .. } => debug!("requests are not served"),
            other => debug!("unexpected {other:?} for {:?}", self.command),
        }
    }

    /// Receive failure reported by the socket.
    pub fn on_socket_error(&mut self, e: io::Error) {
        if e.kind() == io::ErrorKind::ConnectionRefused && self.transfer.is_some() {
            self.fail(TftpError::ConnectionRefused);
        } else {
            warn!("recv failed: {e}");
        }
    }

    /// Retransmission timer expiry.
    pub fn on_timeout<T: Transport + ?Sized>(&mut self, transport: &T) {
        if let Some(Expiry::Exhausted) = self.retransmit.on_timeout(transport) {
            self.fail(TftpError::TransmissionTimedOut);
        }
    }

    fn ready_for_transfer(&self, mode: Mode) -> Result<SocketAddr, TftpError> {
        if self.state != State::Connected {
            return Err(TftpError::NotConnected);
        }
        if self.transfer.is_some() {
            return Err(TftpError::TransferInProgress);
        }
        if !mode.is_supported() {
            return Err(TftpError::UnsupportedMode(mode));
        }
        self.server.ok_or(TftpError::NotConnected)
    }

    fn begin(&mut self, command: Command, block: u16) {
        self.command = command;
        self.block = block;
        self.peer = None;
    }

    // Before the first reply only the server's host is known; the port is
    // whatever the server picked for this transfer.
    fn is_transfer_peer(&self, from: SocketAddr) -> bool {
        match (self.peer, self.server) {
            (Some(peer), _) => peer == from,
            (None, Some(server)) => server.ip() == from.ip(),
            (None, None) => false,
        }
    }

    fn handle_ack<T: Transport + ?Sized>(&mut self, transport: &T, block: u16, from: SocketAddr) {
        if block != self.block {
            debug!("discarding ACK #{block}, expecting #{}", self.block);
            return;
        }
        self.retransmit.disarm();
        self.peer = Some(from);
        if self.state != State::Transferring {
            self.change_state(State::Transferring);
        }

        let Some(Transfer::Upload {
            source,
            total,
            sent,
            final_sent,
        }) = self.transfer.as_mut()
        else {
            return;
        };
        if *final_sent {
            self.complete();
            return;
        }

        let mut buf = vec![0; usize::from(DEF_BLOCK_SIZE)];
        let size = match read_block(source.as_mut(), &mut buf) {
            Ok(size) => size,
            Err(e) => {
                self.abandon(transport, from, e);
                return;
            }
        };
        buf.truncate(size);
        *sent += size as u64;
        *final_sent = size < usize::from(DEF_BLOCK_SIZE);
        let progress = Event::Progress {
            done: *sent,
            total: Some(*total),
        };

        self.block = self.block.wrapping_add(1);
        let data = TftpPacket::DATA {
            block: self.block,
            data: buf,
        };
        self.retransmit.arm(transport, data.serialize(), from);
        self.emit(progress);
    }

    fn handle_data<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        block: u16,
        data: &[u8],
        from: SocketAddr,
    ) {
        if block != self.block {
            debug!("discarding DATA #{block}, expecting #{}", self.block);
            return;
        }
        let first = self.state != State::Transferring;

        let Some(Transfer::Download { sink, written }) = self.transfer.as_mut() else {
            return;
        };
        let stored = if first {
            sink.seek(SeekFrom::Start(0)).and_then(|_| sink.write_all(data))
        } else {
            sink.write_all(data)
        };
        let last = data.len() < usize::from(DEF_BLOCK_SIZE);
        let stored = if last { stored.and_then(|_| sink.flush()) } else { stored };
        if let Err(e) = stored {
            self.abandon(transport, from, e);
            return;
        }
        *written += data.len() as u64;
        let progress = Event::Progress {
            done: *written,
            total: None,
        };

        self.peer = Some(from);
        if first {
            self.change_state(State::Transferring);
        }
        let ack = TftpPacket::ACK(block).serialize();
        if last {
            // nothing resends the final ACK
            self.retransmit.disarm();
            send_once(transport, &ack, from);
        } else {
            self.retransmit.arm(transport, ack, from);
        }
        self.block = self.block.wrapping_add(1);
        self.emit(progress);

        if last {
            self.complete();
        }
    }

    // Local stream failure: tell the peer once, then fail the transfer.
    fn abandon<T: Transport + ?Sized>(&mut self, transport: &T, peer: SocketAddr, e: io::Error) {
        let err = TftpPacket::ERROR {
            code: PeerErrorCode::NotDefined.into(),
            msg: e.to_string(),
        };
        if let Err(e) = transport.send_to(&err.serialize(), peer) {
            warn!("send to {peer} failed: {e}");
        }
        self.fail(TftpError::Io(e));
    }

    fn complete(&mut self) {
        self.retransmit.disarm();
        self.finish();
        info!("transfer complete");
        self.last_error = (ErrorCode::NoError, String::new());
        self.emit(Event::Done { success: true });
    }

    fn fail(&mut self, err: TftpError) {
        self.retransmit.disarm();
        self.finish();
        warn!("transfer failed: {err}");
        self.report(&err);
        self.emit(Event::Done { success: false });
    }

    fn finish(&mut self) {
        self.transfer = None;
        self.command = Command::None;
        self.peer = None;
        if self.state == State::Transferring {
            self.change_state(State::Connected);
        }
    }

    fn report(&mut self, err: &TftpError) {
        self.last_error = (err.code(), err.message());
        self.emit(Event::Error {
            code: err.code(),
            message: err.message(),
        });
    }

    fn change_state(&mut self, state: State) {
        if self.state != state {
            debug!("state {:?} -> {state:?}", self.state);
            self.state = state;
            self.emit(Event::StateChanged(state));
        }
    }

    fn emit(&self, event: Event) {
        // nobody listening is not an error
        let _ = self.events.send(event);
    }
}

/// Unarmed send, given one more try if the socket buffer is momentarily full.
fn send_once<T: Transport + ?Sized>(transport: &T, buf: &[u8], dest: SocketAddr) {
    let result = match transport.send_to(buf, dest) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => transport.send_to(buf, dest),
        other => other,
    };
    if let Err(e) = result {
        warn!("send to {dest} failed: {e}");
    }
}
