use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::debug;

use crate::config::Config;
use crate::error::TftpError;
use crate::packet::Mode;
use crate::session::{Event, Session, State};
use crate::stream::{Sink, Source};
use crate::DEF_BLOCK_SIZE;

/// Outbound half of a datagram socket.
pub trait Transport {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()>;
}

impl Transport for std::net::UdpSocket {
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        let n = std::net::UdpSocket::send_to(self, buf, dest)?;
        if n != buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "datagram truncated"));
        }
        Ok(())
    }
}

struct Unbound;

impl Transport for Unbound {
    fn send_to(&self, _buf: &[u8], _dest: SocketAddr) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
    }
}

/// Bound socket: tokio half for receiving, non-blocking std clone for sending
/// from inside synchronous session callbacks.
struct Bound {
    recv: UdpSocket,
    send: std::net::UdpSocket,
}

impl Bound {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let send = socket.try_clone()?;
        let recv = UdpSocket::from_std(socket)?;
        Ok(Self { recv, send })
    }
}

fn transport_of(socket: &Option<Bound>) -> &dyn Transport {
    match socket {
        Some(bound) => &bound.send,
        None => &Unbound,
    }
}

type Reply = oneshot::Sender<Result<(), TftpError>>;

enum Request {
    Connect { host: String, port: u16, reply: Reply },
    Disconnect,
    Close,
    Upload {
        source: Box<dyn Source>,
        remote: String,
        mode: Mode,
        reply: Reply,
    },
    Download {
        remote: String,
        sink: Box<dyn Sink>,
        mode: Mode,
        reply: Reply,
    },
    Abort,
}

/// Handle for driving a running engine. Cheap to clone.
///
/// Every call returns as soon as the engine has accepted or rejected it;
/// how a connect or transfer ends is reported on the event channel.
#[derive(Clone)]
pub struct Client {
    requests: UnboundedSender<Request>,
    mode: Mode,
}

impl Client {
    /// Start an engine task on the current tokio runtime.
    pub fn spawn(config: Config) -> (Self, UnboundedReceiver<Event>, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let mode = config.mode;
        let engine = Engine::new(config, events_tx, requests_rx);
        let handle = tokio::spawn(engine.run());
        let client = Client {
            requests: requests_tx,
            mode,
        };
        (client, events_rx, handle)
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<(), TftpError> {
        self.call(|reply| Request::Connect {
            host: host.to_string(),
            port,
            reply,
        })
        .await
    }

    pub fn disconnect(&self) {
        let _ = self.requests.send(Request::Disconnect);
    }

    pub fn close(&self) {
        let _ = self.requests.send(Request::Close);
    }

    pub fn abort(&self) {
        let _ = self.requests.send(Request::Abort);
    }

    pub async fn upload<S: Source + 'static>(&self, source: S, remote: &str) -> Result<(), TftpError> {
        self.upload_with_mode(source, remote, self.mode).await
    }

    pub async fn upload_with_mode<S: Source + 'static>(
        &self,
        source: S,
        remote: &str,
        mode: Mode,
    ) -> Result<(), TftpError> {
        self.call(|reply| Request::Upload {
            source: Box::new(source),
            remote: remote.to_string(),
            mode,
            reply,
        })
        .await
    }

    pub async fn download<S: Sink + 'static>(&self, remote: &str, sink: S) -> Result<(), TftpError> {
        self.download_with_mode(remote, sink, self.mode).await
    }

    pub async fn download_with_mode<S: Sink + 'static>(
        &self,
        remote: &str,
        sink: S,
        mode: Mode,
    ) -> Result<(), TftpError> {
        self.call(|reply| Request::Download {
            remote: remote.to_string(),
            sink: Box::new(sink),
            mode,
            reply,
        })
        .await
    }

    async fn call(&self, request: impl FnOnce(Reply) -> Request) -> Result<(), TftpError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| TftpError::EngineStopped)?;
        rx.await.map_err(|_| TftpError::EngineStopped)?
    }
}

/// Owns the socket and the session; every state change happens on its task.
struct Engine {
    config: Config,
    session: Session,
    socket: Option<Bound>,
    requests: UnboundedReceiver<Request>,
    lookups_tx: UnboundedSender<(u64, io::Result<IpAddr>)>,
    lookups_rx: UnboundedReceiver<(u64, io::Result<IpAddr>)>,
}

impl Engine {
    fn new(config: Config, events: UnboundedSender<Event>, requests: UnboundedReceiver<Request>) -> Self {
        let (lookups_tx, lookups_rx) = mpsc::unbounded_channel();
        Self {
            session: Session::new(&config, events),
            config,
            socket: None,
            requests,
            lookups_tx,
            lookups_rx,
        }
    }

    async fn run(mut self) {
        // room for a full block plus header, and one byte to spot oversized datagrams
        let mut buf = vec![0; usize::from(DEF_BLOCK_SIZE) + 5];
        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some((ticket, result)) = self.lookups_rx.recv() => {
                    self.session.on_lookup(ticket, result);
                }
                received = recv_from(self.socket.as_ref().map(|b| &b.recv), &mut buf) => match received {
                    Ok((n, from)) => {
                        self.session.on_datagram(transport_of(&self.socket), &buf[..n], from);
                    }
                    // ICMP unreachable and friends surface here on some platforms
                    Err(e) => self.session.on_socket_error(e),
                },
                _ = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    self.session.on_timeout(transport_of(&self.socket));
                }
            }
        }
        self.session.close();
        debug!("engine stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { host, port, reply } => {
                let _ = reply.send(self.connect(host, port).await);
            }
            Request::Disconnect => self.session.disconnect(),
            Request::Close => {
                self.session.close();
                self.socket = None;
            }
            Request::Abort => self.session.abort(),
            Request::Upload {
                source,
                remote,
                mode,
                reply,
            } => {
                let result = self
                    .session
                    .upload(transport_of(&self.socket), source, &remote, mode);
                let _ = reply.send(result);
            }
            Request::Download {
                remote,
                sink,
                mode,
                reply,
            } => {
                let result = self
                    .session
                    .download(transport_of(&self.socket), &remote, sink, mode);
                let _ = reply.send(result);
            }
        }
    }

    async fn connect(&mut self, host: String, port: u16) -> Result<(), TftpError> {
        if self.session.state() == State::Idle {
            let socket = Bound::bind(SocketAddr::new(self.config.bind_ip, self.config.local_port))?;
            debug!("bound {}", socket.recv.local_addr()?);
            self.socket = Some(socket);
            self.session.socket_bound();
        }

        let ticket = self.session.connect(&host, port)?;
        let lookups = self.lookups_tx.clone();
        let bind_ip = self.config.bind_ip;
        tokio::spawn(async move {
            let result = resolve(&host, port, bind_ip).await;
            let _ = lookups.send((ticket, result));
        });
        Ok(())
    }
}

async fn recv_from(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Resolve `host` to an address the socket bound on `bind_ip` can reach.
async fn resolve(host: &str, port: u16, bind_ip: IpAddr) -> io::Result<IpAddr> {
    let addrs = lookup_host((host, port)).await?;
    pick_address(addrs, bind_ip).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}: no address usable from {bind_ip}"),
        )
    })
}

// An IPv4 socket cannot send to IPv6 peers and vice versa.
fn pick_address(addrs: impl IntoIterator<Item = SocketAddr>, bind_ip: IpAddr) -> Option<IpAddr> {
    addrs
        .into_iter()
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() == bind_ip.is_ipv4())
}
