use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Transport;

/// The single packet waiting for a response.
#[derive(Debug)]
struct Pending {
    bytes: Vec<u8>,
    dest: SocketAddr,
    attempts: u8,
    deadline: Instant,
}

/// Outcome of a timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The stored packet went out again; carries the resend count so far.
    Resent(u8),
    /// Retry budget used up. The record has been dropped.
    Exhausted,
}

/// Lock-step retransmission slot.
///
/// Holds at most one outstanding packet; arming always replaces whatever was
/// stored before.
#[derive(Debug)]
pub struct Retransmitter {
    pending: Option<Pending>,
    interval: Duration,
    max_retries: u8,
}

impl Retransmitter {
    pub fn new(interval: Duration, max_retries: u8) -> Self {
        Self {
            pending: None,
            interval,
            max_retries,
        }
    }

    /// Send `bytes` to `dest` once and start the timer for it.
    pub fn arm<T: Transport + ?Sized>(&mut self, transport: &T, bytes: Vec<u8>, dest: SocketAddr) {
        if let Err(e) = transport.send_to(&bytes, dest) {
            // the timer will try again
            warn!("send to {dest} failed: {e}");
        }
        self.pending = Some(Pending {
            bytes,
            dest,
            attempts: 0,
            deadline: Instant::now() + self.interval,
        });
    }

    pub fn disarm(&mut self) {
        if self.pending.take().is_some() {
            debug!("retransmission disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn attempts(&self) -> Option<u8> {
        self.pending.as_ref().map(|p| p.attempts)
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.pending.as_ref().map(|p| p.dest)
    }

    pub fn packet(&self) -> Option<&[u8]> {
        self.pending.as_ref().map(|p| p.bytes.as_slice())
    }

    /// Timer expiry. Returns `None` when nothing is armed.
    pub fn on_timeout<T: Transport + ?Sized>(&mut self, transport: &T) -> Option<Expiry> {
        let pending = self.pending.as_mut()?;
        if pending.attempts >= self.max_retries {
            self.pending = None;
            return Some(Expiry::Exhausted);
        }

        pending.attempts += 1;
        warn!(
            "timeout, resending to {} ({}/{})",
            pending.dest, pending.attempts, self.max_retries
        );
        if let Err(e) = transport.send_to(&pending.bytes, pending.dest) {
            warn!("resend to {} failed: {e}", pending.dest);
        }
        pending.deadline = Instant::now() + self.interval;
        Some(Expiry::Resent(pending.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::RecordingTransport;

    fn dest() -> SocketAddr {
        "127.0.0.1:69".parse().unwrap()
    }

    #[test]
    fn arm_sends_once() {
        let transport = RecordingTransport::default();
        let mut rt = Retransmitter::new(Duration::from_millis(2500), 3);
        rt.arm(&transport, vec![0, 4, 0, 1], dest());
        assert_eq!(transport.sent(), vec![(vec![0, 4, 0, 1], dest())]);
        assert!(rt.is_armed());
        assert_eq!(rt.attempts(), Some(0));
        assert!(rt.deadline().is_some());
    }

    #[test]
    fn gives_up_after_three_resends() {
        let transport = RecordingTransport::default();
        let mut rt = Retransmitter::new(Duration::from_millis(2500), 3);
        rt.arm(&transport, vec![0, 4, 0, 1], dest());

        assert_eq!(rt.on_timeout(&transport), Some(Expiry::Resent(1)));
        assert_eq!(rt.on_timeout(&transport), Some(Expiry::Resent(2)));
        assert_eq!(rt.on_timeout(&transport), Some(Expiry::Resent(3)));
        assert_eq!(rt.on_timeout(&transport), Some(Expiry::Exhausted));
        assert!(!rt.is_armed());
        assert_eq!(rt.on_timeout(&transport), None);

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|(b, d)| b == &[0, 4, 0, 1] && *d == dest()));
    }

    #[test]
    fn arming_replaces_previous_record() {
        let transport = RecordingTransport::default();
        let mut rt = Retransmitter::new(Duration::from_millis(10), 3);
        rt.arm(&transport, vec![1], dest());
        rt.on_timeout(&transport);
        let other: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        rt.arm(&transport, vec![2], other);
        assert_eq!(rt.attempts(), Some(0));
        assert_eq!(rt.packet(), Some(&[2u8][..]));
        assert_eq!(rt.destination(), Some(other));
    }

    #[test]
    fn disarm_clears_record() {
        let transport = RecordingTransport::default();
        let mut rt = Retransmitter::new(Duration::from_millis(10), 3);
        rt.arm(&transport, vec![1], dest());
        rt.disarm();
        assert!(!rt.is_armed());
        assert_eq!(rt.deadline(), None);
        assert_eq!(rt.on_timeout(&transport), None);
        assert_eq!(transport.sent().len(), 1);
    }
}
