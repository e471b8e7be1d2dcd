//! Readiness multiplexer.
//!
//! Thin layer over `mio::Poll` (epoll on Linux, kqueue on macOS) giving
//! level-triggered semantics on top of mio's edge-triggered ones:
//!
//! - `register` and `modify` go through `epoll_ctl` ADD/MOD, which
//!   re-evaluates the descriptor. Data already buffered when a descriptor is
//!   armed is reported on the next `wait`.
//! - A `Mode::Persistent` registration is re-armed the same way each time
//!   `wait` reports it, so a descriptor that is still ready (say, a listener
//!   with connections left in its backlog) is reported again on the next
//!   call until it has been drained.
//! - A `Mode::OneShot` registration reports a single readiness event and is
//!   then disarmed until `modify` re-arms it. Events that arrive for a
//!   disarmed token are swallowed by `wait`.
//!
//! Hangup and error conditions are always delivered by the OS regardless of
//! the requested interest.

use mio::event::{Event, Source};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// How long a registration stays armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Report readiness until deregistered.
    Persistent,
    /// Report readiness once, then stay quiet until re-armed.
    OneShot,
}

#[derive(Debug, Clone, Copy)]
struct Arm {
    fd: RawFd,
    interest: Interest,
    mode: Mode,
    armed: bool,
}

/// One ready descriptor reported by `Multiplexer::wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    hangup: bool,
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Peer hung up or the socket is in an error state.
    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_error() || event.is_read_closed() || event.is_write_closed(),
        }
    }
}

/// Registration failures.
#[derive(Debug)]
pub enum RegistrationError {
    /// The token is already registered.
    AlreadyRegistered(Token),
    /// The token is not registered.
    NotRegistered(Token),
    /// The OS rejected the request (invalid descriptor, table exhausted).
    Os(Token, io::Error),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::AlreadyRegistered(token) => {
                write!(f, "token {} is already registered", token.0)
            }
            RegistrationError::NotRegistered(token) => {
                write!(f, "token {} is not registered", token.0)
            }
            RegistrationError::Os(token, e) => {
                write!(f, "failed to register token {}: {}", token.0, e)
            }
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrationError::Os(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistrationError> for io::Error {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Os(_, e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Readiness multiplexer owned by the dispatch loop.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    arms: HashMap<Token, Arm>,
}

impl Multiplexer {
    /// Create a multiplexer reporting at most `max_events` events per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
            arms: HashMap::new(),
        })
    }

    /// Create a waker that interrupts `wait` from another thread.
    ///
    /// Its events are reported under `token` and are never suppressed.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    /// Start watching `source` for `interest`.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        mode: Mode,
    ) -> Result<(), RegistrationError>
    where
        S: Source + AsRawFd + ?Sized,
    {
        if self.arms.contains_key(&token) {
            return Err(RegistrationError::AlreadyRegistered(token));
        }
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|e| RegistrationError::Os(token, e))?;
        self.arms.insert(
            token,
            Arm {
                fd: source.as_raw_fd(),
                interest,
                mode,
                armed: true,
            },
        );
        Ok(())
    }

    /// Replace the interest of a registered source and re-arm it.
    pub fn modify<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        mode: Mode,
    ) -> Result<(), RegistrationError>
    where
        S: Source + AsRawFd + ?Sized,
    {
        let arm = self
            .arms
            .get_mut(&token)
            .ok_or(RegistrationError::NotRegistered(token))?;
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|e| RegistrationError::Os(token, e))?;
        *arm = Arm {
            fd: source.as_raw_fd(),
            interest,
            mode,
            armed: true,
        };
        Ok(())
    }

    /// Stop watching `source`.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), RegistrationError>
    where
        S: Source + ?Sized,
    {
        if self.arms.remove(&token).is_none() {
            return Err(RegistrationError::NotRegistered(token));
        }
        self.poll
            .registry()
            .deregister(source)
            .map_err(|e| RegistrationError::Os(token, e))
    }

    /// Whether `token` is registered.
    pub fn is_registered(&self, token: Token) -> bool {
        self.arms.contains_key(&token)
    }

    /// Whether `token` is registered and armed.
    #[cfg(test)]
    pub fn is_armed(&self, token: Token) -> bool {
        self.arms.get(&token).is_some_and(|arm| arm.armed)
    }

    /// Block until at least one registered source is ready.
    ///
    /// `ready` is cleared and filled with the reported events. A wait
    /// interrupted by a signal is retried; with a finite `timeout` it is
    /// retried only for the time that remains, and may return no events.
    pub fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if remaining.is_some_and(|r| r.is_zero()) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        for event in self.events.iter() {
            let token = event.token();
            if let Some(arm) = self.arms.get_mut(&token) {
                if !arm.armed {
                    trace!(token = token.0, "Suppressed event on disarmed registration");
                    continue;
                }
                match arm.mode {
                    Mode::OneShot => arm.armed = false,
                    Mode::Persistent => {
                        // MOD makes epoll look at the descriptor again, so it
                        // is reported next time if it is still ready.
                        if let Err(e) = self.poll.registry().reregister(
                            &mut SourceFd(&arm.fd),
                            token,
                            arm.interest,
                        ) {
                            warn!(token = token.0, error = %e, "Failed to re-arm registration");
                        }
                    }
                }
            }
            ready.push(Readiness::from(event));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;
    use std::net::SocketAddr;

    const TIMEOUT: Option<Duration> = Some(Duration::from_millis(500));
    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn test_readable_event() {
        let mut mux = Multiplexer::new(16).unwrap();
        let (mut server, mut client) = connected_pair();
        mux.register(&mut server, Token(1), Interest::READABLE, Mode::OneShot)
            .unwrap();

        client.write_all(b"PING").unwrap();

        let mut ready = Vec::new();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token(), Token(1));
        assert!(ready[0].is_readable());
        assert!(!mux.is_armed(Token(1)));
    }

    #[test]
    fn test_one_shot_suppresses_until_modify() {
        let mut mux = Multiplexer::new(16).unwrap();
        let (mut server, mut client) = connected_pair();
        mux.register(&mut server, Token(7), Interest::READABLE, Mode::OneShot)
            .unwrap();

        let mut ready = Vec::new();
        client.write_all(b"first").unwrap();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);

        // New data produces a fresh edge, but the registration is consumed.
        client.write_all(b"second").unwrap();
        mux.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());

        // Re-arming reports the data still sitting in the socket.
        mux.modify(&mut server, Token(7), Interest::READABLE, Mode::OneShot)
            .unwrap();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].is_readable());
    }

    #[test]
    fn test_persistent_listener_keeps_reporting() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        mux.register(&mut listener, Token(0), Interest::READABLE, Mode::Persistent)
            .unwrap();

        let mut ready = Vec::new();
        let _c1 = std::net::TcpStream::connect(addr).unwrap();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        let _ = listener.accept().unwrap();

        let _c2 = std::net::TcpStream::connect(addr).unwrap();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(mux.is_armed(Token(0)));
    }

    #[test]
    fn test_persistent_reports_until_drained() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        mux.register(&mut listener, Token(0), Interest::READABLE, Mode::Persistent)
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        // Nothing accepts, so the pending connection keeps being reported.
        let mut ready = Vec::new();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token(), Token(0));

        // Once drained it goes quiet.
        let _ = listener.accept().unwrap();
        mux.wait(&mut ready, SHORT).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_modify_switches_to_writable() {
        let mut mux = Multiplexer::new(16).unwrap();
        let (mut server, _client) = connected_pair();
        mux.register(&mut server, Token(2), Interest::READABLE, Mode::OneShot)
            .unwrap();
        mux.modify(&mut server, Token(2), Interest::WRITABLE, Mode::OneShot)
            .unwrap();

        let mut ready = Vec::new();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].is_writable());
    }

    #[test]
    fn test_hangup_reported() {
        let mut mux = Multiplexer::new(16).unwrap();
        let (mut server, client) = connected_pair();
        mux.register(&mut server, Token(3), Interest::READABLE, Mode::OneShot)
            .unwrap();

        drop(client);

        let mut ready = Vec::new();
        mux.wait(&mut ready, TIMEOUT).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].is_hangup());
    }

    #[test]
    fn test_registration_errors() {
        let mut mux = Multiplexer::new(16).unwrap();
        let (mut server, _client) = connected_pair();

        assert!(matches!(
            mux.modify(&mut server, Token(4), Interest::READABLE, Mode::OneShot),
            Err(RegistrationError::NotRegistered(Token(4)))
        ));

        mux.register(&mut server, Token(4), Interest::READABLE, Mode::OneShot)
            .unwrap();
        assert!(matches!(
            mux.register(&mut server, Token(4), Interest::READABLE, Mode::OneShot),
            Err(RegistrationError::AlreadyRegistered(Token(4)))
        ));

        mux.deregister(&mut server, Token(4)).unwrap();
        assert!(!mux.is_registered(Token(4)));
        assert!(matches!(
            mux.deregister(&mut server, Token(4)),
            Err(RegistrationError::NotRegistered(Token(4)))
        ));
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut mux = Multiplexer::new(16).unwrap();
        let waker = std::sync::Arc::new(mux.waker(Token(99)).unwrap());

        let remote = std::sync::Arc::clone(&waker);
        let handle = std::thread::spawn(move || remote.wake().unwrap());

        let mut ready = Vec::new();
        mux.wait(&mut ready, None).unwrap();
        handle.join().unwrap();
        assert!(ready.iter().any(|r| r.token() == Token(99)));
    }
}
