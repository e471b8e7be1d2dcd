//! Dispatch loop: a Proactor simulated on a readiness multiplexer.
//!
//! One thread owns the multiplexer and performs every socket system call:
//! accept, non-blocking read and non-blocking write. Once a connection's
//! pending input has been drained, its socket is deregistered and its
//! buffers are moved into a task for the worker pool. The worker runs the
//! application and sends the buffers back over a channel, waking the loop,
//! which then arms the socket for writing. From a worker's point of view the
//! reads and writes have already "completed".
//!
//! Per connection:
//!
//! ```text
//! Idle -> AwaitingRead -> Processing -> AwaitingWrite -> AwaitingRead -> ...
//!                  \            \              \
//!                   +------------+--------------+--> closed (slot freed)
//! ```
//!
//! Every registration is one-shot and is only renewed by the actor that
//! finished with the connection, so at most one thread touches a
//! connection's buffers at any time.

use crate::config::{Config, ShutdownMode};
use crate::runtime::connection::{ConnState, ConnectionTable};
use crate::runtime::poller::{Mode, Multiplexer, Readiness};
use crate::runtime::pool::{ShutdownPolicy, WorkerPool};
use crate::runtime::protocol::{Application, ProcessResult};
use crate::runtime::task::{Completion, Task};
use crate::runtime::token::{ConnId, LISTENER_TOKEN, WAKER_TOKEN};
use bytes::Buf;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Pending connections the kernel queues before `accept`.
const LISTEN_BACKLOG: i32 = 128;

/// Handle for observing and stopping a running server from other threads.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    live: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Ask the dispatch loop to stop.
    ///
    /// New connections are no longer accepted, queued work is finished or
    /// discarded per the configured policy, and `Server::run` returns once
    /// every worker thread has joined.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }

    /// Number of live connections.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// TCP server driven by a single dispatch thread and a worker pool.
pub struct Server {
    poller: Multiplexer,
    listener: TcpListener,
    connections: ConnectionTable,
    pool: WorkerPool<Task>,
    completions: Receiver<Completion>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    shutdown_policy: ShutdownPolicy,
    /// Scratch space for socket reads, `buffer_size` bytes.
    read_buf: Vec<u8>,
    max_events: usize,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener and start the worker pool.
    pub fn bind(config: &Config, app: Arc<dyn Application>) -> io::Result<Self> {
        let addr = config
            .listen_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut poller = Multiplexer::new(config.max_events)?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poller.register(
            &mut listener,
            LISTENER_TOKEN,
            Interest::READABLE,
            Mode::Persistent,
        )?;

        let waker = Arc::new(poller.waker(WAKER_TOKEN)?);
        let (tx, completions) = mpsc::channel();

        let handler = {
            let waker = Arc::clone(&waker);
            move |task: Task| {
                let Task { id, mut buffers } = task;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    app.process(&mut buffers.input, &mut buffers.output)
                }))
                .unwrap_or_else(|_| {
                    error!(conn = %id, "Application panicked");
                    ProcessResult::Error
                });

                // The dispatch loop is gone once the receiver is dropped.
                if tx.send(Completion { id, buffers, result }).is_err() {
                    return;
                }
                if let Err(e) = waker.wake() {
                    error!(conn = %id, error = %e, "Failed to wake dispatch loop");
                }
            }
        };

        let workers = config.worker_threads();
        let pool = WorkerPool::new(workers, config.queue_capacity, handler)?;

        info!(
            addr = %local_addr,
            workers,
            queue_capacity = config.queue_capacity,
            max_connections = config.max_connections,
            "Server bound"
        );

        Ok(Self {
            poller,
            listener,
            connections: ConnectionTable::new(config.max_connections, config.buffer_size),
            pool,
            completions,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_policy: match config.shutdown_policy {
                ShutdownMode::Drain => ShutdownPolicy::Drain,
                ShutdownMode::Discard => ShutdownPolicy::Discard,
            },
            read_buf: vec![0; config.buffer_size],
            max_events: config.max_events,
            local_addr,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
            live: self.connections.live_gauge(),
            local_addr: self.local_addr,
        }
    }

    /// Run the dispatch loop until shutdown is requested or waiting for
    /// readiness fails.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            workers = self.pool.workers(),
            "Dispatch loop started"
        );

        let mut ready: Vec<Readiness> = Vec::with_capacity(self.max_events);
        let result = loop {
            if let Err(e) = self.poller.wait(&mut ready, None) {
                error!(error = %e, "Waiting for readiness failed");
                break Err(e);
            }

            for readiness in ready.drain(..) {
                match readiness.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => self.drain_completions(),
                    _ => self.handle_event(readiness),
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
        };

        self.stop();
        result
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connections.is_full() {
            warn!(
                peer = %peer,
                max_connections = self.connections.capacity(),
                "Connection limit reached, rejecting"
            );
            return;
        }

        if let Err(e) = socket2::SockRef::from(&stream).set_reuse_address(true) {
            debug!(peer = %peer, error = %e, "Failed to set SO_REUSEADDR");
        }

        let Some(id) = self.connections.insert(stream, peer) else {
            return;
        };
        let Some(slot) = self.connections.get_mut(id) else {
            return;
        };

        match self
            .poller
            .register(&mut slot.stream, id.token(), Interest::READABLE, Mode::OneShot)
        {
            Ok(()) => {
                slot.state = ConnState::AwaitingRead;
                debug!(
                    conn = %id,
                    peer = %peer,
                    live = self.connections.len(),
                    "Accepted connection"
                );
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to register connection");
                self.connections.remove(id);
            }
        }
    }

    fn handle_event(&mut self, readiness: Readiness) {
        let Some(id) = ConnId::from_token(readiness.token()) else {
            return;
        };
        let Some(slot) = self.connections.get(id) else {
            trace!(conn = %id, "Event for closed connection");
            return;
        };

        if readiness.is_hangup() {
            debug!(conn = %id, "Peer hung up");
            self.close(id);
            return;
        }

        let state = slot.state;
        let result = match state {
            ConnState::AwaitingRead if readiness.is_readable() => self.handle_readable(id),
            ConnState::AwaitingWrite if readiness.is_writable() => self.handle_writable(id),
            _ => {
                trace!(conn = %id, ?state, "Ignoring readiness");
                self.rearm(id)
            }
        };

        if let Err(e) = result {
            debug!(conn = %id, error = %e, "Connection error");
            self.close(id);
        }
    }

    /// Drain the socket into the input buffer, then hand the connection to
    /// a worker.
    fn handle_readable(&mut self, id: ConnId) -> io::Result<()> {
        let slot = self.connections.get_mut(id).ok_or_else(not_found)?;
        let buffers = slot.buffers.as_mut().ok_or_else(held_by_worker)?;
        let input = &mut buffers.input;

        loop {
            match slot.stream.read(&mut self.read_buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF")),
                Ok(n) => input.extend_from_slice(&self.read_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if input.is_empty() {
            self.poller
                .modify(&mut slot.stream, id.token(), Interest::READABLE, Mode::OneShot)?;
            return Ok(());
        }

        trace!(conn = %id, bytes = input.len(), "Read complete");
        self.dispatch(id)
    }

    /// Flush as much of the output buffer as the socket takes.
    fn handle_writable(&mut self, id: ConnId) -> io::Result<()> {
        let slot = self.connections.get_mut(id).ok_or_else(not_found)?;
        let buffers = slot.buffers.as_mut().ok_or_else(held_by_worker)?;
        let output = &mut buffers.output;

        while !output.is_empty() {
            match slot.stream.write(&output[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => output.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if !output.is_empty() {
            // Partial write, continue on the next writable event.
            trace!(conn = %id, remaining = output.len(), "Partial write");
            self.poller
                .modify(&mut slot.stream, id.token(), Interest::WRITABLE, Mode::OneShot)?;
            return Ok(());
        }

        slot.state = ConnState::AwaitingRead;
        if !buffers.input.is_empty() {
            // Pipelined input left over from the previous request.
            return self.dispatch(id);
        }
        self.poller
            .modify(&mut slot.stream, id.token(), Interest::READABLE, Mode::OneShot)?;
        Ok(())
    }

    /// Move a connection's buffers to the worker pool.
    ///
    /// The socket is deregistered first and stays that way until the worker
    /// hands the buffers back.
    fn dispatch(&mut self, id: ConnId) -> io::Result<()> {
        let slot = self.connections.get_mut(id).ok_or_else(not_found)?;
        self.poller.deregister(&mut slot.stream, id.token())?;
        let buffers = self.connections.take_buffers(id).ok_or_else(held_by_worker)?;

        if let Err(err) = self.pool.submit(Task { id, buffers }) {
            warn!(conn = %id, error = %err, "Worker pool rejected task, closing connection");
            let task = err.into_inner();
            if self.connections.restore_buffers(id, task.buffers).is_err() {
                // The slot was live a moment ago and only this thread frees slots.
                error!(conn = %id, "Rejected task has no connection to return to");
                return Ok(());
            }
            self.close(id);
        }
        Ok(())
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            self.complete(completion);
        }
    }

    /// Take a connection back from a worker and act on the application's
    /// verdict.
    fn complete(&mut self, completion: Completion) {
        let Completion {
            id,
            buffers,
            result,
        } = completion;

        if self.connections.restore_buffers(id, buffers).is_err() {
            trace!(conn = %id, "Completion for closed connection");
            return;
        }

        let closing = self.shutdown.load(Ordering::Acquire)
            || self
                .connections
                .get(id)
                .is_some_and(|slot| slot.state == ConnState::Closing);
        if closing {
            self.close(id);
            return;
        }

        let outcome = match result {
            ProcessResult::NeedData => self.arm(id, ConnState::AwaitingRead, Interest::READABLE),
            ProcessResult::Response => {
                let pending = self
                    .connections
                    .get(id)
                    .and_then(|slot| slot.buffers.as_ref())
                    .is_some_and(|buffers| !buffers.output.is_empty());
                if pending {
                    self.arm(id, ConnState::AwaitingWrite, Interest::WRITABLE)
                } else {
                    self.arm(id, ConnState::AwaitingRead, Interest::READABLE)
                }
            }
            ProcessResult::Quit => {
                debug!(conn = %id, "Client quit");
                self.close(id);
                return;
            }
            ProcessResult::Error => {
                debug!(conn = %id, "Protocol error");
                self.close(id);
                return;
            }
        };

        if let Err(e) = outcome {
            debug!(conn = %id, error = %e, "Failed to re-arm connection");
            self.close(id);
        }
    }

    /// Register a connection returning from a worker.
    fn arm(&mut self, id: ConnId, state: ConnState, interest: Interest) -> io::Result<()> {
        let slot = self.connections.get_mut(id).ok_or_else(not_found)?;
        slot.state = state;
        self.poller
            .register(&mut slot.stream, id.token(), interest, Mode::OneShot)?;
        Ok(())
    }

    /// Re-arm a connection for the interest matching its current state.
    fn rearm(&mut self, id: ConnId) -> io::Result<()> {
        let slot = self.connections.get_mut(id).ok_or_else(not_found)?;
        let interest = match slot.state {
            ConnState::AwaitingWrite => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        if self.poller.is_registered(id.token()) {
            self.poller
                .modify(&mut slot.stream, id.token(), interest, Mode::OneShot)?;
        }
        Ok(())
    }

    /// Close a connection and free its slot.
    ///
    /// Closing a connection that is already gone is a no-op. If a worker
    /// holds the buffers, the connection is only marked `Closing` and is
    /// closed when the worker hands them back.
    fn close(&mut self, id: ConnId) {
        let Some(slot) = self.connections.get_mut(id) else {
            return;
        };

        if slot.is_processing() {
            slot.state = ConnState::Closing;
            debug!(conn = %id, "Close deferred until worker completes");
            return;
        }

        if self.poller.is_registered(id.token()) {
            if let Err(e) = self.poller.deregister(&mut slot.stream, id.token()) {
                debug!(conn = %id, error = %e, "Failed to deregister connection");
            }
        }

        // Dropping the slot closes the socket.
        if let Some(slot) = self.connections.remove(id) {
            debug!(
                conn = %id,
                peer = %slot.peer(),
                live = self.connections.len(),
                "Connection closed"
            );
        }
    }

    /// Stop accepting, finish or discard queued work, and close everything.
    fn stop(&mut self) {
        info!(
            live = self.connections.len(),
            queued = self.pool.queued(),
            "Shutting down"
        );
        self.shutdown.store(true, Ordering::Release);

        if let Err(e) = self.poller.deregister(&mut self.listener, LISTENER_TOKEN) {
            debug!(error = %e, "Failed to deregister listener");
        }

        // Joins every worker, so all completions are in the channel afterwards.
        let discarded = self.pool.shutdown(self.shutdown_policy);
        if !discarded.is_empty() {
            info!(count = discarded.len(), "Discarded queued tasks");
        }
        for Task { id, buffers } in discarded {
            self.complete(Completion {
                id,
                buffers,
                result: ProcessResult::Error,
            });
        }
        self.drain_completions();

        for id in self.connections.ids() {
            self.close(id);
        }

        info!("Server stopped");
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "connection not found")
}

fn held_by_worker() -> io::Error {
    io::Error::other("buffers held by a worker")
}
