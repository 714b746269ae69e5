// src/reactor.rs
//
// The event loop and the worker-side task executor, sharing one `Engine`.
//
// The loop thread is the only place readiness is polled. It owns accept
// and admission control, drains read-ready sockets into their connection
// buffers, filters stale events by generation, runs the idle sweep, and
// performs every teardown. Workers execute parse/build and flush steps and
// re-arm the socket when done; anything a worker wants torn down is parked
// in `Closing` state and handed to the loop over the wake pipe.
//
// Connections are registered edge-triggered + one-shot: after an event
// fires, the socket is silent until the processing step that consumed it
// has completed and explicitly re-armed. That discipline, not a lock, is
// what keeps at most one thread on a connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::conn::{Conn, ConnState, FillOutcome, ProcessOutcome, Readiness};
use crate::error::EmberResult;
use crate::metrics::ServerMetrics;
use crate::pool::{Task, TaskHandler, TaskQueue};
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll,
    WAKE_TOKEN, epoll_event,
};
use crate::table::{ConnTable, split_token, token_for};

/// Listener and wake-pipe tokens live above any possible connection token
/// (connection indices are `u32`, generations below `u32::MAX`).
const LISTENER_TOKEN: u64 = u64::MAX;
const WAKE_PIPE_TOKEN: u64 = u64::MAX - 1;

const MAX_EVENTS: usize = 1024;

fn epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub struct Engine {
    epoll: Epoll,
    pub table: ConnTable,
    pub queue: Arc<TaskQueue>,
    pub metrics: ServerMetrics,
    listen_fd: i32,
    wake_rx: i32,
    wake_tx: i32,
    doc_root: PathBuf,
    /// Seconds of inactivity before an armed connection is evicted;
    /// 0 disables the sweep.
    idle_timeout: u32,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new(
        listen_fd: i32,
        doc_root: PathBuf,
        max_connections: usize,
        read_buf_size: usize,
        write_buf_size: usize,
        idle_timeout: u32,
    ) -> EmberResult<Self> {
        let epoll = Epoll::new()?;
        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        Ok(Self {
            epoll,
            table: ConnTable::new(max_connections, read_buf_size, write_buf_size),
            queue: Arc::new(TaskQueue::new()),
            metrics: ServerMetrics::new(),
            listen_fd,
            wake_rx,
            wake_tx,
            doc_root,
            idle_timeout,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Request shutdown from any thread: set the flag and poke the loop
    /// out of its wait.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = syscalls::send_token(self.wake_tx, WAKE_TOKEN);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The event loop. Returns only on shutdown or a fatal epoll failure.
    pub fn run(&self) -> EmberResult<()> {
        // New connections must never be missed: the listener stays
        // level-triggered. The wake pipe likewise.
        self.epoll.add(self.listen_fd, LISTENER_TOKEN, EPOLLIN)?;
        self.epoll.add(self.wake_rx, WAKE_PIPE_TOKEN, EPOLLIN)?;

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout_ms: i32 = if self.idle_timeout > 0 { 1000 } else { -1 };
        let mut last_sweep = epoch_secs();

        while !self.is_shutting_down() {
            let n = self.epoll.wait(&mut events, timeout_ms)?;
            let now = epoch_secs();

            for ev in &events[..n] {
                match ev.u64 {
                    LISTENER_TOKEN => self.accept_ready(now),
                    WAKE_PIPE_TOKEN => self.drain_wake_pipe(),
                    token => self.connection_event(token, ev.events as i32, now),
                }
            }

            if self.idle_timeout > 0 && now > last_sweep {
                self.sweep_idle(now);
                last_sweep = now;
            }
        }

        Ok(())
    }

    /// Accept every queued connection; admission control closes the socket
    /// outright once the table is full.
    fn accept_ready(&self, now: u32) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => match self.table.allocate(fd, peer, now) {
                    Some((idx, generation)) => {
                        let token = token_for(idx, generation);
                        if let Err(e) =
                            self.epoll
                                .add(fd, token, EPOLLIN | EPOLLET | EPOLLONESHOT | EPOLLRDHUP)
                        {
                            tracing::warn!(fd, error = %e, "failed to register connection");
                            if let Some(conn) = self.table.take(idx, generation) {
                                self.table.recycle(idx, conn);
                            }
                            syscalls::close_fd(fd);
                            continue;
                        }
                        self.metrics.inc_conn();
                        tracing::debug!(fd, peer = ?peer, slot = idx, "connection accepted");
                    }
                    None => {
                        tracing::debug!(fd, "connection table full, rejecting");
                        syscalls::close_fd(fd);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Wake tokens just interrupt the wait; any other token is a slot index
    /// a worker parked in `Closing` state for us to tear down.
    fn drain_wake_pipe(&self) {
        loop {
            match syscalls::recv_token(self.wake_rx) {
                Ok(Some(WAKE_TOKEN)) => continue,
                Ok(Some(idx)) => {
                    if let Some(conn) = self.table.take_closing(idx) {
                        self.teardown(idx, conn);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn connection_event(&self, token: u64, flags: i32, now: u32) {
        let (idx, generation) = split_token(token);

        // A slot recycled earlier in this same event batch can leave a
        // stale event behind; the generation token catches it.
        if self.table.generation(idx) != Some(generation) {
            tracing::trace!(slot = idx, "stale event ignored");
            return;
        }

        if flags & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) != 0 {
            if let Some(conn) = self.table.take(idx, generation) {
                tracing::debug!(fd = conn.fd, slot = idx, "peer hangup");
                self.teardown(idx, conn);
            }
            return;
        }

        if flags & EPOLLIN != 0 {
            let Some(mut conn) = self.table.take(idx, generation) else {
                return;
            };
            conn.last_active = now;
            match conn.fill() {
                Ok(FillOutcome::Drained(_)) => {
                    // Parsing is worker-pool work; a slow request must not
                    // stall readiness dispatch for everyone else.
                    conn.state = ConnState::Processing;
                    self.table.park(idx, conn);
                    self.queue.submit(Task {
                        slot: idx,
                        generation,
                        reason: Readiness::Readable,
                    });
                }
                Ok(FillOutcome::Eof) => {
                    tracing::debug!(slot = idx, "peer closed during drain");
                    self.teardown(idx, conn);
                }
                Err(e) => {
                    tracing::debug!(slot = idx, error = %e, "read failed");
                    self.teardown(idx, conn);
                }
            }
        } else if flags & EPOLLOUT != 0 {
            let Some(mut conn) = self.table.take(idx, generation) else {
                return;
            };
            conn.last_active = now;
            conn.state = ConnState::Processing;
            self.table.park(idx, conn);
            self.queue.submit(Task {
                slot: idx,
                generation,
                reason: Readiness::Writable,
            });
        }
    }

    /// Teardown: the socket is closed, the mapping (if any) is released by
    /// `recycle`, and the slot's generation is bumped. Only ever runs on
    /// the loop thread.
    fn teardown(&self, idx: u32, conn: Box<Conn>) {
        let fd = conn.fd;
        let _ = self.epoll.delete(fd);
        syscalls::close_fd(fd);
        self.table.recycle(idx, conn);
        self.metrics.dec_conn();
    }

    fn sweep_idle(&self, now: u32) {
        for idx in 0..self.table.capacity() as u32 {
            if let Some(conn) = self.table.try_evict_idle(idx, now, self.idle_timeout) {
                tracing::debug!(fd = conn.fd, slot = idx, "evicting idle connection");
                self.teardown(idx, conn);
            }
        }
    }

    /// Close every remaining connection and the loop's own descriptors.
    /// Called by the server after the worker pool has been joined, so no
    /// connection is checked out anymore.
    pub fn shutdown_cleanup(&self) {
        for (idx, conn) in self.table.drain_live() {
            let fd = conn.fd;
            let _ = self.epoll.delete(fd);
            syscalls::close_fd(fd);
            self.table.recycle(idx, conn);
        }
        syscalls::close_fd(self.wake_rx);
        syscalls::close_fd(self.wake_tx);
        syscalls::close_fd(self.listen_fd);
    }

    // ---- Worker side ----

    /// Park a connection and re-arm its one-shot registration. Parking must
    /// precede re-arming: the moment the socket is armed, the next event
    /// may fire and expects to find the connection in its slot.
    fn park_and_arm(&self, idx: u32, generation: u32, conn: Box<Conn>, interest: i32) {
        let fd = conn.fd;
        self.table.park(idx, conn);
        let token = token_for(idx, generation);
        if let Err(e) = self
            .epoll
            .rearm(fd, token, interest | EPOLLET | EPOLLONESHOT | EPOLLRDHUP)
        {
            tracing::debug!(fd, slot = idx, error = %e, "re-arm failed");
            if let Some(mut conn) = self.table.take(idx, generation) {
                conn.state = ConnState::Closing;
                self.table.park(idx, conn);
                self.request_teardown(idx);
            }
        }
    }

    /// Hand a connection to the loop thread for teardown.
    fn park_closing(&self, idx: u32, mut conn: Box<Conn>) {
        conn.state = ConnState::Closing;
        self.table.park(idx, conn);
        self.request_teardown(idx);
    }

    fn request_teardown(&self, idx: u32) {
        let _ = syscalls::send_token(self.wake_tx, idx);
    }
}

impl TaskHandler for Engine {
    /// One processing step for one connection. The take either succeeds —
    /// and then this worker is the only thread touching the connection
    /// until it parks it back — or the task is stale and dropped.
    fn run_task(&self, task: Task) {
        let Some(mut conn) = self.table.take(task.slot, task.generation) else {
            return;
        };

        let mut reason = task.reason;
        loop {
            match conn.process(reason, &self.doc_root) {
                Ok(ProcessOutcome::NeedMoreData) => {
                    conn.state = ConnState::Reading;
                    self.park_and_arm(task.slot, task.generation, conn, EPOLLIN);
                    return;
                }
                Ok(ProcessOutcome::ResponseReady) if reason == Readiness::Readable => {
                    // The response just got staged; the socket is almost
                    // always writable right now, so try the flush at once.
                    self.metrics.inc_req();
                    reason = Readiness::Writable;
                }
                Ok(ProcessOutcome::Error) => {
                    self.metrics.inc_req();
                    reason = Readiness::Writable;
                }
                Ok(ProcessOutcome::ResponseReady) => {
                    // Short write: re-arm for write-readiness only, no new
                    // parsing work.
                    conn.state = ConnState::Writing;
                    self.park_and_arm(task.slot, task.generation, conn, EPOLLOUT);
                    return;
                }
                Ok(ProcessOutcome::Complete) => {
                    self.metrics.add_bytes(conn.response_bytes() as u64);
                    if conn.keep_alive && !self.is_shutting_down() {
                        conn.reset_for_next_request();
                        if conn.has_buffered() {
                            // The next request's bytes were drained along
                            // with this one; no event will fire for them.
                            reason = Readiness::Readable;
                            continue;
                        }
                        conn.state = ConnState::Reading;
                        self.park_and_arm(task.slot, task.generation, conn, EPOLLIN);
                    } else {
                        self.park_closing(task.slot, conn);
                    }
                    return;
                }
                Err(e) => {
                    tracing::debug!(slot = task.slot, error = %e, "connection I/O failed");
                    self.park_closing(task.slot, conn);
                    return;
                }
            }
        }
    }
}
