// src/table.rs
//
// Fixed-capacity connection table. Every slot's `Conn` (and its buffers)
// is allocated once at startup and recycled for the slot's next
// connection, never deallocated.
//
// A slot's generation counter is bumped on recycle; readiness tokens and
// tasks carry the generation they were minted with, so anything stale is
// detected and ignored instead of touching a reused slot.
//
// The per-slot mutex guards only the ownership handoff (park/take); it is
// never held across processing, and the one-shot re-arm protocol ensures
// it is uncontended.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::conn::{Conn, ConnState};

struct Slot {
    parked: Mutex<Option<Box<Conn>>>,
    generation: AtomicU32,
}

pub struct ConnTable {
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
    active: AtomicUsize,
}

/// Pack a slot index and its generation into an epoll token.
pub fn token_for(idx: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | idx as u64
}

/// Split an epoll token back into (index, generation).
pub fn split_token(token: u64) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

impl ConnTable {
    pub fn new(capacity: usize, read_capacity: usize, write_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                parked: Mutex::new(Some(Box::new(Conn::new(read_capacity, write_capacity)))),
                generation: AtomicU32::new(0),
            });
        }
        // Pop from the back: slot 0 is handed out first.
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
            active: AtomicUsize::new(0),
        }
    }

    /// Claim a free slot for a freshly accepted socket. `None` means the
    /// table is at capacity and the caller must close the socket
    /// (admission control).
    pub fn allocate(&self, fd: i32, peer: Option<std::net::SocketAddr>, now: u32) -> Option<(u32, u32)> {
        let idx = self.free.lock().unwrap().pop()?;
        let slot = &self.slots[idx as usize];
        let generation = slot.generation.load(Ordering::Acquire);
        {
            let mut parked = slot.parked.lock().unwrap();
            let conn = parked
                .as_mut()
                .expect("free slot always holds a parked connection");
            conn.init(fd, peer, now);
        }
        self.active.fetch_add(1, Ordering::Relaxed);
        Some((idx, generation))
    }

    /// Check a connection out of its slot, if `generation` is current.
    /// Stale takes (slot recycled since the token was minted) return None.
    pub fn take(&self, idx: u32, generation: u32) -> Option<Box<Conn>> {
        let slot = self.slots.get(idx as usize)?;
        if slot.generation.load(Ordering::Acquire) != generation {
            return None;
        }
        slot.parked.lock().unwrap().take()
    }

    /// Check a connection out regardless of generation, for teardown
    /// requests that reference the slot directly.
    pub fn take_closing(&self, idx: u32) -> Option<Box<Conn>> {
        let slot = self.slots.get(idx as usize)?;
        let mut parked = slot.parked.lock().unwrap();
        match parked.as_ref() {
            Some(conn) if conn.state == ConnState::Closing => parked.take(),
            _ => None,
        }
    }

    /// Return a checked-out connection to its slot. Must happen before the
    /// socket is re-armed, so the next event finds the connection parked.
    pub fn park(&self, idx: u32, conn: Box<Conn>) {
        let slot = &self.slots[idx as usize];
        let mut parked = slot.parked.lock().unwrap();
        debug_assert!(parked.is_none(), "slot parked twice");
        *parked = Some(conn);
    }

    /// Recycle a torn-down connection's slot: release its resources, bump
    /// the generation so outstanding tokens go stale, and free the slot.
    /// The caller has already closed the socket.
    pub fn recycle(&self, idx: u32, mut conn: Box<Conn>) {
        conn.clear();
        let slot = &self.slots[idx as usize];
        slot.generation.fetch_add(1, Ordering::AcqRel);
        *slot.parked.lock().unwrap() = Some(conn);
        self.free.lock().unwrap().push(idx);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Take an armed connection that has been idle past `timeout_secs`.
    /// Connections currently checked out, queued for processing, or
    /// already closing are left alone.
    pub fn try_evict_idle(&self, idx: u32, now: u32, timeout_secs: u32) -> Option<Box<Conn>> {
        let slot = self.slots.get(idx as usize)?;
        let mut parked = slot.parked.lock().unwrap();
        match parked.as_ref() {
            Some(conn)
                if matches!(conn.state, ConnState::Reading | ConnState::Writing)
                    && now.saturating_sub(conn.last_active) > timeout_secs =>
            {
                parked.take()
            }
            _ => None,
        }
    }

    pub fn generation(&self, idx: u32) -> Option<u32> {
        self.slots
            .get(idx as usize)
            .map(|s| s.generation.load(Ordering::Acquire))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Tear-down helper for shutdown: drain every live connection.
    pub fn drain_live(&self) -> Vec<(u32, Box<Conn>)> {
        let mut live = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let mut parked = slot.parked.lock().unwrap();
            if let Some(conn) = parked.as_ref() {
                if conn.state != ConnState::Free {
                    live.push((i as u32, parked.take().unwrap()));
                }
            }
        }
        live
    }
}
