//! Events raised by endpoints, and the way other threads reach the loop.
//!
//! Endpoints never call into the protocol layer directly: they push
//! notifications tagged with their token here, and the event loop drains the queue
//! between readiness events. A producer running on another thread also wakes
//! the loop, so that new write interest is picked up without waiting for the
//! next natural wake.
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, OnceLock, PoisonError,
    },
    thread::{self, ThreadId},
};

use mio::{Registry, Token, Waker};

use crate::{endpoint::EndpointEvent, EndpointId};

#[derive(Debug)]
pub enum Notification {
    /// to be dispatched to the endpoint's subscribers
    Event(EndpointEvent),
    /// data was queued from outside the loop, write interest must be refreshed
    Interest,
    /// the endpoint may have more to read
    Read,
}

/// A notification and the endpoint it comes from. The id guards against
/// tokens reused by the slab once the endpoint is gone.
pub type Queued = (Token, EndpointId, Notification);

pub struct Notifier {
    waker: Waker,
    queue: Mutex<VecDeque<Queued>>,
    loop_thread: OnceLock<ThreadId>,
    stopping: AtomicBool,
}

impl Notifier {
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Notifier {
            waker: Waker::new(registry, token)?,
            queue: Mutex::new(VecDeque::new()),
            loop_thread: OnceLock::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Marks the calling thread as the event loop thread. Only the first call
    /// has an effect.
    pub fn bind_current_thread(&self) {
        let _ = self.loop_thread.set(thread::current().id());
    }

    pub fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    pub fn push(&self, token: Token, id: EndpointId, notification: Notification) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((token, id, notification));

        if !self.is_loop_thread() {
            self.wake();
        }
    }

    pub fn pop(&self) -> Option<Queued> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!("could not wake the event loop: {}", e);
        }
    }

    /// asks the loop to close every session and return
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
