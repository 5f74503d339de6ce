// vim: tw=80
//! Admission control for host requests
//!
//! At most `pool_size` requests may be in flight at once, and at most
//! `discard_limit` of them may be discards.  Requests which can't be admitted
//! sleep, first come first served, until a finishing request hands them its
//! place.

use crate::types::*;
use futures::{
    Future,
    FutureExt,
    channel::oneshot,
    future,
};
use std::{
    collections::VecDeque,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

#[derive(Debug)]
struct Limiter {
    busy: usize,
    limit: usize,
    max_busy: usize,
}

impl Limiter {
    fn new(limit: usize) -> Self {
        Limiter { busy: 0, limit, max_busy: 0 }
    }

    fn has_room(&self) -> bool {
        self.busy < self.limit
    }

    fn give(&mut self) {
        debug_assert!(self.busy > 0, "Limiter underflow");
        self.busy -= 1;
    }

    fn take(&mut self) {
        self.busy += 1;
        self.max_busy = self.max_busy.max(self.busy);
    }
}

#[derive(Debug)]
struct Sleeper {
    tx: oneshot::Sender<()>,
    /// Does this sleeper already hold a discard slot (or want one)?
    discard: bool,
}

#[derive(Debug)]
struct Inner {
    requests: Limiter,
    discards: Limiter,
    /// Requests waiting for a slot
    sleepers: VecDeque<Sleeper>,
    /// Discards waiting for a discard slot.  Once they get one, they join
    /// `sleepers` if necessary.
    discard_sleepers: VecDeque<Sleeper>,
    /// Waiting for the pool to be idle
    drainers: Vec<oneshot::Sender<()>>,
}

impl Inner {
    /// Hand out as many slots as possible
    fn awaken(&mut self) {
        loop {
            let mut progressed = false;
            while self.discards.has_room() {
                let Some(sleeper) = self.discard_sleepers.pop_front() else {
                    break;
                };
                self.discards.take();
                self.sleepers.push_back(sleeper);
                progressed = true;
            }
            while self.requests.has_room() {
                let Some(sleeper) = self.sleepers.pop_front() else { break };
                self.requests.take();
                if sleeper.tx.send(()).is_err() {
                    // The requester stopped waiting
                    self.requests.give();
                    if sleeper.discard {
                        self.discards.give();
                    }
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

/// The right to have one request in flight
#[derive(Debug)]
pub struct Permit {
    pool: Arc<DataVioPool>,
    discard: bool,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release(self.discard);
    }
}

#[derive(Debug)]
enum AcquireState {
    Ready,
    Waiting(oneshot::Receiver<()>),
    Done,
}

/// Future returned by [`DataVioPool::acquire`]
#[derive(Debug)]
pub struct Acquire {
    pool: Arc<DataVioPool>,
    discard: bool,
    state: AcquireState,
}

impl Future for Acquire {
    type Output = Result<Permit>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Self::Output>
    {
        let this = &mut *self;
        let granted = match &mut this.state {
            AcquireState::Ready => Ok(()),
            AcquireState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => Ok(()),
                // The pool is gone
                Poll::Ready(Err(_)) => Err(Error::ShuttingDown),
            },
            AcquireState::Done => panic!("Acquire polled after completion"),
        };
        this.state = AcquireState::Done;
        Poll::Ready(granted.map(|_| Permit {
            pool: this.pool.clone(),
            discard: this.discard
        }))
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        match mem::replace(&mut self.state, AcquireState::Done) {
            AcquireState::Ready => self.pool.release(self.discard),
            AcquireState::Waiting(mut rx) => {
                rx.close();
                // We may have been handed a slot before closing
                if let Ok(Some(())) = rx.try_recv() {
                    self.pool.release(self.discard);
                }
            }
            AcquireState::Done => (),
        }
    }
}

#[derive(Debug)]
pub struct DataVioPool {
    inner: Mutex<Inner>,
}

impl DataVioPool {
    pub fn new(limit: usize, discard_limit: usize) -> Self {
        let inner = Inner {
            requests: Limiter::new(limit),
            discards: Limiter::new(discard_limit),
            sleepers: VecDeque::new(),
            discard_sleepers: VecDeque::new(),
            drainers: Vec::new(),
        };
        DataVioPool { inner: Mutex::new(inner) }
    }

    /// Wait for a slot.  Waiters are served in order of arrival.
    pub fn acquire(self: &Arc<Self>, discard: bool) -> Acquire {
        let mut inner = self.lock();
        let state = if discard && (!inner.discard_sleepers.is_empty() ||
                                   !inner.discards.has_room())
        {
            let (tx, rx) = oneshot::channel();
            inner.discard_sleepers.push_back(Sleeper { tx, discard });
            AcquireState::Waiting(rx)
        } else {
            if discard {
                inner.discards.take();
            }
            if inner.sleepers.is_empty() && inner.requests.has_room() {
                inner.requests.take();
                AcquireState::Ready
            } else {
                let (tx, rx) = oneshot::channel();
                inner.sleepers.push_back(Sleeper { tx, discard });
                AcquireState::Waiting(rx)
            }
        };
        Acquire { pool: self.clone(), discard, state }
    }

    /// Number of requests in flight
    pub fn active(&self) -> usize {
        self.lock().requests.busy
    }

    /// Number of discards in flight
    pub fn active_discards(&self) -> usize {
        self.lock().discards.busy
    }

    /// Wait until no request is in flight
    pub fn drain(&self) -> Pin<Box<dyn Future<Output=()> + Send>> {
        let mut inner = self.lock();
        if inner.requests.busy == 0 {
            future::ready(()).boxed()
        } else {
            let (tx, rx) = oneshot::channel();
            inner.drainers.push(tx);
            rx.map(drop).boxed()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most requests ever in flight at once
    pub fn max_active(&self) -> usize {
        self.lock().requests.max_busy
    }

    fn release(&self, discard: bool) {
        let mut inner = self.lock();
        inner.requests.give();
        if discard {
            inner.discards.give();
        }
        inner.awaken();
        if inner.requests.busy == 0 {
            for tx in inner.drainers.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    /// Take a slot if one is free and nobody is waiting for it
    pub fn try_acquire(self: &Arc<Self>, discard: bool) -> Option<Permit> {
        let mut inner = self.lock();
        if !inner.sleepers.is_empty() || !inner.requests.has_room() {
            return None;
        }
        if discard {
            if !inner.discard_sleepers.is_empty() ||
                !inner.discards.has_room()
            {
                return None;
            }
            inner.discards.take();
        }
        inner.requests.take();
        Some(Permit { pool: self.clone(), discard })
    }
}

// LCOV_EXCL_STOP
