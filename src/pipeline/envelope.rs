//! Payload wrapper carrying a one-shot interruption signal.
//!
//! An [`InterruptHandle`] can be cloned freely; every clone observes the same flag.
//! A stage that is mid-flight on an interruptible unit of work either polls
//! [`InterruptHandle::is_set`] between suspendable steps or races its work against
//! [`InterruptHandle::interrupted`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Signal {
    id: u64,
    interruptible: bool,
    interrupted: AtomicBool,
    token: CancellationToken,
}

/// Shared one-shot interruption flag.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    inner: Arc<Signal>,
}

impl InterruptHandle {
    /// Creates a signal that can be interrupted.
    pub fn new() -> Self {
        Self::with_interruptible(true)
    }

    /// Creates a signal that ignores every interruption request.
    pub fn uninterruptible() -> Self {
        Self::with_interruptible(false)
    }

    fn with_interruptible(interruptible: bool) -> Self {
        Self {
            inner: Arc::new(Signal {
                id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
                interruptible,
                interrupted: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Requests interruption.
    ///
    /// Returns `true` only for the call that performed the transition. Calls on an
    /// uninterruptible or already-interrupted signal return `false` and change nothing.
    pub fn interrupt(&self) -> bool {
        if !self.inner.interruptible {
            return false;
        }
        let transitioned = self
            .inner
            .interrupted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            self.inner.token.cancel();
        }
        transitioned
    }

    /// Non-blocking query of the interruption state.
    pub fn is_set(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Whether this signal can ever be set.
    pub fn is_interruptible(&self) -> bool {
        self.inner.interruptible
    }

    /// Completes once the signal is set. Never completes for uninterruptible signals.
    ///
    /// Cancel-safe.
    pub async fn interrupted(&self) {
        self.inner.token.cancelled().await
    }

    /// True if both handles observe the same signal.
    pub fn same_signal(&self, other: &InterruptHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A payload travelling through the pipeline together with its interruption signal.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    payload: T,
    signal: InterruptHandle,
}

impl<T> Envelope<T> {
    /// Wraps a payload with a fresh interruptible signal.
    pub fn new(payload: T) -> Self {
        Self::with_signal(payload, InterruptHandle::new())
    }

    /// Wraps a payload that can never be interrupted.
    pub fn uninterruptible(payload: T) -> Self {
        Self::with_signal(payload, InterruptHandle::uninterruptible())
    }

    /// Wraps a payload with an existing signal, shared with other envelopes.
    pub fn with_signal(payload: T, signal: InterruptHandle) -> Self {
        Self { payload, signal }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Splits into payload and signal.
    pub fn into_parts(self) -> (T, InterruptHandle) {
        (self.payload, self.signal)
    }

    /// See [`InterruptHandle::interrupt`].
    pub fn interrupt(&self) -> bool {
        self.signal.interrupt()
    }

    /// See [`InterruptHandle::is_set`].
    pub fn is_set(&self) -> bool {
        self.signal.is_set()
    }

    pub fn is_interruptible(&self) -> bool {
        self.signal.is_interruptible()
    }

    /// Handle to the signal, usable after the envelope has been moved into a queue.
    pub fn signal(&self) -> &InterruptHandle {
        &self.signal
    }

    /// Replaces the payload, keeping the signal.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: f(self.payload),
            signal: self.signal,
        }
    }
}
