use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::drivers::preset::TdrPreset;
use crate::drivers::ConsoleError;
use crate::types::{
    Frame, InstrumentState, LedId, LedSelectors, LedState, TdrConfiguration, TdrWorkingState,
};

/// A cancellable blocking sequence produced by one of the listen operations.
///
/// `next_item` parks until the producer yields, the stream fails, or the
/// token the subscription was opened with is cancelled, in which case it
/// returns [`ConsoleError::Cancelled`] (or whatever error the aborted transport
/// produced; callers decide by checking their own running flag).
pub trait Subscription<T>: Send {
    fn next_item(&mut self) -> Result<T, ConsoleError>;
}

/// Capability set of a TDR instrument endpoint.
pub trait Instrument: Send + Sync {
    /// Human readable endpoint, used in log lines.
    fn host(&self) -> String;
    fn is_ready(&self, timeout: Duration) -> Result<(), ConsoleError>;
    fn version_id(&self) -> Result<String, ConsoleError>;
    fn state(&self) -> Result<InstrumentState, ConsoleError>;
    fn tdr_configuration(&self) -> Result<TdrConfiguration, ConsoleError>;
    fn tdr_working_state(&self) -> Result<TdrWorkingState, ConsoleError>;
    fn configure_tdr_preset(&self, preset: TdrPreset) -> Result<(), ConsoleError>;
    fn enable_tdr(&self, enable: bool) -> Result<(), ConsoleError>;
    fn set_led(&self, led: LedId, on: bool) -> Result<(), ConsoleError>;

    /// Change tokens only; follow each with [`Instrument::state`].
    fn listen_state_events(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<()>>, ConsoleError>;
    fn listen_sample_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<Frame>>, ConsoleError>;
    fn listen_led_state(
        &self,
        selectors: LedSelectors,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<LedState>>, ConsoleError>;
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<CancelHook>>,
    tripwire: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// One token shared by every listener of a connection. Cancelling it wakes
/// all parked receivers at once.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
                tripwire: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    /// Idempotent. Runs registered hooks on the calling thread.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tripwire.lock().take();
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that never yields a value and disconnects once cancelled.
    /// Meant for the `recv` arm of a `select!`.
    pub fn signal(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    /// Registers a hook that unblocks a transport. Runs immediately if the
    /// token is already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
