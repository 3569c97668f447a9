// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::crossbeam_channel::{
    self,
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::std::{
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//==============================================================================
// Structures
//==============================================================================

/// A background alarm that runs a callback after a delay, either once or periodically until cancelled.
///
/// Cancellation is idempotent. Cancelling waits for an in-flight callback to finish, except when invoked from the
/// alarm's own callback, in which case the alarm is simply detached.
pub struct Alarm {
    name: String,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Alarm {
    /// Arms a periodic alarm. The callback runs every `period` for as long as it returns `true`.
    pub fn periodic<F>(name: &str, period: Duration, mut callback: F) -> Result<Self, Fail>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(name, move |cancel: Receiver<()>| loop {
            match cancel.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    if !callback() {
                        break;
                    }
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    }

    /// Arms a one-shot alarm that runs `callback` once after `delay`, unless cancelled before.
    pub fn oneshot<F>(name: &str, delay: Duration, callback: F) -> Result<Self, Fail>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, move |cancel: Receiver<()>| {
            if let Err(RecvTimeoutError::Timeout) = cancel.recv_timeout(delay) {
                callback();
            }
        })
    }

    fn spawn<F>(name: &str, body: F) -> Result<Self, Fail>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(rx))?;
        trace!("spawn(): alarm {} armed", name);
        Ok(Self {
            name: name.to_string(),
            cancel: Some(tx),
            handle: Some(handle),
        })
    }

    /// Cancels the target alarm. Cancelling an alarm that already fired or was already cancelled is a no-op.
    pub fn cancel(&mut self) {
        // Dropping the sender disconnects the channel and wakes the alarm thread.
        if self.cancel.take().is_none() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("cancel(): alarm {} callback panicked", self.name);
            }
        }
        trace!("cancel(): alarm {} cancelled", self.name);
    }

    /// Returns `true` if the target alarm was neither cancelled nor did it run to completion.
    pub fn is_armed(&self) -> bool {
        match self.handle {
            Some(ref handle) => !handle.is_finished(),
            None => false,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod test {
    use super::Alarm;
    use crate::ensure_eq;
    use ::anyhow::Result;
    use ::std::{
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn periodic_alarm_stops_when_callback_declines() -> Result<()> {
        let ticks: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let counter: Arc<AtomicUsize> = ticks.clone();
        let mut alarm: Alarm = Alarm::periodic("test-periodic", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst) + 1 < 3
        })?;
        while alarm.is_armed() {
            thread::sleep(Duration::from_millis(1));
        }
        alarm.cancel();
        ensure_eq!(ticks.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn cancelled_oneshot_never_fires() -> Result<()> {
        let fired: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let flag: Arc<AtomicUsize> = fired.clone();
        let mut alarm: Alarm = Alarm::oneshot("test-oneshot", Duration::from_secs(60), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        })?;
        alarm.cancel();
        // Cancelling twice is harmless.
        alarm.cancel();
        ensure_eq!(fired.load(Ordering::SeqCst), 0);
        ensure_eq!(alarm.is_armed(), false);
        Ok(())
    }

    #[test]
    fn oneshot_fires_after_delay() -> Result<()> {
        let fired: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let flag: Arc<AtomicUsize> = fired.clone();
        let alarm: Alarm = Alarm::oneshot("test-oneshot-fire", Duration::from_millis(1), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        })?;
        while alarm.is_armed() {
            thread::sleep(Duration::from_millis(1));
        }
        ensure_eq!(fired.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
