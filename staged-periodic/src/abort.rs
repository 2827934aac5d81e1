// Copyright (c) Facebook, Inc. and its affiliates.

//! Run cancellation.
//!
//! An [`Aborter`] is a one-shot stop signal shared by every thread of a run.
//! Closing it is the only state transition and it can't be reopened.
//!
//! A [`SignalBroker`] multiplexes the process interrupt signal across all
//! outstanding runs. Each subscribed run gets a watcher thread which aborts
//! the run when an interrupt is delivered and goes away when the run's own
//! stop channel closes. The process-global broker hooks SIGINT/SIGTERM on its
//! first subscription. While no run is outstanding, an interrupt terminates
//! the process like the default disposition would.
use crossbeam::channel::{self, select, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};

/// Idempotent one-shot cancellation signal.
pub struct Aborter {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Aborter {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = channel::bounded(1);
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }

    /// Close the stop channel. Safe to call any number of times from any
    /// number of threads; only the first call has an effect.
    pub fn abort(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            debug!("aborter: closing stop channel");
            drop(tx);
        }
    }

    /// Receiver side of the stop channel. It never yields a message and
    /// becomes ready, disconnected, once `abort()` is called.
    pub fn stop_chan(&self) -> Receiver<()> {
        self.rx.clone()
    }

    pub fn is_aborted(&self) -> bool {
        is_closed(&self.rx)
    }
}

/// Non-blocking check on a stop channel.
pub fn is_closed(rx: &Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

struct BrokerState {
    outstanding: usize,
    next_id: u64,
    watchers: HashMap<u64, Sender<()>>,
    hooked: bool,
}

/// Reference counted multiplexer of the process interrupt signal.
pub struct SignalBroker {
    state: Mutex<BrokerState>,
    os_hook: bool,
}

lazy_static::lazy_static! {
    static ref GLOBAL_BROKER: Arc<SignalBroker> = Arc::new(SignalBroker::build(true));
}

impl SignalBroker {
    /// Exit status used when an interrupt arrives without outstanding runs.
    pub const EXIT_ON_INTERRUPT: i32 = 130;

    fn build(os_hook: bool) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                outstanding: 0,
                next_id: 0,
                watchers: HashMap::new(),
                hooked: false,
            }),
            os_hook,
        }
    }

    /// A detached broker which never touches process signal state.
    /// Interrupts are delivered only through `interrupt()`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// The process-wide broker, hooked to SIGINT/SIGTERM.
    pub fn global() -> Arc<Self> {
        GLOBAL_BROKER.clone()
    }

    fn hook_os_signal() {
        let res = ctrlc::set_handler(|| {
            if SignalBroker::global().interrupt() {
                info!("broker: SIGINT/TERM received, aborting outstanding runs");
            } else {
                info!("broker: SIGINT/TERM received without outstanding runs, exiting");
                std::process::exit(Self::EXIT_ON_INTERRUPT);
            }
        });
        if let Err(e) = res {
            warn!(
                "broker: failed to install signal handler ({:?}), deliver interrupts with interrupt()",
                &e
            );
        }
    }

    /// Register a run. Its `aborter` is aborted when an interrupt is
    /// delivered while the returned subscription is alive.
    pub fn subscribe(self: &Arc<Self>, aborter: &Arc<Aborter>) -> Subscription {
        let (intr_tx, intr_rx) = channel::bounded::<()>(1);

        let id = {
            let mut state = self.state.lock().unwrap();
            state.outstanding += 1;
            let id = state.next_id;
            state.next_id += 1;
            state.watchers.insert(id, intr_tx);
            if state.outstanding == 1 {
                debug!("broker: watcher {} is the first outstanding run", id);
                if self.os_hook && !state.hooked {
                    Self::hook_os_signal();
                    state.hooked = true;
                }
            }
            id
        };

        let broker = self.clone();
        let stop_rx = aborter.stop_chan();
        let aborter = aborter.clone();
        let jh = spawn(move || {
            select! {
                recv(intr_rx) -> msg => match msg {
                    Ok(()) => {
                        debug!("broker: watcher {} got interrupt", id);
                        aborter.abort();
                    }
                    Err(_) => debug!("broker: watcher {} unsubscribed", id),
                },
                recv(stop_rx) -> _ => debug!("broker: watcher {} stop channel closed", id),
            }
            broker.release(id);
        });

        Subscription {
            broker: self.clone(),
            id,
            jh: Some(jh),
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.watchers.remove(&id);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            debug!("broker: watcher {} was the last outstanding run", id);
        } else {
            debug!(
                "broker: watcher {} done, {} outstanding",
                id, state.outstanding
            );
        }
    }

    /// Deliver an interrupt to every subscribed run. Returns whether there
    /// was anyone to deliver to.
    pub fn interrupt(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let listening = state.outstanding > 0;
        for (id, tx) in state.watchers.drain() {
            if tx.try_send(()).is_err() {
                debug!("broker: watcher {} already gone", id);
            }
        }
        listening
    }

    /// Number of runs currently watching for interrupts.
    pub fn nr_outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }
}

/// Cancellation handle returned by `SignalBroker::subscribe()`. Dropping it
/// unsubscribes without aborting the run.
pub struct Subscription {
    broker: Arc<SignalBroker>,
    id: u64,
    jh: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        // dropping the sender wakes the watcher with a disconnect
        let tx = self.broker.state.lock().unwrap().watchers.remove(&self.id);
        drop(tx);
        if let Some(jh) = self.jh.take() {
            if jh.join().is_err() {
                warn!("broker: watcher {} panicked", self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::{Aborter, SignalBroker};
    use std::thread::{sleep, spawn};
    use std::time::{Duration, Instant};

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_abort_idempotent() {
        let _ = ::env_logger::try_init();
        let a = Aborter::new();
        let stop = a.stop_chan();
        assert!(!a.is_aborted());
        assert!(stop.try_recv().is_err());

        a.abort();
        a.abort();
        assert!(a.is_aborted());
        assert!(super::is_closed(&stop));
        // a closed stop channel is always ready
        assert!(stop.recv().is_err());
    }

    #[test]
    fn test_abort_concurrent() {
        let _ = ::env_logger::try_init();
        let a = Aborter::new();
        let jhs: Vec<_> = (0..16)
            .map(|_| {
                let a = a.clone();
                spawn(move || {
                    for _ in 0..100 {
                        a.abort();
                    }
                })
            })
            .collect();
        for jh in jhs {
            jh.join().unwrap();
        }
        assert!(a.is_aborted());
    }

    #[test]
    fn test_two_watchers_interrupt() {
        let _ = ::env_logger::try_init();
        let broker = SignalBroker::new();
        let (a1, a2) = (Aborter::new(), Aborter::new());
        let s1 = broker.subscribe(&a1);
        let s2 = broker.subscribe(&a2);
        assert_eq!(broker.nr_outstanding(), 2);

        assert!(broker.interrupt());
        wait_for("both runs to be aborted", || {
            a1.is_aborted() && a2.is_aborted()
        });
        wait_for("watchers to go away", || broker.nr_outstanding() == 0);

        // nobody is listening anymore
        assert!(!broker.interrupt());
        drop(s1);
        s2.cancel();
        assert_eq!(broker.nr_outstanding(), 0);
    }

    #[test]
    fn test_stop_releases_watcher() {
        let _ = ::env_logger::try_init();
        let broker = SignalBroker::new();
        let a = Aborter::new();
        let _sub = broker.subscribe(&a);
        assert_eq!(broker.nr_outstanding(), 1);

        a.abort();
        wait_for("watcher to notice stop", || broker.nr_outstanding() == 0);
    }

    #[test]
    fn test_cancel_does_not_abort() {
        let _ = ::env_logger::try_init();
        let broker = SignalBroker::new();
        let a = Aborter::new();
        let other = Aborter::new();
        let sub = broker.subscribe(&a);
        let _other_sub = broker.subscribe(&other);
        sub.cancel();

        assert_eq!(broker.nr_outstanding(), 1);
        assert!(!a.is_aborted());

        // interrupts after cancellation only reach the remaining run
        assert!(broker.interrupt());
        wait_for("remaining run to be aborted", || other.is_aborted());
        assert!(!a.is_aborted());
    }
}
