//! Timer thread for flight retransmissions.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::engine::RetransmitTimers;
use crate::flight::FlightHandle;

/// What a fired timer is handed to.
pub type TimeoutTarget = Arc<dyn Fn(SocketAddr, FlightHandle) + Send + Sync>;

enum Command {
    Schedule(Timer),
    CancelAll,
    Shutdown,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    peer: SocketAddr,
    handle: FlightHandle,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Earliest deadline on top of the max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One thread holding all retransmission timers.
///
/// Fired timers are passed to the target set with [`set_target`](Self::set_target),
/// which is expected to hand them to the peer's stripe. Timers whose flight
/// was cancelled in the meantime are skipped.
pub struct RetransmitScheduler {
    tx: Sender<Command>,
    target: Arc<RwLock<Option<TimeoutTarget>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RetransmitScheduler {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let target: Arc<RwLock<Option<TimeoutTarget>>> = Arc::new(RwLock::new(None));

        let thread_target = target.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || run_timers(rx, thread_target));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn timer thread: {}", e);
                None
            }
        };

        RetransmitScheduler {
            tx,
            target,
            thread: Mutex::new(thread),
        }
    }

    pub fn set_target(&self, target: impl Fn(SocketAddr, FlightHandle) + Send + Sync + 'static) {
        *self.target.write() = Some(Arc::new(target));
    }

    /// Stop the timer thread. Pending timers never fire.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

impl RetransmitTimers for RetransmitScheduler {
    fn schedule(&self, peer: SocketAddr, handle: FlightHandle, delay: Duration) {
        trace!("Scheduling flight {} to {} in {:?}", handle.id(), peer, delay);
        let timer = Timer {
            deadline: Instant::now() + delay,
            seq: 0,
            peer,
            handle,
        };
        let _ = self.tx.send(Command::Schedule(timer));
    }

    fn cancel_all(&self) {
        let _ = self.tx.send(Command::CancelAll);
    }
}

impl Drop for RetransmitScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timers(rx: Receiver<Command>, target: Arc<RwLock<Option<TimeoutTarget>>>) {
    let mut timers = BinaryHeap::<Timer>::new();
    let mut seq = 0_u64;

    loop {
        let command = match timers.peek() {
            Some(Timer { deadline, .. }) => rx.recv_deadline(*deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Schedule(mut timer)) => {
                seq += 1;
                timer.seq = seq;
                timers.push(timer);
            }
            Ok(Command::CancelAll) => {
                debug!("Cancelling {} retransmission timers", timers.len());
                timers.clear();
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.deadline <= now) {
            let Some(timer) = timers.pop() else {
                break;
            };
            if timer.handle.is_cancelled() {
                continue;
            }
            let target = target.read().clone();
            match target {
                Some(target) => target(timer.peer, timer.handle),
                None => debug!("No target for timer of {}", timer.peer),
            }
        }
    }
    trace!("Timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flight::Flight;
    use crate::timer::ExponentialBackoff;
    use std::sync::mpsc;

    fn flight(id: u64) -> Flight {
        Flight::new(
            id,
            "127.0.0.1:1".parse().unwrap(),
            vec![],
            true,
            ExponentialBackoff::new(Duration::from_secs(1), 1),
        )
    }

    #[test]
    fn fires_in_deadline_order() {
        let scheduler = RetransmitScheduler::new("test");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        scheduler.set_target(move |_, handle| {
            tx.lock().send(handle.id()).unwrap();
        });

        let late = flight(1);
        let early = flight(2);
        let peer = late.peer();
        scheduler.schedule(peer, late.handle(), Duration::from_millis(60));
        scheduler.schedule(peer, early.handle(), Duration::from_millis(10));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn cancelled_flights_do_not_fire() {
        let scheduler = RetransmitScheduler::new("test");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        scheduler.set_target(move |_, handle| {
            tx.lock().send(handle.id()).unwrap();
        });

        let mut cancelled = flight(1);
        let kept = flight(2);
        scheduler.schedule(kept.peer(), cancelled.handle(), Duration::from_millis(10));
        scheduler.schedule(kept.peer(), kept.handle(), Duration::from_millis(30));
        cancelled.acknowledge();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn cancel_all_drops_pending_timers() {
        let scheduler = RetransmitScheduler::new("test");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        scheduler.set_target(move |_, handle| {
            tx.lock().send(handle.id()).unwrap();
        });

        let f = flight(1);
        scheduler.schedule(f.peer(), f.handle(), Duration::from_millis(30));
        scheduler.cancel_all();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
