use std::{
    future::{pending, poll_fn},
    sync::Arc,
    time::Instant,
};

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::{runtime::Runtime, ConnectionHandle, EngineConnection};

/// A connection's single armed timer
///
/// Arming a new timer retires the previous one by moving to a new epoch. An expiry only counts if
/// it carries the epoch that is armed at the time it is processed.
///
/// The first arming starts a task that sleeps on behalf of the connection; later armings reset
/// that task's timer in place. Dropping the state stops the task.
#[derive(Debug, Default)]
pub struct TimerState {
    armed: Option<(u64, Instant)>,
    next_epoch: u64,
    wakeup: Option<watch::Sender<Option<(u64, Instant)>>>,
}

impl TimerState {
    /// Whether a timer is armed
    pub fn is_active(&self) -> bool {
        self.armed.is_some()
    }

    /// Deadline of the armed timer
    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(_, deadline)| deadline)
    }

    /// Consume an expiry, returning whether it belongs to the armed timer
    ///
    /// A matching expiry disarms the timer.
    pub fn fire(&mut self, epoch: u64) -> bool {
        match self.armed {
            Some((armed, _)) if armed == epoch => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    fn arm(&mut self, deadline: Instant) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.armed = Some((epoch, deadline));
        epoch
    }
}

/// Notification that a connection's timer ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    /// The connection the timer was armed for
    pub handle: ConnectionHandle,
    /// The arming it belongs to
    pub epoch: u64,
}

/// Schedules wakeups at the deadlines engines report
///
/// Expiries are delivered through [`TimeoutDriver::expired`] to the task that owns the
/// connections, so handling one never races with datagram processing.
#[derive(Debug)]
pub struct TimeoutDriver {
    runtime: Arc<dyn Runtime>,
    tx: mpsc::UnboundedSender<TimerExpired>,
    rx: mpsc::UnboundedReceiver<TimerExpired>,
}

impl TimeoutDriver {
    /// Create a driver scheduling on `runtime`
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { runtime, tx, rx }
    }

    /// Arm `timer` from the connection's next timeout
    ///
    /// Nothing happens if the engine reports no timeout, or if the armed deadline is already no
    /// later than the new one. Returns the deadline armed by this call.
    pub fn arm<C: EngineConnection>(
        &self,
        handle: ConnectionHandle,
        timer: &mut TimerState,
        conn: &C,
    ) -> Option<Instant> {
        let timeout = conn.next_timeout()?;
        self.arm_at(handle, timer, self.runtime.now() + timeout)
    }

    /// Arm `timer` to expire at `deadline`, unless it is armed to expire no later already
    pub fn arm_at(
        &self,
        handle: ConnectionHandle,
        timer: &mut TimerState,
        deadline: Instant,
    ) -> Option<Instant> {
        if matches!(timer.deadline(), Some(armed) if armed <= deadline) {
            return None;
        }
        let epoch = timer.arm(deadline);
        trace!(cid = %handle.cid(), epoch, "arming timer");
        match &timer.wakeup {
            Some(wakeup) => {
                wakeup.send_replace(Some((epoch, deadline)));
            }
            None => {
                let (wakeup, armed) = watch::channel(Some((epoch, deadline)));
                self.runtime.spawn(Box::pin(drive_timer(
                    self.runtime.clone(),
                    handle,
                    armed,
                    self.tx.clone(),
                )));
                timer.wakeup = Some(wakeup);
            }
        }
        Some(deadline)
    }

    /// Wait for the next expiry
    pub async fn expired(&mut self) -> TimerExpired {
        match self.rx.recv().await {
            Some(expired) => expired,
            // `self.tx` keeps the channel open
            None => pending().await,
        }
    }
}

/// Sleep until the connection's armed deadline, report it, and wait to be armed again
///
/// Exits once the connection's [`TimerState`] is dropped.
async fn drive_timer(
    runtime: Arc<dyn Runtime>,
    handle: ConnectionHandle,
    mut armed: watch::Receiver<Option<(u64, Instant)>>,
    expired: mpsc::UnboundedSender<TimerExpired>,
) {
    let mut timer = runtime.new_timer(runtime.now());
    loop {
        let current = *armed.borrow_and_update();
        let Some((epoch, deadline)) = current else {
            if armed.changed().await.is_err() {
                return;
            }
            continue;
        };
        timer.as_mut().reset(deadline);
        tokio::select! {
            () = poll_fn(|cx| timer.as_mut().poll(cx)) => {
                // The receiver lives as long as the owning endpoint
                let _ = expired.send(TimerExpired { handle, epoch });
                if armed.changed().await.is_err() {
                    return;
                }
            }
            changed = armed.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
