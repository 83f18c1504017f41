use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, trace};

use crate::bound_transport::BoundTransport;
use crate::command::Frame;
use crate::connection_record::{ConnectionRecord, ConnectionState};

/// A control command that is re-sent periodically until the connection leaves the state that
///  made it necessary
pub(crate) struct RetryEntry {
    pub record: Arc<ConnectionRecord>,
    pub frame: Frame,
    pub exit_state: ConnectionState,
    pub transport: Arc<BoundTransport>,
}

impl RetryEntry {
    fn is_done(&self) -> bool {
        if self.transport.is_closed() {
            return true;
        }
        let state = self.record.state();
        state == self.exit_state || matches!(state, ConnectionState::Dead | ConnectionState::Closed | ConnectionState::Established)
    }
}

/// At-least-once delivery for handshake commands: one loop per supervisor re-sends all entries
///  at a fixed interval
#[derive(Default)]
pub(crate) struct RetrySender {
    entries: Mutex<Vec<RetryEntry>>,
}

impl RetrySender {
    fn entries(&self) -> MutexGuard<'_, Vec<RetryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, entry: RetryEntry) {
        trace!("registering {:?} for {:?} for retry", entry.frame.command.kind(), entry.record.id());
        self.entries().push(entry);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Drops entries that are done and re-sends the others
    pub fn tick(&self) {
        self.entries().retain(|entry| {
            if entry.is_done() {
                trace!("retry of {:?} for {:?} is done", entry.frame.command.kind(), entry.record.id());
                return false;
            }
            debug!("re-sending {:?} for {:?}", entry.frame.command.kind(), entry.record.id());
            entry.transport.send(&entry.frame)
        });
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately, and a command was just sent when it is registered
        ticks.tick().await;

        loop {
            select! {
                _ = ticks.tick() => self.tick(),
                _ = shutdown.wait_for(|s| *s) => break,
            }
        }
        self.entries().clear();
        debug!("retry sender terminated");
    }
}
