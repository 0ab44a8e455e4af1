use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};

use crate::control::domain::command::Command;
use crate::control::domain::command_channel::CommandChannel;

#[derive(Default)]
struct DispatchCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Totals reported when the dispatcher shuts down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub queued: u64,
    /// Commands discarded because the dispatch queue was full.
    pub dropped: u64,
    pub sent: u64,
    /// Commands lost after the retry also failed.
    pub failed: u64,
}

/// Non-blocking handle for enqueuing commands.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    counters: Arc<DispatchCounters>,
}

impl CommandSender {
    /// Queues `command` without waiting. Returns `false` if it was dropped.
    pub fn try_send(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dispatch queue unavailable; dropped {command}");
                false
            }
        }
    }
}

/// Owns the vehicle link on a dedicated thread.
///
/// Commands arrive through a bounded queue. A failed send is retried once
/// on a fresh connection after `retry_delay`; if that also fails the command
/// is counted as lost. When the last sender is gone the thread sends a
/// final Stop and exits.
pub struct CommandDispatcher {
    sender: CommandSender,
    handle: JoinHandle<()>,
}

impl CommandDispatcher {
    pub fn spawn(channel: Box<dyn CommandChannel>, capacity: usize, retry_delay: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Command>(capacity.max(1));
        let counters = Arc::new(DispatchCounters::default());

        let thread_counters = Arc::clone(&counters);
        let handle = std::thread::spawn(move || {
            let mut channel = channel;
            for command in rx {
                deliver(channel.as_mut(), command, retry_delay, &thread_counters);
            }
            log::info!("Dispatcher stopping; sending final stop");
            deliver(channel.as_mut(), Command::Stop, retry_delay, &thread_counters);
        });

        Self {
            sender: CommandSender { tx, counters },
            handle,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Waits for queued commands and the final Stop to go out.
    ///
    /// Every [`CommandSender`] clone must be dropped first, or this blocks.
    pub fn shutdown(self) -> DispatchReport {
        let counters = Arc::clone(&self.sender.counters);
        drop(self.sender);
        if self.handle.join().is_err() {
            log::error!("Dispatcher thread panicked");
        }
        DispatchReport {
            queued: counters.queued.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            sent: counters.sent.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

fn deliver(
    channel: &mut dyn CommandChannel,
    command: Command,
    retry_delay: Duration,
    counters: &DispatchCounters,
) {
    let first = match channel.send(command) {
        Ok(()) => {
            counters.sent.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(e) => e,
    };
    log::debug!("Send failed ({first}); retrying in {retry_delay:?}");
    std::thread::sleep(retry_delay);

    let retried = channel.reconnect().and_then(|_| channel.send(command));
    match retried {
        Ok(()) => {
            counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("Vehicle unreachable, {command} lost: {e}");
        }
    }
}
