//! # Events specification.
//!
//! The sync core never writes to stdout or a log file itself. Everything of
//! interest is emitted as an [`Event`] on a bounded in-memory channel and
//! consumed by whoever embeds the engine.

use async_channel::{self as channel, Receiver, Sender, TrySendError};

/// Event channel.
#[derive(Debug, Clone)]
pub struct Events {
    receiver: Receiver<Event>,
    sender: Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// Creates a new event channel.
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(1_000);
        Self { receiver, sender }
    }

    /// Emits an event into the channel.
    ///
    /// If the channel is full, the oldest event is dropped to make room.
    pub fn emit(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                // When the queue is full, drop the oldest event.
                let _ = self.receiver.try_recv();
                self.emit(event);
            }
            Err(TrySendError::Closed(_)) => {
                unreachable!("unable to emit event, channel disconnected");
            }
        }
    }

    /// Retrieves the event emitter.
    pub fn get_emitter(&self) -> EventEmitter {
        EventEmitter(self.receiver.clone())
    }
}

/// A receiver of events from a [`crate::context::Context`].
#[derive(Debug, Clone)]
pub struct EventEmitter(Receiver<Event>);

impl EventEmitter {
    /// Async recv of an event. Return `None` if all `Sender`s have been dropped.
    pub async fn recv(&self) -> Option<Event> {
        self.0.recv().await.ok()
    }

    /// Tries to receive an event without blocking.
    pub fn try_recv(&self) -> Option<Event> {
        self.0.try_recv().ok()
    }
}

/// The event emitted by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An informational string, intended for the log.
    Info(String),

    /// A warning string, intended for the log.
    Warning(String),

    /// An error string. Persistent errors also surface through
    /// [`Event::FolderSyncErrored`].
    Error(String),

    /// A folder sync task entered a new state or made download progress.
    SyncProgress {
        /// Database id of the account being synced.
        account_id: i64,
        /// Folder this update is about.
        folder: String,
        /// Current sync state, e.g. "initial" or "poll".
        state: String,
        /// Download progress in percent, if the state downloads messages.
        progress: Option<f64>,
    },

    /// A folder sync task gave up after exhausting its retries.
    FolderSyncErrored {
        /// Database id of the account being synced.
        account_id: i64,
        /// Folder that failed to sync.
        folder: String,
        /// Human readable failure description.
        message: String,
    },

    /// New or changed messages were committed and downstream consumers
    /// (e.g. a search indexer) should pick them up.
    IndexUpdateRequested {
        /// Database id of the account with new data.
        account_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_receives_events() {
        let events = Events::new();
        let emitter = events.get_emitter();
        events.emit(Event::Info("hello".to_string()));
        assert_eq!(emitter.recv().await, Some(Event::Info("hello".to_string())));
        assert_eq!(emitter.try_recv(), None);
    }

    #[tokio::test]
    async fn test_full_channel_drops_oldest() {
        let events = Events::new();
        let emitter = events.get_emitter();
        for i in 0..1_005 {
            events.emit(Event::Info(format!("msg {i}")));
        }
        // The first five got dropped.
        assert_eq!(emitter.recv().await, Some(Event::Info("msg 5".to_string())));
    }
}
