use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::domain::{DownloadError, ResourceKey};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(f32),
    Completed(PathBuf),
    Failed(DownloadError),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

pub type ProgressListener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct Channel {
    /// Set while a transfer attempt owns this key.
    open: bool,
    last: f32,
    listeners: Vec<(u64, ProgressListener)>,
}

#[derive(Default)]
struct Channels {
    next_id: u64,
    keys: HashMap<ResourceKey, Channel>,
}

/// In-process fan-out of per-key progress.
///
/// Fractions delivered for a key are non-decreasing within one attempt, and
/// nothing is delivered after the attempt's terminal event.
#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    channels: Arc<Mutex<Channels>>,
}

/// Handle returned by [`ProgressBroadcaster::subscribe`].
pub struct Subscription {
    key: ResourceKey,
    id: u64,
    channels: Weak<Mutex<Channels>>,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn unsubscribe(self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.keys.get_mut(&self.key) else {
            return;
        };
        channel.listeners.retain(|(id, _)| *id != self.id);
        if !channel.open && channel.listeners.is_empty() {
            channels.keys.remove(&self.key);
        }
    }
}

/// Subscribers of a closed key still owed its terminal event.
#[must_use]
pub(crate) struct Detached {
    listeners: Vec<(u64, ProgressListener)>,
}

impl Detached {
    pub(crate) fn deliver(self, event: &ProgressEvent) {
        for (_, listener) in self.listeners {
            listener(event);
        }
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &ResourceKey, listener: ProgressListener) -> Subscription {
        let mut channels = self.lock();
        let id = channels.next_id;
        channels.next_id += 1;
        channels
            .keys
            .entry(key.clone())
            .or_default()
            .listeners
            .push((id, listener));

        Subscription {
            key: key.clone(),
            id,
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Subscribes with an unbounded channel instead of a callback.
    pub fn subscribe_channel(
        &self,
        key: &ResourceKey,
    ) -> (Subscription, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(
            key,
            Arc::new(move |event: &ProgressEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        (subscription, rx)
    }

    /// Starts a new attempt for `key`, resetting its progress floor.
    pub fn open(&self, key: &ResourceKey) {
        let mut channels = self.lock();
        let channel = channels.keys.entry(key.clone()).or_default();
        channel.open = true;
        channel.last = 0.0;
    }

    /// Delivers `fraction` to every subscriber of `key`.
    ///
    /// Values below the last delivered fraction are dropped; keys without an
    /// open attempt are ignored.
    pub fn emit(&self, key: &ResourceKey, fraction: f32) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);

        let listeners = {
            let mut channels = self.lock();
            let Some(channel) = channels.keys.get_mut(key) else {
                return;
            };
            if !channel.open || fraction < channel.last {
                return;
            }
            channel.last = fraction;
            channel.listeners.clone()
        };

        let event = ProgressEvent::Progress(fraction);
        for (_, listener) in listeners {
            listener(&event);
        }
    }

    /// Delivers the terminal event for the current attempt and drops every
    /// subscriber of `key`.
    pub fn finish(&self, key: &ResourceKey, event: ProgressEvent) {
        self.detach(key).deliver(&event);
    }

    /// Closes `key` without delivering anything yet, so the owner can publish
    /// the terminal event after releasing its own locks.
    pub(crate) fn detach(&self, key: &ResourceKey) -> Detached {
        let listeners = self
            .lock()
            .keys
            .remove(key)
            .map(|channel| channel.listeners)
            .unwrap_or_default();
        Detached { listeners }
    }

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.lock()
            .keys
            .get(key)
            .map_or(0, |channel| channel.listeners.len())
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressListener, Arc<Mutex<Vec<ProgressEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ProgressListener = Arc::new(move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (listener, seen)
    }

    #[test]
    fn test_all_subscribers_see_same_order() {
        let broadcaster = ProgressBroadcaster::new();
        let key = ResourceKey::from_resource_id("song-1");
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        broadcaster.subscribe(&key, a);
        broadcaster.subscribe(&key, b);
        broadcaster.open(&key);

        broadcaster.emit(&key, 0.25);
        broadcaster.emit(&key, 0.5);
        broadcaster.finish(&key, ProgressEvent::Completed(PathBuf::from("x.mp3")));

        let expected = vec![
            ProgressEvent::Progress(0.25),
            ProgressEvent::Progress(0.5),
            ProgressEvent::Completed(PathBuf::from("x.mp3")),
        ];
        assert_eq!(*seen_a.lock().unwrap(), expected);
        assert_eq!(*seen_b.lock().unwrap(), expected);
    }

    #[test]
    fn test_regressing_fraction_is_dropped() {
        let broadcaster = ProgressBroadcaster::new();
        let key = ResourceKey::from_resource_id("song-1");
        let (listener, seen) = recorder();
        broadcaster.subscribe(&key, listener);
        broadcaster.open(&key);

        broadcaster.emit(&key, 0.5);
        broadcaster.emit(&key, 0.4);
        broadcaster.emit(&key, 0.5);
        broadcaster.emit(&key, 7.0);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ProgressEvent::Progress(0.5),
                ProgressEvent::Progress(0.5),
                ProgressEvent::Progress(1.0),
            ]
        );
    }

    #[test]
    fn test_nothing_after_finish() {
        let broadcaster = ProgressBroadcaster::new();
        let key = ResourceKey::from_resource_id("song-1");
        let (listener, seen) = recorder();
        broadcaster.subscribe(&key, listener);
        broadcaster.open(&key);

        broadcaster.finish(&key, ProgressEvent::Failed(DownloadError::Timeout));
        broadcaster.emit(&key, 0.9);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProgressEvent::Failed(DownloadError::Timeout)]
        );
        assert_eq!(broadcaster.subscriber_count(&key), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broadcaster = ProgressBroadcaster::new();
        let key = ResourceKey::from_resource_id("song-1");
        let (listener, seen) = recorder();
        let subscription = broadcaster.subscribe(&key, listener);
        broadcaster.open(&key);

        broadcaster.emit(&key, 0.1);
        subscription.unsubscribe();
        broadcaster.emit(&key, 0.2);

        assert_eq!(*seen.lock().unwrap(), vec![ProgressEvent::Progress(0.1)]);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let broadcaster = ProgressBroadcaster::new();
        let key = ResourceKey::from_resource_id("song-1");
        let (_subscription, mut rx) = broadcaster.subscribe_channel(&key);
        broadcaster.open(&key);

        broadcaster.emit(&key, 1.0);
        broadcaster.finish(&key, ProgressEvent::Completed(PathBuf::from("a")));

        assert_eq!(rx.recv().await, Some(ProgressEvent::Progress(1.0)));
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Completed(PathBuf::from("a")))
        );
        // Sender was dropped with the channel.
        assert_eq!(rx.recv().await, None);
    }
}
