use flume::{Receiver, Sender};

/// Broadcast channel: every subscriber receives every event.
#[derive(Debug)]
pub struct EventChannel<T: Clone> {
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventChannel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Registers a new listener. Events emitted before this call are not replayed.
    pub fn subscribe(&mut self) -> Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: T) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_prune() {
        let mut channel = EventChannel::new();
        let a = channel.subscribe();
        let b = channel.subscribe();

        channel.emit(7_u32);
        assert_eq!(a.try_recv().ok(), Some(7));
        assert_eq!(b.try_recv().ok(), Some(7));

        drop(b);
        channel.emit(8);
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![8]);
    }
}
