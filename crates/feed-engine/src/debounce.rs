use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trailing-edge debounce that delivers a message on a channel.
///
/// Each `schedule` restarts the timer, so a burst of triggers yields one
/// delivery `delay` after the last of them. Dropping the debouncer cancels
/// any pending delivery.
///
/// Every timer gets a generation number that is baked into its message.
/// A message can still be in the channel after a newer timer was started,
/// so [`Debouncer::fired`] only forgets the timer the message came from.
pub struct Debouncer<T> {
    delay: Duration,
    tx: mpsc::UnboundedSender<T>,
    pending: Option<CancellationToken>,
    generation: u64,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(delay: Duration, tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            delay,
            tx,
            pending: None,
            generation: 0,
        }
    }

    /// Restart the timer. `message` builds the payload from the timer's generation.
    pub fn schedule(&mut self, message: impl FnOnce(u64) -> T) {
        self.cancel();
        self.generation += 1;
        let message = message(self.generation);
        let token = CancellationToken::new();
        let child = token.clone();
        let tx = self.tx.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(message);
                }
            }
        });
        self.pending = Some(token);
    }

    /// Drop a pending delivery, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    /// Forget the timer after its message was received. Returns `false` for
    /// a message from a timer that has since been replaced or cancelled.
    pub fn fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}
