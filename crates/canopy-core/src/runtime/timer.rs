//! Timers backing `Delay` bookmarks.
//!
//! Each armed timer is a tokio task that sleeps and then sends
//! `Command::TimerFired` to the instance. The registry only keeps a weak
//! sender so an instance whose handles are all gone can still shut down.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bookmark::BookmarkKey;
use super::command::Command;

pub(crate) struct TimerRegistry {
    commands: mpsc::WeakSender<Command>,
    active: HashMap<BookmarkKey, CancellationToken>,
}

impl TimerRegistry {
    pub fn new(commands: mpsc::WeakSender<Command>) -> Self {
        Self {
            commands,
            active: HashMap::new(),
        }
    }

    pub fn arm(&mut self, key: BookmarkKey, after: Duration) {
        let token = CancellationToken::new();
        match self.commands.upgrade() {
            Some(sender) => {
                let cancelled = token.clone();
                let fired = key.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancelled.cancelled() => {}
                        _ = tokio::time::sleep(after) => {
                            let _ = sender.send(Command::TimerFired { key: fired }).await;
                        }
                    }
                });
            }
            None => {
                tracing::warn!(bookmark = %key, "command channel closed, timer will never fire");
            }
        }
        self.active.insert(key, token);
    }

    /// Stop a pending timer, e.g. because its owner was canceled.
    pub fn cancel(&mut self, key: &BookmarkKey) {
        if let Some(token) = self.active.remove(key) {
            token.cancel();
        }
    }

    /// Drop bookkeeping for a timer that has already fired.
    pub fn forget(&mut self, key: &BookmarkKey) {
        self.active.remove(key);
    }

    pub fn cancel_all(&mut self) {
        for (_, token) in self.active.drain() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn armed_timer_sends_fired_command() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerRegistry::new(tx.downgrade());
        let key = BookmarkKey::new("timer:1", None);

        timers.arm(key.clone(), Duration::from_millis(50));
        let start = tokio::time::Instant::now();

        match rx.recv().await {
            Some(Command::TimerFired { key: fired }) => assert_eq!(fired, key),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(timers.len(), 1);
        timers.forget(&key);
        assert_eq!(timers.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerRegistry::new(tx.downgrade());
        let key = BookmarkKey::new("timer:2", None);

        timers.arm(key.clone(), Duration::from_millis(50));
        timers.cancel(&key);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(rx.try_recv().is_err());
    }
}
