use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Commands serialised through the owner task.
enum Command {
    Query(oneshot::Sender<bool>),
    Set(bool, oneshot::Sender<bool>),
    Toggle {
        reactivation_delay: u64,
        reply: oneshot::Sender<bool>,
    },
    ToggleOff {
        timeout: u64,
        reply: oneshot::Sender<bool>,
    },
    Quit,
}

/// Handle to the blocking-activation state machine. One task owns the bit
/// and the reactivation timer; every query thread reads the atomic mirror
/// without crossing the channel.
#[derive(Clone)]
pub struct ActivationHandle {
    mirror: Arc<AtomicBool>,
    tx: mpsc::Sender<Command>,
}

impl ActivationHandle {
    /// Spawn the owner task with blocking initially enabled.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(8);
        let mirror = Arc::new(AtomicBool::new(true));
        tokio::spawn(run(rx, mirror.clone()));
        Self { mirror, tx }
    }

    /// Lock-free read used on every query.
    pub fn is_active(&self) -> bool {
        self.mirror.load(Ordering::Relaxed)
    }

    /// Serialised read through the owner task.
    pub async fn query(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Query(reply)).await.is_err() {
            return self.is_active();
        }
        rx.await.unwrap_or_else(|_| self.is_active())
    }

    pub async fn set(&self, value: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Set(value, reply)).await.is_err() {
            return self.is_active();
        }
        rx.await.unwrap_or_else(|_| self.is_active())
    }

    /// Flip the bit. When the flip lands on `false` and the delay is
    /// positive, a timer re-activates blocking after `reactivation_delay`
    /// seconds.
    pub async fn toggle(&self, reactivation_delay: u64) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Toggle {
            reactivation_delay,
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return self.is_active();
        }
        rx.await.unwrap_or_else(|_| self.is_active())
    }

    /// Like `toggle`, but only towards off. Calling it while already off
    /// restarts the reactivation timer.
    pub async fn toggle_off(&self, timeout: u64) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::ToggleOff { timeout, reply };
        if self.tx.send(cmd).await.is_err() {
            return self.is_active();
        }
        rx.await.unwrap_or_else(|_| self.is_active())
    }

    /// Shut the owner task down cleanly.
    pub async fn quit(&self) {
        let _ = self.tx.send(Command::Quit).await;
    }
}

async fn run(mut rx: mpsc::Receiver<Command>, mirror: Arc<AtomicBool>) {
    let mut active = true;
    let mut reactivate_at: Option<Instant> = None;

    loop {
        let deadline = reactivate_at.unwrap_or_else(Instant::now);

        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Query(reply) => {
                        let _ = reply.send(active);
                    }
                    Command::Set(value, reply) => {
                        active = value;
                        if active {
                            reactivate_at = None;
                        }
                        mirror.store(active, Ordering::Relaxed);
                        let _ = reply.send(active);
                    }
                    Command::Toggle { reactivation_delay, reply } => {
                        active = !active;
                        mirror.store(active, Ordering::Relaxed);
                        if !active && reactivation_delay > 0 {
                            reactivate_at = Some(
                                Instant::now() + Duration::from_secs(reactivation_delay),
                            );
                        } else {
                            reactivate_at = None;
                        }
                        let _ = reply.send(active);
                    }
                    Command::ToggleOff { timeout, reply } => {
                        active = false;
                        mirror.store(false, Ordering::Relaxed);
                        if timeout > 0 {
                            reactivate_at = Some(Instant::now() + Duration::from_secs(timeout));
                        }
                        let _ = reply.send(active);
                    }
                    Command::Quit => break,
                }
            }
            _ = sleep_until(deadline), if reactivate_at.is_some() => {
                debug!("reactivation timer fired, blocking re-enabled");
                active = true;
                reactivate_at = None;
                mirror.store(true, Ordering::Relaxed);
            }
        }
    }

    debug!("activation task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test]
    async fn starts_active() {
        let handle = ActivationHandle::spawn();
        assert!(handle.query().await);
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn set_and_toggle() {
        let handle = ActivationHandle::spawn();

        assert!(!handle.set(false).await);
        assert!(!handle.is_active());

        assert!(handle.toggle(0).await);
        assert!(!handle.toggle(0).await);
        assert!(!handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_arms_reactivation_timer() {
        let handle = ActivationHandle::spawn();

        assert!(!handle.toggle(30).await);
        assert!(!handle.is_active());

        advance(Duration::from_secs(29)).await;
        assert!(!handle.query().await);

        advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(handle.query().await);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_off_restarts_timer() {
        let handle = ActivationHandle::spawn();

        assert!(!handle.toggle_off(30).await);
        advance(Duration::from_secs(20)).await;
        assert!(!handle.query().await);

        // Second toggle_off restarts the countdown from now.
        assert!(!handle.toggle_off(30).await);
        advance(Duration::from_secs(20)).await;
        assert!(!handle.query().await);

        advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(handle.query().await);
    }

    #[tokio::test(start_paused = true)]
    async fn set_true_cancels_timer() {
        let handle = ActivationHandle::spawn();

        assert!(!handle.toggle_off(30).await);
        assert!(handle.set(true).await);

        advance(Duration::from_secs(60)).await;
        assert!(handle.query().await);
    }

    #[tokio::test]
    async fn quit_is_clean() {
        let handle = ActivationHandle::spawn();
        handle.quit().await;
        // The fast path keeps serving the last known state.
        assert!(handle.is_active());
    }
}
