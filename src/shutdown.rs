use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

/// One-way shutdown signal shared by the sampler, writer and power
/// controller. Once requested it is never cleared.
pub struct ShutdownCoordinator {
    requested: watch::Sender<bool>,
    writer_closed: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        let (writer_closed, _) = watch::channel(false);
        Self {
            requested,
            writer_closed,
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.requested.subscribe(),
        }
    }

    pub fn request(&self) {
        self.requested.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Called by the writer once its file is closed and storage unmounted.
    pub fn mark_writer_closed(&self) {
        self.writer_closed.send_replace(true);
    }

    pub fn is_writer_closed(&self) -> bool {
        *self.writer_closed.borrow()
    }

    /// Wait up to `limit` for the writer to finish closing.
    pub async fn wait_writer_closed(&self, limit: Duration) -> bool {
        let mut rx = self.writer_closed.subscribe();
        let closed = matches!(timeout(limit, rx.wait_for(|closed| *closed)).await, Ok(Ok(_)));
        closed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side handed to each pipeline task.
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Also resolves if the
    /// coordinator is gone, since nothing could ever request it then.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_request_wakes_listeners() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.listener();
        assert!(!listener.is_requested());

        let waiter = tokio::spawn(async move {
            listener.requested().await;
            listener.is_requested()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.request();

        assert!(waiter.await.unwrap());
        assert!(coordinator.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_created_after_request_sees_it() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request();
        let mut late = coordinator.listener();
        late.requested().await;
        assert!(late.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_writer_closed_is_bounded() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.wait_writer_closed(Duration::from_millis(100)).await);

        coordinator.mark_writer_closed();
        assert!(coordinator.is_writer_closed());
        assert!(coordinator.wait_writer_closed(Duration::from_millis(100)).await);
    }
}
