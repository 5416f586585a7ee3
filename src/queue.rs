use std::time::Duration;
use tokio::sync::mpsc;

/// Unbounded FIFO handing inbound network messages to a worker loop.
///
/// Single consumer (the engine task); producers are transport callbacks
/// holding a cloned [`MessageQueueSender`]. A timed `get` returning `None`
/// is the worker's idle signal; `wake_up` forces that early so the worker
/// can observe shutdown.
pub struct MessageQueue<T> {
    rx: mpsc::UnboundedReceiver<T>,
    wake_rx: mpsc::UnboundedReceiver<()>,
}

pub struct MessageQueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
    wake_tx: mpsc::UnboundedSender<()>,
}

impl<T> Clone for MessageQueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wake_tx: self.wake_tx.clone(),
        }
    }
}

impl<T> MessageQueueSender<T> {
    pub fn put(&self, msg: T) {
        let _ = self.tx.send(msg);
    }

    /// Unblock a waiter inside `get_with_timeout` without delivering
    /// anything.
    pub fn wake_up(&self) {
        let _ = self.wake_tx.send(());
    }
}

impl<T> MessageQueue<T> {
    pub fn channel() -> (MessageQueueSender<T>, MessageQueue<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        (MessageQueueSender { tx, wake_tx }, MessageQueue { rx, wake_rx })
    }

    /// Wait for the next message, at most `timeout`. `None` on timeout,
    /// wake-up, or when every sender is gone.
    pub async fn get_with_timeout(&mut self, timeout: Duration) -> Option<T> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            _ = self.wake_rx.recv() => None,
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    /// Drain without blocking.
    pub fn try_get(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (tx, mut q) = MessageQueue::channel();
        tx.put(1u32);
        tx.put(2);
        assert_eq!(q.get_with_timeout(Duration::from_secs(1)).await, Some(1));
        assert_eq!(q.try_get(), Some(2));
        assert_eq!(q.try_get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn get_times_out_when_empty() {
        let (_tx, mut q) = MessageQueue::<u32>::channel();
        assert_eq!(q.get_with_timeout(Duration::from_secs(15)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_up_unblocks_waiter() {
        let (tx, mut q) = MessageQueue::<u32>::channel();
        let waiter = tokio::spawn(async move {
            q.get_with_timeout(Duration::from_secs(3600)).await
        });
        tokio::task::yield_now().await;
        tx.wake_up();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
