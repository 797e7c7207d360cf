//! Small shared plumbing.

use tokio::sync::mpsc;

/// An mpsc receiver with one slot of lookahead, so a consumer can inspect a
/// value — say, to wait on a rate budget sized to it — before committing to
/// dequeue it.
#[derive(Debug)]
pub(crate) struct PeekableReceiver<T> {
    inner: mpsc::Receiver<T>,
    slot: Option<T>,
}

impl<T> PeekableReceiver<T> {
    pub(crate) fn new(inner: mpsc::Receiver<T>) -> Self {
        Self { inner, slot: None }
    }

    /// Borrow the next value without consuming it. `None` once the channel
    /// is closed and drained.
    pub(crate) async fn peek(&mut self) -> Option<&T> {
        if self.slot.is_none() {
            self.slot = self.inner.recv().await;
        }
        self.slot.as_ref()
    }

    /// Consume the next value.
    pub(crate) async fn next(&mut self) -> Option<T> {
        match self.slot.take() {
            Some(value) => Some(value),
            None => self.inner.recv().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (sender, receiver) = mpsc::channel(4);
        let mut receiver = PeekableReceiver::new(receiver);
        sender.send(7u32).await.unwrap();
        sender.send(8u32).await.unwrap();
        drop(sender);

        assert_eq!(receiver.peek().await, Some(&7));
        assert_eq!(receiver.peek().await, Some(&7));
        assert_eq!(receiver.next().await, Some(7));
        assert_eq!(receiver.next().await, Some(8));
        assert_eq!(receiver.next().await, None);
        assert_eq!(receiver.peek().await, None);
    }
}
