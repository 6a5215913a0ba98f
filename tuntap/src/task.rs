//! Task handles which tie the lifetime of a spawned task to an owning value.

/// A handle to a task spawned on an [`EventLoop`](crate::poll::EventLoop). When this handle is
/// dropped, the task is cancelled at its next yield point.
#[derive(Debug)]
pub struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    #[inline]
    fn drop(&mut self) {
        self.0.abort()
    }
}

impl<T> From<tokio::task::JoinHandle<T>> for AbortOnDrop {
    #[inline]
    fn from(value: tokio::task::JoinHandle<T>) -> Self {
        Self(value.abort_handle())
    }
}
