use tokio::task::JoinHandle;

// Task handle that aborts its task when dropped, so an owner going away
// reclaims everything it spawned.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
