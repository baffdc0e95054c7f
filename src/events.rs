use tokio::sync::broadcast;

/// Per-entity observer registry.
///
/// Every handle owns one; observers call `subscribe()` and receive every event
/// emitted afterwards, in emission order.
#[derive(Clone)]
pub struct Emitter<E: Clone> {
    tx: broadcast::Sender<E>,
    capacity: usize,
}

impl<E: Clone> Emitter<E> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Emit to current observers. No observers is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
