//! Data-change notification seam.
//!
//! The write path notifies registered listeners after a mutating statement
//! executes. The guarantee is "never misses a true positive, may produce
//! false positives": listeners can be told data changed when the statement
//! touched nothing, but a real change is always reported.

/// Implemented by parties interested in cache invalidation.
pub trait DataChangedListener: Send + Sync {
    /// Called after a mutating statement executed on the write path.
    fn notify_data_changed(&self);
}

impl<F> DataChangedListener for F
where
    F: Fn() + Send + Sync,
{
    fn notify_data_changed(&self) {
        self();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closure_listener() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let listener: Arc<dyn DataChangedListener> = Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        listener.notify_data_changed();
        listener.notify_data_changed();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
