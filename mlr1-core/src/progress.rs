//! Progress reporting for long decodes.
//!
//! Decoders report consumed bytes to an optional [`ProgressSink`] handed over
//! at construction. The sink is closed exactly once: on the first `is_done()`
//! call that observes the end of the stream, or when the decoder is dropped.

/// Receiver of decoding progress.
pub trait ProgressSink {
    /// Advances the progress by `n` bytes.
    fn update(&mut self, n: u64);

    /// Releases the sink. Called exactly once.
    fn close(&mut self);
}

/// Holder of an optional sink that guarantees the single `close` call.
#[derive(Default)]
pub(crate) struct ProgressSlot {
    sink: Option<Box<dyn ProgressSink>>,
}

impl ProgressSlot {
    pub(crate) fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self { sink: Some(sink) }
    }

    #[inline]
    pub(crate) fn update(&mut self, n: u64) {
        if let Some(sink) = self.sink.as_mut() {
            sink.update(n);
        }
    }

    pub(crate) fn release(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for ProgressSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ProgressSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProgressSink;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Shared record of what a sink received.
    #[derive(Debug, Default)]
    pub struct Record {
        pub bytes: u64,
        pub closed: usize,
    }

    /// Sink writing into a shared [`Record`].
    pub struct RecordingSink(pub Rc<RefCell<Record>>);

    impl ProgressSink for RecordingSink {
        fn update(&mut self, n: u64) {
            self.0.borrow_mut().bytes += n;
        }

        fn close(&mut self) {
            self.0.borrow_mut().closed += 1;
        }
    }

    pub fn recording() -> (Box<dyn ProgressSink>, Rc<RefCell<Record>>) {
        let record = Rc::new(RefCell::new(Record::default()));
        (Box::new(RecordingSink(record.clone())), record)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::recording;
    use super::*;

    #[test]
    fn test_release_closes_once() {
        let (sink, record) = recording();
        let mut slot = ProgressSlot::new(sink);
        slot.update(10);
        slot.release();
        slot.release();
        slot.update(5);
        drop(slot);

        let record = record.borrow();
        assert_eq!(record.bytes, 10);
        assert_eq!(record.closed, 1);
    }

    #[test]
    fn test_drop_closes() {
        let (sink, record) = recording();
        drop(ProgressSlot::new(sink));
        assert_eq!(record.borrow().closed, 1);
    }
}
