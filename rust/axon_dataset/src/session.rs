//! Single-pass cursor over a scan
//!
//! Batches are produced only when asked for. The batch handed out last stays
//! accounted against the scanner's pool until the next pull or until the
//! session is dropped. A batch whose reservation is refused is kept back and
//! handed out by the next pull that manages to reserve it. Once the scan
//! reports its end the session keeps reporting it without touching the scan
//! again.

use std::sync::Arc;

use arrow_array::RecordBatch;

use crate::error::Result;
use crate::memory::MemoryReservation;
use crate::scanner::{Scanner, TaggedRecordBatchIterator};

pub struct ScanSession {
    scanner: Arc<Scanner>,
    batches: TaggedRecordBatchIterator,
    finished: bool,
    pending: Option<RecordBatch>,
    reservation: Option<MemoryReservation>,
}

impl ScanSession {
    pub fn create(scanner: Arc<Scanner>) -> Result<Self> {
        let batches = scanner.scan_batches()?;
        Ok(Self {
            scanner,
            batches,
            finished: false,
            pending: None,
            reservation: None,
        })
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes currently reserved for the last produced batch
    pub fn reserved_bytes(&self) -> i64 {
        self.reservation.as_ref().map_or(0, MemoryReservation::size)
    }

    /// Pull the next batch; `None` means the scan is over
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }
        self.reservation = None;
        let batch = match self.pending.take() {
            Some(batch) => batch,
            None => match self.batches.next() {
                None => {
                    self.finished = true;
                    log::debug!("scan session reached end of stream");
                    return Ok(None);
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(tagged)) => tagged.record_batch,
            },
        };
        let size = batch.get_array_memory_size() as i64;
        match MemoryReservation::try_new(Arc::clone(self.scanner.pool()), size) {
            Ok(reservation) => {
                self.reservation = Some(reservation);
                Ok(Some(batch))
            }
            Err(err) => {
                log::debug!("holding back batch of {} rows: {}", batch.num_rows(), err);
                self.pending = Some(batch);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::people_batch;
    use crate::dataset::{Dataset, Fragment};
    use crate::error::DatasetError;
    use crate::foreign::{ForeignBatchSource, ForeignFragment};
    use crate::host::mock::MockHost;
    use crate::host::HostBatchIterator;
    use crate::memory::tests::RecordingListener;
    use crate::memory::{
        MemoryPool, ReservationListenableMemoryPool, ReservationListener, SystemMemoryPool,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn foreign_dataset(host: &Arc<MockHost>, batches: Vec<RecordBatch>) -> Arc<Dataset> {
        let schema = batches[0].schema();
        let object = host.add_iterator(batches);
        let iterator = HostBatchIterator::new(host.clone(), object).unwrap();
        let fragment = ForeignFragment::new(ForeignBatchSource::new(Box::new(iterator), Arc::clone(&schema)));
        Arc::new(Dataset::new(schema, vec![Arc::new(fragment) as Arc<dyn Fragment>]))
    }

    #[test]
    fn test_end_of_stream_is_sticky() {
        let host = MockHost::new();
        let dataset = foreign_dataset(&host, vec![people_batch(0, 5), people_batch(5, 5)]);
        let scanner = Arc::new(dataset.new_scan().finish().unwrap());
        let mut session = ScanSession::create(scanner).unwrap();

        assert_eq!(session.next_batch().unwrap().unwrap().num_rows(), 5);
        assert_eq!(session.next_batch().unwrap().unwrap().num_rows(), 5);
        assert!(session.next_batch().unwrap().is_none());
        assert!(session.is_finished());

        let calls = host.has_next_calls.load(Ordering::SeqCst);
        assert!(session.next_batch().unwrap().is_none());
        assert_eq!(host.has_next_calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_reservation_follows_current_batch() {
        let host = MockHost::new();
        let dataset = foreign_dataset(&host, vec![people_batch(0, 100), people_batch(100, 10)]);
        let listener = Arc::new(RecordingListener::default());
        let pool: Arc<dyn MemoryPool> = Arc::new(ReservationListenableMemoryPool::new(
            Arc::new(SystemMemoryPool::new()),
            listener.clone(),
        ));
        let scanner = Arc::new(dataset.new_scan().pool(Arc::clone(&pool)).finish().unwrap());
        let mut session = ScanSession::create(scanner).unwrap();

        let first = session.next_batch().unwrap().unwrap();
        assert_eq!(pool.bytes_allocated(), first.get_array_memory_size() as i64);
        assert_eq!(session.reserved_bytes(), pool.bytes_allocated());

        let second = session.next_batch().unwrap().unwrap();
        assert_eq!(pool.bytes_allocated(), second.get_array_memory_size() as i64);

        assert!(session.next_batch().unwrap().is_none());
        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(
            listener.reserved.load(Ordering::SeqCst),
            listener.released.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_drop_releases_reservation() {
        let host = MockHost::new();
        let dataset = foreign_dataset(&host, vec![people_batch(0, 8)]);
        let pool: Arc<dyn MemoryPool> = Arc::new(SystemMemoryPool::new());
        let scanner = Arc::new(dataset.new_scan().pool(Arc::clone(&pool)).finish().unwrap());
        let mut session = ScanSession::create(scanner).unwrap();

        session.next_batch().unwrap().unwrap();
        assert!(pool.bytes_allocated() > 0);
        drop(session);
        assert_eq!(pool.bytes_allocated(), 0);
    }

    #[test]
    fn test_rejected_reservation_fails_pull() {
        let host = MockHost::new();
        let dataset = foreign_dataset(&host, vec![people_batch(0, 8)]);
        let listener = Arc::new(RecordingListener::default());
        listener.reject.store(true, Ordering::SeqCst);
        let pool: Arc<dyn MemoryPool> = Arc::new(ReservationListenableMemoryPool::new(
            Arc::new(SystemMemoryPool::new()),
            listener,
        ));
        let scanner = Arc::new(dataset.new_scan().pool(pool).finish().unwrap());
        let mut session = ScanSession::create(scanner).unwrap();

        assert!(matches!(
            session.next_batch(),
            Err(DatasetError::HostRejected(_))
        ));
    }

    /// Rejects its first reservation, accepts everything after
    #[derive(Default)]
    struct RejectOnce {
        rejected: AtomicBool,
    }

    impl ReservationListener for RejectOnce {
        fn on_reservation(&self, _size: i64) -> Result<()> {
            if self.rejected.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DatasetError::HostRejected("over budget".to_string()))
            }
        }

        fn on_release(&self, _size: i64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_rejected_batch_is_retried() {
        let host = MockHost::new();
        let dataset = foreign_dataset(&host, vec![people_batch(0, 8), people_batch(8, 3)]);
        let pool: Arc<dyn MemoryPool> = Arc::new(ReservationListenableMemoryPool::new(
            Arc::new(SystemMemoryPool::new()),
            Arc::new(RejectOnce::default()),
        ));
        let scanner = Arc::new(dataset.new_scan().pool(Arc::clone(&pool)).finish().unwrap());
        let mut session = ScanSession::create(scanner).unwrap();

        assert!(session.next_batch().is_err());
        assert_eq!(pool.bytes_allocated(), 0);

        let mut rows = Vec::new();
        while let Some(batch) = session.next_batch().unwrap() {
            rows.push(batch.num_rows());
        }
        assert_eq!(rows, vec![8, 3]);
        assert_eq!(pool.bytes_allocated(), 0);
    }
}
