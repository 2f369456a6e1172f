use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::LoggerConfig;
use crate::error::LoggerResult;
use crate::queue::{DropCounter, QueueConsumer};
use crate::record::{LogRecord, RECORD_SIZE};
use crate::sampler::BootClock;
use crate::shutdown::{ShutdownCoordinator, ShutdownListener};
use crate::status::{LoggerStatus, WriterState};
use crate::storage::{FileNaming, SessionStore, Storage, StorageLock};

/// Records staged for the next storage write. Only whole records are ever
/// staged, so a block always encodes to a multiple of `RECORD_SIZE`.
pub struct OutputBlock {
    buf: Vec<u8>,
    capacity: usize,
}

impl OutputBlock {
    /// Holds as many whole records as fit in `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        let capacity = (block_size / RECORD_SIZE).max(1);
        Self {
            buf: Vec::with_capacity(capacity * RECORD_SIZE),
            capacity,
        }
    }

    /// Returns true once the block is full.
    pub fn push(&mut self, record: &LogRecord) -> bool {
        self.buf.extend_from_slice(&record.encode());
        self.is_full()
    }

    pub fn len(&self) -> usize {
        self.buf.len() / RECORD_SIZE
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterSummary {
    pub file_name: String,
    pub records_written: u64,
    pub file_bytes: u64,
    pub write_errors: u64,
    pub lost_records: u64,
    pub drops: u64,
}

/// Sole consumer of the queue and sole user of the session file.
pub struct Writer<S: Storage> {
    store: StorageLock<S>,
    consumer: QueueConsumer,
    drops: DropCounter,
    coordinator: Arc<ShutdownCoordinator>,
    clock: BootClock,
    block: OutputBlock,
    file_name: String,
    flush_interval: Duration,
    queue_wait: Duration,
    status_path: Option<PathBuf>,
    last_flush: Instant,
    state: WriterState,
    records_written: u64,
    write_errors: u64,
    lost_records: u64,
}

impl<S: Storage> Writer<S> {
    /// Mount storage and open a fresh session file. Failure here leaves the
    /// session with nowhere to put data and is reported to the caller.
    pub async fn open(
        store: StorageLock<S>,
        config: &LoggerConfig,
        consumer: QueueConsumer,
        drops: DropCounter,
        coordinator: Arc<ShutdownCoordinator>,
        clock: BootClock,
    ) -> LoggerResult<Self> {
        let naming = FileNaming::from_config(config);
        let file_name = store.lock().await.open_session(&naming)?;

        Ok(Self {
            store,
            consumer,
            drops,
            coordinator,
            clock,
            block: OutputBlock::new(config.block_size),
            file_name,
            flush_interval: config.flush_interval(),
            queue_wait: config.queue_wait(),
            status_path: config.status_path.clone(),
            last_flush: Instant::now(),
            state: WriterState::Opening,
            records_written: 0,
            write_errors: 0,
            lost_records: 0,
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Drain the queue into the session file until shutdown is requested,
    /// then write what is left, close and unmount.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> WriterSummary {
        self.state = WriterState::Draining;
        info!("[writer] draining into {}", self.file_name);

        loop {
            let popped = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                popped = self.consumer.pop_wait(self.queue_wait) => popped,
            };

            if let Some(record) = popped {
                self.accept(record).await;
            }

            if self.last_flush.elapsed() >= self.flush_interval {
                self.periodic_flush().await;
            }
        }

        self.finish().await
    }

    async fn accept(&mut self, record: LogRecord) {
        if self.block.push(&record) {
            let store = self.store.clone();
            let mut store = store.lock().await;
            self.write_block(&mut store);
        }
    }

    /// Write the staged block. A failed write loses the whole block and is
    /// not retried; the file keeps only whole records either way.
    fn write_block(&mut self, store: &mut SessionStore<S>) {
        if self.block.is_empty() {
            return;
        }
        let count = self.block.len() as u64;
        match store.write_records(self.block.as_bytes()) {
            Ok(()) => self.records_written += count,
            Err(e) => {
                self.write_errors += 1;
                self.lost_records += count;
                warn!("[writer] block write failed, {} records lost: {}", count, e);
            }
        }
        self.block.clear();
    }

    async fn periodic_flush(&mut self) {
        {
            let store = self.store.clone();
            let mut store = store.lock().await;
            self.write_block(&mut store);
            if let Err(e) = store.flush() {
                self.write_errors += 1;
                warn!("[writer] flush failed: {}", e);
            }
        }
        self.last_flush = Instant::now();
        debug!("[writer] flushed {} records", self.records_written);
        self.publish_status().await;
    }

    async fn finish(mut self) -> WriterSummary {
        while let Some(record) = self.consumer.try_pop() {
            self.accept(record).await;
        }

        {
            let store = self.store.clone();
            let mut store = store.lock().await;
            self.write_block(&mut store);
            if let Err(e) = store.close_session() {
                warn!("[writer] close failed: {}", e);
            }
            if let Err(e) = store.unmount() {
                warn!("[writer] unmount failed: {}", e);
            }
        }

        self.state = WriterState::Closed;
        self.coordinator.mark_writer_closed();
        self.publish_status().await;

        let summary = self.summary().await;
        info!(
            "[writer] closed {}: {} records, {} write errors, {} drops",
            summary.file_name, summary.records_written, summary.write_errors, summary.drops
        );
        summary
    }

    async fn summary(&mut self) -> WriterSummary {
        WriterSummary {
            file_name: self.file_name.clone(),
            records_written: self.records_written,
            file_bytes: self.store.lock().await.file_bytes(),
            write_errors: self.write_errors,
            lost_records: self.lost_records,
            drops: self.drops.get(),
        }
    }

    async fn publish_status(&mut self) {
        let summary = self.summary().await;
        let status = LoggerStatus {
            uptime_ms: self.clock.uptime().as_millis() as u64,
            file_name: Some(summary.file_name),
            records_written: summary.records_written,
            file_bytes: summary.file_bytes,
            drops: summary.drops,
            write_errors: summary.write_errors,
            lost_records: summary.lost_records,
            ..LoggerStatus::new(self.state)
        };

        info!("[writer] {}", status.summary_line());
        if let Some(path) = &self.status_path {
            if let Err(e) = status.save(path) {
                warn!("[writer] failed to save status to {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::{analyze_sequence, decode_records};
    use crate::queue::{sample_queue, QueueProducer};
    use crate::sim::MemStorage;

    struct Rig {
        storage: MemStorage,
        writer: Writer<MemStorage>,
        producer: QueueProducer,
        coordinator: Arc<ShutdownCoordinator>,
    }

    async fn rig(block_size: usize) -> Rig {
        let storage = MemStorage::new();
        let config = LoggerConfig {
            block_size,
            ..LoggerConfig::default()
        };
        let (producer, consumer) = sample_queue(config.queue_capacity).unwrap();
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let writer = Writer::open(
            SessionStore::new(storage.clone()).into_lock(),
            &config,
            consumer,
            DropCounter::new(),
            coordinator.clone(),
            BootClock::new(),
        )
        .await
        .unwrap();
        Rig {
            storage,
            writer,
            producer,
            coordinator,
        }
    }

    fn record(sequence: u32) -> LogRecord {
        LogRecord::stamped(sequence * 5, sequence)
    }

    #[test]
    fn test_output_block_holds_whole_records() {
        let mut block = OutputBlock::new(512);
        assert_eq!(block.capacity(), 16);
        for seq in 0..15 {
            assert!(!block.push(&record(seq)));
        }
        assert!(block.push(&record(15)));
        assert_eq!(block.as_bytes().len(), 512);

        // 100 bytes only fits three records.
        assert_eq!(OutputBlock::new(100).capacity(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_reach_file_in_order_with_periodic_flush() {
        let Rig {
            storage,
            writer,
            producer,
            coordinator,
        } = rig(512).await;
        let start = Instant::now();
        let file_name = writer.file_name().to_string();
        assert_eq!(file_name, "log000.bin");

        let handle = tokio::spawn(writer.run(coordinator.listener()));
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        for seq in 0..1000 {
            ticker.tick().await;
            assert!(producer.try_push(record(seq)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.request();
        let summary = handle.await.unwrap();

        assert_eq!(summary.records_written, 1000);
        assert_eq!(summary.file_bytes, 32_000);
        assert_eq!(summary.write_errors, 0);

        let bytes = storage.file(&file_name).unwrap();
        assert_eq!(bytes.len(), 32_000);
        let records = decode_records(&bytes).unwrap();
        let sequences: Vec<u32> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (0..1000).collect::<Vec<_>>());

        let flushes: Vec<u128> = storage
            .flush_times()
            .iter()
            .map(|t| (*t - start).as_millis())
            .collect();
        assert!((1000..1010).contains(&flushes[0]), "{:?}", flushes);
        assert!((2000..2020).contains(&flushes[1]), "{:?}", flushes);

        assert!(coordinator.is_writer_closed());
        assert!(!storage.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_without_data() {
        let Rig {
            storage,
            writer,
            producer: _producer,
            coordinator,
        } = rig(512).await;
        let start = Instant::now();

        let handle = tokio::spawn(writer.run(coordinator.listener()));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let flushes: Vec<Duration> = storage.flush_times().iter().map(|t| *t - start).collect();
        assert_eq!(
            flushes,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );

        coordinator.request();
        let summary = handle.await.unwrap();
        assert_eq!(summary.records_written, 0);
        assert_eq!(storage.file("log000.bin").unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_block_is_discarded_whole() {
        let Rig {
            storage,
            mut writer,
            producer: _producer,
            coordinator: _coordinator,
        } = rig(64).await;

        for seq in 0..4 {
            writer.accept(record(seq)).await;
        }
        storage.set_fail_writes(true);
        for seq in 4..6 {
            writer.accept(record(seq)).await;
        }
        storage.set_fail_writes(false);
        for seq in 6..10 {
            writer.accept(record(seq)).await;
        }
        let summary = writer.finish().await;

        assert_eq!(summary.write_errors, 1);
        assert_eq!(summary.lost_records, 2);
        assert_eq!(summary.records_written, 8);

        let bytes = storage.file("log000.bin").unwrap();
        assert_eq!(bytes.len() % RECORD_SIZE, 0);
        let records = decode_records(&bytes).unwrap();
        let report = analyze_sequence(&records);
        assert_eq!(report.holes, 2);
        assert_eq!(report.duplicates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_block_write_leaves_whole_records() {
        let Rig {
            storage,
            mut writer,
            producer: _producer,
            coordinator: _coordinator,
        } = rig(64).await;

        for seq in 0..2 {
            writer.accept(record(seq)).await;
        }
        // Card accepts 45 bytes of the next two-record block, then faults.
        storage.set_torn_writes(Some(45));
        for seq in 2..4 {
            writer.accept(record(seq)).await;
        }
        let torn = storage.file("log000.bin").unwrap();
        assert_eq!(torn.len(), 2 * RECORD_SIZE);

        storage.set_torn_writes(None);
        for seq in 4..7 {
            writer.accept(record(seq)).await;
        }
        let summary = writer.finish().await;

        assert_eq!(summary.write_errors, 1);
        assert_eq!(summary.lost_records, 2);
        assert_eq!(summary.records_written, 5);

        let bytes = storage.file("log000.bin").unwrap();
        assert_eq!(bytes.len() as u64, summary.file_bytes);
        assert_eq!(bytes.len() % RECORD_SIZE, 0);
        let records = decode_records(&bytes).unwrap();
        let sequences: Vec<u32> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_stream_leaves_whole_records() {
        let Rig {
            storage,
            writer,
            producer,
            coordinator,
        } = rig(512).await;

        let handle = tokio::spawn(writer.run(coordinator.listener()));
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            for seq in 0.. {
                ticker.tick().await;
                if !producer.try_push(record(seq)) {
                    break;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(1234)).await;
        coordinator.request();
        let summary = handle.await.unwrap();
        feeder.abort();

        let bytes = storage.file("log000.bin").unwrap();
        assert_eq!(bytes.len() as u64, summary.file_bytes);
        assert_eq!(bytes.len() % RECORD_SIZE, 0);
        let records = decode_records(&bytes).unwrap();
        assert!(records.len() >= 240);
        let report = analyze_sequence(&records);
        assert_eq!(report.first, Some(0));
        assert_eq!(report.holes, 0);
        assert!(coordinator.is_writer_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_file_written_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let config = LoggerConfig {
            status_path: Some(status_path.clone()),
            ..LoggerConfig::default()
        };
        let (_producer, consumer) = sample_queue(8).unwrap();
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let writer = Writer::open(
            SessionStore::new(MemStorage::new()).into_lock(),
            &config,
            consumer,
            DropCounter::new(),
            coordinator.clone(),
            BootClock::new(),
        )
        .await
        .unwrap();

        let handle = tokio::spawn(writer.run(coordinator.listener()));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let status: LoggerStatus =
            serde_json::from_str(&std::fs::read_to_string(&status_path).unwrap()).unwrap();
        assert_eq!(status.writer_state, WriterState::Draining);
        assert_eq!(status.file_name.as_deref(), Some("log000.bin"));

        coordinator.request();
        handle.await.unwrap();
        let status: LoggerStatus =
            serde_json::from_str(&std::fs::read_to_string(&status_path).unwrap()).unwrap();
        assert_eq!(status.writer_state, WriterState::Closed);
    }
}
