use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use bootlog_types::{LogEntry, ModuleRecord};

use crate::buffer::EntryBuffer;
use crate::config::AggregatorConfig;
use crate::error::{AggregatorError, Result};
use crate::flusher::{Flusher, FlusherHandle, FlusherState};
use crate::index::ModuleIndex;
use crate::sink::{FileSink, Sink};

/// Counters describing an aggregator's activity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Successful `record` calls
    pub recorded: u64,
    /// Entries overwritten before any write delivered them
    pub evicted: u64,
    /// Lines written to the sink
    pub flushed: u64,
    /// Entries waiting in the buffer
    pub pending: usize,
    /// Distinct modules seen
    pub modules: usize,
}

/// Module-aware log aggregator
///
/// Producers call [`record`](Self::record) from any thread. A background
/// flusher drains the buffer to the sink when occupancy reaches the
/// threshold, when the interval elapses, or on [`flush`](Self::flush).
/// Must be created inside a tokio runtime. Dropping it without
/// [`shutdown`](Self::shutdown) writes the remaining entries synchronously.
pub struct Aggregator {
    config: AggregatorConfig,
    threshold: usize,

    /// Locked before `buffer` so per-module order matches buffer order
    index: Mutex<ModuleIndex>,
    buffer: EntryBuffer,

    /// Set once by `shutdown`; held for read across a record's critical section
    closed: RwLock<bool>,

    recorded: AtomicU64,
    flusher: FlusherHandle,
}

impl Aggregator {
    /// Create an aggregator appending to the file at `config.sink_path`
    pub fn open(config: AggregatorConfig) -> Result<Self> {
        let sink = FileSink::new(config.sink_path.clone());
        Self::new(config, sink)
    }

    /// Create an aggregator writing to `sink`
    pub fn new(config: AggregatorConfig, sink: impl Sink) -> Result<Self> {
        config.validate()?;

        let threshold = config.flush_threshold();
        let buffer = EntryBuffer::new(config.capacity);
        let flusher = Flusher::spawn(buffer.clone(), Box::new(sink), config.flush_interval());

        info!(
            capacity = config.capacity,
            threshold,
            interval_ms = config.flush_interval_ms,
            "aggregator started"
        );

        Ok(Self {
            config,
            threshold,
            index: Mutex::new(ModuleIndex::new()),
            buffer,
            closed: RwLock::new(false),
            recorded: AtomicU64::new(0),
            flusher,
        })
    }

    /// Record a message for `module`, merging its declared dependencies
    ///
    /// Never blocks on the sink. When the buffer is full the oldest unread
    /// entry is dropped. Fails only after [`shutdown`](Self::shutdown).
    pub fn record<S: AsRef<str>>(
        &self,
        module: &str,
        dependencies: &[S],
        message: &str,
    ) -> Result<()> {
        let closed = self.closed.read();
        if *closed {
            return Err(AggregatorError::Closed);
        }

        let occupancy = {
            let mut index = self.index.lock();
            let now = Utc::now();
            let seconds_from_first = index.touch(module, dependencies, now);
            self.buffer.push(LogEntry::new(now, module, seconds_from_first, message));
            self.buffer.occupancy()
        };
        drop(closed);

        self.recorded.fetch_add(1, Ordering::Relaxed);
        if occupancy >= self.threshold {
            self.flusher.wake();
        }
        Ok(())
    }

    /// Drain everything buffered to the sink now
    ///
    /// Returns the number of lines written.
    pub async fn flush(&self) -> Result<usize> {
        if self.is_closed() {
            return Err(AggregatorError::Closed);
        }
        self.flusher.flush().await
    }

    /// One formatted line per module, in first-seen order
    pub fn report(&self) -> Vec<String> {
        self.modules()
            .iter()
            .map(ModuleRecord::to_report_line)
            .collect()
    }

    /// Snapshot of all module records, in first-seen order
    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.index.lock().snapshot()
    }

    /// Copy of the entries not yet written to the sink
    pub fn pending_entries(&self) -> Vec<LogEntry> {
        self.buffer.peek(None).entries
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            evicted: self.buffer.evicted(),
            flushed: self.flusher.flushed(),
            pending: self.buffer.occupancy(),
            modules: self.index.lock().len(),
        }
    }

    pub fn flusher_state(&self) -> FlusherState {
        self.flusher.state()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Stop accepting records and perform the final drain
    ///
    /// Waits for any in-flight drain and then for the final write, with no
    /// timeout: on slow or unreachable storage this blocks for as long as
    /// the sink does. Returns the number of lines written by the final
    /// drain; calling it again returns `Ok(0)`.
    pub async fn shutdown(&self) -> Result<usize> {
        {
            let mut closed = self.closed.write();
            if *closed {
                debug!("aggregator already shut down");
                return Ok(0);
            }
            *closed = true;
        }

        info!(pending = self.buffer.occupancy(), "aggregator shutting down");
        self.flusher.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::io;
    use std::time::Duration;

    const NO_DEPS: &[&str] = &[];

    /// Sink whose storage never becomes available
    struct DeadSink;

    impl Sink for DeadSink {
        fn append(&mut self, _lines: &[String]) -> io::Result<()> {
            Err(io::Error::other("no storage"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Config whose flusher only runs when asked
    fn quiet_config(capacity: usize) -> AggregatorConfig {
        AggregatorConfig::default()
            .with_capacity(capacity)
            .with_flush_threshold(capacity)
            .with_flush_interval(Duration::from_secs(3600))
    }

    fn contents(entries: &[LogEntry]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|e| (e.module.clone(), e.content.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_records_reach_sink_in_call_order() {
        let sink = MemorySink::new();
        let aggregator = Aggregator::new(quiet_config(16), sink.clone()).unwrap();

        for (module, message) in [("A", "a1"), ("B", "b1"), ("A", "a2"), ("B", "b2"), ("A", "a3")] {
            aggregator.record(module, NO_DEPS, message).unwrap();
        }
        assert_eq!(aggregator.flush().await.unwrap(), 5);

        let lines = sink.lines();
        assert_eq!(lines.len(), 5);
        let a_lines: Vec<_> = lines.iter().filter(|l| l.contains("][A][")).collect();
        assert_eq!(a_lines.len(), 3);
        assert!(a_lines[0].ends_with("a1"));
        assert!(a_lines[1].ends_with("a2"));
        assert!(a_lines[2].ends_with("a3"));
        assert_eq!(aggregator.stats().flushed, 5);
    }

    #[tokio::test]
    async fn test_overflow_scenario_and_report() {
        // Writes always fail, so the buffer holds exactly what survived eviction
        let config = AggregatorConfig::default()
            .with_capacity(3)
            .with_flush_threshold(2)
            .with_flush_interval(Duration::from_secs(3600));
        let aggregator = Aggregator::new(config, DeadSink).unwrap();

        for (module, message) in [("A", "a1"), ("B", "b1"), ("A", "a2"), ("C", "c1"), ("A", "a3")] {
            aggregator.record(module, NO_DEPS, message).unwrap();
        }

        let pending = contents(&aggregator.pending_entries());
        assert_eq!(
            pending,
            vec![
                ("A".to_string(), "a2".to_string()),
                ("C".to_string(), "c1".to_string()),
                ("A".to_string(), "a3".to_string()),
            ]
        );

        let stats = aggregator.stats();
        assert_eq!(stats.recorded, 5);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.modules, 3);

        let report = aggregator.report();
        assert_eq!(report.len(), 3);
        assert!(report[0].starts_with("[A]["));
        assert!(report[1].starts_with("[B]["));
        assert!(report[2].starts_with("[C]["));
        // No dependencies were declared, so each line ends right after the elapsed field
        assert!(report[0].ends_with(']'));
        assert!(aggregator.modules()[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_report_merges_dependencies() {
        let aggregator = Aggregator::new(quiet_config(8), MemorySink::new()).unwrap();
        aggregator.record("Module A", NO_DEPS, "first").unwrap();
        aggregator
            .record("Module A", &["Module B,Module D"], "second")
            .unwrap();
        aggregator
            .record("Module A", &["Module D", "Module C"], "third")
            .unwrap();

        let report = aggregator.report();
        assert_eq!(report.len(), 1);
        assert!(report[0].starts_with("[Module A]["));
        assert!(report[0].ends_with("]Module B,Module C,Module D"));
    }

    #[tokio::test]
    async fn test_threshold_wakes_flusher() {
        let sink = MemorySink::new();
        let config = AggregatorConfig::default()
            .with_capacity(10)
            .with_flush_threshold(2)
            .with_flush_interval(Duration::from_secs(3600));
        let aggregator = Aggregator::new(config, sink.clone()).unwrap();

        aggregator.record("A", NO_DEPS, "one").unwrap();
        aggregator.record("A", NO_DEPS, "two").unwrap();

        for _ in 0..100 {
            if sink.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(aggregator.stats().pending, 0);
    }

    #[test]
    fn test_drop_without_shutdown_keeps_entries() {
        let sink = MemorySink::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let aggregator = {
            let _guard = rt.enter();
            Aggregator::new(quiet_config(16), sink.clone()).unwrap()
        };

        for message in ["one", "two", "three"] {
            aggregator.record("boot", NO_DEPS, message).unwrap();
        }
        drop(aggregator);
        drop(rt);

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("[boot][0]one"));
        assert!(lines[2].ends_with("[boot][0]three"));
    }

    #[tokio::test]
    async fn test_seconds_from_first() {
        let aggregator = Aggregator::new(quiet_config(8), MemorySink::new()).unwrap();
        aggregator.record("A", NO_DEPS, "first").unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        aggregator.record("A", NO_DEPS, "second").unwrap();
        aggregator.record("B", NO_DEPS, "other").unwrap();

        let seconds: Vec<u64> = aggregator
            .pending_entries()
            .iter()
            .map(|e| e.seconds_from_first)
            .collect();
        assert_eq!(seconds, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_and_closes() {
        let sink = MemorySink::new();
        let aggregator = Aggregator::new(quiet_config(500), sink.clone()).unwrap();

        for i in 0..10 {
            aggregator.record("boot", NO_DEPS, &format!("step {i}")).unwrap();
        }
        assert_eq!(aggregator.shutdown().await.unwrap(), 10);

        let lines = sink.lines();
        assert_eq!(lines.len(), 10);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.ends_with(&format!("[boot][0]step {i}")), "{line}");
        }

        assert!(matches!(
            aggregator.record("boot", NO_DEPS, "late"),
            Err(AggregatorError::Closed)
        ));
        assert!(matches!(aggregator.flush().await, Err(AggregatorError::Closed)));
        assert_eq!(aggregator.flusher_state(), FlusherState::Stopped);
        assert_eq!(aggregator.shutdown().await.unwrap(), 0);
        assert_eq!(sink.len(), 10);
    }

    #[tokio::test]
    async fn test_unavailable_sink_does_not_fail_producers() {
        let aggregator = Aggregator::new(quiet_config(4), DeadSink).unwrap();
        aggregator.record("A", NO_DEPS, "kept").unwrap();

        let err = aggregator.flush().await.unwrap_err();
        assert!(matches!(err, AggregatorError::SinkUnavailable(_)));
        assert_eq!(aggregator.stats().pending, 1);

        aggregator.record("A", NO_DEPS, "still accepted").unwrap();
        assert_eq!(aggregator.stats().pending, 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = AggregatorConfig::default().with_capacity(0);
        let err = Aggregator::new(config, MemorySink::new()).err().unwrap();
        assert!(matches!(err, AggregatorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_open_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.log");
        let config = quiet_config(8).with_sink_path(&path);
        let aggregator = Aggregator::open(config).unwrap();

        aggregator.record("net", &["dhcp"], "link up").unwrap();
        aggregator.record("net", NO_DEPS, "address acquired").unwrap();
        assert_eq!(aggregator.shutdown().await.unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[net][0]link up"));
        assert!(lines[1].ends_with("address acquired"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_producers() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;
        const TOTAL: usize = THREADS * PER_THREAD * 2;

        // Nothing leaves the buffer, so every entry can be inspected afterwards
        let aggregator = Aggregator::new(quiet_config(TOTAL), DeadSink).unwrap();

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let aggregator = &aggregator;
                scope.spawn(move || {
                    let own = format!("worker-{t}");
                    for i in 0..PER_THREAD {
                        aggregator
                            .record("shared", NO_DEPS, &format!("{t}:{i}"))
                            .unwrap();
                        aggregator.record(&own, &["shared"], "tick").unwrap();
                    }
                });
            }
        });

        let entries = aggregator.pending_entries();
        let stats = aggregator.stats();
        assert_eq!(stats.recorded, TOTAL as u64);
        assert_eq!(stats.evicted, 0);
        assert_eq!(stats.modules, THREADS + 1);
        assert_eq!(entries.len(), TOTAL);

        let modules = aggregator.modules();
        for module in &modules {
            let timestamps: Vec<_> = entries
                .iter()
                .filter(|e| e.module == module.name)
                .map(|e| e.timestamp)
                .collect();
            assert_eq!(Some(module.last_seen), timestamps.iter().max().copied());
            assert_eq!(Some(module.first_seen), timestamps.iter().min().copied());

            let seconds: Vec<u64> = entries
                .iter()
                .filter(|e| e.module == module.name)
                .map(|e| e.seconds_from_first)
                .collect();
            assert!(seconds.windows(2).all(|w| w[0] <= w[1]));

            if module.name.starts_with("worker-") {
                assert_eq!(module.dependency_list(), "shared");
            }
        }

        // Each producer's entries for the shared module keep their call order
        for t in 0..THREADS {
            let prefix = format!("{t}:");
            let sequence: Vec<usize> = entries
                .iter()
                .filter(|e| e.module == "shared" && e.content.starts_with(&prefix))
                .map(|e| e.content[prefix.len()..].parse().unwrap())
                .collect();
            assert_eq!(sequence, (0..PER_THREAD).collect::<Vec<_>>());
        }
    }
}
