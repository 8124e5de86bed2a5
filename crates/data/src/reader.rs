//! Delta record readers: sequential and concurrent.

use crate::framing::{log_and_continue, FrameReader, RecoveryFn};
use crate::records::{DeltaFileMetadata, DeltaRecord};
use crate::DataError;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// A seekable byte stream over one delta file.
pub trait DeltaStream: Read + Seek + Send {}
impl<T: Read + Seek + Send> DeltaStream for T {}

/// Produces independent seekable streams pointing at the same delta file.
pub type StreamFactory =
    Arc<dyn Fn() -> Result<Box<dyn DeltaStream>, DataError> + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Sequential reader
// ---------------------------------------------------------------------------

/// Reads one delta file front to back. Not intended for use by multiple
/// threads.
pub struct DeltaFileReader<R: Read + Seek> {
    frames: FrameReader<R>,
    header_consumed: bool,
    recovery: Arc<RecoveryFn>,
}

impl<R: Read + Seek + Send> DeltaFileReader<R> {
    pub fn new(stream: R) -> Result<Self, DataError> {
        Self::with_recovery(stream, Arc::new(log_and_continue))
    }

    /// Like [`DeltaFileReader::new`] with a custom corrupt-region callback.
    pub fn with_recovery(stream: R, recovery: Arc<RecoveryFn>) -> Result<Self, DataError> {
        Ok(Self {
            frames: FrameReader::new(stream, 0)?,
            header_consumed: false,
            recovery,
        })
    }

    /// File metadata. Callable once, before record iteration.
    pub fn metadata(&mut self) -> Result<DeltaFileMetadata, DataError> {
        if self.header_consumed {
            return Err(DataError::Internal(
                "metadata() must be called before reading records".into(),
            ));
        }
        self.header_consumed = true;
        self.frames.read_header()
    }

    /// Invoke `callback` once per record in file order. Callback errors are
    /// logged and counted, never fatal; the first stream error aborts and is
    /// returned.
    pub fn read_records<F>(&mut self, mut callback: F) -> Result<(), DataError>
    where
        F: FnMut(DeltaRecord) -> Result<(), silo_common::Error>,
    {
        if !self.header_consumed {
            self.header_consumed = true;
            self.frames.read_header()?;
        }
        let mut callback_failures = 0u64;
        while let Some((_, record, _)) = self.frames.next_record(self.recovery.as_ref())? {
            if let Err(e) = callback(record) {
                callback_failures += 1;
                silo_metrics::metrics().delta_callback_failures.inc();
                tracing::warn!("record callback failed: {}", e);
            }
        }
        if callback_failures > 0 {
            tracing::error!(
                callback_failures,
                "record callback failed to process some records"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Concurrent reader
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConcurrentReadOptions {
    /// Number of byte-range shards read in parallel. 0 = hardware
    /// concurrency.
    pub num_workers: usize,
    /// Minimum shard size; small files collapse to fewer shards.
    pub min_shard_size_bytes: u64,
    /// Corrupt-region callback shared by all shard tasks.
    pub recovery: Arc<RecoveryFn>,
}

impl Default for ConcurrentReadOptions {
    fn default() -> Self {
        Self {
            num_workers: 0,
            min_shard_size_bytes: 8 * 1024 * 1024,
            recovery: Arc::new(log_and_continue),
        }
    }
}

impl std::fmt::Debug for ConcurrentReadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentReadOptions")
            .field("num_workers", &self.num_workers)
            .field("min_shard_size_bytes", &self.min_shard_size_bytes)
            .finish_non_exhaustive()
    }
}

/// Byte range read by one shard task. Inclusive on both ends: a record
/// belongs to the shard whose range contains its starting byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShardRange {
    start_pos: u64,
    end_pos: u64,
}

/// Stats returned by one shard task, used for the no-gap correctness check.
#[derive(Debug, Clone, Copy)]
struct ShardResult {
    first_record_pos: u64,
    next_shard_first_record_pos: u64,
    num_records_read: u64,
}

/// Reads one delta file with multiple parallel byte-range shards. Every
/// record is delivered exactly once across all shards, in no guaranteed
/// order.
pub struct ConcurrentDeltaReader {
    stream_factory: StreamFactory,
    options: ConcurrentReadOptions,
}

impl ConcurrentDeltaReader {
    pub fn new(stream_factory: StreamFactory, options: ConcurrentReadOptions) -> Self {
        Self {
            stream_factory,
            options,
        }
    }

    fn effective_workers(&self) -> usize {
        if self.options.num_workers > 0 {
            self.options.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// File metadata, read from a fresh stream.
    pub fn metadata(&self) -> Result<DeltaFileMetadata, DataError> {
        let stream = (self.stream_factory)()?;
        let mut frames = FrameReader::new(stream, 0)?;
        frames.read_header()
    }

    fn stream_size(&self) -> Result<u64, DataError> {
        let mut stream = (self.stream_factory)()?;
        Ok(stream.seek(SeekFrom::End(0))?)
    }

    fn build_shards(&self) -> Result<Vec<ShardRange>, DataError> {
        let size = self.stream_size()?;
        let workers = self.effective_workers() as u64;
        // Shard size is at least `min_shard_size_bytes` and at most the
        // whole stream.
        let shard_size = size.min(size.div_ceil(workers).max(self.options.min_shard_size_bytes));
        let mut shards = Vec::new();
        let mut start_pos = 0u64;
        while start_pos < size {
            let end_pos = (start_pos + shard_size).min(size);
            shards.push(ShardRange { start_pos, end_pos });
            start_pos = end_pos + 1;
        }
        if shards.is_empty() || shards.last().map(|s| s.end_pos) != Some(size) {
            return Err(DataError::Internal("failed to generate shards".into()));
        }
        Ok(shards)
    }

    /// Read every record, invoking `callback` from the shard tasks. Blocks
    /// until all shards complete; returns the total record count.
    pub async fn read_records<F>(&self, callback: F) -> Result<u64, DataError>
    where
        F: Fn(DeltaRecord) -> Result<(), silo_common::Error> + Send + Sync + 'static,
    {
        let shards = self.build_shards()?;
        let callback = Arc::new(callback);

        let mut tasks = Vec::with_capacity(shards.len());
        for shard in &shards {
            let shard = *shard;
            let factory = self.stream_factory.clone();
            let recovery = self.options.recovery.clone();
            let callback = callback.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                read_shard_records(factory.as_ref(), shard, recovery.as_ref(), callback.as_ref())
            }));
        }

        let mut prev: Option<ShardResult> = None;
        let mut total_records_read = 0u64;
        for task in tasks {
            let result = task
                .await
                .map_err(|e| DataError::Internal(format!("shard task panicked: {e}")))??;
            if let Some(prev) = prev {
                if prev.next_shard_first_record_pos < result.first_record_pos {
                    return Err(DataError::Internal(format!(
                        "Skipped some records between byte={} and byte={}.",
                        prev.next_shard_first_record_pos, result.first_record_pos
                    )));
                }
            }
            total_records_read += result.num_records_read;
            prev = Some(result);
        }
        tracing::debug!(total_records_read, "finished concurrent delta read");
        Ok(total_records_read)
    }
}

fn read_shard_records(
    factory: &(dyn Fn() -> Result<Box<dyn DeltaStream>, DataError> + Send + Sync),
    shard: ShardRange,
    recovery: &RecoveryFn,
    callback: &(dyn Fn(DeltaRecord) -> Result<(), silo_common::Error> + Send + Sync),
) -> Result<ShardResult, DataError> {
    let stream = factory()?;
    let mut frames = FrameReader::new(stream, shard.start_pos)?;

    let mut first_record_pos: Option<u64> = None;
    let mut num_records_read = 0u64;
    let mut callback_failures = 0u64;
    let next_shard_first_record_pos;

    loop {
        match frames.next_record(recovery)? {
            // A record starting past our range belongs to the next shard;
            // it was only peeked here.
            Some((start_pos, _, _)) if start_pos > shard.end_pos => {
                next_shard_first_record_pos = start_pos;
                break;
            }
            Some((start_pos, record, _)) => {
                first_record_pos.get_or_insert(start_pos);
                if let Err(e) = callback(record) {
                    callback_failures += 1;
                    silo_metrics::metrics().delta_callback_failures.inc();
                    tracing::warn!("record callback failed: {}", e);
                }
                num_records_read += 1;
            }
            None => {
                next_shard_first_record_pos = frames.position();
                break;
            }
        }
    }
    if callback_failures > 0 {
        tracing::error!(
            callback_failures,
            shard_start = shard.start_pos,
            "record callback failed to process some records"
        );
    }
    Ok(ShardResult {
        first_record_pos: first_record_pos.unwrap_or(next_shard_first_record_pos),
        next_shard_first_record_pos,
        num_records_read,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::DeltaFileWriter;
    use crate::records::KvMutation;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn sample_file(n: usize) -> Arc<Vec<u8>> {
        let metadata = DeltaFileMetadata {
            shard_num: Some(0),
            min_logical_commit_time: 1,
            max_logical_commit_time: n as i64,
        };
        let mut writer = DeltaFileWriter::new(Vec::new(), &metadata).unwrap();
        for i in 0..n {
            writer
                .write_record(&DeltaRecord::KvMutation(KvMutation::update_scalar(
                    format!("key{i}"),
                    format!("value{i}"),
                    i as i64 + 1,
                )))
                .unwrap();
        }
        Arc::new(writer.finish().unwrap())
    }

    fn factory_for(bytes: Arc<Vec<u8>>) -> StreamFactory {
        Arc::new(move || {
            let bytes = bytes.clone();
            Ok(Box::new(Cursor::new(ArcBytes(bytes))) as Box<dyn DeltaStream>)
        })
    }

    /// Cursor needs AsRef<[u8]>.
    struct ArcBytes(Arc<Vec<u8>>);
    impl AsRef<[u8]> for ArcBytes {
        fn as_ref(&self) -> &[u8] {
            self.0.as_slice()
        }
    }

    #[test]
    fn test_sequential_reader_metadata_then_records() {
        let bytes = sample_file(10);
        let mut reader = DeltaFileReader::new(Cursor::new(bytes.to_vec())).unwrap();
        let metadata = reader.metadata().unwrap();
        assert_eq!(metadata.shard_num, Some(0));
        assert_eq!(metadata.max_logical_commit_time, 10);

        let mut count = 0;
        reader
            .read_records(|_record| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 10);
    }

    #[test]
    fn test_sequential_reader_metadata_once() {
        let bytes = sample_file(1);
        let mut reader = DeltaFileReader::new(Cursor::new(bytes.to_vec())).unwrap();
        reader.metadata().unwrap();
        assert!(reader.metadata().is_err());
    }

    #[test]
    fn test_sequential_reader_callback_errors_not_fatal() {
        let bytes = sample_file(5);
        let mut reader = DeltaFileReader::new(Cursor::new(bytes.to_vec())).unwrap();
        let mut delivered = 0;
        reader
            .read_records(|_record| {
                delivered += 1;
                Err(silo_common::Error::Internal("boom".into()))
            })
            .unwrap();
        assert_eq!(delivered, 5, "iteration continues past callback errors");
    }

    #[test]
    fn test_build_shards_cover_stream_contiguously() {
        let bytes = sample_file(100);
        let size = bytes.len() as u64;
        let reader = ConcurrentDeltaReader::new(
            factory_for(bytes),
            ConcurrentReadOptions {
                num_workers: 4,
                min_shard_size_bytes: 16,
                ..Default::default()
            },
        );
        let shards = reader.build_shards().unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].start_pos, 0);
        assert_eq!(shards.last().unwrap().end_pos, size);
        for pair in shards.windows(2) {
            assert_eq!(pair[1].start_pos, pair[0].end_pos + 1);
        }
    }

    #[test]
    fn test_min_shard_size_collapses_small_files() {
        let bytes = sample_file(10);
        let reader = ConcurrentDeltaReader::new(
            factory_for(bytes),
            ConcurrentReadOptions {
                num_workers: 8,
                min_shard_size_bytes: 8 * 1024 * 1024,
                ..Default::default()
            },
        );
        let shards = reader.build_shards().unwrap();
        assert_eq!(shards.len(), 1, "small file should be one shard");
    }

    #[tokio::test]
    async fn test_concurrent_read_delivers_every_record_exactly_once() {
        let n = 2000;
        let bytes = sample_file(n);
        let reader = ConcurrentDeltaReader::new(
            factory_for(bytes),
            ConcurrentReadOptions {
                num_workers: 8,
                min_shard_size_bytes: 128,
                ..Default::default()
            },
        );

        let seen: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let seen_cb = seen.clone();
        let total = reader
            .read_records(move |record| {
                if let DeltaRecord::KvMutation(m) = record {
                    *seen_cb.lock().unwrap().entry(m.key).or_insert(0) += 1;
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(total, n as u64);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), n);
        assert!(
            seen.values().all(|&count| count == 1),
            "every record delivered exactly once"
        );
    }

    #[tokio::test]
    async fn test_concurrent_read_matches_sequential_count() {
        let n = 500;
        let bytes = sample_file(n);

        let mut sequential = 0u64;
        let mut reader = DeltaFileReader::new(Cursor::new(bytes.to_vec())).unwrap();
        reader
            .read_records(|_| {
                sequential += 1;
                Ok(())
            })
            .unwrap();

        let concurrent = ConcurrentDeltaReader::new(
            factory_for(bytes),
            ConcurrentReadOptions {
                num_workers: 5,
                min_shard_size_bytes: 64,
                ..Default::default()
            },
        )
        .read_records(|_| Ok(()))
        .await
        .unwrap();

        assert_eq!(concurrent, sequential);
    }

    #[tokio::test]
    async fn test_concurrent_read_with_corruption_skips_region() {
        let n = 200;
        let bytes = Arc::try_unwrap(sample_file(n)).unwrap();
        let mut bytes = bytes;
        // Damage a payload byte around the middle of the file.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let bytes = Arc::new(bytes);

        let total = ConcurrentDeltaReader::new(
            factory_for(bytes),
            ConcurrentReadOptions {
                num_workers: 4,
                min_shard_size_bytes: 64,
                ..Default::default()
            },
        )
        .read_records(|_| Ok(()))
        .await
        .unwrap();

        assert!(
            total == n as u64 - 1 || total == n as u64,
            "at most one record lost to corruption, got {total}"
        );
    }

    #[tokio::test]
    async fn test_concurrent_metadata() {
        let bytes = sample_file(3);
        let reader = ConcurrentDeltaReader::new(factory_for(bytes), Default::default());
        let metadata = reader.metadata().unwrap();
        assert_eq!(metadata.min_logical_commit_time, 1);
        assert_eq!(metadata.max_logical_commit_time, 3);
    }
}
