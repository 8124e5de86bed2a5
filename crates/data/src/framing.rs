//! Frame layer of the delta file format.
//!
//! Layout: `file := header frame*` where every frame is
//! `magic(4) crc32(4) len(4, LE) payload(len)`. The header carries the file
//! metadata under `HEADER_MAGIC`; every record frame uses `RECORD_MAGIC`.
//! Both markers start with `0xF5`, a byte that cannot occur in the UTF-8
//! JSON payloads, so a reader dropped at an arbitrary byte offset finds the
//! next record start by scanning for the marker. Frames that fail the CRC or
//! do not parse are skipped by resuming the scan one byte past their marker.

use crate::records::{DeltaFileMetadata, DeltaRecord};
use crate::DataError;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

/// Marker of the file-metadata frame, only valid at offset 0.
pub(crate) const HEADER_MAGIC: [u8; 4] = [0xF5, 0x4B, 0x56, 0x48];

/// Marker of every record frame.
pub(crate) const RECORD_MAGIC: [u8; 4] = [0xF5, 0x4B, 0x56, 0x52];

/// Upper bound on a frame payload. Anything larger is a scan false positive.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// A byte range that was skipped because it could not be parsed as records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedRegion {
    pub begin: u64,
    pub end: u64,
}

impl std::fmt::Display for SkippedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Recovery callback: return `true` to skip the region and continue, `false`
/// to abort the read.
pub type RecoveryFn = dyn Fn(&SkippedRegion) -> bool + Send + Sync;

/// Default recovery: log and continue.
pub(crate) fn log_and_continue(region: &SkippedRegion) -> bool {
    tracing::warn!("skipping over corrupted region: {}", region);
    silo_metrics::metrics().delta_corrupt_regions.inc();
    true
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes a delta file: metadata header first, then record frames.
pub struct DeltaFileWriter<W: Write> {
    writer: BufWriter<W>,
    records_written: u64,
}

impl<W: Write> DeltaFileWriter<W> {
    /// Start a new delta file, writing the metadata header immediately.
    pub fn new(inner: W, metadata: &DeltaFileMetadata) -> Result<Self, DataError> {
        let mut writer = BufWriter::new(inner);
        let payload = serde_json::to_vec(metadata)?;
        write_frame(&mut writer, HEADER_MAGIC, &payload)?;
        Ok(Self {
            writer,
            records_written: 0,
        })
    }

    pub fn write_record(&mut self, record: &DeltaRecord) -> Result<(), DataError> {
        let payload = serde_json::to_vec(record)?;
        write_frame(&mut self.writer, RECORD_MAGIC, &payload)?;
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W, DataError> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| DataError::Io(e.into_error()))
    }
}

fn write_frame(w: &mut impl Write, magic: [u8; 4], payload: &[u8]) -> Result<(), DataError> {
    let crc = crc32fast::hash(payload);
    w.write_all(&magic)?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame reader
// ---------------------------------------------------------------------------

/// Low-level frame reader over a seekable stream, with resynchronization.
pub(crate) struct FrameReader<R: Read + Seek> {
    inner: BufReader<R>,
    /// Absolute position of the next byte to read.
    pos: u64,
    /// False right after construction or a seek: scanning to the next marker
    /// is expected and not reported as corruption.
    synced: bool,
    /// Start of the current unparseable run, reported once a valid frame (or
    /// EOF) is found.
    pending_skip_start: Option<u64>,
}

impl<R: Read + Seek> FrameReader<R> {
    pub(crate) fn new(mut inner: R, start: u64) -> Result<Self, DataError> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner: BufReader::new(inner),
            pos: start,
            synced: false,
            pending_skip_start: None,
        })
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    fn read_byte(&mut self) -> Result<Option<u8>, io::Error> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.pos += 1;
                    return Ok(Some(buf[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read exactly `buf.len()` bytes; `Ok(false)` on clean EOF mid-read.
    fn read_exact_opt(&mut self, buf: &mut [u8]) -> Result<bool, io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    filled += n;
                    self.pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), io::Error> {
        self.inner.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    /// Read the frame body (crc + len + payload) that follows a marker.
    /// `Ok(None)` means the candidate is not a valid frame.
    fn try_read_body(&mut self) -> Result<Option<Vec<u8>>, io::Error> {
        let mut crc_buf = [0u8; 4];
        if !self.read_exact_opt(&mut crc_buf)? {
            return Ok(None);
        }
        let expected_crc = u32::from_le_bytes(crc_buf);

        let mut len_buf = [0u8; 4];
        if !self.read_exact_opt(&mut len_buf)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_PAYLOAD_LEN {
            return Ok(None);
        }

        let mut payload = vec![0u8; len as usize];
        if !self.read_exact_opt(&mut payload)? {
            return Ok(None);
        }

        if crc32fast::hash(&payload) != expected_crc {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// Scan for the next valid record frame at or after the current
    /// position. Returns `(frame_start_pos, record, next_pos)`.
    pub(crate) fn next_record(
        &mut self,
        recovery: &RecoveryFn,
    ) -> Result<Option<(u64, DeltaRecord, u64)>, DataError> {
        let mut window: [u8; 4] = [0; 4];
        let mut filled = 0usize;
        let mut window_start = self.pos;

        loop {
            while filled < 4 {
                match self.read_byte()? {
                    Some(b) => {
                        window[filled] = b;
                        filled += 1;
                    }
                    None => {
                        return self.finish_at_eof(recovery);
                    }
                }
            }

            if window == RECORD_MAGIC {
                let frame_start = window_start;
                match self.try_read_body()? {
                    Some(payload) => match serde_json::from_slice::<DeltaRecord>(&payload) {
                        Ok(record) => {
                            if let Some(skip_start) = self.pending_skip_start.take() {
                                let region = SkippedRegion {
                                    begin: skip_start,
                                    end: frame_start,
                                };
                                if !recovery(&region) {
                                    return Err(DataError::Internal(format!(
                                        "unrecoverable corrupt region {region}"
                                    )));
                                }
                            }
                            self.synced = true;
                            return Ok(Some((frame_start, record, self.pos)));
                        }
                        Err(_) => self.mark_corrupt_and_resync(frame_start)?,
                    },
                    None => self.mark_corrupt_and_resync(frame_start)?,
                }
                filled = 0;
                window_start = self.pos;
            } else {
                // A byte that is not the start of a record where one was
                // expected begins a corrupt run.
                if self.synced && self.pending_skip_start.is_none() {
                    self.pending_skip_start = Some(window_start);
                }
                window.rotate_left(1);
                filled = 3;
                window_start += 1;
            }
        }
    }

    fn mark_corrupt_and_resync(&mut self, frame_start: u64) -> Result<(), io::Error> {
        if self.synced && self.pending_skip_start.is_none() {
            self.pending_skip_start = Some(frame_start);
        }
        self.seek_to(frame_start + 1)
    }

    fn finish_at_eof(
        &mut self,
        recovery: &RecoveryFn,
    ) -> Result<Option<(u64, DeltaRecord, u64)>, DataError> {
        if let Some(skip_start) = self.pending_skip_start.take() {
            let region = SkippedRegion {
                begin: skip_start,
                end: self.pos,
            };
            if !recovery(&region) {
                return Err(DataError::Internal(format!(
                    "unrecoverable corrupt region {region}"
                )));
            }
        }
        Ok(None)
    }

    /// Read the metadata header. Only valid at position 0, before any
    /// record has been read.
    pub(crate) fn read_header(&mut self) -> Result<DeltaFileMetadata, DataError> {
        let mut magic = [0u8; 4];
        if !self.read_exact_opt(&mut magic)? {
            return Err(DataError::InvalidFormat("empty delta file".into()));
        }
        if magic != HEADER_MAGIC {
            return Err(DataError::InvalidFormat(
                "delta file does not start with a metadata header".into(),
            ));
        }
        let payload = self
            .try_read_body()?
            .ok_or_else(|| DataError::InvalidFormat("corrupt delta file header".into()))?;
        let metadata = serde_json::from_slice(&payload)?;
        self.synced = true;
        Ok(metadata)
    }
}
