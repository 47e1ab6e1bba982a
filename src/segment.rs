use crate::codec::aac::AacConfig;
use crate::errors::{HlsError, Result};
use crate::transport_stream::TsMuxer;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Produces unique, monotonically increasing segment names.
///
/// Names are millisecond unix timestamps; two cuts inside the same
/// millisecond fall back to `last + 1` so a name never repeats.
pub struct SegmentNamer {
    last: i64,
}

impl SegmentNamer {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next(&mut self) -> String {
        let id = Utc::now().timestamp_millis().max(self.last + 1);
        self.last = id;
        id.to_string()
    }
}

impl Default for SegmentNamer {
    fn default() -> Self {
        Self::new()
    }
}

struct SegmentInner {
    muxer: TsMuxer,
    buf: BytesMut,
    first_written_at: Option<Instant>,
    closed: bool,
}

/// One in-memory MPEG-TS segment.
///
/// The writer appends whole access units under the inner mutex; readers take
/// byte snapshots, so a reader never observes a torn write and every snapshot
/// is a prefix of the segment's final content. A snapshot stays valid after
/// the segment leaves the window.
pub struct TsSegment {
    name: String,
    has_video: bool,
    inner: Mutex<SegmentInner>,
}

impl TsSegment {
    pub fn new(name: String, has_video: bool, has_audio: bool) -> Result<Self> {
        let muxer = TsMuxer::new(has_video, has_audio);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&muxer.tables()?);
        Ok(Self {
            name,
            has_video,
            inner: Mutex::new(SegmentInner {
                muxer,
                buf,
                first_written_at: None,
                closed: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    pub fn set_pcr(&self, elapsed: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.muxer.set_pcr(elapsed)
    }

    pub fn write_h264(
        &self,
        dts: Duration,
        pts: Duration,
        idr: bool,
        nalus: &[Bytes],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(HlsError::MuxError {
                message: format!("segment {} is closed", self.name),
            });
        }
        let packets = inner.muxer.mux_h264(dts, pts, idr, nalus)?;
        inner.buf.extend_from_slice(&packets);
        inner.first_written_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    pub fn write_aac(&self, config: &AacConfig, pts: Duration, au: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(HlsError::MuxError {
                message: format!("segment {} is closed", self.name),
            });
        }
        let frame = config.adts_frame(au);
        let packets = inner.muxer.mux_aac(pts, &frame)?;
        inner.buf.extend_from_slice(&packets);
        inner.first_written_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// True once the first access unit landed.
    pub fn first_written(&self) -> bool {
        self.inner.lock().unwrap().first_written_at.is_some()
    }

    /// Time since the first access unit, zero before any write.
    pub fn age(&self) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .first_written_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Independent snapshot of the current segment bytes.
    pub fn reader(&self) -> Bytes {
        let inner = self.inner.lock().unwrap();
        Bytes::copy_from_slice(&inner.buf)
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

/// Ordered set of live segments, oldest first, bounded by the configured
/// segment count. Evicting a segment drops index visibility only; readers
/// created earlier keep their bytes.
pub struct SegmentWindow {
    queue: VecDeque<Arc<TsSegment>>,
    by_name: HashMap<String, Arc<TsSegment>>,
    deleted_count: u64,
    max_segments: usize,
}

impl SegmentWindow {
    pub fn new(max_segments: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            by_name: HashMap::new(),
            deleted_count: 0,
            max_segments,
        }
    }

    /// Pushes a segment, evicting and returning the oldest one when the
    /// window overflows.
    pub fn append(&mut self, segment: Arc<TsSegment>) -> Option<Arc<TsSegment>> {
        self.by_name
            .insert(segment.name().to_string(), segment.clone());
        self.queue.push_back(segment);

        if self.queue.len() > self.max_segments {
            let evicted = self.queue.pop_front().unwrap();
            self.by_name.remove(evicted.name());
            self.deleted_count += 1;
            return Some(evicted);
        }
        None
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<TsSegment>> {
        self.by_name.get(name).cloned()
    }

    /// Segment names in order plus the total evicted count, for playlist
    /// rendering.
    pub fn snapshot(&self) -> (Vec<String>, u64) {
        (
            self.queue.iter().map(|s| s.name().to_string()).collect(),
            self.deleted_count,
        )
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str) -> Arc<TsSegment> {
        Arc::new(TsSegment::new(name.to_string(), true, false).unwrap())
    }

    #[test]
    fn test_namer_is_strictly_increasing() {
        let mut namer = SegmentNamer::new();
        let a: i64 = namer.next().parse().unwrap();
        let b: i64 = namer.next().parse().unwrap();
        let c: i64 = namer.next().parse().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_segment_starts_with_tables() {
        let seg = segment("1");
        let bytes = seg.reader();
        assert_eq!(bytes.len(), 2 * 188);
        assert_eq!(bytes[0], 0x47);
        assert!(!seg.first_written());
    }

    #[test]
    fn test_segment_write_and_reader_prefix() {
        let seg = segment("1");
        let before = seg.reader();

        seg.set_pcr(Duration::from_millis(1)).unwrap();
        seg.write_h264(
            Duration::from_secs(2),
            Duration::from_secs(2),
            true,
            &[Bytes::from_static(&[0x65, 0x01, 0x02])],
        )
        .unwrap();

        assert!(seg.first_written());
        let after = seg.reader();
        assert!(after.len() > before.len());
        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn test_segment_rejects_writes_after_close() {
        let seg = segment("1");
        seg.close();
        let err = seg.write_h264(
            Duration::from_secs(2),
            Duration::from_secs(2),
            true,
            &[Bytes::from_static(&[0x65])],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_window_eviction() {
        let mut window = SegmentWindow::new(3);
        for i in 0..3 {
            assert!(window.append(segment(&i.to_string())).is_none());
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.deleted_count(), 0);

        let evicted = window.append(segment("3")).unwrap();
        assert_eq!(evicted.name(), "0");
        assert_eq!(window.len(), 3);
        assert_eq!(window.deleted_count(), 1);
        assert!(window.lookup("0").is_none());
        assert!(window.lookup("3").is_some());

        let (names, deleted) = window.snapshot();
        assert_eq!(names, vec!["1", "2", "3"]);
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_window_index_matches_queue() {
        let mut window = SegmentWindow::new(2);
        for i in 0..5 {
            window.append(segment(&i.to_string()));
            let (names, _) = window.snapshot();
            for name in &names {
                assert!(window.lookup(name).is_some());
            }
            assert_eq!(names.len(), window.len());
        }
        assert_eq!(window.deleted_count(), 3);
    }

    #[test]
    fn test_evicted_segment_stays_readable() {
        let mut window = SegmentWindow::new(1);
        let first = segment("0");
        window.append(first.clone());
        let reader = first.reader();
        let evicted = window.append(segment("1")).unwrap();
        assert_eq!(evicted.reader(), reader);
    }
}
