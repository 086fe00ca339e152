//! Segment references and the per-stream segment index.
//
// A SegmentIndex is an ordered sequence of references to media byte ranges, finite for VOD and
// unbounded for live (the manifest updater appends new references through `merge` while the
// engine holds cursors into the index). Positions are stable for the lifetime of the index:
// eviction advances `first_position` instead of renumbering, so a cursor created before an
// eviction still addresses the same segments afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::trace;
use url::Url;

/// A non-media preamble (codec configuration) that must be appended before any media segment of
/// its stream. Shared by many [SegmentReference]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegmentReference {
    pub uris: Vec<Url>,
    /// `(first_byte, last_byte)`; `None` end means "to end of resource".
    pub byte_range: (u64, Option<u64>),
}

impl InitSegmentReference {
    pub fn new(uris: Vec<Url>, byte_range: (u64, Option<u64>)) -> Self {
        InitSegmentReference { uris, byte_range }
    }

    /// Known size in bytes, when the byte range is bounded.
    pub fn size_bytes(&self) -> Option<u64> {
        self.byte_range.1.map(|end| end + 1 - self.byte_range.0)
    }
}

/// A pointer to one media segment: a byte range of a resource plus its media-time coverage.
#[derive(Debug, Clone)]
pub struct SegmentReference {
    /// Presentation time this segment starts at, in seconds.
    pub start_time: f64,
    /// Presentation time this segment ends at. Always greater than `start_time`.
    pub end_time: f64,
    pub uris: Vec<Url>,
    /// `(first_byte, last_byte)`; a `None` last byte means the size is unknown and must be
    /// estimated from bandwidth × duration.
    pub byte_range: (u64, Option<u64>),
    pub init: Option<Arc<InitSegmentReference>>,
    /// Offset applied by the sink when appending, so period-local media timestamps land at the
    /// right presentation time.
    pub timestamp_offset: f64,
    pub append_window_start: f64,
    pub append_window_end: f64,
}

impl SegmentReference {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Known size in bytes, when the byte range is bounded.
    pub fn size_bytes(&self) -> Option<u64> {
        self.byte_range.1.map(|end| end + 1 - self.byte_range.0)
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    refs: VecDeque<Arc<SegmentReference>>,
    /// Position of `refs[0]`. Starts at 0 and only grows, as eviction drops the front.
    first_position: u64,
}

/// Ordered, seekable sequence of [SegmentReference]s for one stream.
///
/// Cheaply cloneable; clones share the same underlying sequence, which is how live updates
/// published by the manifest updater become visible to engine cursors.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    inner: Arc<RwLock<IndexInner>>,
}

impl SegmentIndex {
    pub fn new(refs: Vec<SegmentReference>) -> Self {
        debug_assert!(refs.windows(2).all(|w| w[0].start_time < w[1].start_time),
                      "segment references must be strictly monotonic in start_time");
        SegmentIndex {
            inner: Arc::new(RwLock::new(IndexInner {
                refs: refs.into_iter().map(Arc::new).collect(),
                first_position: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().refs.is_empty()
    }

    /// Position of the earliest reference still in the index.
    pub fn first_position(&self) -> u64 {
        self.inner.read().unwrap().first_position
    }

    /// One past the position of the last reference.
    pub fn end_position(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.first_position + inner.refs.len() as u64
    }

    /// The reference at `position`, or `None` if it has been evicted or does not exist yet.
    pub fn get(&self, position: u64) -> Option<Arc<SegmentReference>> {
        let inner = self.inner.read().unwrap();
        let idx = position.checked_sub(inner.first_position)?;
        inner.refs.get(idx as usize).cloned()
    }

    pub fn first(&self) -> Option<Arc<SegmentReference>> {
        self.inner.read().unwrap().refs.front().cloned()
    }

    pub fn last(&self) -> Option<Arc<SegmentReference>> {
        self.inner.read().unwrap().refs.back().cloned()
    }

    /// Position of the segment covering `media_time`, or of the segment strictly after it when
    /// `media_time` falls in a gap (including before the first segment). `None` past the end.
    pub fn find(&self, media_time: f64) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        // first reference whose end_time is after media_time
        let idx = inner.refs.partition_point(|r| r.end_time <= media_time);
        if idx == inner.refs.len() {
            return None;
        }
        Some(inner.first_position + idx as u64)
    }

    /// Drop references that end at or before `older_than`. Outstanding `Arc`s to the dropped
    /// references stay valid; positions of the survivors do not change.
    pub fn evict(&self, older_than: f64) {
        let mut inner = self.inner.write().unwrap();
        let mut dropped = 0u64;
        while let Some(front) = inner.refs.front() {
            if front.end_time <= older_than {
                inner.refs.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }
        if dropped > 0 {
            inner.first_position += dropped;
            trace!("evicted {dropped} segment references older than {older_than}");
        }
    }

    /// Fold in references from a live update. Idempotent for overlapping ranges: a reference
    /// whose `start_time` matches an existing one replaces it (newer definitions win); other
    /// overlaps are discarded; references after the current end are appended.
    pub fn merge_refs<I>(&self, additions: I)
    where
        I: IntoIterator<Item = SegmentReference>,
    {
        let mut inner = self.inner.write().unwrap();
        for r in additions {
            let idx = inner.refs.partition_point(|e| e.start_time < r.start_time - 0.001);
            match inner.refs.get(idx) {
                Some(existing) if (existing.start_time - r.start_time).abs() < 0.001 => {
                    inner.refs[idx] = Arc::new(r);
                }
                Some(_) => {
                    // overlaps an existing reference without matching its start; ignore
                }
                None => {
                    inner.refs.push_back(Arc::new(r));
                }
            }
        }
    }

    /// Fold another index's references into this one; see [merge_refs](Self::merge_refs).
    pub fn merge(&self, other: &SegmentIndex) {
        let refs: Vec<SegmentReference> = {
            let o = other.inner.read().unwrap();
            o.refs.iter().map(|r| (**r).clone()).collect()
        };
        self.merge_refs(refs);
    }

    /// A restartable cursor positioned at the segment covering `media_time` (or the first one
    /// after it).
    pub fn iterator_from(&self, media_time: f64) -> SegmentCursor {
        let pos = self.find(media_time).unwrap_or_else(|| self.end_position());
        SegmentCursor { index: self.clone(), next_position: pos }
    }

    pub fn iterator_from_position(&self, position: u64) -> SegmentCursor {
        SegmentCursor { index: self.clone(), next_position: position }
    }
}

/// Cursor into a [SegmentIndex]. `next()` returns the reference at the cursor and advances; the
/// index may grow underneath it (live), in which case a cursor that previously hit the end
/// resumes returning references.
#[derive(Debug, Clone)]
pub struct SegmentCursor {
    index: SegmentIndex,
    next_position: u64,
}

impl SegmentCursor {
    pub fn next(&mut self) -> Option<Arc<SegmentReference>> {
        let r = self.index.get(self.next_position)?;
        self.next_position += 1;
        Some(r)
    }

    /// The position `next()` will return, without advancing.
    pub fn peek_position(&self) -> u64 {
        self.next_position
    }

    pub fn peek(&self) -> Option<Arc<SegmentReference>> {
        self.index.get(self.next_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Vec<Url> {
        vec![Url::parse(s).unwrap()]
    }

    fn make_ref(start: f64, end: f64, name: &str) -> SegmentReference {
        SegmentReference {
            start_time: start,
            end_time: end,
            uris: uri(&format!("https://origin.example.com/{name}")),
            byte_range: (0, None),
            init: None,
            timestamp_offset: 0.0,
            append_window_start: 0.0,
            append_window_end: f64::INFINITY,
        }
    }

    fn index_of(n: usize, seg_dur: f64) -> SegmentIndex {
        SegmentIndex::new(
            (0..n)
                .map(|i| make_ref(i as f64 * seg_dur, (i + 1) as f64 * seg_dur, &format!("s{i}.mp4")))
                .collect(),
        )
    }

    #[test]
    fn test_find_covers_and_gaps() {
        let idx = index_of(4, 10.0);
        assert_eq!(idx.find(0.0), Some(0));
        assert_eq!(idx.find(9.999), Some(0));
        assert_eq!(idx.find(10.0), Some(1));
        assert_eq!(idx.find(35.0), Some(3));
        assert_eq!(idx.find(40.0), None);
        // a gap before the first segment resolves to the first segment
        let gappy = SegmentIndex::new(vec![make_ref(5.0, 10.0, "a"), make_ref(20.0, 30.0, "b")]);
        assert_eq!(gappy.find(0.0), Some(0));
        assert_eq!(gappy.find(12.0), Some(1));
    }

    #[test]
    fn test_eviction_keeps_positions_stable() {
        let idx = index_of(4, 10.0);
        let s3 = idx.get(3).unwrap();
        idx.evict(20.0);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.first_position(), 2);
        assert!(idx.get(0).is_none());
        assert!(idx.get(1).is_none());
        assert_eq!(idx.get(2).unwrap().start_time, 20.0);
        // a reference obtained before eviction stays valid
        assert_eq!(s3.start_time, idx.get(3).unwrap().start_time);
        // evicting mid-segment keeps the covering segment
        idx.evict(25.0);
        assert_eq!(idx.first_position(), 2);
    }

    #[test]
    fn test_merge_appends_and_is_idempotent() {
        let idx = index_of(2, 1.0); // [(0,1), (1,2)]
        idx.merge_refs(vec![make_ref(2.0, 3.0, "s2.mp4")]);
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.last().unwrap().start_time, 2.0);
        // re-declaring an existing segment is a no-op for the shape of the index
        idx.merge_refs(vec![make_ref(2.0, 3.0, "s2.mp4")]);
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.end_position(), 3);
    }

    #[test]
    fn test_merge_same_start_newer_wins() {
        let idx = index_of(2, 10.0);
        idx.merge_refs(vec![make_ref(10.0, 21.0, "s1-longer.mp4")]);
        assert_eq!(idx.len(), 2);
        let r = idx.get(1).unwrap();
        assert_eq!(r.end_time, 21.0);
        assert!(r.uris[0].as_str().ends_with("s1-longer.mp4"));
    }

    #[test]
    fn test_cursor_sees_live_growth() {
        let idx = index_of(2, 10.0);
        let mut cur = idx.iterator_from(15.0);
        assert_eq!(cur.next().unwrap().start_time, 10.0);
        assert!(cur.next().is_none());
        idx.merge_refs(vec![make_ref(20.0, 30.0, "s2.mp4")]);
        assert_eq!(cur.next().unwrap().start_time, 20.0);
    }

    #[test]
    fn test_init_reference_size() {
        let init = InitSegmentReference::new(uri("https://origin.example.com/init.mp4"), (0, Some(811)));
        assert_eq!(init.size_bytes(), Some(812));
        let unbounded = InitSegmentReference::new(uri("https://origin.example.com/init.mp4"), (0, None));
        assert_eq!(unbounded.size_bytes(), None);
    }
}
