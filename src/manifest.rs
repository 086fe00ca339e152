//! The manifest model the engine consumes: streams, variants, and the shared handle the live
//! updater publishes through.
//
// Several variants routinely alias the same stream (one audio rendition paired with every video
// bitrate, for example). Streams therefore live in an arena keyed by StreamId and everything else
// holds ids, never references; the updater is the only writer and bumps a version counter after
// publishing, which the engine's tracks consult after each suspension point.

use crate::segment::SegmentIndex;
use crate::timeline::PresentationTimeline;
use crate::{MseError, TrackType};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Stable key of a stream in the manifest arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// What kind of content a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Audio,
    Video,
    Text,
    Image,
    TrickVideo,
}

impl ContentType {
    /// The engine track this content plays on. Trick-mode video plays on the video track;
    /// image streams (thumbnails) are not streamed by the engine.
    pub fn track(&self) -> Option<TrackType> {
        match self {
            ContentType::Audio => Some(TrackType::Audio),
            ContentType::Video | ContentType::TrickVideo => Some(TrackType::Video),
            ContentType::Text => Some(TrackType::Text),
            ContentType::Image => None,
        }
    }
}

/// Deferred construction of a stream's [SegmentIndex]; may need the network (e.g. a segment-index
/// box fetch), so it can fail with a network or manifest error.
pub type IndexFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<SegmentIndex, MseError>> + Send + Sync>;

/// One elementary stream (a DASH Representation).
#[derive(Clone)]
pub struct Stream {
    pub id: StreamId,
    /// Identity of this stream in the source manifest (`Representation@id`), stable across
    /// periods and manifest updates. `None` for synthesised streams.
    pub rep_id: Option<String>,
    pub content_type: ContentType,
    pub mime: String,
    pub codecs: String,
    /// Average bandwidth in bits per second; used for size estimates when byte ranges are open.
    pub bandwidth: u64,
    pub language: Option<String>,
    pub roles: Vec<String>,
    pub label: Option<String>,
    /// Marked as the default/primary rendition by the manifest.
    pub primary: bool,
    pub channel_count: Option<u32>,
    /// emsg scheme ids the application wants surfaced from this stream's segments.
    pub emsg_scheme_id_uris: Vec<String>,
    /// Alternate low-framerate video stream used for trick-mode playback.
    pub trick_mode_video: Option<StreamId>,
    /// `None` until materialised through [Manifest::take_index_factory] + publication.
    pub segment_index: Option<SegmentIndex>,
    pub(crate) index_factory: Option<IndexFactory>,
    /// Latch making index creation at-most-once-in-flight.
    pub(crate) index_pending: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("mime", &self.mime)
            .field("codecs", &self.codecs)
            .field("bandwidth", &self.bandwidth)
            .field("language", &self.language)
            .field("has_index", &self.segment_index.is_some())
            .finish()
    }
}

impl Stream {
    /// A stream with the given content type and no index; fill in metadata field-by-field.
    pub fn new(content_type: ContentType, mime: &str, codecs: &str) -> Self {
        Stream {
            id: StreamId(0),
            rep_id: None,
            content_type,
            mime: mime.to_string(),
            codecs: codecs.to_string(),
            bandwidth: 0,
            language: None,
            roles: Vec::new(),
            label: None,
            primary: false,
            channel_count: None,
            emsg_scheme_id_uris: Vec::new(),
            trick_mode_video: None,
            segment_index: None,
            index_factory: None,
            index_pending: false,
        }
    }

    pub fn with_index(mut self, index: SegmentIndex) -> Self {
        self.segment_index = Some(index);
        self
    }

    pub fn with_index_factory(mut self, factory: IndexFactory) -> Self {
        self.index_factory = Some(factory);
        self
    }
}

/// A selectable (audio, video) pairing.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: u32,
    pub audio: Option<StreamId>,
    pub video: Option<StreamId>,
    /// Combined bandwidth of the paired streams, in bits per second.
    pub bandwidth: u64,
    pub language: Option<String>,
    pub allowed_by_application: bool,
    pub allowed_by_key_system: bool,
}

impl Variant {
    pub fn stream(&self, track: TrackType) -> Option<StreamId> {
        match track {
            TrackType::Audio => self.audio,
            TrackType::Video => self.video,
            TrackType::Text => None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed_by_application && self.allowed_by_key_system
    }
}

/// Immutable view of the presentation the engine streams from. Mutation after parse happens only
/// through the manifest updater, via [SharedManifest::modify].
#[derive(Debug)]
pub struct Manifest {
    pub timeline: PresentationTimeline,
    streams: BTreeMap<StreamId, Stream>,
    pub variants: Vec<Variant>,
    pub text_streams: Vec<StreamId>,
    pub image_streams: Vec<StreamId>,
    /// Manifest-declared minimum buffer, in seconds.
    pub min_buffer_time: f64,
    next_stream_id: u32,
}

impl Manifest {
    pub fn new(timeline: PresentationTimeline) -> Self {
        Manifest {
            timeline,
            streams: BTreeMap::new(),
            variants: Vec::new(),
            text_streams: Vec::new(),
            image_streams: Vec::new(),
            min_buffer_time: 2.0,
            next_stream_id: 0,
        }
    }

    /// Move a stream into the arena, assigning its id.
    pub fn add_stream(&mut self, mut stream: Stream) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        stream.id = id;
        self.streams.insert(id, stream);
        id
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn variant(&self, id: u32) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Claim the index factory for a stream, flipping the in-flight latch. Returns `None` when
    /// the index already exists, creation is already in flight, or there is nothing to create.
    pub fn take_index_factory(&mut self, id: StreamId) -> Option<IndexFactory> {
        let stream = self.streams.get_mut(&id)?;
        if stream.segment_index.is_some() || stream.index_pending {
            return None;
        }
        let factory = stream.index_factory.clone()?;
        stream.index_pending = true;
        Some(factory)
    }

    /// Publish the result of an index factory run.
    pub fn finish_index_creation(&mut self, id: StreamId, index: Option<SegmentIndex>) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.index_pending = false;
            if stream.segment_index.is_none() {
                stream.segment_index = index;
            }
        }
    }
}

/// Shared, versioned handle on the manifest. Readers never block writers for long: no lock is
/// held across a suspension point anywhere in the crate.
#[derive(Clone)]
pub struct SharedManifest {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    manifest: RwLock<Manifest>,
    version: AtomicU64,
}

impl SharedManifest {
    pub fn new(manifest: Manifest) -> Self {
        SharedManifest {
            inner: Arc::new(SharedInner { manifest: RwLock::new(manifest), version: AtomicU64::new(0) }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Manifest> {
        self.inner.manifest.read().unwrap()
    }

    /// Run a mutation and bump the version so engine tracks re-validate their cursors. New
    /// segment index entries must be merged inside `f`, before the version moves.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Manifest) -> R) -> R {
        let r = {
            let mut guard = self.inner.manifest.write().unwrap();
            f(&mut guard)
        };
        self.inner.version.fetch_add(1, Ordering::Release);
        r
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }
}
