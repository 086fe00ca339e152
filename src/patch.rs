//! MPD-Patch application and live manifest updating.
//
// A dynamic manifest is refreshed either by refetching the whole document or, when the manifest
// advertises a PatchLocation, by fetching a small MPD-Patch diff (ISO/IEC 23009-1, schema
// urn:mpeg:dash:schema:mpd-patch:2020) and applying it to the manifest DOM. We keep the manifest
// as an xmltree DOM, apply patch operations to a clone of it, serialize the result and re-parse it
// with the typed model, then reconcile the parsed representation timelines into the engine's
// segment indexes through `SegmentIndex::merge_refs`. An invalid patch therefore never leaves a
// half-updated manifest behind: the clone is simply dropped.
//
// The XPath subset accepted in `sel` attributes is the one MPD patches actually use: child steps,
// attribute predicates `[@attr='v']`, positional predicates `[n]` (1-based, counted per element
// name), and a trailing attribute axis `/@name`.

use crate::manifest::SharedManifest;
use crate::mpd::{expand_representations, manifest_from_mpd, parse_mpd, parse_mpd_datetime, MPD};
use crate::{parse_xs_duration_secs, MseError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use url::Url;
use xmltree::{Element, XMLNode};

/// What the owner should fetch next to keep a dynamic manifest fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Fetch an MPD-Patch document from this location.
    Patch(Url),
    /// Refetch the full manifest.
    Full(Url),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Attr(String, String),
    Position(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    name: String,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
struct Selector {
    steps: Vec<Step>,
    /// Trailing `/@name` attribute axis, if any.
    attribute: Option<String>,
}

fn parse_step(s: &str) -> Result<Step, MseError> {
    let bad = |why: &str| MseError::DashInvalidPatch(format!("selector step {s:?}: {why}"));
    let (name, rest) = match s.find('[') {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    };
    if name.is_empty() {
        return Err(bad("empty element name"));
    }
    let mut predicates = Vec::new();
    let mut rest = rest;
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(bad("malformed predicate"));
        }
        let close = rest.find(']').ok_or_else(|| bad("unterminated predicate"))?;
        let body = &rest[1..close];
        rest = &rest[close + 1..];
        if let Some(attr_body) = body.strip_prefix('@') {
            let (attr, value) = attr_body
                .split_once('=')
                .ok_or_else(|| bad("attribute predicate without comparison"))?;
            let value = value.trim_matches('\'').trim_matches('"');
            predicates.push(Predicate::Attr(attr.to_string(), value.to_string()));
        } else {
            let n: usize = body.trim().parse().map_err(|_| bad("non-numeric position"))?;
            if n == 0 {
                return Err(bad("positions are 1-based"));
            }
            predicates.push(Predicate::Position(n));
        }
    }
    Ok(Step { name: name.to_string(), predicates })
}

fn parse_selector(sel: &str) -> Result<Selector, MseError> {
    let trimmed = sel.strip_prefix('/').ok_or_else(|| {
        MseError::DashInvalidPatch(format!("selector {sel:?} is not absolute"))
    })?;
    let mut steps = Vec::new();
    let mut attribute = None;
    for part in trimmed.split('/') {
        if let Some(attr) = part.strip_prefix('@') {
            attribute = Some(attr.to_string());
            break;
        }
        if part.is_empty() {
            return Err(MseError::DashInvalidPatch(format!("selector {sel:?} has an empty step")));
        }
        steps.push(parse_step(part)?);
    }
    if steps.is_empty() {
        return Err(MseError::DashInvalidPatch(format!("selector {sel:?} selects nothing")));
    }
    Ok(Selector { steps, attribute })
}

fn predicates_match(el: &Element, predicates: &[Predicate], nth_same_name: usize) -> bool {
    predicates.iter().all(|p| match p {
        Predicate::Attr(name, value) => el.attributes.get(name).map(String::as_str) == Some(value),
        Predicate::Position(n) => *n == nth_same_name,
    })
}

// Index into `parent.children` of the child matched by `step`, counting positions per element
// name as XPath does.
fn find_child_index(parent: &Element, step: &Step) -> Option<usize> {
    let mut nth = 0;
    for (i, node) in parent.children.iter().enumerate() {
        if let Some(ce) = node.as_element() {
            if ce.name == step.name {
                nth += 1;
                if predicates_match(ce, &step.predicates, nth) {
                    return Some(i);
                }
            }
        }
    }
    None
}

fn navigate<'a>(root: &'a mut Element, steps: &[Step]) -> Result<&'a mut Element, MseError> {
    let first = &steps[0];
    if root.name != first.name || !predicates_match(root, &first.predicates, 1) {
        return Err(MseError::DashInvalidPatch(format!(
            "selector root {} does not match document root {}", first.name, root.name)));
    }
    let mut current = root;
    for step in &steps[1..] {
        let idx = find_child_index(current, step).ok_or_else(|| {
            MseError::DashInvalidPatch(format!("no element matching step {:?}", step.name))
        })?;
        current = current.children[idx]
            .as_mut_element()
            .expect("find_child_index returns element nodes");
    }
    Ok(current)
}

fn text_content(el: &Element) -> String {
    el.children
        .iter()
        .filter_map(|n| match n {
            XMLNode::Text(t) => Some(t.as_str()),
            XMLNode::CData(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string()
}

fn element_children(el: &Element) -> Vec<XMLNode> {
    el.children
        .iter()
        .filter(|n| n.as_element().is_some())
        .cloned()
        .collect()
}

fn apply_add(dom: &mut Element, op: &Element) -> Result<(), MseError> {
    let sel = op.attributes.get("sel")
        .ok_or_else(|| MseError::DashInvalidPatch(String::from("add without @sel")))?;
    let selector = parse_selector(sel)?;
    if let Some(attr) = &selector.attribute {
        // `<add sel=".../@x">v</add>` introduces an attribute
        let target = navigate(dom, &selector.steps)?;
        target.attributes.insert(attr.clone(), text_content(op));
        return Ok(());
    }
    if let Some(type_attr) = op.attributes.get("type") {
        let name = type_attr.strip_prefix('@').ok_or_else(|| {
            MseError::DashInvalidPatch(format!("add @type {type_attr:?} is not an attribute name"))
        })?;
        let target = navigate(dom, &selector.steps)?;
        target.attributes.insert(name.to_string(), text_content(op));
        return Ok(());
    }
    let insertions = element_children(op);
    if insertions.is_empty() {
        return Err(MseError::DashInvalidPatch(String::from("add with no element content")));
    }
    if op.attributes.get("pos").map(String::as_str) == Some("after") {
        let inserted_name = insertions[0]
            .as_element()
            .map(|e| e.name.clone())
            .unwrap_or_default();
        // When the selector addresses a container that already holds elements of the inserted
        // kind (e.g. sel=".../SegmentTimeline" inserting <S>), "after" means after the last of
        // those children. When it addresses a sibling of the inserted kind (e.g. sel=".../S[@t='0']"),
        // "after" means right after that sibling.
        let target = navigate(dom, &selector.steps)?;
        let last_same_name = target
            .children
            .iter()
            .rposition(|n| n.as_element().is_some_and(|e| e.name == inserted_name));
        if let Some(idx) = last_same_name {
            for (off, node) in insertions.into_iter().enumerate() {
                target.children.insert(idx + 1 + off, node);
            }
        } else {
            if selector.steps.len() < 2 {
                return Err(MseError::DashInvalidPatch(String::from("pos=\"after\" on document root")));
            }
            let (parent_steps, last) = selector.steps.split_at(selector.steps.len() - 1);
            let parent = navigate(dom, parent_steps)?;
            let idx = find_child_index(parent, &last[0]).ok_or_else(|| {
                MseError::DashInvalidPatch(format!("no element matching step {:?}", last[0].name))
            })?;
            for (off, node) in insertions.into_iter().enumerate() {
                parent.children.insert(idx + 1 + off, node);
            }
        }
    } else {
        let target = navigate(dom, &selector.steps)?;
        target.children.extend(insertions);
    }
    Ok(())
}

fn apply_replace(dom: &mut Element, op: &Element) -> Result<(), MseError> {
    let sel = op.attributes.get("sel")
        .ok_or_else(|| MseError::DashInvalidPatch(String::from("replace without @sel")))?;
    let selector = parse_selector(sel)?;
    if let Some(attr) = &selector.attribute {
        let target = navigate(dom, &selector.steps)?;
        target.attributes.insert(attr.clone(), text_content(op));
        return Ok(());
    }
    if selector.steps.len() < 2 {
        return Err(MseError::DashInvalidPatch(String::from("cannot replace the document root")));
    }
    let insertions = element_children(op);
    if insertions.is_empty() {
        return Err(MseError::DashInvalidPatch(String::from("replace with no element content")));
    }
    let (parent_steps, last) = selector.steps.split_at(selector.steps.len() - 1);
    let parent = navigate(dom, parent_steps)?;
    let idx = find_child_index(parent, &last[0]).ok_or_else(|| {
        MseError::DashInvalidPatch(format!("no element matching step {:?}", last[0].name))
    })?;
    parent.children.remove(idx);
    for (off, node) in insertions.into_iter().enumerate() {
        parent.children.insert(idx + off, node);
    }
    Ok(())
}

fn apply_remove(dom: &mut Element, op: &Element) -> Result<(), MseError> {
    let sel = op.attributes.get("sel")
        .ok_or_else(|| MseError::DashInvalidPatch(String::from("remove without @sel")))?;
    let selector = parse_selector(sel)?;
    if let Some(attr) = &selector.attribute {
        let target = navigate(dom, &selector.steps)?;
        target.attributes.remove(attr);
        return Ok(());
    }
    if selector.steps.len() < 2 {
        return Err(MseError::DashInvalidPatch(String::from("cannot remove the document root")));
    }
    let (parent_steps, last) = selector.steps.split_at(selector.steps.len() - 1);
    let parent = navigate(dom, parent_steps)?;
    let idx = find_child_index(parent, &last[0]).ok_or_else(|| {
        MseError::DashInvalidPatch(format!("no element matching step {:?}", last[0].name))
    })?;
    parent.children.remove(idx);
    Ok(())
}

pub(crate) fn serialize_dom(dom: &Element) -> Result<String, MseError> {
    let mut buf = Vec::new();
    dom.write(&mut buf)
        .map_err(|e| MseError::Parsing(format!("serializing manifest DOM: {e}")))?;
    String::from_utf8(buf).map_err(|e| MseError::Parsing(format!("manifest DOM not UTF-8: {e}")))
}

/// Maintains the live manifest: owns its DOM and typed view, decides between patch and full
/// updates, applies patches, and publishes reconciled segment indexes through the shared handle.
pub struct ManifestUpdater {
    shared: SharedManifest,
    manifest_url: Url,
    dom: Element,
    mpd: MPD,
    publish_time: Option<DateTime<Utc>>,
    /// Representation ids already published as streams; later updates for unknown ids are
    /// reported and skipped rather than invented.
    known_reps: HashSet<String>,
}

impl ManifestUpdater {
    /// Parse the initial manifest and build the shared model the engine will stream from.
    pub fn from_xml(xml: &str, manifest_url: Url, now_epoch: f64) -> Result<Self, MseError> {
        let dom = Element::parse(xml.as_bytes())
            .map_err(|e| MseError::Parsing(format!("parsing manifest DOM: {e}")))?;
        if dom.name != "MPD" {
            return Err(MseError::Parsing(format!("root element is {}, expecting <MPD>", dom.name)));
        }
        let mpd = parse_mpd(xml)?;
        let manifest = manifest_from_mpd(&mpd, &manifest_url, now_epoch)?;
        let known_reps = manifest.streams().filter_map(|s| s.rep_id.clone()).collect();
        let publish_time = mpd.publish_time();
        let shared = SharedManifest::new(manifest);
        Ok(ManifestUpdater { shared, manifest_url, dom, mpd, publish_time, known_reps })
    }

    pub fn shared(&self) -> SharedManifest {
        self.shared.clone()
    }

    pub fn mpd(&self) -> &MPD {
        &self.mpd
    }

    /// Seconds the owner should wait between update requests, from `MPD@minimumUpdatePeriod`.
    pub fn minimum_update_period(&self) -> Option<f64> {
        self.mpd.minimumUpdatePeriod.as_deref().and_then(|s| parse_xs_duration_secs(s).ok())
    }

    /// Decide how the next manifest refresh should happen. `None` once the presentation has
    /// become static and no further updates are expected.
    pub fn update_request(&self, now_epoch: f64) -> Option<UpdateRequest> {
        if !self.mpd.is_dynamic() {
            return None;
        }
        let full = UpdateRequest::Full(self.manifest_url.clone());
        let Some(pl) = &self.mpd.patch_location else {
            return Some(full);
        };
        let Some(location) = &pl.location else {
            return Some(full);
        };
        let Some(publish_time) = self.publish_time else {
            debug!("manifest has PatchLocation but no publishTime; using full refetch");
            return Some(full);
        };
        if let Some(ttl) = pl.ttl {
            let age = now_epoch - publish_time.timestamp_millis() as f64 / 1000.0;
            if age > ttl {
                info!("patch TTL expired ({age:.1}s > {ttl:.1}s); using full refetch");
                return Some(full);
            }
        }
        match self.manifest_url.join(location) {
            Ok(url) => Some(UpdateRequest::Patch(url)),
            Err(e) => {
                warn!("unusable PatchLocation {location:?}: {e}");
                Some(full)
            }
        }
    }

    /// Replace the manifest from a full refetch.
    pub fn apply_full(&mut self, xml: &str, now_epoch: f64) -> Result<(), MseError> {
        let dom = Element::parse(xml.as_bytes())
            .map_err(|e| MseError::Parsing(format!("parsing manifest DOM: {e}")))?;
        let mpd = parse_mpd(xml)?;
        self.reconcile(&mpd, now_epoch)?;
        self.publish_time = mpd.publish_time();
        self.dom = dom;
        self.mpd = mpd;
        Ok(())
    }

    /// Apply an MPD-Patch document. On any validation or application failure the manifest is
    /// left exactly as it was and the error tells the owner to fall back to a full refetch.
    pub fn apply_patch(&mut self, patch_xml: &str, now_epoch: f64) -> Result<(), MseError> {
        let patch = Element::parse(patch_xml.as_bytes())
            .map_err(|e| MseError::DashInvalidPatch(format!("parsing patch: {e}")))?;
        if patch.name != "Patch" {
            return Err(MseError::DashInvalidPatch(format!(
                "root element is {}, expecting <Patch>", patch.name)));
        }
        let current_publish = self.publish_time.ok_or_else(|| {
            MseError::DashPatchUnusable(String::from("current manifest has no publishTime"))
        })?;
        if let Some(mpd_id) = patch.attributes.get("mpdId") {
            if self.mpd.id.as_deref() != Some(mpd_id.as_str()) {
                return Err(MseError::DashInvalidPatch(format!(
                    "patch mpdId {:?} does not match manifest id {:?}", mpd_id, self.mpd.id)));
            }
        }
        let original = patch.attributes.get("originalPublishTime").ok_or_else(|| {
            MseError::DashInvalidPatch(String::from("patch without originalPublishTime"))
        })?;
        let original_parsed = parse_mpd_datetime(original).ok_or_else(|| {
            MseError::DashInvalidPatch(format!("unparseable originalPublishTime {original:?}"))
        })?;
        if original_parsed != current_publish {
            return Err(MseError::DashInvalidPatch(format!(
                "patch originalPublishTime {original:?} does not match manifest publishTime")));
        }

        // apply to a clone so failure rolls back for free
        let mut dom = self.dom.clone();
        for node in &patch.children {
            let Some(op) = node.as_element() else { continue };
            match op.name.as_str() {
                "add" => apply_add(&mut dom, op)?,
                "replace" => apply_replace(&mut dom, op)?,
                "remove" => apply_remove(&mut dom, op)?,
                other => {
                    return Err(MseError::DashInvalidPatch(format!(
                        "unknown patch operation <{other}>")));
                }
            }
        }
        let xml = serialize_dom(&dom)?;
        let mpd = parse_mpd(&xml)
            .map_err(|e| MseError::DashInvalidPatch(format!("patched manifest unparseable: {e}")))?;
        self.reconcile(&mpd, now_epoch)?;
        self.publish_time = mpd.publish_time();
        self.dom = dom;
        self.mpd = mpd;
        Ok(())
    }

    // Push the updated representation timelines into the shared manifest: merge new references
    // into materialised indexes, refresh timeline attributes, purge references that fell out of
    // the availability window (periods disappear with their last reference, as streams span
    // periods). New segment index entries are published before the version counter moves.
    fn reconcile(&mut self, new_mpd: &MPD, now_epoch: f64) -> Result<(), MseError> {
        let expanded = expand_representations(new_mpd, &self.manifest_url, now_epoch)?;
        for rep_id in expanded.keys() {
            if !self.known_reps.contains(rep_id) {
                warn!("manifest update introduces unknown representation {rep_id:?}; ignoring it");
            }
        }
        let became_static = self.mpd.is_dynamic() && !new_mpd.is_dynamic();
        let new_duration = match &new_mpd.mediaPresentationDuration {
            Some(d) => Some(parse_xs_duration_secs(d)?),
            None => None,
        };
        self.shared.modify(|m| {
            if became_static {
                let duration = new_duration.unwrap_or_else(|| {
                    // no declared duration: close the presentation at the last reference
                    expanded.values()
                        .flat_map(|e| e.refs.last())
                        .map(|r| r.end_time)
                        .fold(0.0, f64::max)
                });
                info!("manifest became static, duration {duration}");
                m.timeline.make_static(duration);
            } else if let Some(d) = new_duration {
                m.timeline.set_duration_from_manifest(d);
            }
            if let Some(mbt) = &new_mpd.minBufferTime {
                if let Ok(secs) = parse_xs_duration_secs(mbt) {
                    m.min_buffer_time = secs;
                }
            }
            let availability_start = m.timeline.availability_window_start(now_epoch);
            let stream_ids: Vec<_> = m.streams().map(|s| s.id).collect();
            for sid in stream_ids {
                let Some(stream) = m.stream_mut(sid) else { continue };
                let Some(rep_id) = stream.rep_id.clone() else { continue };
                let Some(exp) = expanded.get(&rep_id) else { continue };
                let refs = exp.refs.clone();
                match stream.segment_index.clone() {
                    Some(index) => {
                        index.merge_refs(refs);
                        index.evict(availability_start);
                    }
                    None => {
                        // not yet materialised: replace the factory with the fresh expansion
                        stream.index_factory = Some(std::sync::Arc::new(
                            move || -> futures_util::future::BoxFuture<
                                'static,
                                Result<crate::segment::SegmentIndex, MseError>,
                            > {
                                let refs = refs.clone();
                                Box::pin(async move {
                                    Ok(crate::segment::SegmentIndex::new(refs))
                                })
                            },
                        ));
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    static LIVE_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" id="mpd-1" type="dynamic"
     availabilityStartTime="1970-01-01T00:00:00Z" publishTime="1970-01-01T00:00:01Z"
     minimumUpdatePeriod="PT2S" maxSegmentDuration="PT2S" minBufferTime="PT1S">
  <PatchLocation ttl="60">patches/manifest.patch.mpp</PatchLocation>
  <Period id="p1" start="PT0S">
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4">
      <Representation id="v" bandwidth="1000000">
        <SegmentTemplate media="s$Time$.mp4" timescale="1">
          <SegmentTimeline>
            <S t="0" d="1"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn url() -> Url {
        Url::parse("https://origin.example.com/live/manifest.mpd").unwrap()
    }

    fn materialize(shared: &SharedManifest) {
        // run the lazy index factory inline; template factories resolve immediately
        let sid = shared.read().variants[0].video.unwrap();
        let factory = shared.modify(|m| m.take_index_factory(sid)).unwrap();
        let index = futures_util::future::FutureExt::now_or_never(factory())
            .expect("template index factories are immediate")
            .unwrap();
        shared.modify(|m| m.finish_index_creation(sid, Some(index)));
    }

    fn segment_times(shared: &SharedManifest) -> Vec<(f64, f64)> {
        let sid = shared.read().variants[0].video.unwrap();
        let guard = shared.read();
        let index = guard.stream(sid).unwrap().segment_index.clone().unwrap();
        let mut out = Vec::new();
        let mut cursor = index.iterator_from_position(index.first_position());
        while let Some(r) = cursor.next() {
            out.push((r.start_time, r.end_time));
        }
        out
    }

    #[test]
    fn test_selector_parsing() {
        let s = parse_selector("/MPD/Period[@id='p1']/AdaptationSet[1]/SegmentTemplate/SegmentTimeline").unwrap();
        assert_eq!(s.steps.len(), 5);
        assert_eq!(s.steps[1].predicates,
                   vec![Predicate::Attr(String::from("id"), String::from("p1"))]);
        assert_eq!(s.steps[2].predicates, vec![Predicate::Position(1)]);
        assert_eq!(s.attribute, None);
        let s = parse_selector("/MPD/@type").unwrap();
        assert_eq!(s.steps.len(), 1);
        assert_eq!(s.attribute.as_deref(), Some("type"));
        assert!(parse_selector("MPD/Period").is_err());
    }

    #[test]
    fn test_update_request_prefers_patch_within_ttl() {
        let updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        match updater.update_request(10.0) {
            Some(UpdateRequest::Patch(u)) => {
                assert_eq!(u.as_str(), "https://origin.example.com/live/patches/manifest.patch.mpp");
            }
            other => panic!("expected patch request, got {other:?}"),
        }
        // TTL expired: fall back to the full manifest
        match updater.update_request(1000.0) {
            Some(UpdateRequest::Full(u)) => assert_eq!(u, url()),
            other => panic!("expected full request, got {other:?}"),
        }
    }

    #[test]
    fn test_patch_grows_segment_timeline() {
        let mut updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        let shared = updater.shared();
        materialize(&shared);
        assert_eq!(segment_times(&shared), vec![(0.0, 1.0)]);
        let patch = r#"<?xml version="1.0" encoding="UTF-8"?>
<Patch xmlns="urn:mpeg:dash:schema:mpd-patch:2020" mpdId="mpd-1"
       originalPublishTime="1970-01-01T00:00:01Z">
  <add sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline" pos="after">
    <S d="1" t="1"/>
  </add>
  <replace sel="/MPD/@publishTime">1970-01-01T00:00:03Z</replace>
</Patch>"#;
        // pos="after" inserting after the SegmentTimeline's last S is equivalent to appending
        // inside it; here the sel addresses the timeline element so content appends as children
        let version_before = shared.version();
        updater.apply_patch(patch, 3.0).unwrap();
        assert!(shared.version() > version_before);
        assert_eq!(segment_times(&shared), vec![(0.0, 1.0), (1.0, 2.0)]);
        // the updater now validates future patches against the new publishTime
        assert!(updater.publish_time.unwrap().timestamp() == 3);
    }

    #[test]
    fn test_patch_s_elements_addressed_by_attribute() {
        let mut updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        let shared = updater.shared();
        materialize(&shared);
        // replace the S with t=0 by attribute lookup, not by position
        let patch = r#"<Patch mpdId="mpd-1" originalPublishTime="1970-01-01T00:00:01Z">
  <replace sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline/S[@t='0']">
    <S t="0" d="2"/>
  </replace>
  <replace sel="/MPD/@publishTime">1970-01-01T00:00:05Z</replace>
</Patch>"#;
        updater.apply_patch(patch, 5.0).unwrap();
        assert_eq!(segment_times(&shared), vec![(0.0, 2.0)]);
    }

    #[test]
    fn test_invalid_patch_rolls_back() {
        let mut updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        let shared = updater.shared();
        materialize(&shared);
        let before = serialize_dom(&updater.dom).unwrap();
        // wrong mpdId
        let patch = r#"<Patch mpdId="other-mpd" originalPublishTime="1970-01-01T00:00:01Z">
  <add sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline"><S d="1" t="1"/></add>
</Patch>"#;
        match updater.apply_patch(patch, 3.0) {
            Err(MseError::DashInvalidPatch(_)) => {}
            other => panic!("expected DashInvalidPatch, got {other:?}"),
        }
        // wrong originalPublishTime
        let patch = r#"<Patch mpdId="mpd-1" originalPublishTime="1999-01-01T00:00:00Z">
  <add sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline"><S d="1" t="1"/></add>
</Patch>"#;
        assert!(matches!(updater.apply_patch(patch, 3.0), Err(MseError::DashInvalidPatch(_))));
        // manifest completely unchanged
        assert_eq!(serialize_dom(&updater.dom).unwrap(), before);
        assert_eq!(segment_times(&shared), vec![(0.0, 1.0)]);
    }

    #[test]
    fn test_add_then_remove_restores_dom() {
        let mut updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        let before = serialize_dom(&updater.dom).unwrap();
        let add = r#"<Patch mpdId="mpd-1" originalPublishTime="1970-01-01T00:00:01Z">
  <add sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline"><S d="1" t="1"/></add>
</Patch>"#;
        updater.apply_patch(add, 2.0).unwrap();
        let remove = r#"<Patch mpdId="mpd-1" originalPublishTime="1970-01-01T00:00:01Z">
  <remove sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline/S[@t='1']"/>
</Patch>"#;
        updater.apply_patch(remove, 2.5).unwrap();
        assert_eq!(serialize_dom(&updater.dom).unwrap(), before);
    }

    #[test]
    fn test_dynamic_to_static_transition() {
        let mut updater = ManifestUpdater::from_xml(LIVE_MPD, url(), 1.0).unwrap();
        let shared = updater.shared();
        assert!(shared.read().timeline.is_live());
        let patch = r#"<Patch mpdId="mpd-1" originalPublishTime="1970-01-01T00:00:01Z">
  <replace sel="/MPD/@type">static</replace>
  <add sel="/MPD" type="@mediaPresentationDuration">PT1S</add>
  <replace sel="/MPD/@publishTime">1970-01-01T00:00:09Z</replace>
</Patch>"#;
        updater.apply_patch(patch, 9.0).unwrap();
        assert!(!shared.read().timeline.is_live());
        assert_eq!(shared.read().timeline.duration(), 1.0);
        // static presentations schedule no further updates
        assert_eq!(updater.update_request(10.0), None);
    }

    #[test]
    fn test_availability_eviction_on_update() {
        // tight 2-second time-shift buffer
        let mpd = LIVE_MPD.replace("minBufferTime=\"PT1S\"",
                                   "minBufferTime=\"PT1S\" timeShiftBufferDepth=\"PT2S\"");
        let mut updater = ManifestUpdater::from_xml(&mpd, url(), 1.0).unwrap();
        let shared = updater.shared();
        materialize(&shared);
        let patch = r#"<Patch mpdId="mpd-1" originalPublishTime="1970-01-01T00:00:01Z">
  <add sel="/MPD/Period[@id='p1']/AdaptationSet[@id='1']/Representation[@id='v']/SegmentTemplate/SegmentTimeline"><S d="1" t="1"/><S d="1" t="2"/><S d="1" t="3"/><S d="1" t="4"/><S d="1" t="5"/></add>
  <replace sel="/MPD/@publishTime">1970-01-01T00:00:06Z</replace>
</Patch>"#;
        updater.apply_patch(patch, 6.0).unwrap();
        // at now=6 the availability window starts at 4: segments ending at or before it are gone
        let times = segment_times(&shared);
        assert_eq!(times.first().unwrap().0, 4.0);
        assert_eq!(times.last().unwrap().1, 6.0);
    }
}
