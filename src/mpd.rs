//! Serde model of the DASH MPD subset the engine consumes, and its conversion into the
//! [Manifest](crate::manifest::Manifest) model.
//
// The MPD format is documented by ISO using an XML Schema at
// https://standards.iso.org/ittf/PubliclyAvailableStandards/MPEG-DASH_schema_files/DASH-MPD-edition2.xsd
// We deserialize with quick-xml + serde and deliberately cover only the subset the streaming core
// needs: SegmentTemplate (with and without SegmentTimeline) and SegmentList addressing,
// multi-period layout, live attributes, PatchLocation, in-band event stream declarations and
// trick-mode signalling. serde ignores unknown fields, so manifests using the rest of the schema
// still parse.

#![allow(non_snake_case)]

use crate::manifest::{ContentType, Manifest, Stream, StreamId, Variant};
use crate::segment::{InitSegmentReference, SegmentIndex, SegmentReference};
use crate::timeline::PresentationTimeline;
use crate::{parse_range, parse_xs_duration_secs, MseError};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// Describes a sequence of contiguous Segments with identical duration.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct S {
    /// Start time in timescale units; defaults to the running time.
    #[serde(rename = "@t")]
    pub t: Option<i64>,
    /// Duration in timescale units (shall not exceed MPD@maxSegmentDuration).
    #[serde(rename = "@d")]
    pub d: i64,
    /// Repeat count (contiguous segments with identical duration, minus one). Negative means
    /// "repeat until the start of the next S element or the end of the Period".
    #[serde(rename = "@r")]
    pub r: Option<i64>,
    /// Segment number override, used by patched timelines that address by number.
    #[serde(rename = "@n")]
    pub n: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

/// Template-based segment addressing with `$Time$`/`$Number$` substitution.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    /// Unsigned int in timescale units, not an xs:duration.
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<u64>,
    pub SegmentTimeline: Option<SegmentTimeline>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

/// Explicit per-segment URL list, used by byte-range addressed content.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentList {
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    pub Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentURL>,
}

/// A URI that specifies a common location for segments and other resources.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Role {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Label {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AudioChannelConfiguration {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

/// Generic descriptor, used for trick-mode signalling
/// (`http://dashif.org/guidelines/trickmode`).
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EssentialProperty {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

/// Declares that segments of this adaptation carry `emsg` boxes for a scheme the application
/// wants surfaced.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct InbandEventStream {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Vec<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    #[serde(rename = "AudioChannelConfiguration", default)]
    pub audio_channel_configuration: Vec<AudioChannelConfiguration>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "Role", default)]
    pub roles: Vec<Role>,
    pub Label: Option<Label>,
    #[serde(rename = "EssentialProperty", default)]
    pub essential_properties: Vec<EssentialProperty>,
    #[serde(rename = "InbandEventStream", default)]
    pub inband_event_streams: Vec<InbandEventStream>,
    #[serde(rename = "AudioChannelConfiguration", default)]
    pub audio_channel_configuration: Vec<AudioChannelConfiguration>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<String>,
    #[serde(rename = "@duration")]
    pub duration: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Vec<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

/// Where a patch for this manifest can be fetched, and for how long it stays applicable.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PatchLocation {
    #[serde(rename = "@ttl")]
    pub ttl: Option<f64>,
    #[serde(rename = "$text")]
    pub location: Option<String>,
}

/// The root of a Media Presentation Description.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MPD {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@xmlns")]
    pub xmlns: Option<String>,
    #[serde(rename = "@publishTime")]
    pub publishTime: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availabilityStartTime: Option<String>,
    #[serde(rename = "@mediaPresentationDuration")]
    pub mediaPresentationDuration: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    pub minimumUpdatePeriod: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth")]
    pub timeShiftBufferDepth: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay")]
    pub suggestedPresentationDelay: Option<String>,
    #[serde(rename = "@maxSegmentDuration")]
    pub maxSegmentDuration: Option<String>,
    #[serde(rename = "@minBufferTime")]
    pub minBufferTime: Option<String>,
    #[serde(rename = "PatchLocation")]
    pub patch_location: Option<PatchLocation>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

impl MPD {
    pub fn is_dynamic(&self) -> bool {
        self.mpdtype.as_deref() == Some("dynamic")
    }

    /// Parsed `@publishTime`, tolerating both xs:dateTime (RFC 3339) and RFC 2822 strings.
    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        parse_mpd_datetime(self.publishTime.as_deref()?)
    }
}

pub(crate) fn parse_mpd_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Parse an MPD document.
pub fn parse_mpd(xml: &str) -> Result<MPD, MseError> {
    let mpd: MPD = quick_xml::de::from_str(xml)
        .map_err(|e| MseError::Parsing(format!("MPD: {e}")))?;
    Ok(mpd)
}

// From DASH-IF-IOP: "For the avoidance of doubt, only %0[width]d is permitted and no other
// identifiers", so template substitution does not need a printf implementation.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
lazy_static! {
    static ref URL_TEMPLATE_IDS: Vec<(&'static str, String, Regex)> = {
        vec!["RepresentationID", "Number", "Time", "Bandwidth"].into_iter()
            .map(|k| (k, format!("${k}$"), Regex::new(&format!("\\${k}%0([\\d])d\\$")).unwrap()))
            .collect()
    };
}

pub(crate) fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (k, ident, rx) in URL_TEMPLATE_IDS.iter() {
        // first check for simple cases such as $Number$
        if result.contains(ident) {
            if let Some(value) = params.get(k as &str) {
                result = result.replace(ident, value);
            }
        }
        // now check for complex cases such as $Number%06d$
        if let Some(cap) = rx.captures(&result) {
            if let Some(value) = params.get(k as &str) {
                let width: usize = cap[1].parse::<usize>().unwrap();
                let count = format!("{value:0>width$}");
                let m = rx.find(&result).unwrap();
                result = result[..m.start()].to_owned() + &count + &result[m.end()..];
            }
        }
    }
    result
}

// Scope a base URL: a BaseURL element either replaces the parent scope (absolute) or is joined
// onto it (relative).
fn scoped_base(parent: &Url, elements: &[BaseURL]) -> Result<Url, MseError> {
    match elements.first() {
        Some(b) => parent
            .join(b.base.trim())
            .map_err(|e| MseError::Parsing(format!("parsing BaseURL: {e}"))),
        None => Ok(parent.clone()),
    }
}

/// The expanded segment addressing for one representation within one period.
#[derive(Debug, Clone)]
pub(crate) struct ExpandedRepresentation {
    /// Stable identity across periods and manifest updates: `Representation@id`.
    pub rep_id: String,
    pub refs: Vec<SegmentReference>,
}

fn effective_template(
    period: &Period,
    adaptation: &AdaptationSet,
    representation: &Representation,
) -> Option<SegmentTemplate> {
    // Representation-level values override AdaptationSet-level ones, which override Period-level
    // ones. Merge attribute by attribute, as inheritance in the schema is per-attribute.
    let mut merged = SegmentTemplate::default();
    for level in [&period.SegmentTemplate, &adaptation.SegmentTemplate, &representation.SegmentTemplate] {
        if let Some(st) = level {
            if st.initialization.is_some() { merged.initialization = st.initialization.clone(); }
            if st.media.is_some() { merged.media = st.media.clone(); }
            if st.startNumber.is_some() { merged.startNumber = st.startNumber; }
            if st.duration.is_some() { merged.duration = st.duration; }
            if st.timescale.is_some() { merged.timescale = st.timescale; }
            if st.presentationTimeOffset.is_some() { merged.presentationTimeOffset = st.presentationTimeOffset; }
            if st.SegmentTimeline.is_some() { merged.SegmentTimeline = st.SegmentTimeline.clone(); }
        }
    }
    if merged == SegmentTemplate::default() { None } else { Some(merged) }
}

#[allow(clippy::too_many_arguments)]
fn expand_template(
    st: &SegmentTemplate,
    base: &Url,
    rep_id: &str,
    bandwidth: u64,
    period_start: f64,
    period_end: f64,
    live_edge: Option<f64>,
) -> Result<Vec<SegmentReference>, MseError> {
    let timescale = st.timescale.unwrap_or(1) as f64;
    let pto = st.presentationTimeOffset.unwrap_or(0) as f64;
    let dict = HashMap::from([
        ("RepresentationID", rep_id.to_string()),
        ("Bandwidth", bandwidth.to_string()),
    ]);
    let init = match &st.initialization {
        Some(tmpl) => {
            let path = resolve_url_template(tmpl, &dict);
            let url = base.join(&path)
                .map_err(|e| MseError::Parsing(format!("joining init template: {e}")))?;
            Some(Arc::new(InitSegmentReference::new(vec![url], (0, None))))
        }
        None => None,
    };
    let media = st.media.as_ref()
        .ok_or_else(|| MseError::Parsing(String::from("SegmentTemplate without @media")))?;
    let mut refs = Vec::new();
    let mut push_ref = |time_units: f64, dur_units: f64, number: u64| -> Result<(), MseError> {
        let dict = HashMap::from([
            ("RepresentationID", rep_id.to_string()),
            ("Bandwidth", bandwidth.to_string()),
            ("Time", format!("{}", time_units as i64)),
            ("Number", number.to_string()),
        ]);
        let path = resolve_url_template(media, &dict);
        let url = base.join(&path)
            .map_err(|e| MseError::Parsing(format!("joining media template: {e}")))?;
        let start = period_start + (time_units - pto) / timescale;
        refs.push(SegmentReference {
            start_time: start,
            end_time: start + dur_units / timescale,
            uris: vec![url],
            byte_range: (0, None),
            init: init.clone(),
            timestamp_offset: period_start,
            append_window_start: period_start,
            append_window_end: period_end,
        });
        Ok(())
    };
    if let Some(stl) = &st.SegmentTimeline {
        let mut time: f64 = 0.0;
        let mut number = st.startNumber.unwrap_or(1);
        for s in &stl.segments {
            if let Some(t) = s.t {
                time = t as f64;
            }
            if let Some(n) = s.n {
                number = n;
            }
            let d = s.d as f64;
            let r = s.r.unwrap_or(0);
            let count = if r >= 0 {
                r + 1
            } else {
                // repeats until the period end (or the live edge if the period is open)
                let end_units = (period_end - period_start).min(live_edge.unwrap_or(f64::INFINITY) - period_start)
                    * timescale + pto;
                (((end_units - time) / d).ceil() as i64).max(0)
            };
            for _ in 0..count {
                push_ref(time, d, number)?;
                time += d;
                number += 1;
            }
        }
    } else {
        let d = st.duration
            .ok_or_else(|| MseError::Parsing(String::from("SegmentTemplate without @duration or SegmentTimeline")))? as f64;
        let seg_secs = d / timescale;
        let end = period_end.min(live_edge.unwrap_or(f64::INFINITY));
        if !end.is_finite() {
            return Err(MseError::Parsing(String::from(
                "cannot expand an unbounded SegmentTemplate without a live edge")));
        }
        let total = ((end - period_start) / seg_secs).ceil().max(0.0) as u64;
        let mut number = st.startNumber.unwrap_or(1);
        for i in 0..total {
            push_ref(i as f64 * d + pto, d, number)?;
            number += 1;
        }
    }
    Ok(refs)
}

fn expand_list(
    sl: &SegmentList,
    base: &Url,
    period_start: f64,
    period_end: f64,
) -> Result<Vec<SegmentReference>, MseError> {
    let timescale = sl.timescale.unwrap_or(1) as f64;
    let d = sl.duration
        .ok_or_else(|| MseError::Parsing(String::from("SegmentList without @duration")))? as f64;
    let init = match &sl.Initialization {
        Some(i) => {
            let url = match &i.sourceURL {
                Some(su) => base.join(su)
                    .map_err(|e| MseError::Parsing(format!("parsing Initialization URL: {e}")))?,
                None => base.clone(),
            };
            let byte_range = match &i.range {
                Some(r) => { let (s, e) = parse_range(r)?; (s, Some(e)) }
                None => (0, None),
            };
            Some(Arc::new(InitSegmentReference::new(vec![url], byte_range)))
        }
        None => None,
    };
    let mut refs = Vec::new();
    for (i, su) in sl.segment_urls.iter().enumerate() {
        let url = match &su.media {
            Some(m) => base.join(m)
                .map_err(|e| MseError::Parsing(format!("parsing SegmentURL: {e}")))?,
            None => base.clone(),
        };
        let byte_range = match &su.mediaRange {
            Some(r) => { let (s, e) = parse_range(r)?; (s, Some(e)) }
            None => (0, None),
        };
        let start = period_start + i as f64 * d / timescale;
        refs.push(SegmentReference {
            start_time: start,
            end_time: start + d / timescale,
            uris: vec![url],
            byte_range,
            init: init.clone(),
            timestamp_offset: period_start,
            append_window_start: period_start,
            append_window_end: period_end,
        });
    }
    Ok(refs)
}

struct PeriodLayout {
    start: f64,
    end: f64,
}

fn period_layout(mpd: &MPD, total_duration: f64) -> Result<Vec<PeriodLayout>, MseError> {
    let mut layouts: Vec<PeriodLayout> = Vec::with_capacity(mpd.periods.len());
    let mut cursor = 0.0;
    for (i, p) in mpd.periods.iter().enumerate() {
        let start = match &p.start {
            Some(s) => parse_xs_duration_secs(s)?,
            None => cursor,
        };
        let end = match &p.duration {
            Some(d) => start + parse_xs_duration_secs(d)?,
            None => {
                // closed by the next period's start, or by the presentation duration
                match mpd.periods.get(i + 1).and_then(|n| n.start.as_ref()) {
                    Some(ns) => parse_xs_duration_secs(ns)?,
                    None if i + 1 == mpd.periods.len() => total_duration,
                    None => {
                        return Err(MseError::Parsing(format!(
                            "period {i} has no duration and the next period has no start")))
                    }
                }
            }
        };
        cursor = end;
        layouts.push(PeriodLayout { start, end });
    }
    Ok(layouts)
}

/// Expand every representation of every period into segment references, keyed by
/// `Representation@id`. Representations that keep their id across periods contribute to a single
/// entry, which is what lets one stream (and one segment index) span period transitions.
pub(crate) fn expand_representations(
    mpd: &MPD,
    manifest_url: &Url,
    now_epoch: f64,
) -> Result<HashMap<String, ExpandedRepresentation>, MseError> {
    let mpd_base = scoped_base(manifest_url, &mpd.base_url)?;
    let total_duration = match &mpd.mediaPresentationDuration {
        Some(d) => parse_xs_duration_secs(d)?,
        None => f64::INFINITY,
    };
    let live_edge = if mpd.is_dynamic() {
        let ast = mpd.availabilityStartTime.as_deref()
            .and_then(parse_mpd_datetime)
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
            .unwrap_or(0.0);
        Some((now_epoch - ast).max(0.0))
    } else {
        None
    };
    let layouts = period_layout(mpd, total_duration)?;
    let mut out: HashMap<String, ExpandedRepresentation> = HashMap::new();
    for (period, layout) in mpd.periods.iter().zip(&layouts) {
        let period_base = scoped_base(&mpd_base, &period.base_url)?;
        for adaptation in &period.adaptations {
            let adaptation_base = scoped_base(&period_base, &adaptation.base_url)?;
            for representation in &adaptation.representations {
                let rep_id = match &representation.id {
                    Some(id) => id.clone(),
                    None => {
                        warn!("ignoring Representation without @id");
                        continue;
                    }
                };
                let rep_base = scoped_base(&adaptation_base, &representation.base_url)?;
                let bandwidth = representation.bandwidth.unwrap_or(0);
                let refs = if let Some(st) = effective_template(period, adaptation, representation) {
                    expand_template(&st, &rep_base, &rep_id, bandwidth,
                                    layout.start, layout.end, live_edge)?
                } else if let Some(sl) = &representation.SegmentList {
                    expand_list(sl, &rep_base, layout.start, layout.end)?
                } else {
                    return Err(MseError::Parsing(format!(
                        "representation {rep_id} has neither SegmentTemplate nor SegmentList")));
                };
                out.entry(rep_id.clone())
                    .or_insert_with(|| ExpandedRepresentation { rep_id, refs: Vec::new() })
                    .refs
                    .extend(refs);
            }
        }
    }
    Ok(out)
}

fn content_type_of(adaptation: &AdaptationSet, representation: &Representation) -> ContentType {
    let is_trick = adaptation.essential_properties.iter().any(|p| {
        p.schemeIdUri.as_deref() == Some("http://dashif.org/guidelines/trickmode")
    });
    let declared = adaptation.contentType.as_deref();
    let mime = representation.mimeType.as_deref()
        .or(adaptation.mimeType.as_deref())
        .unwrap_or("");
    match declared {
        Some("audio") => ContentType::Audio,
        Some("video") if is_trick => ContentType::TrickVideo,
        Some("video") => ContentType::Video,
        Some("text") => ContentType::Text,
        Some("image") => ContentType::Image,
        _ if mime.starts_with("audio/") => ContentType::Audio,
        _ if mime.starts_with("video/") && is_trick => ContentType::TrickVideo,
        _ if mime.starts_with("video/") => ContentType::Video,
        _ if mime.starts_with("image/") => ContentType::Image,
        _ => ContentType::Text,
    }
}

fn build_timeline(mpd: &MPD) -> Result<PresentationTimeline, MseError> {
    let max_segment_duration = match &mpd.maxSegmentDuration {
        Some(d) => parse_xs_duration_secs(d)?,
        None => 10.0,
    };
    if mpd.is_dynamic() {
        let ast = mpd.availabilityStartTime.as_deref()
            .and_then(parse_mpd_datetime)
            .ok_or_else(|| {
                MseError::Parsing(String::from("dynamic MPD without availabilityStartTime"))
            })?;
        let depth = match &mpd.timeShiftBufferDepth {
            Some(d) => Some(parse_xs_duration_secs(d)?),
            None => None,
        };
        let delay = match &mpd.suggestedPresentationDelay {
            Some(d) => parse_xs_duration_secs(d)?,
            None => 0.0,
        };
        let mut t = PresentationTimeline::new_live(ast, depth, delay, max_segment_duration);
        if let Some(d) = &mpd.mediaPresentationDuration {
            t.set_duration_from_manifest(parse_xs_duration_secs(d)?);
        }
        Ok(t)
    } else {
        let duration = match &mpd.mediaPresentationDuration {
            Some(d) => parse_xs_duration_secs(d)?,
            None => {
                // fall back to the end of the last period
                let layouts = period_layout(mpd, f64::INFINITY)?;
                layouts.last().map(|l| l.end).unwrap_or(0.0)
            }
        };
        let mut t = PresentationTimeline::new_vod(duration);
        t.set_max_segment_duration(max_segment_duration);
        Ok(t)
    }
}

/// Build the engine's manifest model from a parsed MPD. `now_epoch` anchors live expansion of
/// open-ended timelines.
pub fn manifest_from_mpd(mpd: &MPD, manifest_url: &Url, now_epoch: f64) -> Result<Manifest, MseError> {
    let timeline = build_timeline(mpd)?;
    let mut manifest = Manifest::new(timeline);
    if let Some(mbt) = &mpd.minBufferTime {
        manifest.min_buffer_time = parse_xs_duration_secs(mbt)?;
    }
    let expanded = expand_representations(mpd, manifest_url, now_epoch)?;

    // one Stream per representation id; collect trick-mode links by adaptation id on the way
    let mut by_rep: HashMap<String, StreamId> = HashMap::new();
    let mut trick_links: Vec<(String, StreamId)> = Vec::new(); // (main adaptation id, trick stream)
    let mut adaptation_members: HashMap<String, Vec<StreamId>> = HashMap::new();
    for period in &mpd.periods {
        for adaptation in &period.adaptations {
            for representation in &adaptation.representations {
                let Some(rep_id) = representation.id.clone() else { continue };
                if by_rep.contains_key(&rep_id) {
                    continue; // continuation of the same stream in a later period
                }
                let content_type = content_type_of(adaptation, representation);
                let mime = representation.mimeType.clone()
                    .or_else(|| adaptation.mimeType.clone())
                    .unwrap_or_default();
                let codecs = representation.codecs.clone().unwrap_or_default();
                let mut stream = Stream::new(content_type, &mime, &codecs);
                stream.rep_id = Some(rep_id.clone());
                stream.bandwidth = representation.bandwidth.unwrap_or(0);
                stream.language = adaptation.lang.clone();
                stream.roles = adaptation.roles.iter()
                    .filter_map(|r| r.value.clone())
                    .collect();
                stream.label = adaptation.Label.as_ref().and_then(|l| l.content.clone());
                stream.primary = adaptation.roles.iter()
                    .any(|r| r.value.as_deref() == Some("main"));
                stream.channel_count = representation.audio_channel_configuration.iter()
                    .chain(adaptation.audio_channel_configuration.iter())
                    .filter_map(|c| c.value.as_deref())
                    .find_map(|v| v.parse::<u32>().ok());
                stream.emsg_scheme_id_uris = adaptation.inband_event_streams.iter()
                    .filter_map(|e| e.schemeIdUri.clone())
                    .collect();
                if let Some(exp) = expanded.get(&rep_id) {
                    let refs = exp.refs.clone();
                    stream.index_factory = Some(Arc::new(
                        move || -> futures_util::future::BoxFuture<'static, Result<SegmentIndex, MseError>> {
                            let refs = refs.clone();
                            Box::pin(async move { Ok(SegmentIndex::new(refs)) })
                        },
                    ));
                }
                let sid = manifest.add_stream(stream);
                by_rep.insert(rep_id, sid);
                if let Some(aid) = &adaptation.id {
                    adaptation_members.entry(aid.clone()).or_default().push(sid);
                }
                if content_type == ContentType::TrickVideo {
                    if let Some(main_id) = adaptation.essential_properties.iter()
                        .find(|p| p.schemeIdUri.as_deref()
                              == Some("http://dashif.org/guidelines/trickmode"))
                        .and_then(|p| p.value.clone())
                    {
                        trick_links.push((main_id, sid));
                    }
                }
            }
        }
    }

    // attach trick-mode streams to the video streams of the adaptation they accelerate
    for (main_adaptation, trick_sid) in trick_links {
        if let Some(members) = adaptation_members.get(&main_adaptation) {
            for sid in members.clone() {
                if let Some(s) = manifest.stream_mut(sid) {
                    if s.content_type == ContentType::Video {
                        s.trick_mode_video = Some(trick_sid);
                    }
                }
            }
        }
    }

    // pair audio and video streams into variants; text and image streams stand alone
    let audio_ids: Vec<StreamId> = manifest.streams()
        .filter(|s| s.content_type == ContentType::Audio)
        .map(|s| s.id)
        .collect();
    let video_ids: Vec<StreamId> = manifest.streams()
        .filter(|s| s.content_type == ContentType::Video)
        .map(|s| s.id)
        .collect();
    let mut next_variant = 0u32;
    let mut push_variant = |manifest: &mut Manifest, audio: Option<StreamId>, video: Option<StreamId>| {
        let audio_bw = audio.and_then(|i| manifest.stream(i)).map(|s| s.bandwidth).unwrap_or(0);
        let video_bw = video.and_then(|i| manifest.stream(i)).map(|s| s.bandwidth).unwrap_or(0);
        let language = audio
            .and_then(|i| manifest.stream(i))
            .and_then(|s| s.language.clone());
        let v = Variant {
            id: next_variant,
            audio,
            video,
            bandwidth: audio_bw + video_bw,
            language,
            allowed_by_application: true,
            allowed_by_key_system: true,
        };
        next_variant += 1;
        manifest.variants.push(v);
    };
    match (audio_ids.is_empty(), video_ids.is_empty()) {
        (false, false) => {
            for v in &video_ids {
                for a in &audio_ids {
                    push_variant(&mut manifest, Some(*a), Some(*v));
                }
            }
        }
        (false, true) => audio_ids.iter().for_each(|a| push_variant(&mut manifest, Some(*a), None)),
        (true, false) => video_ids.iter().for_each(|v| push_variant(&mut manifest, None, Some(*v))),
        (true, true) => {}
    }
    manifest.text_streams = manifest.streams()
        .filter(|s| s.content_type == ContentType::Text)
        .map(|s| s.id)
        .collect();
    manifest.image_streams = manifest.streams()
        .filter(|s| s.content_type == ContentType::Image)
        .map(|s| s.id)
        .collect();
    Ok(manifest)
}
