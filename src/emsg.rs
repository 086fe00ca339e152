//! In-band event extraction: locating and parsing `emsg` boxes in media segments.
//
// Event Message boxes (ISO/IEC 23009-1 §5.10.3.3) ride at the top level of fragmented MP4
// segments, next to `moof`/`mdat`. We walk only the top-level boxes; nothing here demuxes media.
// Version 0 carries fields in the order scheme_id_uri, value, timescale,
// presentation_time_delta, event_duration, id; version 1 reorders to timescale,
// presentation_time, event_duration, id, scheme_id_uri, value. A v0 event is anchored relative
// to the segment start; a v1 event is absolute.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use tracing::{trace, warn};

/// Scheme carried by DASH streams to signal "refetch the manifest now". Not surfaced as an
/// application event; the engine reacts to it directly.
pub const MANIFEST_UPDATE_SCHEME: &str = "urn:mpeg:dash:event:2012";

/// One parsed `emsg` event.
#[derive(Debug, Clone, PartialEq)]
pub struct EmsgEvent {
    pub scheme_id_uri: String,
    pub value: String,
    /// Presentation time the event starts at, in seconds.
    pub start_time: f64,
    pub end_time: f64,
    pub id: u32,
    pub timescale: u32,
    pub event_duration: u32,
    /// Offset from the segment start in timescale units (v0) or the absolute presentation time
    /// (v1).
    pub presentation_time_delta: u64,
    pub message_data: Vec<u8>,
}

/// Result of scanning one segment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmsgScan {
    /// Events whose scheme the application subscribed to.
    pub events: Vec<EmsgEvent>,
    /// Set when the segment carried a manifest-update signal.
    pub manifest_update: bool,
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_emsg(payload: &[u8], segment_start: f64) -> std::io::Result<EmsgEvent> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_u8()?;
    let _flags = cursor.read_u24::<BigEndian>()?;
    let (scheme_id_uri, value, timescale, presentation_time, event_duration, id, absolute);
    if version == 0 {
        scheme_id_uri = read_cstring(&mut cursor)?;
        value = read_cstring(&mut cursor)?;
        timescale = cursor.read_u32::<BigEndian>()?;
        presentation_time = cursor.read_u32::<BigEndian>()? as u64;
        event_duration = cursor.read_u32::<BigEndian>()?;
        id = cursor.read_u32::<BigEndian>()?;
        absolute = false;
    } else {
        timescale = cursor.read_u32::<BigEndian>()?;
        presentation_time = cursor.read_u64::<BigEndian>()?;
        event_duration = cursor.read_u32::<BigEndian>()?;
        id = cursor.read_u32::<BigEndian>()?;
        scheme_id_uri = read_cstring(&mut cursor)?;
        value = read_cstring(&mut cursor)?;
        absolute = true;
    }
    let mut message_data = Vec::new();
    cursor.read_to_end(&mut message_data)?;
    let ts = if timescale == 0 { 1 } else { timescale } as f64;
    let start_time = if absolute {
        presentation_time as f64 / ts
    } else {
        segment_start + presentation_time as f64 / ts
    };
    Ok(EmsgEvent {
        scheme_id_uri,
        value,
        start_time,
        end_time: start_time + event_duration as f64 / ts,
        id,
        timescale,
        event_duration,
        presentation_time_delta: presentation_time,
        message_data,
    })
}

/// Walk the top-level boxes of a segment, parsing `emsg` boxes whose scheme the caller
/// subscribed to. Malformed boxes are skipped, not fatal: a broken event must not take down
/// media playback.
pub fn scan_segment(data: &[u8], segment_start: f64, wanted_schemes: &[String]) -> EmsgScan {
    let mut scan = EmsgScan::default();
    let mut offset: usize = 0;
    while offset + 8 <= data.len() {
        let mut header = Cursor::new(&data[offset..]);
        let size32 = header.read_u32::<BigEndian>().unwrap_or(0);
        let mut box_type = [0u8; 4];
        if header.read_exact(&mut box_type).is_err() {
            break;
        }
        let (box_size, header_len) = match size32 {
            0 => ((data.len() - offset) as u64, 8usize), // box extends to end of segment
            1 => match header.read_u64::<BigEndian>() {
                Ok(large) => (large, 16usize),
                Err(_) => break,
            },
            n => (n as u64, 8usize),
        };
        if box_size < header_len as u64 || offset as u64 + box_size > data.len() as u64 {
            warn!("truncated {} box at offset {offset}",
                  String::from_utf8_lossy(&box_type));
            break;
        }
        if &box_type == b"emsg" {
            let payload = &data[offset + header_len..offset + box_size as usize];
            match parse_emsg(payload, segment_start) {
                Ok(event) => {
                    trace!("emsg scheme={} value={} start={}",
                           event.scheme_id_uri, event.value, event.start_time);
                    if event.scheme_id_uri == MANIFEST_UPDATE_SCHEME {
                        scan.manifest_update = true;
                    } else if wanted_schemes.iter().any(|s| s == &event.scheme_id_uri) {
                        scan.events.push(event);
                    }
                }
                Err(e) => warn!("skipping malformed emsg box: {e}"),
            }
        }
        offset += box_size as usize;
    }
    scan
}
