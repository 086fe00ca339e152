//! Deterministic selection of variants and text streams from owner preferences.
//
// The engine streams whatever variant it is told to; this adapter reproduces the preference
// ordering the player front-end applies when the owner only states preferences:
// language match, then role match, then the manifest's primary flag, then label match, then
// channel count. Channel-count matching prefers an exact match, then the largest count not
// exceeding the preferred count, then the smallest available. Earlier manifest order wins ties,
// which keeps selection reproducible.

use crate::manifest::{Manifest, Stream, StreamId, Variant};

/// Owner preferences for picking among allowed variants and text streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionPreferences {
    /// RFC 5646 tag, e.g. `fr` or `pt-BR`.
    pub language: Option<String>,
    pub role: Option<String>,
    pub label: Option<String>,
    pub channel_count: Option<u32>,
}

// 2 = exact tag match, 1 = same primary subtag, 0 = no match.
fn language_affinity(preferred: Option<&str>, actual: Option<&str>) -> u8 {
    let (Some(p), Some(a)) = (preferred, actual) else { return 0 };
    let p = p.to_ascii_lowercase();
    let a = a.to_ascii_lowercase();
    if p == a {
        return 2;
    }
    let base = |s: &str| s.split('-').next().unwrap_or("").to_string();
    if base(&p) == base(&a) {
        1
    } else {
        0
    }
}

// Encode channel-count preference so that lexicographic comparison gives: exact match, then the
// largest count not exceeding the target, then the smallest count overall.
fn channel_affinity(preferred: Option<u32>, actual: Option<u32>) -> (u8, u32) {
    let Some(want) = preferred else { return (0, 0) };
    let Some(have) = actual else { return (0, 0) };
    if have == want {
        (3, 0)
    } else if have < want {
        (2, have)
    } else {
        (1, u32::MAX - have)
    }
}

type Score = (u8, bool, bool, bool, (u8, u32));

fn stream_score(prefs: &SelectionPreferences, stream: &Stream) -> Score {
    (
        language_affinity(prefs.language.as_deref(), stream.language.as_deref()),
        prefs.role.as_deref().is_some_and(|r| stream.roles.iter().any(|have| have == r)),
        stream.primary,
        prefs.label.is_some() && prefs.label == stream.label,
        channel_affinity(prefs.channel_count, stream.channel_count),
    )
}

fn variant_score(manifest: &Manifest, prefs: &SelectionPreferences, variant: &Variant) -> Score {
    // audio carries the attributes listeners select on; a video-only variant is scored on its
    // video stream so role/label preferences still apply
    let attrs: Option<&Stream> = variant
        .audio
        .or(variant.video)
        .and_then(|id| manifest.stream(id));
    match attrs {
        Some(s) => {
            let mut score = stream_score(prefs, s);
            // the variant's own language (from the manifest pairing) can satisfy a language
            // preference even when the audio stream is untagged
            score.0 = score.0.max(language_affinity(prefs.language.as_deref(),
                                                    variant.language.as_deref()));
            score
        }
        None => (0, false, false, false, (0, 0)),
    }
}

/// Pick the preferred variant among those allowed by the application and key system. Ties keep
/// manifest order.
pub fn choose_variant<'a>(manifest: &'a Manifest, prefs: &SelectionPreferences) -> Option<&'a Variant> {
    let mut best: Option<(&Variant, Score)> = None;
    for v in manifest.variants.iter().filter(|v| v.is_allowed()) {
        let score = variant_score(manifest, prefs, v);
        match &best {
            Some((_, best_score)) if score <= *best_score => {}
            _ => best = Some((v, score)),
        }
    }
    best.map(|(v, _)| v)
}

/// Pick the preferred text stream.
pub fn choose_text_stream<'a>(manifest: &'a Manifest, prefs: &SelectionPreferences) -> Option<&'a Stream> {
    let mut best: Option<(StreamId, Score)> = None;
    for id in &manifest.text_streams {
        let Some(stream) = manifest.stream(*id) else { continue };
        let score = stream_score(prefs, stream);
        match &best {
            Some((_, best_score)) if score <= *best_score => {}
            _ => best = Some((*id, score)),
        }
    }
    best.and_then(|(id, _)| manifest.stream(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ContentType, Manifest, Stream, Variant};
    use crate::timeline::PresentationTimeline;

    struct AudioSpec {
        language: &'static str,
        role: Option<&'static str>,
        primary: bool,
        label: Option<&'static str>,
        channels: u32,
    }

    fn build(specs: &[AudioSpec]) -> Manifest {
        let mut m = Manifest::new(PresentationTimeline::new_vod(60.0));
        let video = m.add_stream(Stream::new(ContentType::Video, "video/mp4", "avc1.42c01e"));
        for (i, spec) in specs.iter().enumerate() {
            let mut a = Stream::new(ContentType::Audio, "audio/mp4", "mp4a.40.2");
            a.language = Some(spec.language.to_string());
            a.roles = spec.role.iter().map(|r| r.to_string()).collect();
            a.primary = spec.primary;
            a.label = spec.label.map(|l| l.to_string());
            a.channel_count = Some(spec.channels);
            let audio = m.add_stream(a);
            m.variants.push(Variant {
                id: i as u32,
                audio: Some(audio),
                video: Some(video),
                bandwidth: 1_000_000,
                language: Some(spec.language.to_string()),
                allowed_by_application: true,
                allowed_by_key_system: true,
            });
        }
        m
    }

    fn prefs(language: &str) -> SelectionPreferences {
        SelectionPreferences { language: Some(language.to_string()), ..Default::default() }
    }

    #[test]
    fn test_language_beats_everything() {
        let m = build(&[
            AudioSpec { language: "en", role: Some("main"), primary: true, label: None, channels: 6 },
            AudioSpec { language: "fr", role: None, primary: false, label: None, channels: 2 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("fr")),
            role: Some(String::from("main")),
            channel_count: Some(6),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
    }

    #[test]
    fn test_base_subtag_matches() {
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "pt-BR", role: None, primary: false, label: None, channels: 2 },
        ]);
        assert_eq!(choose_variant(&m, &prefs("pt")).unwrap().id, 1);
        // exact beats base-only
        let m = build(&[
            AudioSpec { language: "pt", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "pt-BR", role: None, primary: false, label: None, channels: 2 },
        ]);
        assert_eq!(choose_variant(&m, &prefs("pt-BR")).unwrap().id, 1);
    }

    #[test]
    fn test_role_beats_primary() {
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: true, label: None, channels: 2 },
            AudioSpec { language: "en", role: Some("commentary"), primary: false, label: None, channels: 2 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("en")),
            role: Some(String::from("commentary")),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
    }

    #[test]
    fn test_primary_beats_label() {
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: Some("Director"), channels: 2 },
            AudioSpec { language: "en", role: None, primary: true, label: None, channels: 2 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("en")),
            label: Some(String::from("Director")),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
    }

    #[test]
    fn test_channel_count_tiers() {
        // exact match wins
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 6 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("en")),
            channel_count: Some(6),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
        // no exact: the largest count not exceeding the target
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 4 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 8 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("en")),
            channel_count: Some(6),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
        // everything exceeds the target: the smallest
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 8 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 6 },
        ]);
        let p = SelectionPreferences {
            language: Some(String::from("en")),
            channel_count: Some(4),
            ..Default::default()
        };
        assert_eq!(choose_variant(&m, &p).unwrap().id, 1);
    }

    #[test]
    fn test_disallowed_variants_are_skipped() {
        let mut m = build(&[
            AudioSpec { language: "fr", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
        ]);
        m.variants[0].allowed_by_key_system = false;
        assert_eq!(choose_variant(&m, &prefs("fr")).unwrap().id, 1);
    }

    #[test]
    fn test_ties_keep_manifest_order() {
        let m = build(&[
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
            AudioSpec { language: "en", role: None, primary: false, label: None, channels: 2 },
        ]);
        assert_eq!(choose_variant(&m, &prefs("en")).unwrap().id, 0);
    }

    #[test]
    fn test_text_stream_selection() {
        let mut m = Manifest::new(PresentationTimeline::new_vod(60.0));
        let mut t1 = Stream::new(ContentType::Text, "text/vtt", "");
        t1.language = Some(String::from("en"));
        let mut t2 = Stream::new(ContentType::Text, "text/vtt", "");
        t2.language = Some(String::from("de"));
        t2.roles = vec![String::from("forced-subtitle")];
        let id1 = m.add_stream(t1);
        let id2 = m.add_stream(t2);
        m.text_streams = vec![id1, id2];
        let p = SelectionPreferences {
            language: Some(String::from("de")),
            ..Default::default()
        };
        assert_eq!(choose_text_stream(&m, &p).unwrap().id, id2);
    }
}
