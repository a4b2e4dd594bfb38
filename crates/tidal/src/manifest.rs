use base64::{Engine, prelude::BASE64_STANDARD};
use roxmltree::Document;
use serde::Deserialize;

use crate::error::TidalError;

/// Flattened stream manifest: an ordered fetch list (initialization
/// segment first) plus the container identity needed to name the file.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub mime_type: String,
    pub codec: String,
    /// Wrapped content key; present only for encrypted containers.
    pub key_id: Option<String>,
    pub segments: Vec<String>,
}

impl Manifest {
    /// Decodes the provider's base64 manifest payload, which is either
    /// DASH XML or the provider's JSON container description.
    pub fn parse(manifest_mime_type: &str, manifest_b64: &str) -> Result<Self, TidalError> {
        let raw = BASE64_STANDARD.decode(manifest_b64)?;
        let text = String::from_utf8_lossy(&raw);
        match manifest_mime_type {
            "application/dash+xml" => parse_dash(&text),
            "application/vnd.tidal.bts" => parse_bts(&text),
            other => Err(TidalError::UnsupportedManifest(other.to_owned())),
        }
    }

    pub fn extension(&self) -> Result<&'static str, TidalError> {
        extension_for(&self.mime_type, &self.codec)
    }

    pub fn encrypted(&self) -> bool {
        self.key_id.is_some()
    }
}

/// File extension for a `(mime type, codec)` pair. Anything outside the
/// table is refused rather than guessed.
pub fn extension_for(mime_type: &str, codec: &str) -> Result<&'static str, TidalError> {
    let codec = codec.to_ascii_lowercase();
    match (mime_type, codec.as_str()) {
        ("audio/mp4", "flac") => Ok("flac"),
        ("audio/mp4", "eac3" | "aac" | "alac" | "mp4a.40.2" | "mp4a.40.5") => Ok("m4a"),
        ("audio/flac", "flac") => Ok("flac"),
        _ => Err(TidalError::UnsupportedFormat {
            mime_type: mime_type.to_owned(),
            codec,
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BtsManifest {
    mime_type: String,
    codecs: String,
    #[serde(default)]
    encryption_type: Option<String>,
    #[serde(default)]
    key_id: Option<String>,
    urls: Vec<String>,
}

fn parse_bts(text: &str) -> Result<Manifest, TidalError> {
    let bts: BtsManifest = serde_json::from_str(text)?;
    if bts.urls.is_empty() {
        return Err(TidalError::Manifest("no urls"));
    }

    let encrypted = !matches!(bts.encryption_type.as_deref(), None | Some("NONE"));
    if encrypted && bts.key_id.is_none() {
        return Err(TidalError::Manifest("encrypted container without keyId"));
    }

    Ok(Manifest {
        mime_type: bts.mime_type,
        codec: bts.codecs,
        key_id: if encrypted { bts.key_id } else { None },
        segments: bts.urls,
    })
}

fn parse_dash(text: &str) -> Result<Manifest, TidalError> {
    let doc = Document::parse(text)?;

    let adaptation = doc
        .descendants()
        .find(|n| n.tag_name().name() == "AdaptationSet")
        .ok_or(TidalError::Manifest("missing AdaptationSet"))?;
    let representation = doc
        .descendants()
        .find(|n| n.tag_name().name() == "Representation")
        .ok_or(TidalError::Manifest("missing Representation"))?;

    let mime_type = representation
        .attribute("mimeType")
        .or_else(|| adaptation.attribute("mimeType"))
        .ok_or(TidalError::Manifest("missing mimeType"))?;
    let codec = representation
        .attribute("codecs")
        .or_else(|| adaptation.attribute("codecs"))
        .ok_or(TidalError::Manifest("missing codecs"))?;

    let template = doc
        .descendants()
        .find(|n| n.tag_name().name() == "SegmentTemplate")
        .ok_or(TidalError::Manifest("missing SegmentTemplate"))?;
    let init = template
        .attribute("initialization")
        .ok_or(TidalError::Manifest("missing initialization template"))?;
    let media = template
        .attribute("media")
        .ok_or(TidalError::Manifest("missing media template"))?;

    let timeline = template
        .descendants()
        .find(|n| n.tag_name().name() == "SegmentTimeline")
        .ok_or(TidalError::Manifest("missing SegmentTimeline"))?;

    // 2 + Σ (r + 1) over timeline entries; the count has to be exact or
    // the tail of the track is silently dropped.
    let mut count: usize = 2;
    let mut entries = 0usize;
    for entry in timeline.children().filter(|n| n.tag_name().name() == "S") {
        entries += 1;
        let repeat = match entry.attribute("r") {
            Some(r) => r
                .parse::<usize>()
                .map_err(|_| TidalError::Manifest("negative repeat values are unsupported"))?,
            None => 0,
        };
        count += repeat + 1;
    }
    if entries == 0 {
        return Err(TidalError::Manifest("empty SegmentTimeline"));
    }

    let mut segments = Vec::with_capacity(count);
    segments.push(init.to_owned());
    for number in 1..count {
        segments.push(media.replace("$Number$", &number.to_string()));
    }

    Ok(Manifest {
        mime_type: mime_type.to_owned(),
        codec: codec.to_owned(),
        key_id: None,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DASH: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <Representation id="0" codecs="flac" bandwidth="1000000">
        <SegmentTemplate initialization="https://cdn.example/init.mp4" media="https://cdn.example/seg-$Number$.mp4" startNumber="1" timescale="44100">
          <SegmentTimeline>
            <S t="0" d="10" r="3"/>
            <S d="10"/>
            <S d="5" r="1"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn b64(text: &str) -> String {
        BASE64_STANDARD.encode(text)
    }

    #[test]
    fn dash_segment_count_is_exact() {
        let manifest = Manifest::parse("application/dash+xml", &b64(DASH)).unwrap();
        // 2 + (3+1) + 1 + (1+1)
        assert_eq!(manifest.segments.len(), 9);
        assert_eq!(manifest.segments[0], "https://cdn.example/init.mp4");
        assert_eq!(manifest.segments[1], "https://cdn.example/seg-1.mp4");
        assert_eq!(manifest.segments[8], "https://cdn.example/seg-8.mp4");
        assert_eq!(manifest.codec, "flac");
        assert_eq!(manifest.mime_type, "audio/mp4");
        assert!(!manifest.encrypted());
    }

    #[test]
    fn dash_negative_repeat_is_refused() {
        let xml = DASH.replace(r#"r="3""#, r#"r="-1""#);
        assert!(Manifest::parse("application/dash+xml", &b64(&xml)).is_err());
    }

    #[test]
    fn bts_plain() {
        let json = r#"{"mimeType":"audio/flac","codecs":"flac","encryptionType":"NONE","urls":["https://cdn.example/track.flac"]}"#;
        let manifest = Manifest::parse("application/vnd.tidal.bts", &b64(json)).unwrap();
        assert_eq!(manifest.segments, vec!["https://cdn.example/track.flac"]);
        assert!(!manifest.encrypted());
    }

    #[test]
    fn bts_encrypted_carries_key() {
        let json = r#"{"mimeType":"audio/mp4","codecs":"aac","encryptionType":"OLD_AES","keyId":"a2V5","urls":["https://cdn.example/track.mp4"]}"#;
        let manifest = Manifest::parse("application/vnd.tidal.bts", &b64(json)).unwrap();
        assert!(manifest.encrypted());
        assert_eq!(manifest.key_id.as_deref(), Some("a2V5"));
    }

    #[test]
    fn bts_encrypted_without_key_is_refused() {
        let json = r#"{"mimeType":"audio/mp4","codecs":"aac","encryptionType":"OLD_AES","urls":["https://cdn.example/track.mp4"]}"#;
        assert!(Manifest::parse("application/vnd.tidal.bts", &b64(json)).is_err());
    }

    #[test]
    fn unknown_manifest_mime_is_refused() {
        assert!(Manifest::parse("application/x-mystery", &b64("{}")).is_err());
    }

    #[test]
    fn extension_table() {
        assert_eq!(extension_for("audio/mp4", "flac").unwrap(), "flac");
        assert_eq!(extension_for("audio/mp4", "FLAC").unwrap(), "flac");
        assert_eq!(extension_for("audio/mp4", "eac3").unwrap(), "m4a");
        assert_eq!(extension_for("audio/mp4", "aac").unwrap(), "m4a");
        assert_eq!(extension_for("audio/mp4", "alac").unwrap(), "m4a");
        assert_eq!(extension_for("audio/mp4", "MP4A.40.2").unwrap(), "m4a");
        assert_eq!(extension_for("audio/mp4", "mp4a.40.5").unwrap(), "m4a");
        assert_eq!(extension_for("audio/flac", "flac").unwrap(), "flac");
        assert!(extension_for("audio/ogg", "vorbis").is_err());
        assert!(extension_for("audio/mp4", "mp4a.40.33").is_err());
    }
}
