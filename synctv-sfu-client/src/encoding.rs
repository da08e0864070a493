//! Encoding policy
//!
//! Pure helpers deciding what goes into a `produce` call: which codec and
//! which encoding layers. Also decodes the scalability mode string the server
//! puts on consumer encodings.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::media::{RtpCapabilities, RtpCodecCapability, RtpEncodingParameters};

/// Downscale factors for simulcast layers, coarsest first
pub const SIMULCAST_DOWNSCALE_FACTORS: [f64; 3] = [4.0, 2.0, 1.0];

static SCALABILITY_MODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[LS]([1-9]\d?)T([1-9]\d?)(_KEY)?").expect("scalability mode pattern is valid")
});

/// Scalability flag chosen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalabilityMode {
    #[default]
    Simple,
    Simulcast,
}

impl fmt::Display for ScalabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::Simulcast => f.write_str("simulcast"),
        }
    }
}

impl FromStr for ScalabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "simulcast" => Ok(Self::Simulcast),
            other => Err(format!("Unknown scalability mode: {other}")),
        }
    }
}

/// Encoding hints for a video producer.
///
/// `Simple` leaves encodings to the engine; `Simulcast` yields one layer per
/// entry of [`SIMULCAST_DOWNSCALE_FACTORS`].
#[must_use]
pub fn encodings_for(mode: ScalabilityMode) -> Option<Vec<RtpEncodingParameters>> {
    match mode {
        ScalabilityMode::Simple => None,
        ScalabilityMode::Simulcast => Some(
            SIMULCAST_DOWNSCALE_FACTORS
                .iter()
                .map(|factor| RtpEncodingParameters {
                    scale_resolution_down_by: Some(*factor),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// First codec whose mime type matches `mime_type`, ignoring case
#[must_use]
pub fn select_codec<'a>(
    capabilities: &'a RtpCapabilities,
    mime_type: &str,
) -> Option<&'a RtpCodecCapability> {
    capabilities
        .codecs
        .iter()
        .find(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type))
}

/// Spatial/temporal layer counts decoded from a scalability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalabilityInfo {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl Default for ScalabilityInfo {
    fn default() -> Self {
        Self {
            spatial_layers: 1,
            temporal_layers: 1,
            ksvc: false,
        }
    }
}

/// Decode a scalability mode such as `L3T3_KEY` or `S1T3`.
///
/// Missing or unrecognized modes mean a single spatial and temporal layer.
#[must_use]
pub fn parse_scalability_mode(mode: Option<&str>) -> ScalabilityInfo {
    let Some(captures) = mode.and_then(|m| SCALABILITY_MODE_RE.captures(m)) else {
        return ScalabilityInfo::default();
    };

    let layer = |idx: usize| {
        captures
            .get(idx)
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .unwrap_or(1)
    };

    ScalabilityInfo {
        spatial_layers: layer(1),
        temporal_layers: layer(2),
        ksvc: captures.get(3).is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use serde_json::Value;

    fn codec(kind: MediaKind, mime: &str) -> RtpCodecCapability {
        RtpCodecCapability {
            kind,
            mime_type: mime.to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Value::Null,
            rtcp_feedback: Vec::new(),
        }
    }

    #[test]
    fn test_simple_has_no_encodings() {
        assert!(encodings_for(ScalabilityMode::Simple).is_none());
    }

    #[test]
    fn test_simulcast_layers_coarsest_first() {
        let encodings = encodings_for(ScalabilityMode::Simulcast).unwrap();
        let factors: Vec<f64> = encodings
            .iter()
            .map(|e| e.scale_resolution_down_by.unwrap())
            .collect();
        assert_eq!(factors, vec![4.0, 2.0, 1.0]);
        assert!(encodings.iter().all(|e| e.rid.is_none()));
    }

    #[test]
    fn test_select_codec_case_insensitive() {
        let caps = RtpCapabilities {
            codecs: vec![
                codec(MediaKind::Audio, "audio/opus"),
                codec(MediaKind::Video, "video/VP8"),
                codec(MediaKind::Video, "video/H264"),
            ],
            header_extensions: Vec::new(),
        };
        let selected = select_codec(&caps, "video/h264").unwrap();
        assert_eq!(selected.mime_type, "video/H264");
        assert!(select_codec(&caps, "video/AV1").is_none());
    }

    #[test]
    fn test_parse_scalability_mode() {
        let info = parse_scalability_mode(Some("L3T3_KEY"));
        assert_eq!((info.spatial_layers, info.temporal_layers, info.ksvc), (3, 3, true));

        let info = parse_scalability_mode(Some("S1T3"));
        assert_eq!((info.spatial_layers, info.temporal_layers, info.ksvc), (1, 3, false));

        assert_eq!(parse_scalability_mode(None), ScalabilityInfo::default());
        assert_eq!(parse_scalability_mode(Some("bogus")), ScalabilityInfo::default());
    }

    #[test]
    fn test_scalability_mode_from_str() {
        assert_eq!("Simulcast".parse::<ScalabilityMode>(), Ok(ScalabilityMode::Simulcast));
        assert!("svc".parse::<ScalabilityMode>().is_err());
    }
}
