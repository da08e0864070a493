//! SFU client configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::encoding::ScalabilityMode;
use crate::error::{Error, Result};
use crate::types::PeerId;

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

/// Signaling endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Media server host name
    pub host: String,
    /// Signaling port
    pub port: u16,
    /// Room to join
    pub room_id: String,
    /// Fixed local peer id; generated when absent
    pub peer_id: Option<String>,
    /// Use `wss://` instead of `ws://`
    pub secure: bool,
    /// Per-request timeout (ms)
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4443,
            room_id: String::new(),
            peer_id: None,
            secure: true,
            request_timeout_ms: 20_000,
        }
    }
}

impl SignalingConfig {
    /// Build the signaling URL for the given local peer
    pub fn url(&self, peer_id: &PeerId) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}/", self.host, self.port))
            .map_err(|e| Error::Config(format!("Invalid signaling endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("roomId", &self.room_id)
            .append_pair("peerId", peer_id.as_str());
        Ok(url)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Local media publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// `simple` or `simulcast`
    pub scalability: ScalabilityMode,
    /// Video codec the server mandates (matched case-insensitively on mime type)
    pub preferred_video_codec: String,
    /// Initial video bitrate hint (kbps)
    pub video_start_bitrate_kbps: u32,
    /// Ask the server for TCP-only ICE candidates
    pub force_tcp: bool,
    /// Name announced on join
    pub display_name: String,
    pub produce_audio: bool,
    pub produce_video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            scalability: ScalabilityMode::Simple,
            preferred_video_codec: "video/H264".to_string(),
            video_start_bitrate_kbps: 1000,
            force_tcp: false,
            display_name: "me".to_string(),
            produce_audio: true,
            produce_video: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SYNCTV_SFU__SIGNALING__ROOM_ID, SYNCTV_SFU__MEDIA__SCALABILITY, ...
        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_SFU")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling.host.trim().is_empty() {
            return Err(Error::Config("signaling.host must not be empty".into()));
        }
        if self.signaling.room_id.trim().is_empty() {
            return Err(Error::Config("signaling.room_id must not be empty".into()));
        }
        if self.signaling.request_timeout_ms == 0 {
            return Err(Error::Config(
                "signaling.request_timeout_ms must be greater than zero".into(),
            ));
        }
        if let Some(peer_id) = &self.signaling.peer_id {
            if peer_id.trim().is_empty() {
                return Err(Error::Config("signaling.peer_id must not be blank".into()));
            }
        }
        Ok(())
    }
}
