//! Common types used throughout the SFU client

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alphabet used for locally generated peer ids (lowercase alphanumeric).
const PEER_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Length of a locally generated peer id
const PEER_ID_LEN: usize = 8;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a peer in the room. Generated locally for ourselves,
    /// assigned by other clients for remote peers.
    PeerId
);

string_id!(
    /// Server-assigned identifier of a WebRTC transport
    TransportId
);

string_id!(
    /// Server-assigned identifier of a producer
    ProducerId
);

string_id!(
    /// Server-assigned identifier of a consumer
    ConsumerId
);

string_id!(
    /// Identifier of a registered track; shared with its producer or consumer
    TrackId
);

impl PeerId {
    /// Generate a fresh 8-character lowercase alphanumeric peer id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(PEER_ID_LEN, &PEER_ID_ALPHABET))
    }
}

impl From<&ProducerId> for TrackId {
    fn from(id: &ProducerId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&ConsumerId> for TrackId {
    fn from(id: &ConsumerId) -> Self {
        Self(id.0.clone())
    }
}

/// Media kind of a track, producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
