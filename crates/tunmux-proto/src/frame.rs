//! Frames multiplexed over the physical stream

use crate::{SessionId, TunnelId};
use serde::{Deserialize, Serialize};

/// Generic tunnel frame
///
/// `tunnel_id` is the routing key. A frame with `closed` set means the sender
/// has no more data for that tunnel and it should be torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFrame {
    pub tunnel_id: TunnelId,
    pub session_id: SessionId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub closed: bool,
}

impl TunnelFrame {
    pub fn data(tunnel_id: TunnelId, session_id: impl Into<SessionId>, data: Vec<u8>) -> Self {
        Self {
            tunnel_id,
            session_id: session_id.into(),
            data,
            closed: false,
        }
    }

    pub fn close(tunnel_id: TunnelId, session_id: impl Into<SessionId>) -> Self {
        Self {
            tunnel_id,
            session_id: session_id.into(),
            data: Vec::new(),
            closed: true,
        }
    }
}

/// SOCKS5 relay frame
///
/// `tunnel_id` is the correlation key mapping the frame back to a local socket.
/// `sequence` counts frames per direction per connection and is only used to
/// detect gaps, never to reorder.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksFrame {
    pub tunnel_id: TunnelId,
    pub sequence: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub closed: bool,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SocksFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocksFrame")
            .field("tunnel_id", &self.tunnel_id)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .field("closed", &self.closed)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

// Vec<u8> as a byte string rather than a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_has_no_data() {
        let frame = TunnelFrame::close(7, "abc");
        assert!(frame.closed);
        assert!(frame.data.is_empty());
        assert_eq!(frame.session_id, "abc");
    }

    #[test]
    fn test_socks_frame_debug_hides_password() {
        let frame = SocksFrame {
            tunnel_id: 3,
            sequence: 1,
            data: b"hello".to_vec(),
            closed: false,
            username: "operator".to_string(),
            password: "hunter2".to_string(),
        };

        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("operator"));
        assert!(!rendered.contains("hunter2"));
    }
}
