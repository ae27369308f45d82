//! Rendezvous signaling messages
//!
//! Every rendezvous frame is one JSON object discriminated by its `type` field.
//! The translator is pure: [`decode`] and [`encode`] perform no I/O and keep no
//! session state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A network reachability descriptor exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// ICE server URLs arrive either as a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Peer session options supplied by the rendezvous server's `config` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectionOptions {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// `"relay"` restricts gathering to TURN candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<String>,
    /// Options this client does not interpret, kept for the peer session
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PeerConnectionOptions {
    /// Whether only relayed candidates may be used
    pub fn relay_only(&self) -> bool {
        self.ice_transport_policy.as_deref() == Some("relay")
    }

    /// Every STUN/TURN URL across all servers
    pub fn ice_urls(&self) -> Vec<String> {
        self.ice_servers.iter().flat_map(|s| s.urls.to_vec()).collect()
    }
}

/// Messages received from the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    Config {
        #[serde(rename = "peerConnectionOptions", default)]
        peer_connection_options: PeerConnectionOptions,
    },
    StreamerList {
        ids: Vec<String>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    PeerDataChannels {
        #[serde(rename = "sendStreamId")]
        send_stream_id: u16,
        #[serde(rename = "recvStreamId")]
        recv_stream_id: u16,
    },
    Pong {
        #[serde(default)]
        time: f64,
    },
    PlayerCount {
        count: u32,
    },
    StreamerDisconnected,
    Error {
        #[serde(default)]
        message: String,
    },
    Disconnect {
        #[serde(default)]
        reason: String,
    },
}

impl InboundMessage {
    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Config { .. } => "config",
            InboundMessage::StreamerList { .. } => "streamerList",
            InboundMessage::Offer { .. } => "offer",
            InboundMessage::Answer { .. } => "answer",
            InboundMessage::IceCandidate { .. } => "iceCandidate",
            InboundMessage::PeerDataChannels { .. } => "peerDataChannels",
            InboundMessage::Pong { .. } => "pong",
            InboundMessage::PlayerCount { .. } => "playerCount",
            InboundMessage::StreamerDisconnected => "streamerDisconnected",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// Messages sent to the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    ListStreamers,
    Subscribe {
        #[serde(rename = "streamerId")]
        streamer_id: String,
    },
    Unsubscribe,
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    Ping {
        time: u64,
    },
}

impl OutboundMessage {
    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ListStreamers => "listStreamers",
            OutboundMessage::Subscribe { .. } => "subscribe",
            OutboundMessage::Unsubscribe => "unsubscribe",
            OutboundMessage::Answer { .. } => "answer",
            OutboundMessage::IceCandidate { .. } => "iceCandidate",
            OutboundMessage::Ping { .. } => "ping",
        }
    }
}

/// Decode one rendezvous text frame
pub fn decode(frame: &str) -> Result<InboundMessage> {
    serde_json::from_str(frame).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Decode one rendezvous frame delivered as raw bytes
pub fn decode_bytes(frame: &[u8]) -> Result<InboundMessage> {
    serde_json::from_slice(frame).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Encode one outbound message as a rendezvous text frame
pub fn encode(message: &OutboundMessage) -> Result<String> {
    serde_json::to_string(message).map_err(|e| Error::EncodeError(e.to_string()))
}
