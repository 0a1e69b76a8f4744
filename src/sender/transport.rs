use crate::domain::EventSendType;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The three send primitives a host can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Xhr,
    Fetch,
    Beacon,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timeout: {0}")]
    Timeout(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TransportError {
    /// Status reported to the retry logic: timeouts look like a server error, everything else
    /// like a dropped connection.
    pub fn status(&self) -> u16 {
        match self {
            TransportError::Timeout(_) => 500,
            _ => 0,
        }
    }
}

/// A fully assembled request.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadData {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
    pub timeout: Option<Duration>,
    pub disable_xhr_sync: bool,
    pub disable_fetch_keep_alive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl TransportResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Request/response POST primitive (XHR or Fetch style).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends one request. `sync` marks requests made while the host is going away.
    async fn send_post(
        &self,
        payload: PayloadData,
        sync: bool,
    ) -> Result<TransportResponse, TransportError>;
}

/// Fire-and-forget primitive with no response visibility.
pub trait BeaconTransport: Send + Sync {
    /// Returns `false` when the host refuses to queue the body.
    fn send_beacon(&self, url: &str, data: &[u8]) -> bool;
}

/// Send primitives available in the current host.
#[derive(Clone, Default)]
pub struct TransportEnvironment {
    pub xhr: Option<Arc<dyn HttpTransport>>,
    pub fetch: Option<Arc<dyn HttpTransport>>,
    pub beacon: Option<Arc<dyn BeaconTransport>>,
    /// React-Native-like hosts have no beacons and prefer Fetch over XHR.
    pub react_native: bool,
}

impl fmt::Debug for TransportEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEnvironment")
            .field("xhr", &self.xhr.is_some())
            .field("fetch", &self.fetch.is_some())
            .field("beacon", &self.beacon.is_some())
            .field("react_native", &self.react_native)
            .finish()
    }
}

#[derive(Clone)]
pub enum SendPost {
    Http(Arc<dyn HttpTransport>),
    Beacon(Arc<dyn BeaconTransport>),
}

/// A transport chosen for one send type.
#[derive(Clone)]
pub struct SenderInterface {
    pub transport: TransportType,
    pub is_sync: bool,
    pub is_custom: bool,
    pub sender: SendPost,
}

impl fmt::Debug for SenderInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderInterface")
            .field("transport", &self.transport)
            .field("is_sync", &self.is_sync)
            .field("is_custom", &self.is_custom)
            .finish()
    }
}

/// Preferences that steer transport selection.
#[derive(Clone, Default)]
pub struct TransportSelection {
    pub transports: Vec<TransportType>,
    pub unload_transports: Vec<TransportType>,
    pub disable_xhr_sync: bool,
    pub disable_fetch_keep_alive: bool,
    pub xhr_override: Option<Arc<dyn HttpTransport>>,
    pub always_use_xhr_override: bool,
}

impl TransportEnvironment {
    /// First available transport from `preferences`. Sync-capable selection skips XHR when
    /// synchronous XHR is disabled and Fetch when keep-alive is disabled.
    pub fn sender_interface(
        &self,
        preferences: &[TransportType],
        sync_support: bool,
        selection: &TransportSelection,
    ) -> Option<SenderInterface> {
        preferences.iter().find_map(|transport| {
            let sender = match transport {
                TransportType::Xhr if !(sync_support && selection.disable_xhr_sync) => {
                    self.xhr.clone().map(SendPost::Http)
                }
                TransportType::Fetch if !(sync_support && selection.disable_fetch_keep_alive) => {
                    self.fetch.clone().map(SendPost::Http)
                }
                TransportType::Beacon if !self.react_native => {
                    self.beacon.clone().map(SendPost::Beacon)
                }
                _ => None,
            }?;

            Some(SenderInterface {
                transport: *transport,
                is_sync: sync_support,
                is_custom: false,
                sender,
            })
        })
    }
}

/// The transport used for each [`EventSendType`].
#[derive(Clone, Debug, Default)]
pub struct SendInterfaces {
    pub batched: Option<SenderInterface>,
    pub synchronous: Option<SenderInterface>,
    pub send_beacon: Option<SenderInterface>,
    pub sync_fetch: Option<SenderInterface>,
}

impl SendInterfaces {
    pub fn select(environment: &TransportEnvironment, selection: &TransportSelection) -> Self {
        use TransportType::{Beacon, Fetch, Xhr};

        let custom = selection.xhr_override.clone().map(|transport| SenderInterface {
            transport: Xhr,
            is_sync: false,
            is_custom: true,
            sender: SendPost::Http(transport),
        });

        let batched_preferences = if environment.react_native {
            vec![Fetch, Xhr]
        } else if selection.transports.is_empty() {
            vec![Xhr, Fetch, Beacon]
        } else {
            selection.transports.clone()
        };

        let batched = custom
            .clone()
            .or_else(|| environment.sender_interface(&batched_preferences, false, selection));

        if selection.always_use_xhr_override && custom.is_some() {
            let sync_custom = custom.map(|c| SenderInterface { is_sync: true, ..c });
            return Self {
                batched,
                synchronous: sync_custom.clone(),
                send_beacon: sync_custom.clone(),
                sync_fetch: sync_custom,
            };
        }

        let synchronous = environment
            .sender_interface(&batched_preferences, true, selection)
            .or_else(|| environment.sender_interface(&[Xhr, Fetch, Beacon], true, selection));

        let unload_preferences = if selection.unload_transports.is_empty() {
            vec![Beacon, Fetch]
        } else {
            selection.unload_transports.clone()
        };
        let send_beacon = environment
            .sender_interface(&unload_preferences, true, selection)
            .or_else(|| synchronous.clone());
        let sync_fetch = environment
            .sender_interface(&[Fetch, Beacon], true, selection)
            .or_else(|| synchronous.clone());

        Self {
            batched,
            synchronous,
            send_beacon,
            sync_fetch,
        }
    }

    pub fn get(&self, send_type: EventSendType) -> Option<&SenderInterface> {
        match send_type {
            EventSendType::Batched => self.batched.as_ref(),
            EventSendType::Synchronous => self.synchronous.as_ref(),
            EventSendType::SendBeacon => self.send_beacon.as_ref(),
            EventSendType::SyncFetch => self.sync_fetch.as_ref(),
        }
    }
}
