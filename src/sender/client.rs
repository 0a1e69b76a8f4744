use super::serialization::MAX_REDUCED_REQUEST_SIZE;
use super::transport::{
    BeaconTransport, HttpTransport, PayloadData, TransportEnvironment, TransportError,
    TransportResponse,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
    pub enable_compression: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            max_connections: 20,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            enable_compression: true,
        }
    }
}

fn build_client(config: &ClientConfig) -> Result<Client, TransportError> {
    let mut client_builder = ClientBuilder::new()
        .connect_timeout(config.connection_timeout)
        .pool_max_idle_per_host(config.max_connections)
        .pool_idle_timeout(config.keep_alive_timeout)
        .user_agent(&config.user_agent);

    if config.enable_compression {
        client_builder = client_builder.gzip(true);
    }

    client_builder.build().map_err(|e| {
        TransportError::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
    })
}

fn header_map(headers: &std::collections::BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Skipping invalid request header '{}'", name),
        }
    }
    map
}

/// reqwest-backed request/response transport, usable as either XHR or Fetch.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(&config)?,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send_post(
        &self,
        payload: PayloadData,
        _sync: bool,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .post(&payload.url)
            .headers(header_map(&payload.headers))
            .body(payload.data);

        if let Some(timeout) = payload.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = match response.text().await {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                debug!("Failed to read response body: {}", e);
                None
            }
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Beacon emulation: bodies above the beacon ceiling are refused, accepted ones are posted in the
/// background without waiting for a response.
#[derive(Debug, Clone)]
pub struct ReqwestBeacon {
    client: Client,
    max_size: usize,
}

impl ReqwestBeacon {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(&config)?,
            max_size: MAX_REDUCED_REQUEST_SIZE,
        })
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

impl BeaconTransport for ReqwestBeacon {
    fn send_beacon(&self, url: &str, data: &[u8]) -> bool {
        if data.len() > self.max_size {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Beacon refused: no async runtime available");
            return false;
        };

        let request = self
            .client
            .post(url)
            .body(bytes::Bytes::copy_from_slice(data));
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                debug!("Beacon delivery failed: {}", e);
            }
        });
        true
    }
}

/// A host offering all three send primitives backed by one reqwest client configuration.
pub fn reqwest_environment(config: ClientConfig) -> Result<TransportEnvironment, TransportError> {
    let transport = Arc::new(ReqwestTransport::new(config.clone())?);
    let beacon = Arc::new(ReqwestBeacon::new(config)?);

    Ok(TransportEnvironment {
        xhr: Some(transport.clone()),
        fetch: Some(transport),
        beacon: Some(beacon),
        react_native: false,
    })
}
