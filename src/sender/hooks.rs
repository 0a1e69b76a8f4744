use super::transport::{HttpTransport, PayloadData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Rewrites a request before it is sent. Beacon sends skip it. On error the original request is
/// sent unchanged.
#[async_trait]
pub trait PayloadPreprocessor: Send + Sync {
    async fn process(&self, payload: PayloadData, sync: bool) -> Result<PayloadData, HookError>;
}

/// Observes every request handed to a transport.
pub trait PayloadListener: Send + Sync {
    fn on_payload_sent(
        &self,
        original: &PayloadData,
        sent: &PayloadData,
        sync: bool,
        is_beacon: bool,
    ) -> Result<(), HookError>;
}

/// Receives the raw body of every collector response.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, body: &str) -> Result<(), HookError>;
}

/// Persistence for the collector-assigned correlation cookie.
#[cfg_attr(test, automock)]
pub trait CookieStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str, max_age: Duration);
}

/// Process-local cookie store.
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    cookies: Mutex<HashMap<String, String>>,
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, name: &str) -> Option<String> {
        self.cookies.lock().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str, _max_age: Duration) {
        self.cookies.lock().insert(name.to_string(), value.to_string());
    }
}

/// Optional collaborators wired into the HTTP manager.
#[derive(Clone, Default)]
pub struct SendHooks {
    pub preprocessor: Option<Arc<dyn PayloadPreprocessor>>,
    pub listener: Option<Arc<dyn PayloadListener>>,
    pub cookie_store: Option<Arc<dyn CookieStore>>,
    /// Replaces the XHR/Fetch transport for batched sends.
    pub xhr_override: Option<Arc<dyn HttpTransport>>,
}

impl std::fmt::Debug for SendHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHooks")
            .field("preprocessor", &self.preprocessor.is_some())
            .field("listener", &self.listener.is_some())
            .field("cookie_store", &self.cookie_store.is_some())
            .field("xhr_override", &self.xhr_override.is_some())
            .finish()
    }
}
