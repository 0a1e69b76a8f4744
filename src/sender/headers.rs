//! Collector wire vocabulary: request header names, their query-string equivalents and the
//! assembly of per-payload request details.

use std::collections::BTreeMap;

pub const DEFAULT_CONTENT_TYPE: &str = "application/x-json-stream";
pub const DEFAULT_CACHE_CONTROL: &str = "no-cache, no-store";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const CACHE_CONTROL_HEADER: &str = "cache-control";
pub const NO_RESPONSE_BODY_QS: &str = "&NoResponseBody=true";
pub const MSFPC_QS: &str = "ext.intweb.msfpc";
pub const MSFPC_COOKIE: &str = "MSFPC";

pub const CLIENT_ID: &str = "client-id";
pub const CLIENT_VERSION: &str = "client-version";
pub const API_KEY: &str = "apikey";
pub const UPLOAD_TIME: &str = "upload-time";
pub const TIME_DELTA_TO_APPLY: &str = "time-delta-to-apply-millis";
pub const MSA_DEVICE_TICKET: &str = "AuthMsaDeviceTicket";
pub const AUTH_X_TOKEN: &str = "AuthXToken";

pub const TIME_DELTA_HEADER: &str = "time-delta-millis";
pub const KILL_TOKENS_HEADER: &str = "kill-tokens";
pub const KILL_DURATION_HEADER: &str = "kill-duration";
pub const KILL_DURATION_SECONDS_HEADER: &str = "kill-duration-seconds";

const NO_AUTH_CLIENT_ID: &str = "NO_AUTH";

struct CollectorHeader {
    qs_name: &'static str,
    header_name: &'static str,
    allow_qs: bool,
}

const COLLECTOR_HEADERS: &[CollectorHeader] = &[
    CollectorHeader { qs_name: MSA_DEVICE_TICKET, header_name: MSA_DEVICE_TICKET, allow_qs: false },
    CollectorHeader { qs_name: CLIENT_VERSION, header_name: CLIENT_VERSION, allow_qs: true },
    CollectorHeader { qs_name: CLIENT_ID, header_name: "Client-Id", allow_qs: true },
    CollectorHeader { qs_name: API_KEY, header_name: API_KEY, allow_qs: true },
    CollectorHeader { qs_name: TIME_DELTA_TO_APPLY, header_name: TIME_DELTA_TO_APPLY, allow_qs: true },
    CollectorHeader { qs_name: UPLOAD_TIME, header_name: UPLOAD_TIME, allow_qs: true },
    CollectorHeader { qs_name: AUTH_X_TOKEN, header_name: AUTH_X_TOKEN, allow_qs: true },
];

/// Header used for a query-string parameter, if the collector defines one.
pub fn header_for_qs(qs_name: &str) -> Option<&'static str> {
    COLLECTOR_HEADERS
        .iter()
        .find(|h| h.qs_name == qs_name)
        .map(|h| h.header_name)
}

/// Query-string parameter that may carry a header's value when headers are avoided.
pub fn qs_for_header(header_name: &str) -> Option<&'static str> {
    COLLECTOR_HEADERS
        .iter()
        .find(|h| h.allow_qs && h.header_name.eq_ignore_ascii_case(header_name))
        .map(|h| h.qs_name)
}

pub fn client_version() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Collector URL with the fixed query prefix every request carries.
pub fn collector_url(endpoint: &str) -> String {
    format!("{endpoint}?cors=true&{CONTENT_TYPE_HEADER}={DEFAULT_CONTENT_TYPE}")
}

/// Everything about a request that depends on the payload rather than the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDetails {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub use_headers: bool,
}

/// Inputs to [`build_request_details`].
#[derive(Debug)]
pub struct RequestContext<'a> {
    pub url: &'a str,
    pub custom_headers: &'a BTreeMap<String, String>,
    pub api_keys: &'a [String],
    pub msfpc: Option<&'a str>,
    pub clock_skew: Option<&'a str>,
    pub query_params: &'a [(String, String)],
    pub use_headers: bool,
}

impl RequestDetails {
    fn add(&mut self, name: &str, value: &str, use_headers: bool) {
        if name.is_empty() || value.is_empty() {
            return;
        }

        match header_for_qs(name).filter(|_| use_headers) {
            Some(header) => {
                self.headers.insert(header.to_string(), value.to_string());
                self.use_headers = true;
            }
            None => self.push_query(name, value),
        }
    }

    fn push_query(&mut self, name: &str, value: &str) {
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        self.url.push('&');
        self.url.push_str(name);
        self.url.push('=');
        self.url.push_str(&encoded);
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

pub fn build_request_details(ctx: &RequestContext<'_>) -> RequestDetails {
    let mut details = RequestDetails {
        url: ctx.url.to_string(),
        ..RequestDetails::default()
    };

    if ctx.use_headers {
        details.headers.extend(
            ctx.custom_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        details.use_headers = !details.headers.is_empty();
    } else {
        for (name, value) in ctx.custom_headers {
            match qs_for_header(name) {
                Some(qs) => details.add(qs, value, false),
                None => {
                    // Unmapped headers still travel as headers; beacons may drop them.
                    details.headers.insert(name.clone(), value.clone());
                    details.use_headers = true;
                }
            }
        }
    }

    details.add(CLIENT_ID, NO_AUTH_CLIENT_ID, ctx.use_headers);
    details.add(CLIENT_VERSION, &client_version(), ctx.use_headers);
    details.add(API_KEY, &ctx.api_keys.join(","), ctx.use_headers);
    details.add(
        UPLOAD_TIME,
        &chrono::Utc::now().timestamp_millis().to_string(),
        ctx.use_headers,
    );

    if let Some(msfpc) = ctx.msfpc {
        details.push_query(MSFPC_QS, msfpc);
    }

    if let Some(skew) = ctx.clock_skew {
        details.add(TIME_DELTA_TO_APPLY, skew, ctx.use_headers);
    }

    for (name, value) in ctx.query_params {
        details.push_query(name, value);
    }

    details
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(
        headers: &'a BTreeMap<String, String>,
        keys: &'a [String],
        use_headers: bool,
    ) -> RequestContext<'a> {
        RequestContext {
            url: "https://collector.test/OneCollector/1.0/?cors=true&content-type=application/x-json-stream",
            custom_headers: headers,
            api_keys: keys,
            msfpc: None,
            clock_skew: Some("use-collector-delta"),
            query_params: &[],
            use_headers,
        }
    }

    #[test]
    fn test_table_lookups() {
        assert_eq!(header_for_qs(CLIENT_ID), Some("Client-Id"));
        assert_eq!(qs_for_header("client-id"), Some(CLIENT_ID));
        assert_eq!(qs_for_header(MSA_DEVICE_TICKET), None);
        assert_eq!(header_for_qs("x-custom"), None);
    }

    #[test]
    fn test_query_string_mode() {
        let headers = BTreeMap::from([
            ("AuthXToken".to_string(), "tok".to_string()),
            ("x-custom".to_string(), "1".to_string()),
        ]);
        let keys = vec!["a".to_string(), "b".to_string()];
        let details = build_request_details(&context(&headers, &keys, false));

        assert!(details.url.contains("&AuthXToken=tok"));
        assert!(details.url.contains("&client-id=NO_AUTH"));
        assert!(details.url.contains("&apikey=a%2Cb"));
        assert!(details.url.contains("&upload-time="));
        assert!(details.url.contains("&time-delta-to-apply-millis=use-collector-delta"));
        assert_eq!(details.headers.len(), 1);
        assert!(details.use_headers);
        assert!(details.has_header("X-Custom"));
    }

    #[test]
    fn test_header_mode() {
        let headers = BTreeMap::new();
        let keys = vec!["a".to_string()];
        let details = build_request_details(&context(&headers, &keys, true));

        assert_eq!(details.headers.get("Client-Id").map(String::as_str), Some("NO_AUTH"));
        assert_eq!(details.headers.get(API_KEY).map(String::as_str), Some("a"));
        assert!(details.headers.contains_key(UPLOAD_TIME));
        assert!(!details.url.contains("client-id"));
        assert!(details.use_headers);
    }

    #[test]
    fn test_msfpc_and_extra_params_always_in_query() {
        let headers = BTreeMap::new();
        let keys = vec!["a".to_string()];
        let params = vec![("w".to_string(), "2".to_string())];
        let mut ctx = context(&headers, &keys, true);
        ctx.msfpc = Some("GUID=1");
        ctx.query_params = &params;

        let details = build_request_details(&ctx);
        assert!(details.url.contains("&ext.intweb.msfpc=GUID%3D1"));
        assert!(details.url.ends_with("&w=2"));
    }

    #[test]
    fn test_collector_url() {
        assert_eq!(
            collector_url("https://c.test/v1"),
            "https://c.test/v1?cors=true&content-type=application/x-json-stream"
        );
    }
}
