pub mod client;
pub mod headers;
pub mod hooks;
pub mod http_manager;
pub mod serialization;
pub mod transport;

pub use client::{ClientConfig, ReqwestBeacon, ReqwestTransport, reqwest_environment};
pub use hooks::{
    CookieStore, HookError, MemoryCookieStore, PayloadListener, PayloadPreprocessor,
    ResponseHandler, SendHooks,
};
pub use http_manager::HttpManager;
pub use serialization::{PayloadAppend, SerializationError, SerializedPayload, Serializer};
pub use transport::{
    BeaconTransport, HttpTransport, PayloadData, TransportEnvironment, TransportError,
    TransportResponse, TransportType,
};
