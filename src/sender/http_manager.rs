use super::headers::{
    CACHE_CONTROL_HEADER, CONTENT_TYPE_HEADER, DEFAULT_CACHE_CONTROL, DEFAULT_CONTENT_TYPE,
    KILL_DURATION_HEADER, KILL_DURATION_SECONDS_HEADER, KILL_TOKENS_HEADER, MSFPC_COOKIE,
    NO_RESPONSE_BODY_QS, RequestContext, TIME_DELTA_HEADER, build_request_details, collector_url,
};
use super::hooks::{CookieStore, PayloadListener, PayloadPreprocessor, ResponseHandler, SendHooks};
use super::serialization::{PayloadAppend, SerializedPayload, Serializer};
use super::transport::{
    BeaconTransport, PayloadData, SendInterfaces, SendPost, SenderInterface, TransportEnvironment,
    TransportResponse, TransportSelection, TransportType,
};
use crate::buffer::EventBatch;
use crate::channel::config::ChannelConfig;
use crate::channel::notification::{ChannelHooks, NotificationReason};
use crate::domain::{
    ChannelError, EventSendType, EventsDiscardedReason, SendRequestReason, epoch_millis,
};
use crate::reliability::{ClockSkewManager, KillSwitch, RetryPolicy};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MSFPC_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-request settings derived from [`ChannelConfig`].
#[derive(Debug, Clone)]
struct HttpSettings {
    url: String,
    max_connections: usize,
    max_request_retries_before_backoff: u32,
    max_events_per_batch: usize,
    use_headers: bool,
    add_no_response: bool,
    xhr_timeout: Option<Duration>,
    disable_xhr_sync: bool,
    disable_fetch_keep_alive: bool,
    enable_event_timings: bool,
    persistent_storage: bool,
    query_params: Vec<(String, String)>,
}

impl From<&ChannelConfig> for HttpSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            url: collector_url(&config.endpoint_url),
            max_connections: config.max_connections,
            max_request_retries_before_backoff: config.max_request_retries_before_backoff,
            max_events_per_batch: config.max_events_per_batch,
            use_headers: !config.avoid_options,
            add_no_response: config.add_no_response,
            xhr_timeout: config.xhr_timeout,
            disable_xhr_sync: config.disable_xhr_sync,
            disable_fetch_keep_alive: config.disable_fetch_keep_alive,
            enable_event_timings: config.enable_event_timings,
            persistent_storage: config.persistent_storage,
            query_params: config
                .query_string_parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

/// Batches waiting out a retry backoff.
struct PendingRetry {
    batches: VecDeque<EventBatch>,
    retry_count: u32,
    is_teardown: bool,
    send_type: EventSendType,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct HttpState {
    initialized: bool,
    paused: bool,
    is_unloading: bool,
    is_teardown: bool,
    outstanding: usize,
    batch_queue: VecDeque<EventBatch>,
    clock_skew: ClockSkewManager,
    kill_switch: KillSwitch,
    settings: HttpSettings,
    interfaces: SendInterfaces,
    hooks: SendHooks,
    headers: BTreeMap<String, String>,
    response_handlers: Vec<Arc<dyn ResponseHandler>>,
    pending_retries: HashMap<u64, PendingRetry>,
    next_retry_id: u64,
}

/// A payload ready for a transport, assembled under the lock and sent after it is released.
struct Dispatch {
    payload: SerializedPayload,
    request: PayloadData,
    interface: SenderInterface,
    is_sync: bool,
    ignore_response: bool,
    add_no_response: bool,
    persistent_storage: bool,
    preprocessor: Option<Arc<dyn PayloadPreprocessor>>,
    listener: Option<Arc<dyn PayloadListener>>,
}

enum Outgoing {
    Notify {
        batches: Vec<EventBatch>,
        reason: NotificationReason,
        send_type: EventSendType,
    },
    BackOff,
    ClearBackOff,
    Dispatch(Box<Dispatch>),
}

/// Work collected while the state lock is held, replayed in order once it is released.
#[derive(Default)]
struct Outbox(Vec<Outgoing>);

impl Outbox {
    fn notify(&mut self, batches: Vec<EventBatch>, reason: NotificationReason, send_type: EventSendType) {
        if batches.iter().any(|batch| !batch.is_empty()) {
            self.0.push(Outgoing::Notify {
                batches,
                reason,
                send_type,
            });
        }
    }

    fn push(&mut self, outgoing: Outgoing) {
        self.0.push(outgoing);
    }
}

/// Fields of a collector response body the manager acts on.
#[derive(Debug, Default, Deserialize)]
struct CollectorResponse {
    #[serde(default)]
    acc: Option<u64>,
    #[serde(default)]
    rej: Option<u64>,
    #[serde(rename = "webResult", default)]
    web_result: Option<WebResult>,
}

#[derive(Debug, Default, Deserialize)]
struct WebResult {
    #[serde(default)]
    msfpc: Option<String>,
}

struct HttpManagerInner {
    state: Mutex<HttpState>,
    serializer: Serializer,
    owner: Weak<dyn ChannelHooks>,
}

/// Turns queued batches into HTTP requests and interprets the responses.
///
/// Admission, payload packing, retries, kill switch and clock skew handling all live here.
/// Lifecycle outcomes are reported to the owning channel through [`ChannelHooks`]; the owner is
/// never called while the manager's lock is held.
#[derive(Clone)]
pub struct HttpManager {
    inner: Arc<HttpManagerInner>,
}

impl std::fmt::Debug for HttpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HttpManager")
            .field("paused", &state.paused)
            .field("outstanding", &state.outstanding)
            .field("queued_batches", &state.batch_queue.len())
            .field("pending_retries", &state.pending_retries.len())
            .finish()
    }
}

impl HttpManager {
    pub fn new(owner: Weak<dyn ChannelHooks>) -> Self {
        Self::with_serializer(owner, Serializer::new())
    }

    pub fn with_serializer(owner: Weak<dyn ChannelHooks>, serializer: Serializer) -> Self {
        Self {
            inner: Arc::new(HttpManagerInner {
                state: Mutex::new(HttpState::default()),
                serializer,
                owner,
            }),
        }
    }

    /// Selects transports and applies settings. Calling it again only refreshes the settings
    /// and custom headers.
    pub fn initialize(
        &self,
        config: &ChannelConfig,
        environment: &TransportEnvironment,
        hooks: &SendHooks,
    ) -> Result<(), ChannelError> {
        let mut state = self.inner.state.lock();
        state.settings = HttpSettings::from(config);
        for (name, value) in &config.headers {
            state.headers.insert(name.clone(), value.clone());
        }

        if state.initialized {
            return Ok(());
        }

        let selection = TransportSelection {
            transports: config.transports.clone(),
            unload_transports: config.unload_transports.clone(),
            disable_xhr_sync: config.disable_xhr_sync,
            disable_fetch_keep_alive: config.disable_fetch_keep_alive,
            xhr_override: hooks.xhr_override.clone(),
            always_use_xhr_override: config.always_use_xhr_override,
        };
        let interfaces = SendInterfaces::select(environment, &selection);
        let Some(batched) = interfaces.batched.as_ref() else {
            return Err(ChannelError::Config(
                "No usable transport for batched sends".to_string(),
            ));
        };

        info!(
            "HTTP manager initialized: batched={:?} sync={:?} unload={:?}",
            batched.transport,
            interfaces.synchronous.as_ref().map(|i| i.transport),
            interfaces.send_beacon.as_ref().map(|i| i.transport),
        );

        state.interfaces = interfaces;
        state.hooks = hooks.clone();
        state.initialized = true;
        Ok(())
    }

    /// Queues a batch for sending. Returns `false` when its tenant is kill-switched.
    pub fn add_batch(&self, batch: EventBatch) -> bool {
        self.try_add_batch(batch).is_ok()
    }

    /// Like [`HttpManager::add_batch`], but hands a rejected batch back to the caller.
    pub fn try_add_batch(&self, batch: EventBatch) -> Result<(), EventBatch> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.inner.state.lock();
        if state.kill_switch.is_tenant_killed(batch.tenant_key()) {
            return Err(batch);
        }
        state.batch_queue.push_back(batch);
        Ok(())
    }

    /// Whether an async request may start now.
    pub fn can_send_request(&self) -> bool {
        let state = self.inner.state.lock();
        !state.paused && has_idle_connection(&state) && state.clock_skew.allow_request_sending()
    }

    pub fn send_queued_requests(
        &self,
        send_type: Option<EventSendType>,
        send_reason: Option<SendRequestReason>,
    ) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            self.send_queued_locked(&mut state, send_type, send_reason, &mut out);
        }
        self.flush_outbox(out);
    }

    /// Sends one batch right away, bypassing the connection limit.
    pub fn send_synchronous_batch(
        &self,
        batch: EventBatch,
        send_type: Option<EventSendType>,
        send_reason: Option<SendRequestReason>,
    ) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            let send_type = match send_type {
                Some(send_type) => send_type,
                None if state.is_unloading => EventSendType::SendBeacon,
                None => EventSendType::Synchronous,
            };
            let send_reason = send_reason.unwrap_or(SendRequestReason::SyncEvent);
            self.send_batches(
                &mut state,
                VecDeque::from([batch]),
                0,
                false,
                send_type,
                send_reason,
                &mut out,
            );
        }
        self.flush_outbox(out);
    }

    /// True when nothing is queued, waiting on a retry or in flight, and the manager is not
    /// paused.
    pub fn is_completely_idle(&self) -> bool {
        let state = self.inner.state.lock();
        !state.paused
            && state.outstanding == 0
            && state.batch_queue.is_empty()
            && state.pending_retries.is_empty()
    }

    /// Stops sending. Batches waiting out a retry backoff go back to the head of the queue.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        state.paused = true;

        let mut retries: Vec<(u64, PendingRetry)> = state.pending_retries.drain().collect();
        retries.sort_by_key(|(id, _)| std::cmp::Reverse(*id));
        for (_, retry) in retries {
            retry.handle.abort();
            for batch in retry.batches.into_iter().rev() {
                state.batch_queue.push_front(batch);
            }
        }
        debug!("HTTP manager paused with {} queued batches", state.batch_queue.len());
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            state.paused = false;
        }
        self.send_queued_requests(Some(EventSendType::Batched), Some(SendRequestReason::Resumed));
    }

    /// Sends everything still held, including batches waiting on a retry, as beacons. Only the
    /// first call does anything.
    pub fn teardown(&self) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            if state.is_teardown {
                return;
            }
            state.is_teardown = true;

            let mut retries: Vec<(u64, PendingRetry)> = state.pending_retries.drain().collect();
            retries.sort_by_key(|(id, _)| *id);
            let mut batches = VecDeque::new();
            for (_, retry) in retries {
                retry.handle.abort();
                batches.extend(retry.batches);
            }
            batches.extend(state.batch_queue.drain(..));

            info!("HTTP manager teardown with {} batches remaining", batches.len());
            self.send_batches(
                &mut state,
                batches,
                0,
                true,
                EventSendType::SendBeacon,
                SendRequestReason::Unload,
                &mut out,
            );
        }
        self.flush_outbox(out);
    }

    /// From now on every send goes out as a reduced beacon payload.
    pub fn set_unloading(&self, value: bool) {
        self.inner.state.lock().is_unloading = value;
    }

    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.state.lock().headers.insert(name.into(), value.into());
    }

    pub fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.inner.state.lock().response_handlers.push(handler);
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn queued_batch_count(&self) -> usize {
        self.inner.state.lock().batch_queue.len()
    }

    pub fn pending_retry_count(&self) -> usize {
        self.inner.state.lock().pending_retries.len()
    }

    pub fn is_tenant_killed(&self, tenant_key: &str) -> bool {
        self.inner.state.lock().kill_switch.is_tenant_killed(tenant_key)
    }

    fn send_queued_locked(
        &self,
        state: &mut HttpState,
        send_type: Option<EventSendType>,
        send_reason: Option<SendRequestReason>,
        out: &mut Outbox,
    ) {
        let send_type = effective_send_type(state, send_type.unwrap_or(EventSendType::Batched));
        if self.can_send_payload(state, !state.batch_queue.is_empty(), send_type, 0) {
            let batches = std::mem::take(&mut state.batch_queue);
            self.send_batches(
                state,
                batches,
                0,
                false,
                send_type,
                send_reason.unwrap_or_default(),
                out,
            );
        }
    }

    fn can_send_payload(
        &self,
        state: &HttpState,
        has_batches: bool,
        send_type: EventSendType,
        retry_count: u32,
    ) -> bool {
        has_batches
            && !state.paused
            && state.interfaces.get(send_type).is_some()
            && (send_type != EventSendType::Batched
                || retry_count > 0
                || (has_idle_connection(state) && state.clock_skew.allow_request_sending()))
    }

    /// Packs `batches` into as many payloads as admission allows. Whatever is left goes back to
    /// the head of the queue.
    #[allow(clippy::too_many_arguments)]
    fn send_batches(
        &self,
        state: &mut HttpState,
        mut batches: VecDeque<EventBatch>,
        retry_count: u32,
        is_teardown: bool,
        send_type: EventSendType,
        send_reason: SendRequestReason,
        out: &mut Outbox,
    ) {
        let send_type = effective_send_type(state, send_type);
        let is_sync = send_type != EventSendType::Batched;
        let is_reduced = state.is_unloading
            || send_type.is_beacon()
            || state.interfaces.get(send_type).is_some_and(|interface| {
                interface.transport == TransportType::Beacon
                    || (interface.is_sync && interface.transport == TransportType::Fetch)
            });
        let max_events = state.settings.max_events_per_batch;
        let serializer = &self.inner.serializer;

        let mut payload: Option<SerializedPayload> = None;
        let mut killed = Vec::new();
        let mut serialization_start = epoch_millis();

        while self.can_send_payload(state, !batches.is_empty(), send_type, retry_count) {
            let Some(batch) = batches.pop_front() else {
                break;
            };
            if batch.is_empty() {
                continue;
            }
            if state.kill_switch.is_tenant_killed(batch.tenant_key()) {
                killed.push(batch);
                continue;
            }

            let current = payload.get_or_insert_with(|| {
                serializer.create_payload(
                    retry_count,
                    is_teardown,
                    is_sync,
                    is_reduced,
                    send_reason,
                    send_type,
                )
            });

            match serializer.append_payload(current, batch, max_events) {
                PayloadAppend::DidNotFit(batch) => {
                    batches.push_front(batch);
                    if let Some(full) = payload.take() {
                        self.do_payload_send(state, full, serialization_start, out);
                    }
                    serialization_start = epoch_millis();
                }
                PayloadAppend::Added => {
                    if let Some(overflow) = current.overflow.take() {
                        batches.push_front(overflow);
                        if let Some(full) = payload.take() {
                            self.do_payload_send(state, full, serialization_start, out);
                        }
                        serialization_start = epoch_millis();
                    }
                }
            }
        }

        if let Some(last) = payload {
            self.do_payload_send(state, last, serialization_start, out);
        }

        for batch in batches.into_iter().rev() {
            state.batch_queue.push_front(batch);
        }

        out.notify(
            killed,
            NotificationReason::Discarded(EventsDiscardedReason::KillSwitch),
            send_type,
        );
    }

    fn do_payload_send(
        &self,
        state: &mut HttpState,
        mut payload: SerializedPayload,
        serialization_start: i64,
        out: &mut Outbox,
    ) {
        let send_type = payload.send_type;
        let size_exceeded = std::mem::take(&mut payload.size_exceeded);
        let failed = std::mem::take(&mut payload.failed_events);

        if payload.has_data() {
            self.prepare_dispatch(state, payload, serialization_start, out);
        }

        out.notify(
            size_exceeded,
            NotificationReason::Discarded(EventsDiscardedReason::SizeLimitExceeded),
            send_type,
        );
        out.notify(
            failed,
            NotificationReason::Discarded(EventsDiscardedReason::InvalidEvent),
            send_type,
        );
    }

    fn prepare_dispatch(
        &self,
        state: &mut HttpState,
        mut payload: SerializedPayload,
        serialization_start: i64,
        out: &mut Outbox,
    ) {
        let mut interface = state.interfaces.get(payload.send_type).cloned();
        if payload.is_beacon
            && payload.send_reason == SendRequestReason::Unload
            && !payload.send_type.is_beacon()
        {
            interface = state
                .interfaces
                .send_beacon
                .clone()
                .or_else(|| state.interfaces.sync_fetch.clone())
                .or(interface);
        }

        let Some(interface) = interface else {
            warn!("No transport available for {:?} send", payload.send_type);
            let send_type = payload.send_type;
            out.notify(payload.batches, NotificationReason::Requeue, send_type);
            return;
        };

        let is_beacon_transport = interface.transport == TransportType::Beacon;
        let stored_msfpc = match (payload.msfpc(), &state.hooks.cookie_store) {
            (None, Some(store)) => store.get(MSFPC_COOKIE),
            _ => None,
        };
        let clock_skew = state
            .clock_skew
            .should_add_clock_skew_headers()
            .then(|| state.clock_skew.clock_skew_header_value().to_string());

        let details = build_request_details(&RequestContext {
            url: &state.settings.url,
            custom_headers: &state.headers,
            api_keys: &payload.api_keys,
            msfpc: payload.msfpc().or(stored_msfpc.as_deref()),
            clock_skew: clock_skew.as_deref(),
            query_params: &state.settings.query_params,
            use_headers: state.settings.use_headers && !payload.is_beacon && !is_beacon_transport,
        });
        let needs_cache_control = details.use_headers && !details.has_header(CACHE_CONTROL_HEADER);
        let needs_content_type = details.use_headers && !details.has_header(CONTENT_TYPE_HEADER);

        let send_event_start = epoch_millis();
        let timings = state.settings.enable_event_timings;
        for batch in &mut payload.batches {
            for event in batch.events_mut() {
                if timings {
                    event.set_timing("sendEventStart", send_event_start);
                    event.set_timing("serializationStart", serialization_start);
                    event.set_timing("serializationCompleted", send_event_start);
                }
                event.send_attempt += 1;
            }
        }

        out.notify(
            payload.batches.clone(),
            NotificationReason::Sending(payload.send_reason),
            payload.send_type,
        );

        let mut headers = details.headers;
        if needs_cache_control {
            headers.insert(CACHE_CONTROL_HEADER.to_string(), DEFAULT_CACHE_CONTROL.to_string());
        }
        if needs_content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_string(), DEFAULT_CONTENT_TYPE.to_string());
        }

        let request = PayloadData {
            url: details.url,
            headers,
            data: Bytes::from(payload.take_blob()),
            timeout: state.settings.xhr_timeout,
            disable_xhr_sync: state.settings.disable_xhr_sync,
            disable_fetch_keep_alive: state.settings.disable_fetch_keep_alive,
        };

        state.clock_skew.first_request_sent();
        if payload.send_type == EventSendType::Batched {
            state.outstanding += 1;
        }

        let is_sync = payload.is_teardown || payload.is_sync;
        let ignore_response =
            interface.transport == TransportType::Fetch && is_sync && payload.is_beacon;
        let use_hooks = !payload.is_beacon && !is_beacon_transport;

        debug!(
            "Sending {} events in {} bytes via {:?} ({}, retry {})",
            payload.num_events,
            request.data.len(),
            interface.transport,
            payload.send_reason,
            payload.retry_count
        );

        out.push(Outgoing::Dispatch(Box::new(Dispatch {
            payload,
            request,
            interface,
            is_sync,
            ignore_response,
            add_no_response: state.settings.add_no_response,
            persistent_storage: state.settings.persistent_storage,
            preprocessor: state.hooks.preprocessor.clone().filter(|_| use_hooks),
            listener: state.hooks.listener.clone(),
        })));
    }

    fn flush_outbox(&self, out: Outbox) {
        let owner = self.inner.owner.upgrade();
        for outgoing in out.0 {
            match outgoing {
                Outgoing::Notify {
                    batches,
                    reason,
                    send_type,
                } => {
                    if let Some(owner) = &owner {
                        owner.batch_notification(batches, reason, send_type);
                    }
                }
                Outgoing::BackOff => {
                    if let Some(owner) = &owner {
                        owner.back_off_transmission();
                    }
                }
                Outgoing::ClearBackOff => {
                    if let Some(owner) = &owner {
                        owner.clear_back_off();
                    }
                }
                Outgoing::Dispatch(dispatch) => self.dispatch(*dispatch),
            }
        }
    }

    fn dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            mut payload,
            request,
            interface,
            is_sync,
            ignore_response,
            add_no_response,
            persistent_storage,
            preprocessor,
            listener,
        } = dispatch;

        match interface.sender {
            SendPost::Beacon(beacon) => {
                notify_listener(listener.as_deref(), &request, &request, is_sync, true);
                let status = self.send_beacon(
                    beacon.as_ref(),
                    &mut payload,
                    &request,
                    add_no_response,
                    persistent_storage,
                );
                self.handle_response(payload, TransportResponse::with_status(status));
            }
            SendPost::Http(transport) if ignore_response => {
                let mut request = request;
                if add_no_response {
                    request.url.push_str(NO_RESPONSE_BODY_QS);
                }
                notify_listener(listener.as_deref(), &request, &request, is_sync, true);
                tokio::spawn(async move {
                    if let Err(e) = transport.send_post(request, true).await {
                        debug!("Keep-alive send failed: {}", e);
                    }
                });
                self.handle_response(payload, TransportResponse::with_status(200));
            }
            SendPost::Http(transport) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    let sent = match &preprocessor {
                        Some(preprocessor) => {
                            match preprocessor.process(request.clone(), is_sync).await {
                                Ok(processed) => processed,
                                Err(e) => {
                                    warn!("Payload preprocessor failed, sending original: {}", e);
                                    request.clone()
                                }
                            }
                        }
                        None => request.clone(),
                    };
                    notify_listener(listener.as_deref(), &request, &sent, is_sync, payload.is_beacon);

                    let response = match transport.send_post(sent, is_sync).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!("Request failed: {}", e);
                            TransportResponse::with_status(e.status())
                        }
                    };
                    manager.handle_response(payload, response);
                });
            }
        }
    }

    /// Beacon delivery. When the whole payload is refused each event is retried on its own; the
    /// first refusal drops the rest of that batch.
    fn send_beacon(
        &self,
        beacon: &dyn BeaconTransport,
        payload: &mut SerializedPayload,
        request: &PayloadData,
        add_no_response: bool,
        persistent_storage: bool,
    ) -> u16 {
        let mut url = request.url.clone();
        if add_no_response {
            url.push_str(NO_RESPONSE_BODY_QS);
        }

        if beacon.send_beacon(&url, &request.data) {
            return 200;
        }

        let serializer = &self.inner.serializer;
        let mut dropped = Vec::new();
        for batch in &mut payload.batches {
            let mut index = 0;
            while index < batch.count() {
                let sent = serializer
                    .event_blob(&batch.events()[index])
                    .map(|blob| beacon.send_beacon(&url, &blob))
                    .unwrap_or(false);
                if !sent {
                    dropped.push(batch.split(index, None));
                    break;
                }
                index += 1;
            }
        }

        let dropped_count: usize = dropped.iter().map(EventBatch::count).sum();
        payload.num_events = payload.num_events.saturating_sub(dropped_count);
        payload.batches.retain(|batch| !batch.is_empty());

        if dropped_count > 0 {
            warn!("Beacon refused {} events", dropped_count);
            if !persistent_storage {
                if let Some(owner) = self.inner.owner.upgrade() {
                    owner.batch_notification(
                        dropped,
                        NotificationReason::Discarded(EventsDiscardedReason::SizeLimitExceeded),
                        payload.send_type,
                    );
                }
            }
        }
        200
    }

    /// Applies a collector response: clock skew, kill switch, then completion, retry or
    /// failure reporting.
    pub(crate) fn handle_response(&self, mut payload: SerializedPayload, response: TransportResponse) {
        let mut out = Outbox::default();
        let send_type = payload.send_type;
        let (handlers, cookie_store) = {
            let mut state = self.inner.state.lock();
            state.clock_skew.set_clock_skew(response.header(TIME_DELTA_HEADER));

            let kill_duration = response
                .header(KILL_DURATION_HEADER)
                .or_else(|| response.header(KILL_DURATION_SECONDS_HEADER));
            let killed_tenants = state
                .kill_switch
                .set_kill_switch_tenants(response.header(KILL_TOKENS_HEADER), kill_duration);

            let mut killed = Vec::new();
            for tenant in &killed_tenants {
                for batch in payload
                    .batches
                    .iter_mut()
                    .filter(|batch| batch.tenant_key() == tenant)
                {
                    let removed = batch.split(0, None);
                    payload.num_events = payload.num_events.saturating_sub(removed.count());
                    killed.push(removed);
                }
            }
            payload.batches.retain(|batch| !batch.is_empty());

            let status = response.status;
            if status == 200 || status == 204 {
                state.clock_skew.set_clock_skew(None);
                self.request_finished(&mut state, payload, NotificationReason::Complete, false, &mut out);
            } else if !RetryPolicy::should_retry_for_status(status) || payload.num_events == 0 {
                warn!("Collector returned non-retryable status {}", status);
                state.clock_skew.set_clock_skew(None);
                self.request_finished(
                    &mut state,
                    payload,
                    NotificationReason::ResponseFailure(status),
                    false,
                    &mut out,
                );
            } else if send_type != EventSendType::Batched {
                state.clock_skew.set_clock_skew(None);
                self.request_finished(&mut state, payload, NotificationReason::Requeue, false, &mut out);
            } else if payload.retry_count < state.settings.max_request_retries_before_backoff {
                self.schedule_retry(&mut state, payload, &mut out);
            } else {
                let reason = if state.is_unloading {
                    NotificationReason::Discarded(EventsDiscardedReason::NonRetryableStatus)
                } else {
                    NotificationReason::Requeue
                };
                state.clock_skew.set_clock_skew(None);
                self.request_finished(&mut state, payload, reason, true, &mut out);
            }

            out.notify(
                killed,
                NotificationReason::Discarded(EventsDiscardedReason::KillSwitch),
                send_type,
            );
            (state.response_handlers.clone(), state.hooks.cookie_store.clone())
        };

        self.flush_outbox(out);

        if let Some(body) = response.body.as_deref() {
            handle_collector_response(body, &handlers, cookie_store.as_deref());
        }
    }

    fn request_finished(
        &self,
        state: &mut HttpState,
        mut payload: SerializedPayload,
        reason: NotificationReason,
        back_off: bool,
        out: &mut Outbox,
    ) {
        if back_off {
            out.push(Outgoing::BackOff);
        }

        if reason == NotificationReason::Complete {
            if !back_off && !payload.is_sync {
                out.push(Outgoing::ClearBackOff);
            }
            if state.settings.enable_event_timings {
                let completed = epoch_millis();
                for batch in &mut payload.batches {
                    for event in batch.events_mut() {
                        event.set_timing("sendEventCompleted", completed);
                    }
                }
            }
        }

        let send_type = payload.send_type;
        out.notify(payload.batches, reason, send_type);

        if send_type == EventSendType::Batched {
            state.outstanding = state.outstanding.saturating_sub(1);
            if payload.send_reason != SendRequestReason::Retry {
                self.send_queued_locked(
                    state,
                    Some(EventSendType::Batched),
                    Some(SendRequestReason::Response),
                    out,
                );
            }
        }
    }

    /// Releases the connection slot and schedules the payload's batches for another attempt.
    /// While unloading the retry is sent immediately as a beacon.
    fn schedule_retry(&self, state: &mut HttpState, payload: SerializedPayload, out: &mut Outbox) {
        if payload.send_type == EventSendType::Batched {
            state.outstanding = state.outstanding.saturating_sub(1);
        }

        let retry_count = payload.retry_count;
        let is_teardown = payload.is_teardown;
        let batches: VecDeque<EventBatch> = payload.batches.into_iter().collect();

        if state.is_unloading {
            self.send_batches(
                state,
                batches,
                retry_count + 1,
                is_teardown,
                EventSendType::SendBeacon,
                SendRequestReason::Retry,
                out,
            );
            return;
        }

        let delay = RetryPolicy::backoff_for_retry(retry_count);
        let id = state.next_retry_id;
        state.next_retry_id = state.next_retry_id.wrapping_add(1);
        debug!("Retry {} scheduled in {:?}", retry_count + 1, delay);

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                HttpManager { inner }.fire_retry(id);
            }
        });

        state.pending_retries.insert(
            id,
            PendingRetry {
                batches,
                retry_count,
                is_teardown,
                send_type: payload.send_type,
                handle,
            },
        );
    }

    fn fire_retry(&self, id: u64) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            let Some(retry) = state.pending_retries.remove(&id) else {
                return;
            };
            self.send_batches(
                &mut state,
                retry.batches,
                retry.retry_count + 1,
                retry.is_teardown,
                retry.send_type,
                SendRequestReason::Retry,
                &mut out,
            );
        }
        self.flush_outbox(out);
    }
}

fn has_idle_connection(state: &HttpState) -> bool {
    state.outstanding < state.settings.max_connections
}

fn effective_send_type(state: &HttpState, send_type: EventSendType) -> EventSendType {
    if state.is_unloading && !send_type.is_beacon() {
        EventSendType::SendBeacon
    } else {
        send_type
    }
}

fn notify_listener(
    listener: Option<&dyn PayloadListener>,
    original: &PayloadData,
    sent: &PayloadData,
    is_sync: bool,
    is_beacon: bool,
) {
    if let Some(listener) = listener {
        if let Err(e) = listener.on_payload_sent(original, sent, is_sync, is_beacon) {
            warn!("Payload listener failed: {}", e);
        }
    }
}

fn handle_collector_response(
    body: &str,
    handlers: &[Arc<dyn ResponseHandler>],
    cookie_store: Option<&dyn CookieStore>,
) {
    for handler in handlers {
        if let Err(e) = handler.on_response(body) {
            warn!("Response handler failed: {}", e);
        }
    }

    match serde_json::from_str::<CollectorResponse>(body) {
        Ok(response) => {
            debug!(
                "Collector accepted {:?} and rejected {:?} events",
                response.acc, response.rej
            );
            let msfpc = response.web_result.and_then(|result| result.msfpc);
            if let (Some(msfpc), Some(store)) = (msfpc, cookie_store) {
                store.set(MSFPC_COOKIE, &msfpc, MSFPC_MAX_AGE);
            }
        }
        Err(e) => debug!("Ignoring unparsable collector response: {}", e),
    }
}
