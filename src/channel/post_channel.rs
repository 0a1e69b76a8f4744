use super::config::{
    ChannelConfig, FLUSH_IDLE_POLL_SECS, MAX_BACKOFF_COUNT, TransmitProfiles,
};
use super::notification::{ChannelHooks, NotificationAction, NotificationReason, NotificationSink};
use super::timer::TimerSlot;
use crate::buffer::{EventBatch, LatencyQueues};
use crate::domain::{
    ChannelError, EventLatency, EventSendType, EventsDiscardedReason, SendRequestReason,
    TelemetryItem, epoch_millis,
};
use crate::reliability::RetryPolicy;
use crate::sender::hooks::{ResponseHandler, SendHooks};
use crate::sender::http_manager::HttpManager;
use crate::sender::transport::TransportEnvironment;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Invoked once an asynchronous flush has drained, or when the channel gives up on it.
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

struct PendingFlush {
    callback: Option<FlushCallback>,
    reason: SendRequestReason,
}

struct ActiveFlush {
    callback: Option<FlushCallback>,
    reason: SendRequestReason,
    started: bool,
}

struct ChannelState {
    config: ChannelConfig,
    queues: LatencyQueues,
    profiles: TransmitProfiles,
    profile_name: String,
    current_profile: [i64; 3],
    paused: bool,
    backoff_count: u32,
    timer_count: u32,
    is_unloading: bool,
    is_teardown: bool,
    delayed_latency: Option<EventLatency>,
    delayed_reason: Option<SendRequestReason>,
    scheduled_timer: TimerSlot,
    immediate_timer: TimerSlot,
    flush_timer: TimerSlot,
    active_flush: Option<ActiveFlush>,
    flush_queue: VecDeque<PendingFlush>,
}

impl ChannelState {
    fn new(config: ChannelConfig, profiles: TransmitProfiles, current_profile: [i64; 3]) -> Self {
        Self {
            profile_name: config.transmit_profile.clone(),
            config,
            queues: LatencyQueues::new(),
            profiles,
            current_profile,
            paused: false,
            backoff_count: 0,
            timer_count: 0,
            is_unloading: false,
            is_teardown: false,
            delayed_latency: None,
            delayed_reason: None,
            scheduled_timer: TimerSlot::default(),
            immediate_timer: TimerSlot::default(),
            flush_timer: TimerSlot::default(),
            active_flush: None,
            flush_queue: VecDeque::new(),
        }
    }
}

/// Calls that must happen after the state lock is released.
enum Followup {
    SendQueued {
        send_type: EventSendType,
        reason: SendRequestReason,
    },
    SendSynchronous {
        batch: EventBatch,
        reason: SendRequestReason,
    },
    Discarded {
        events: Vec<TelemetryItem>,
        reason: EventsDiscardedReason,
    },
    Callback(FlushCallback),
}

#[derive(Default)]
struct Followups(Vec<Followup>);

impl Followups {
    fn push(&mut self, followup: Followup) {
        self.0.push(followup);
    }

    fn discard(&mut self, events: Vec<TelemetryItem>, reason: EventsDiscardedReason) {
        if !events.is_empty() {
            self.0.push(Followup::Discarded { events, reason });
        }
    }
}

struct ChannelInner {
    state: Mutex<ChannelState>,
    http: HttpManager,
    sink: Arc<dyn NotificationSink>,
    environment: TransportEnvironment,
    hooks: SendHooks,
    weak: Weak<ChannelInner>,
}

/// Queues telemetry by latency tier and tenant and decides when it is handed to the
/// [`HttpManager`].
///
/// A repeating timer alternates between sending RealTime-and-above and Normal-and-above
/// batches at the cadence of the active transmit profile, while Immediate events get their own
/// timer. Exhausted retries slow the cadence down through the backoff counter, and a successful
/// batched send restores it.
#[derive(Clone)]
pub struct PostChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for PostChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PostChannel")
            .field("profile", &state.profile_name)
            .field("queue_size", &state.queues.queue_size())
            .field("immediate_queue_size", &state.queues.immediate_queue_size())
            .field("paused", &state.paused)
            .field("backoff_count", &state.backoff_count)
            .field("is_unloading", &state.is_unloading)
            .finish()
    }
}

impl PostChannel {
    pub fn new(
        config: ChannelConfig,
        environment: TransportEnvironment,
        hooks: SendHooks,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let profiles = TransmitProfiles::with_custom(&config.transmit_profiles);
        let current_profile = profiles.get(&config.transmit_profile).ok_or_else(|| {
            ChannelError::Config(format!("Unknown transmit profile: {}", config.transmit_profile))
        })?;

        let state = ChannelState::new(config.clone(), profiles, current_profile);
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let owner: Weak<dyn ChannelHooks> = weak.clone();
            ChannelInner {
                state: Mutex::new(state),
                http: HttpManager::new(owner),
                sink,
                environment,
                hooks,
                weak: weak.clone(),
            }
        });

        inner
            .http
            .initialize(&config, &inner.environment, &inner.hooks)?;
        info!(
            "Post channel initialized: endpoint={} profile={}",
            config.endpoint_url, config.transmit_profile
        );

        Ok(Self { inner })
    }

    /// Accepts one telemetry item.
    pub fn track(&self, item: TelemetryItem) {
        self.inner.track(item);
    }

    /// Sends everything queued.
    ///
    /// A synchronous flush dispatches all tiers on the Synchronous transport and returns without
    /// waiting for responses. An asynchronous flush hands all queued batches to the HTTP
    /// manager right away and runs `callback` once the manager is completely idle. Flushes
    /// requested while one is running are serviced in order afterwards.
    pub fn flush(
        &self,
        is_async: bool,
        callback: Option<FlushCallback>,
        send_reason: Option<SendRequestReason>,
    ) -> Result<(), ChannelError> {
        let mut followups = Followups::default();
        let result = {
            let mut state = self.inner.state.lock();
            self.inner.flush_locked(
                &mut state,
                is_async,
                callback,
                send_reason.unwrap_or(SendRequestReason::ManualFlush),
                &mut followups,
            )
        };
        self.inner.run(followups);
        result
    }

    /// Asynchronous flush that resolves when the HTTP manager is idle.
    pub async fn flush_async(&self, send_reason: Option<SendRequestReason>) -> Result<(), ChannelError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: FlushCallback = Box::new(move || {
            let _ = tx.send(());
        });
        self.flush(true, Some(callback), send_reason)?;
        rx.await.map_err(|_| ChannelError::FlushCancelled)
    }

    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        state.paused = true;
        clear_scheduled_timers(&mut state);
        self.inner.http.pause();
        info!("Post channel paused");
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            state.paused = false;
        }
        self.inner.http.resume();

        let mut followups = Followups::default();
        {
            let mut state = self.inner.state.lock();
            self.inner.schedule_timer(&mut state, &mut followups);
        }
        self.inner.run(followups);
        info!("Post channel resumed");
    }

    /// The host is going away: everything queued goes out as beacons and every later send is
    /// forced onto beacon-compatible transports.
    pub fn on_unload(&self) {
        self.inner.handle_unload(true);
    }

    pub fn on_page_hide(&self) {
        self.inner.handle_unload(true);
    }

    /// Flushes via beacon without latching the unloading state.
    pub fn on_before_unload(&self) {
        self.inner.handle_unload(false);
    }

    pub fn on_page_show(&self) {
        let mut state = self.inner.state.lock();
        state.is_unloading = false;
        self.inner.http.set_unloading(false);
    }

    /// Releases every queue and cancels all timers. Later calls do nothing.
    pub fn teardown(&self) {
        let mut followups = Followups::default();
        {
            let mut state = self.inner.state.lock();
            if state.is_teardown {
                return;
            }
            self.inner.release_all_queues(
                &mut state,
                EventSendType::SendBeacon,
                SendRequestReason::SdkUnload,
                &mut followups,
            );
            clear_scheduled_timers(&mut state);
            state.flush_timer.cancel();
            state.is_teardown = true;
        }
        self.inner.run(followups);
        self.inner.http.teardown();
        info!("Post channel torn down");
    }

    /// Replaces the in-memory event limit and the auto-flush threshold. Queued events above the
    /// new limit are discarded oldest first.
    pub fn set_event_queue_limits(&self, event_limit: usize, auto_flush_limit: Option<usize>) {
        let mut followups = Followups::default();
        {
            let mut state = self.inner.state.lock();
            state.config.events_limit_in_mem = event_limit.max(1);
            state.config.auto_flush_events_limit = auto_flush_limit.unwrap_or(0);
            trim_to_limit(&mut state, &mut followups);
        }
        self.inner.run(followups);
    }

    pub fn set_transmit_profile(&self, profile_name: &str) -> Result<(), ChannelError> {
        let mut followups = Followups::default();
        {
            let mut state = self.inner.state.lock();
            let profile = state.profiles.get(profile_name).ok_or_else(|| {
                ChannelError::Config(format!("Unknown transmit profile: {profile_name}"))
            })?;
            if state.profile_name != profile_name {
                clear_scheduled_timers(&mut state);
                state.profile_name = profile_name.to_string();
                state.current_profile = profile;
                self.inner.schedule_timer(&mut state, &mut followups);
                info!("Transmit profile set to {}", profile_name);
            }
        }
        self.inner.run(followups);
        Ok(())
    }

    /// Applies a configuration snapshot. Transport selection made at construction is kept.
    pub fn update_config(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        config.validate()?;
        let profiles = TransmitProfiles::with_custom(&config.transmit_profiles);
        let current_profile = profiles.get(&config.transmit_profile).ok_or_else(|| {
            ChannelError::Config(format!("Unknown transmit profile: {}", config.transmit_profile))
        })?;

        let mut followups = Followups::default();
        {
            let mut state = self.inner.state.lock();
            self.inner
                .http
                .initialize(&config, &self.inner.environment, &self.inner.hooks)?;
            state.profile_name = config.transmit_profile.clone();
            state.config = config;
            state.profiles = profiles;
            state.current_profile = current_profile;
            trim_to_limit(&mut state, &mut followups);
            clear_scheduled_timers(&mut state);
            self.inner.schedule_timer(&mut state, &mut followups);
        }
        self.inner.run(followups);
        debug!("Channel configuration updated");
        Ok(())
    }

    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.http.add_header(name, value);
    }

    pub fn add_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.inner.http.add_response_handler(handler);
    }

    pub fn queue_size(&self) -> usize {
        self.inner.state.lock().queues.queue_size()
    }

    pub fn immediate_queue_size(&self) -> usize {
        self.inner.state.lock().queues.immediate_queue_size()
    }

    pub fn backoff_count(&self) -> u32 {
        self.inner.state.lock().backoff_count
    }

    pub fn is_unloading(&self) -> bool {
        self.inner.state.lock().is_unloading
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn transmit_profile(&self) -> String {
        self.inner.state.lock().profile_name.clone()
    }

    pub fn http_manager(&self) -> &HttpManager {
        &self.inner.http
    }
}

impl ChannelInner {
    fn track(&self, mut item: TelemetryItem) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if state.config.disable_telemetry || state.is_teardown {
                debug!("Ignoring event {} while the channel is disabled", item.name);
                return;
            }

            if let Some(key) = &state.config.override_instrumentation_key {
                item.tenant_key = key.clone();
            }
            if state.config.enable_event_timings {
                item.set_timing("processTelemetryStart", epoch_millis());
            }

            self.add_event_to_queues(&mut state, item, true, &mut followups);

            if state.is_unloading {
                self.release_all_queues(
                    &mut state,
                    EventSendType::SendBeacon,
                    SendRequestReason::Unload,
                    &mut followups,
                );
            } else {
                self.schedule_timer(&mut state, &mut followups);
            }
        }
        self.run(followups);
    }

    fn add_event_to_queues(
        &self,
        state: &mut ChannelState,
        mut item: TelemetryItem,
        append: bool,
        followups: &mut Followups,
    ) -> bool {
        if item.sync {
            if state.backoff_count > 0 || state.paused {
                item.sync = false;
                item.latency = EventLatency::Immediate;
            } else {
                followups.push(Followup::SendSynchronous {
                    batch: EventBatch::with_events(item.tenant_key.clone(), vec![item]),
                    reason: SendRequestReason::SyncEvent,
                });
                return true;
            }
        }

        let latency = item.latency;
        let (limit, size, lowest) = if latency == EventLatency::Immediate {
            (
                state.config.immediate_event_limit,
                state.queues.immediate_queue_size(),
                EventLatency::Immediate,
            )
        } else {
            (
                state.config.events_limit_in_mem,
                state.queues.queue_size(),
                EventLatency::Normal,
            )
        };

        if size >= limit {
            match state
                .queues
                .evict_oldest(lowest, latency, state.config.events_dropped_at_once)
            {
                Some(evicted) => {
                    warn!("Queue full, dropping {} oldest events", evicted.count());
                    followups.discard(evicted.into_events(), EventsDiscardedReason::QueueFull);
                }
                None => {
                    warn!("Queue full, dropping incoming {:?} event", latency);
                    followups.discard(vec![item], EventsDiscardedReason::QueueFull);
                    return false;
                }
            }
        }

        let first_attempt = item.send_attempt == 0;
        let max_batch_items = state.config.max_batch_items;
        let batch_len = state.queues.add(item, max_batch_items);

        if max_batch_items > 0 && batch_len >= max_batch_items {
            self.send_events_for_latency_and_above(
                state,
                latency,
                EventSendType::Batched,
                SendRequestReason::MaxQueuedEvents,
                followups,
            );
        } else if append && first_attempt && latency != EventLatency::Immediate {
            self.check_auto_flush(state, followups);
        }
        true
    }

    fn check_auto_flush(&self, state: &mut ChannelState, followups: &mut Followups) {
        let events_limit = state.config.auto_flush_events_limit;
        let batch_limit = state.config.auto_flush_batch_limit;
        let triggered = (events_limit > 0 && state.queues.queue_size() > events_limit)
            || (batch_limit > 0 && state.queues.has_batch_at_least(batch_limit));

        if triggered
            && state.backoff_count == 0
            && state.active_flush.is_none()
            && !state.flush_timer.is_active()
            && self.http.can_send_request()
        {
            debug!("Auto flush triggered at {} queued events", state.queues.queue_size());
            if let Err(e) = self.flush_locked(
                state,
                true,
                None,
                SendRequestReason::MaxQueuedEvents,
                followups,
            ) {
                debug!("Auto flush skipped: {}", e);
            }
        }
    }

    /// Moves every batch at `latency` or above into the HTTP manager. Async sends only proceed
    /// when a request could start now; otherwise the latency is remembered and retried on the
    /// next scheduling pass.
    fn queue_batches(
        &self,
        state: &mut ChannelState,
        latency: EventLatency,
        send_type: EventSendType,
        send_reason: SendRequestReason,
        followups: &mut Followups,
    ) -> bool {
        if state.paused {
            return false;
        }

        if send_type == EventSendType::Batched && !self.http.can_send_request() {
            state.delayed_latency = Some(state.delayed_latency.map_or(latency, |d| d.max(latency)));
            state.delayed_reason = Some(
                state
                    .delayed_reason
                    .map_or(send_reason, |r| r.max(send_reason)),
            );
            return false;
        }

        self.hand_off_batches(state, latency, followups);
        if state.delayed_latency.is_some_and(|delayed| latency <= delayed) {
            state.delayed_latency = None;
            state.delayed_reason = None;
        }
        true
    }

    fn hand_off_batches(&self, state: &mut ChannelState, latency: EventLatency, followups: &mut Followups) {
        for batch in state.queues.take_at_or_above(latency) {
            if let Err(rejected) = self.http.try_add_batch(batch) {
                warn!("Dropping {} events for kill-switched tenant {}", rejected.count(), rejected.tenant_key());
                followups.discard(rejected.into_events(), EventsDiscardedReason::KillSwitch);
            }
        }
    }

    fn send_events_for_latency_and_above(
        &self,
        state: &mut ChannelState,
        latency: EventLatency,
        send_type: EventSendType,
        send_reason: SendRequestReason,
        followups: &mut Followups,
    ) -> bool {
        if self.queue_batches(state, latency, send_type, send_reason, followups) {
            followups.push(Followup::SendQueued {
                send_type,
                reason: send_reason,
            });
            return true;
        }
        false
    }

    fn release_all_queues(
        &self,
        state: &mut ChannelState,
        send_type: EventSendType,
        send_reason: SendRequestReason,
        followups: &mut Followups,
    ) {
        clear_scheduled_timers(state);
        if state.flush_timer.cancel() || state.active_flush.is_some() {
            if let Some(active) = state.active_flush.take() {
                if let Some(callback) = active.callback {
                    followups.push(Followup::Callback(callback));
                }
            }
            for pending in state.flush_queue.drain(..) {
                if let Some(callback) = pending.callback {
                    followups.push(Followup::Callback(callback));
                }
            }
        }

        if !state.paused {
            self.send_events_for_latency_and_above(
                state,
                EventLatency::Normal,
                send_type,
                send_reason,
                followups,
            );
        }
    }

    fn flush_locked(
        &self,
        state: &mut ChannelState,
        is_async: bool,
        callback: Option<FlushCallback>,
        send_reason: SendRequestReason,
        followups: &mut Followups,
    ) -> Result<(), ChannelError> {
        if state.is_teardown {
            return Err(ChannelError::TornDown);
        }
        if state.paused {
            return Err(ChannelError::Paused);
        }

        if is_async {
            if state.active_flush.is_some() || state.flush_timer.is_active() {
                state.flush_queue.push_back(PendingFlush {
                    callback,
                    reason: send_reason,
                });
            } else {
                self.start_flush(state, callback, send_reason, followups);
            }
            return Ok(());
        }

        let cleared = state.scheduled_timer.cancel();
        state.timer_count = 0;
        self.send_events_for_latency_and_above(
            state,
            EventLatency::Normal,
            EventSendType::Synchronous,
            send_reason,
            followups,
        );
        if let Some(callback) = callback {
            followups.push(Followup::Callback(callback));
        }
        if cleared {
            self.schedule_timer(state, followups);
        }
        Ok(())
    }

    fn start_flush(
        &self,
        state: &mut ChannelState,
        callback: Option<FlushCallback>,
        reason: SendRequestReason,
        followups: &mut Followups,
    ) {
        self.hand_off_batches(state, EventLatency::Normal, followups);
        state.active_flush = Some(ActiveFlush {
            callback,
            reason,
            started: false,
        });
        let weak = self.weak.clone();
        state.flush_timer.arm(Duration::ZERO, move |generation| {
            if let Some(inner) = weak.upgrade() {
                inner.on_flush_timer(generation);
            }
        });
    }

    fn on_flush_timer(&self, generation: u64) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if !state.flush_timer.fire(generation) {
                return;
            }
            let Some(active) = state.active_flush.as_mut() else {
                return;
            };
            if !active.started {
                active.started = true;
                let reason = active.reason;
                self.send_events_for_latency_and_above(
                    &mut state,
                    EventLatency::Normal,
                    EventSendType::Batched,
                    reason,
                    &mut followups,
                );
            }
            self.wait_for_idle(&mut state, &mut followups);
        }
        self.run(followups);
    }

    fn wait_for_idle(&self, state: &mut ChannelState, followups: &mut Followups) {
        if !self.http.is_completely_idle() {
            let weak = self.weak.clone();
            let delay = timer_delay(state.backoff_count, FLUSH_IDLE_POLL_SECS);
            state.flush_timer.arm(delay, move |generation| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_flush_timer(generation);
                }
            });
            return;
        }

        if let Some(callback) = state.active_flush.take().and_then(|active| active.callback) {
            followups.push(Followup::Callback(callback));
        }
        match state.flush_queue.pop_front() {
            Some(next) => self.start_flush(state, next.callback, next.reason, followups),
            None => self.schedule_timer(state, followups),
        }
    }

    fn schedule_timer(&self, state: &mut ChannelState, followups: &mut Followups) {
        if state.is_teardown {
            return;
        }

        if let Some(latency) = state.delayed_latency {
            let reason = state.delayed_reason.unwrap_or(SendRequestReason::NormalSchedule);
            self.send_events_for_latency_and_above(
                state,
                latency,
                EventSendType::Batched,
                reason,
                followups,
            );
        }

        if state.paused {
            return;
        }

        let [_, real_time_secs, immediate_secs] = state.current_profile;

        if !state.immediate_timer.is_active()
            && immediate_secs >= 0
            && state.queues.immediate_queue_size() > 0
        {
            let weak = self.weak.clone();
            let delay = timer_delay(state.backoff_count, immediate_secs as f64);
            state.immediate_timer.arm(delay, move |generation| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_immediate_timer(generation);
                }
            });
        }

        if !state.scheduled_timer.is_active()
            && state.active_flush.is_none()
            && !state.flush_timer.is_active()
            && real_time_secs >= 0
        {
            if state.queues.has_events() {
                let weak = self.weak.clone();
                let delay = timer_delay(state.backoff_count, real_time_secs as f64);
                state.scheduled_timer.arm(delay, move |generation| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_scheduled_timer(generation);
                    }
                });
            } else {
                state.timer_count = 0;
            }
        }
    }

    fn on_scheduled_timer(&self, generation: u64) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if !state.scheduled_timer.fire(generation) {
                return;
            }
            let latency = if state.timer_count == 0 {
                EventLatency::RealTime
            } else {
                EventLatency::Normal
            };
            self.send_events_for_latency_and_above(
                &mut state,
                latency,
                EventSendType::Batched,
                SendRequestReason::NormalSchedule,
                &mut followups,
            );
            state.timer_count = (state.timer_count + 1) % 2;
            self.schedule_timer(&mut state, &mut followups);
        }
        self.run(followups);
    }

    fn on_immediate_timer(&self, generation: u64) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if !state.immediate_timer.fire(generation) {
                return;
            }
            self.send_events_for_latency_and_above(
                &mut state,
                EventLatency::Immediate,
                EventSendType::Batched,
                SendRequestReason::NormalSchedule,
                &mut followups,
            );
            self.schedule_timer(&mut state, &mut followups);
        }
        self.run(followups);
    }

    fn handle_unload(&self, latch: bool) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if latch {
                state.is_unloading = true;
                self.http.set_unloading(true);
            }
            self.release_all_queues(
                &mut state,
                EventSendType::SendBeacon,
                SendRequestReason::Unload,
                &mut followups,
            );
        }
        self.run(followups);
    }

    fn requeue_events(&self, batches: Vec<EventBatch>) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            let max_attempts = if state.is_unloading {
                state.config.max_unload_event_retry_attempts
            } else {
                state.config.max_event_retry_attempts
            };

            let mut dropped = Vec::new();
            for batch in batches {
                for mut item in batch.into_events() {
                    if item.sync {
                        item.sync = false;
                        item.latency = EventLatency::Immediate;
                    }
                    if item.send_attempt < max_attempts {
                        self.add_event_to_queues(&mut state, item, false, &mut followups);
                    } else {
                        dropped.push(item);
                    }
                }
            }
            if !dropped.is_empty() {
                warn!("Dropping {} events after {} send attempts", dropped.len(), max_attempts);
            }
            followups.discard(dropped, EventsDiscardedReason::NonRetryableStatus);

            if state.is_unloading {
                self.release_all_queues(
                    &mut state,
                    EventSendType::SendBeacon,
                    SendRequestReason::Unload,
                    &mut followups,
                );
            } else {
                self.schedule_timer(&mut state, &mut followups);
            }
        }
        self.run(followups);
    }

    fn reschedule(&self) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            self.schedule_timer(&mut state, &mut followups);
        }
        self.run(followups);
    }

    fn run(&self, followups: Followups) {
        for followup in followups.0 {
            match followup {
                Followup::SendQueued { send_type, reason } => {
                    self.http.send_queued_requests(Some(send_type), Some(reason));
                }
                Followup::SendSynchronous { batch, reason } => {
                    self.http.send_synchronous_batch(batch, None, Some(reason));
                }
                Followup::Discarded { events, reason } => {
                    self.sink.events_discarded(&events, reason);
                }
                Followup::Callback(callback) => callback(),
            }
        }
    }
}

impl ChannelHooks for ChannelInner {
    fn batch_notification(
        &self,
        batches: Vec<EventBatch>,
        reason: NotificationReason,
        send_type: EventSendType,
    ) {
        match (reason.action(), reason) {
            (NotificationAction::Sending, NotificationReason::Sending(send_reason)) => {
                let events = flatten(batches);
                self.sink.events_send_request(
                    &events,
                    send_reason,
                    send_type != EventSendType::Batched,
                );
            }
            (NotificationAction::Sent, _) => {
                self.sink.events_sent(&flatten(batches));
                self.reschedule();
            }
            (NotificationAction::Drop, NotificationReason::Discarded(discarded)) => {
                self.sink.events_discarded(&flatten(batches), discarded);
            }
            (NotificationAction::ResponseFailure, NotificationReason::ResponseFailure(status)) => {
                self.sink.events_discarded(
                    &flatten(batches),
                    EventsDiscardedReason::ResponseFailure(status),
                );
                self.reschedule();
            }
            (NotificationAction::Requeue, _) => self.requeue_events(batches),
            (action, reason) => debug!("Unhandled notification {:?} for {:?}", action, reason),
        }
    }

    fn back_off_transmission(&self) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if state.backoff_count < MAX_BACKOFF_COUNT {
                state.backoff_count += 1;
                warn!("Transmission backed off to level {}", state.backoff_count);
                clear_scheduled_timers(&mut state);
                self.schedule_timer(&mut state, &mut followups);
            }
        }
        self.run(followups);
    }

    fn clear_back_off(&self) {
        let mut followups = Followups::default();
        {
            let mut state = self.state.lock();
            if state.backoff_count > 0 {
                state.backoff_count = 0;
                info!("Transmission back-off cleared");
                clear_scheduled_timers(&mut state);
                self.schedule_timer(&mut state, &mut followups);
            }
        }
        self.run(followups);
    }
}

fn flatten(batches: Vec<EventBatch>) -> Vec<TelemetryItem> {
    batches.into_iter().flat_map(EventBatch::into_events).collect()
}

fn clear_scheduled_timers(state: &mut ChannelState) {
    state.scheduled_timer.cancel();
    state.immediate_timer.cancel();
    state.timer_count = 0;
}

fn trim_to_limit(state: &mut ChannelState, followups: &mut Followups) {
    let limit = state.config.events_limit_in_mem;
    while state.queues.queue_size() > limit {
        let excess = state.queues.queue_size() - limit;
        match state
            .queues
            .evict_oldest(EventLatency::Normal, EventLatency::RealTime, excess)
        {
            Some(evicted) => followups.discard(evicted.into_events(), EventsDiscardedReason::QueueFull),
            None => break,
        }
    }
}

/// Timer delay for a profile interval. While backed off the interval is stretched by the retry
/// backoff for the current level, and a zero interval counts as one second.
fn timer_delay(backoff_count: u32, secs: f64) -> Duration {
    let secs = secs.max(0.0);
    if backoff_count == 0 {
        return Duration::from_secs_f64(secs);
    }

    let secs = if secs == 0.0 { 1.0 } else { secs };
    let millis = RetryPolicy::millis_to_backoff_for_retry(backoff_count - 1) as f64 * secs;
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::transport::{HttpTransport, PayloadData, TransportError, TransportResponse};
    use async_trait::async_trait;

    struct OkTransport {
        requests: Mutex<Vec<(PayloadData, bool)>>,
    }

    #[async_trait]
    impl HttpTransport for OkTransport {
        async fn send_post(
            &self,
            payload: PayloadData,
            sync: bool,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().push((payload, sync));
            Ok(TransportResponse::with_status(200))
        }
    }

    #[derive(Default)]
    struct CountingSink {
        sent: Mutex<usize>,
        discarded: Mutex<Vec<EventsDiscardedReason>>,
    }

    impl NotificationSink for CountingSink {
        fn events_sent(&self, events: &[TelemetryItem]) {
            *self.sent.lock() += events.len();
        }

        fn events_discarded(&self, events: &[TelemetryItem], reason: EventsDiscardedReason) {
            self.discarded.lock().extend(events.iter().map(|_| reason));
        }
    }

    fn channel(config: ChannelConfig) -> (PostChannel, Arc<OkTransport>, Arc<CountingSink>) {
        let transport = Arc::new(OkTransport {
            requests: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(CountingSink::default());
        let environment = TransportEnvironment {
            xhr: Some(transport.clone()),
            ..Default::default()
        };
        let channel =
            PostChannel::new(config, environment, SendHooks::default(), sink.clone()).unwrap();
        (channel, transport, sink)
    }

    #[test]
    fn test_timer_delay_scaling() {
        assert_eq!(timer_delay(0, 2.0), Duration::from_secs(2));
        assert_eq!(timer_delay(0, 0.25), Duration::from_millis(250));

        let backed_off = timer_delay(1, 0.0);
        assert!(backed_off >= Duration::from_millis(2400) && backed_off < Duration::from_millis(3600));
        let doubled = timer_delay(2, 1.0);
        assert!(doubled >= Duration::from_millis(4800) && doubled < Duration::from_millis(7200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_timer_sends_tracked_events() {
        let (channel, transport, sink) = channel(ChannelConfig::default());
        channel.track(TelemetryItem::new("page_view", "tenant"));
        assert_eq!(channel.queue_size(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(channel.queue_size(), 0);
        assert_eq!(transport.requests.lock().len(), 1);
        assert_eq!(*sink.sent.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_channel_ignores_events() {
        let config = ChannelConfig {
            disable_telemetry: true,
            ..Default::default()
        };
        let (channel, _transport, _sink) = channel(config);
        channel.track(TelemetryItem::new("ignored", "tenant"));
        assert_eq!(channel.queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_key_replaces_tenant() {
        let config = ChannelConfig {
            override_instrumentation_key: Some("override".to_string()),
            ..Default::default()
        };
        let (channel, transport, _sink) = channel(config);
        channel.track(TelemetryItem::new("event", "original"));
        channel.flush(false, None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.url.contains("apikey=override"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_bypasses_queues() {
        let (channel, transport, _sink) = channel(ChannelConfig::default());
        channel.track(TelemetryItem::new("sync", "tenant").with_sync(true));
        assert_eq!(channel.queue_size(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_downgraded_while_paused() {
        let (channel, transport, _sink) = channel(ChannelConfig::default());
        channel.pause();
        channel.track(TelemetryItem::new("sync", "tenant").with_sync(true));

        assert_eq!(channel.immediate_queue_size(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.requests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_event_downgraded_while_backed_off() {
        let (channel, transport, _sink) = channel(ChannelConfig::default());
        channel.inner.back_off_transmission();
        assert_eq!(channel.backoff_count(), 1);

        channel.track(TelemetryItem::new("sync", "tenant").with_sync(true));
        assert_eq!(channel.immediate_queue_size(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_off_slows_immediate_timer() {
        let (channel, transport, sink) = channel(ChannelConfig::default());
        channel.inner.back_off_transmission();

        channel.track(TelemetryItem::new("urgent", "tenant").with_latency(EventLatency::Immediate));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.requests.lock().is_empty());
        assert_eq!(channel.immediate_queue_size(), 1);

        // Level one stretches the zero immediate interval to 2.4s..3.6s.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.requests.lock().len(), 1);
        assert_eq!(*sink.sent.lock(), 1);
        assert_eq!(channel.backoff_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_timer_fires_at_once_without_back_off() {
        let (channel, transport, _sink) = channel(ChannelConfig::default());
        channel.track(TelemetryItem::new("urgent", "tenant").with_latency(EventLatency::Immediate));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.requests.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_rejected_while_paused_or_torn_down() {
        let (channel, _transport, _sink) = channel(ChannelConfig::default());
        channel.pause();
        assert!(matches!(channel.flush(true, None, None), Err(ChannelError::Paused)));
        channel.resume();
        channel.teardown();
        assert!(matches!(channel.flush(false, None, None), Err(ChannelError::TornDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_async_waits_for_idle() {
        let (channel, transport, sink) = channel(ChannelConfig::default());
        for i in 0..3 {
            channel.track(TelemetryItem::new(format!("e{i}"), "tenant"));
        }

        channel.flush_async(None).await.unwrap();
        assert_eq!(transport.requests.lock().len(), 1);
        assert_eq!(*sink.sent.lock(), 3);
        assert!(channel.http_manager().is_completely_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_event_queue_limits_trims_oldest() {
        let (channel, _transport, sink) = channel(ChannelConfig::default());
        for i in 0..5 {
            channel.track(TelemetryItem::new(format!("e{i}"), "tenant"));
        }

        channel.set_event_queue_limits(3, None);
        assert_eq!(channel.queue_size(), 3);
        assert_eq!(
            *sink.discarded.lock(),
            vec![EventsDiscardedReason::QueueFull, EventsDiscardedReason::QueueFull]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_transmit_profile_is_rejected() {
        let (channel, _transport, _sink) = channel(ChannelConfig::default());
        assert!(channel.set_transmit_profile("NOPE").is_err());
        channel.set_transmit_profile(crate::channel::config::BEST_EFFORT).unwrap();
        assert_eq!(channel.transmit_profile(), "BEST_EFFORT");
    }
}
