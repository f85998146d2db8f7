//! In-process [`Transport`] with a scripted device behind it.
//!
//! Every call is recorded so tests can assert on the exact traffic, and the
//! device's answers to control commands are configurable per verb.

use std::collections::HashMap;
use std::sync::Mutex;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use log::debug;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::device::constants::{
    make_sensor_control_uuid, make_sensor_data_uuid, make_sensor_service_uuid, COMMAND_CONNECT,
    COMMAND_DISCONNECT, RESPONSE_CONNECTED, RESPONSE_DISCONNECTED,
};
use crate::device::transport::{ChannelInfo, ConnectionHandle, Subscription, SubscriptionHandle, Transport};
use crate::device::types::{AdapterState, Discovery};
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Scan,
    StopScan,
    Connect(String),
    DiscoverChannels,
    Write { channel: Uuid, payload: String },
    Subscribe(Uuid),
    Unsubscribe(u64),
    CancelConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    // never completes, to exercise the connect deadline
    Hang,
}

struct FakeState {
    adapter_state: AdapterState,
    advertisements: Vec<Discovery>,
    scan_sender: Option<UnboundedSender<Discovery>>,
    channels: Vec<ChannelInfo>,
    connect_behavior: ConnectBehavior,
    responses: HashMap<String, Option<String>>,
    subscriptions: HashMap<u64, (Uuid, UnboundedSender<Vec<u8>>)>,
    next_subscription: u64,
    connected: Option<String>,
    data_feed: Option<Duration>,
    calls: Vec<TransportCall>,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// A powered-on adapter and a device that accepts any credential.
    pub fn new() -> Self {
        let service = make_sensor_service_uuid();
        let mut responses = HashMap::new();
        responses.insert(COMMAND_CONNECT.to_string(), Some(RESPONSE_CONNECTED.to_string()));
        responses.insert(COMMAND_DISCONNECT.to_string(), Some(RESPONSE_DISCONNECTED.to_string()));

        FakeTransport {
            state: Mutex::new(FakeState {
                adapter_state: AdapterState::PoweredOn,
                advertisements: Vec::new(),
                scan_sender: None,
                channels: vec![
                    ChannelInfo { service, channel: make_sensor_data_uuid() },
                    ChannelInfo { service, channel: make_sensor_control_uuid() },
                ],
                connect_behavior: ConnectBehavior::Succeed,
                responses,
                subscriptions: HashMap::new(),
                next_subscription: 1,
                connected: None,
                data_feed: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Used by `--simulate`: one advertising sensor that streams a value every `feed_interval`.
    pub fn demo(feed_interval: Duration) -> Self {
        let transport = Self::new();
        transport.advertise("00:11:22:33:44:55", Some("SENSOR-DEMO"), Some(-58));
        transport.advertise("66:77:88:99:AA:BB", Some("Headphones"), Some(-71));
        transport.lock().data_feed = Some(feed_interval);
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("Failed to lock fake transport state")
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        self.lock().adapter_state = adapter_state;
    }

    /// Queue an advertisement; delivered immediately when a scan is running.
    pub fn advertise(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        let discovery = Discovery {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi,
        };

        let mut state = self.lock();
        if let Some(sender) = &state.scan_sender {
            if sender.unbounded_send(discovery.clone()).is_ok() {
                return;
            }
        }
        state.advertisements.push(discovery);
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        self.lock().channels = channels;
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().connect_behavior = behavior;
    }

    /// Answer commands starting with `verb` with `token`; `None` keeps the device silent.
    pub fn respond(&self, verb: &str, token: Option<&str>) {
        self.lock().responses.insert(verb.to_string(), token.map(str::to_string));
    }

    /// Deliver a notification on every subscription to `channel`.
    pub fn notify(&self, channel: Uuid, payload: &[u8]) {
        let state = self.lock();
        for (subscribed, sender) in state.subscriptions.values() {
            if *subscribed == channel {
                let _ = sender.unbounded_send(payload.to_vec());
            }
        }
    }

    pub fn push_data(&self, payload: &str) {
        self.notify(make_sensor_data_uuid(), payload.as_bytes());
    }

    /// Ends every notification stream, as a link loss would.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.subscriptions.clear();
        state.connected = None;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }
}

fn spawn_data_feed(sender: UnboundedSender<Vec<u8>>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        let mut step: u64 = 0;

        loop {
            ticker.tick().await;
            let value = 500.0 + 25.0 * (step as f64 / 10.0).sin();
            if sender.unbounded_send(format!("{:.2}", value).into_bytes()).is_err() {
                debug!("Demo data feed stopped");
                break;
            }
            step += 1;
        }
    });
}

#[async_trait]
impl Transport for FakeTransport {
    async fn adapter_state(&self) -> AdapterState {
        self.lock().adapter_state
    }

    async fn scan(&self, _services: Option<Vec<Uuid>>) -> Result<BoxStream<'static, Discovery>, TransportError> {
        let (sender, receiver) = unbounded();
        let mut state = self.lock();
        state.calls.push(TransportCall::Scan);

        for discovery in state.advertisements.drain(..) {
            let _ = sender.unbounded_send(discovery);
        }
        state.scan_sender = Some(sender);

        Ok(receiver.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::StopScan);
        state.scan_sender = None;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<ConnectionHandle, TransportError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.push(TransportCall::Connect(device_id.to_string()));
            state.connect_behavior
        };

        match behavior {
            ConnectBehavior::Succeed => {
                self.lock().connected = Some(device_id.to_string());
                Ok(ConnectionHandle { device_id: device_id.to_string() })
            },
            ConnectBehavior::Fail => Err(TransportError::Closed(device_id.to_string())),
            ConnectBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn discover_channels(&self, handle: &ConnectionHandle) -> Result<Vec<ChannelInfo>, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::DiscoverChannels);

        if state.connected.as_deref() != Some(handle.device_id.as_str()) {
            return Err(TransportError::Closed(handle.device_id.clone()));
        }
        Ok(state.channels.clone())
    }

    async fn write(&self, handle: &ConnectionHandle, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let payload = String::from_utf8_lossy(bytes).to_string();
        let mut state = self.lock();
        state.calls.push(TransportCall::Write { channel, payload: payload.clone() });

        if state.connected.as_deref() != Some(handle.device_id.as_str()) {
            return Err(TransportError::Closed(handle.device_id.clone()));
        }
        if !state.channels.iter().any(|info| info.channel == channel) {
            return Err(TransportError::UnknownChannel(channel));
        }

        let verb = payload.split(':').next().unwrap_or_default();
        if let Some(Some(token)) = state.responses.get(verb) {
            for (subscribed, sender) in state.subscriptions.values() {
                if *subscribed == channel {
                    let _ = sender.unbounded_send(token.clone().into_bytes());
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, handle: &ConnectionHandle, channel: Uuid) -> Result<Subscription, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Subscribe(channel));

        if state.connected.as_deref() != Some(handle.device_id.as_str()) {
            return Err(TransportError::Closed(handle.device_id.clone()));
        }
        if !state.channels.iter().any(|info| info.channel == channel) {
            return Err(TransportError::UnknownChannel(channel));
        }

        let (sender, receiver) = unbounded();
        if channel == make_sensor_data_uuid() {
            if let Some(every) = state.data_feed {
                spawn_data_feed(sender.clone(), every);
            }
        }

        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(id, (channel, sender));

        Ok(Subscription { handle: SubscriptionHandle(id), notifications: receiver.boxed() })
    }

    async fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Unsubscribe(subscription.0));

        match state.subscriptions.remove(&subscription.0) {
            Some(_) => Ok(()),
            None => Err(TransportError::UnknownSubscription(subscription.0)),
        }
    }

    async fn cancel_connection(&self, handle: &ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::CancelConnection);

        if state.connected.as_deref() == Some(handle.device_id.as_str()) {
            state.connected = None;
            state.subscriptions.clear();
        }
        Ok(())
    }
}
