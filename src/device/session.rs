//! The connection state machine.
//!
//! ```text
//!   Disconnected ──scan──▶ Scanning ──timeout/stop──▶ Disconnected
//!   Disconnected ──connect──▶ Connecting ──channels ok──▶ Connected ──CONNECTED──▶ Authenticated
//!   Authenticated ──DISCONNECT:<credential>──▶ Connected
//!   any ──transport fault──▶ Error ──cleanup──▶ Disconnected
//! ```
//!
//! Every transition goes through [`Session::set_state`], which notifies the
//! state callback only when the value actually changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::credentials::CredentialStore;
use crate::config::types::Config;
use crate::device::constants::{COMMAND_ACK, COMMAND_CONNECT, COMMAND_DISCONNECT};
use crate::device::correlator::{format_command, CommandCorrelator, ControlResponse};
use crate::device::registry::DeviceRegistry;
use crate::device::stream::DataStreamProcessor;
use crate::device::transport::{ConnectionHandle, SubscriptionHandle, Transport};
use crate::device::types::{
    AdapterState, CommandResult, ConnectionState, DeviceRecord, Discovery, SessionCallbacks,
};
use crate::error::{SessionError, TransportError};

struct ActiveScan {
    id: u64,
    cancel: CancellationToken,
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    // stops the task reading the notifications
    cancel: CancellationToken,
}

/// Everything that belongs to one transport connection.
struct Link {
    handle: ConnectionHandle,
    control: Option<ActiveSubscription>,
    data: Option<ActiveSubscription>,
    // set by the first reader task that sees the link go away
    lost: bool,
}

struct Session {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    config: Config,
    callbacks: RwLock<SessionCallbacks>,
    state: Mutex<ConnectionState>,
    registry: Mutex<DeviceRegistry>,
    correlator: CommandCorrelator,
    link: Mutex<Option<Link>>,
    // claimed before the first await of a scan request, so requests cannot overlap
    scan: Mutex<Option<ActiveScan>>,
    // claimed before the first await of a connect request; cancelled by disconnect()
    attempt: Mutex<Option<Attempt>>,
    next_id: AtomicU64,
}

impl Session {
    fn callbacks(&self) -> RwLockReadGuard<'_, SessionCallbacks> {
        self.callbacks.read().expect("Failed to lock session callbacks")
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("Failed to lock session state")
    }

    fn set_state(&self, new_state: ConnectionState) {
        let previous = self.swap_state(new_state);
        self.notify_state(previous, new_state);
    }

    fn swap_state(&self, new_state: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock().expect("Failed to lock session state");
        std::mem::replace(&mut *state, new_state)
    }

    fn notify_state(&self, previous: ConnectionState, new_state: ConnectionState) {
        if previous != new_state {
            info!("State {} -> {}", previous, new_state);
            self.callbacks().state_change(new_state);
        }
    }

    /// Transition only when the current state is `from`.
    fn set_state_from(&self, from: ConnectionState, new_state: ConnectionState) -> bool {
        {
            let mut state = self.state.lock().expect("Failed to lock session state");
            if *state != from {
                return false;
            }
            *state = new_state;
        }

        self.notify_state(from, new_state);
        true
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Release the scan slot if `id` still holds it.
    fn abandon_scan(&self, id: u64) {
        let mut scan = self.scan.lock().expect("Failed to lock scan");
        if scan.as_ref().map(|active| active.id) == Some(id) {
            *scan = None;
        }
    }

    /// Release the connect slot if attempt `id` still holds it.
    fn end_attempt(&self, id: u64) {
        let mut attempt = self.attempt.lock().expect("Failed to lock attempt");
        if attempt.as_ref().map(|active| active.id) == Some(id) {
            *attempt = None;
        }
    }

    /// Log the error and pass it to the error callback, then hand it back for returning.
    fn report(&self, error: SessionError) -> SessionError {
        warn!("{}", error);
        self.callbacks().error(&error);
        error
    }

    fn publish_devices(&self) {
        let snapshot = self.registry.lock().expect("Failed to lock registry").snapshot();
        self.callbacks().devices_found(snapshot);
    }

    fn link_handle(&self) -> Option<ConnectionHandle> {
        self.link.lock()
            .expect("Failed to lock link")
            .as_ref()
            .map(|link| link.handle.clone())
    }

    async fn stop_scan(&self, only_id: Option<u64>) {
        let scan = {
            let mut scan = self.scan.lock().expect("Failed to lock scan");
            // a scan that timed out must not stop a newer one
            let superseded = match (scan.as_ref(), only_id) {
                (Some(active), Some(id)) => active.id != id,
                _ => false,
            };
            if superseded { None } else { scan.take() }
        };

        let scan = match scan {
            Some(scan) => scan,
            None => {
                debug!("Not scanning");
                return;
            },
        };

        scan.cancel.cancel();
        if let Err(err) = self.transport.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }
        self.set_state_from(ConnectionState::Scanning, ConnectionState::Disconnected);
    }

    /// Drop every subscription, the pending command and the connection itself.
    /// Safe to call at any time, any number of times.
    async fn teardown(&self) {
        let link = self.link.lock().expect("Failed to lock link").take();
        self.release(link).await;
    }

    async fn release(&self, link: Option<Link>) {
        self.correlator.cancel();

        let attempt = self.attempt.lock().expect("Failed to lock attempt").take();
        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
        }

        let link = match link {
            Some(link) => link,
            None => return,
        };

        for subscription in [link.control, link.data].into_iter().flatten() {
            subscription.cancel.cancel();
            if let Err(err) = self.transport.unsubscribe(subscription.handle).await {
                debug!("Failed to unsubscribe: {}", err);
            }
        }

        info!("Closing connection to {}", link.handle.device_id);
        if let Err(err) = self.transport.cancel_connection(&link.handle).await {
            warn!("Failed to close connection: {}", err);
        }
    }

    /// Settle at Disconnected after an error, passing through Error for transport faults.
    async fn fail(&self, error: SessionError) -> SessionError {
        if error.is_transport_fault() {
            self.set_state(ConnectionState::Error);
        }
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        self.report(error)
    }

    async fn connection_lost(&self, handle: &ConnectionHandle) {
        // both reader tasks notice a lost link; only the first one to get here acts
        let link = {
            let mut link = self.link.lock().expect("Failed to lock link");
            let first = match link.as_mut() {
                Some(current) if &current.handle == handle && !current.lost => {
                    current.lost = true;
                    true
                },
                _ => false,
            };
            if !first {
                return;
            }

            // a command waiting for its answer fails with the fault and cleans up
            if self.correlator.fail(TransportError::Closed(handle.device_id.clone())) {
                debug!("Connection lost while a command was pending");
                return;
            }
            link.take()
        };
        if link.is_none() {
            return;
        }

        warn!("Connection lost");
        self.set_state(ConnectionState::Error);
        self.release(link).await;
        self.set_state(ConnectionState::Disconnected);
        self.report(SessionError::from(TransportError::Closed(handle.device_id.clone())));
    }
}

/// Drives one sensor: scanning, connecting, authenticating and streaming.
///
/// Construct one per adapter and call [`dispose`](Self::dispose) when done.
pub struct SessionManager {
    inner: Arc<Session>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialStore>, config: Config) -> Self {
        let registry = DeviceRegistry::new(&config.device_name_marker);
        let correlator = CommandCorrelator::new(config.command_timeout());

        SessionManager {
            inner: Arc::new(Session {
                transport,
                credentials,
                config,
                callbacks: RwLock::new(SessionCallbacks::default()),
                state: Mutex::new(ConnectionState::Disconnected),
                registry: Mutex::new(registry),
                correlator,
                link: Mutex::new(None),
                scan: Mutex::new(None),
                attempt: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_callbacks(self, callbacks: SessionCallbacks) -> Self {
        self.set_callbacks(callbacks);
        self
    }

    /// Replace all callbacks. Callbacks must not call back into the session.
    pub fn set_callbacks(&self, callbacks: SessionCallbacks) {
        *self.inner.callbacks.write().expect("Failed to lock session callbacks") = callbacks;
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan.lock().expect("Failed to lock scan").is_some()
    }

    pub fn connected_device(&self) -> Option<String> {
        self.inner.link_handle().map(|handle| handle.device_id)
    }

    pub async fn adapter_state(&self) -> AdapterState {
        self.inner.transport.adapter_state().await
    }

    pub fn get_available_devices(&self) -> Vec<DeviceRecord> {
        self.inner.registry.lock().expect("Failed to lock registry").snapshot()
    }

    pub fn clear_devices(&self) {
        self.inner.registry.lock().expect("Failed to lock registry").clear();
        self.inner.publish_devices();
    }

    async fn require_adapter(&self) -> Result<(), SessionError> {
        match self.inner.transport.adapter_state().await {
            AdapterState::PoweredOn => Ok(()),
            other => Err(self.inner.report(SessionError::TransportUnavailable(other))),
        }
    }

    /// Start discovery. The scan ends by itself after `scan_timeout` (or the
    /// configured default); results arrive through `on_devices_found`.
    pub async fn scan_for_devices(&self, scan_timeout: Option<Duration>) -> Result<(), SessionError> {
        let session = &self.inner;
        let id = session.next_id();
        let cancel = CancellationToken::new();

        let claimed = {
            let attempt = session.attempt.lock().expect("Failed to lock attempt");
            let mut scan = session.scan.lock().expect("Failed to lock scan");

            if attempt.is_some() {
                Err(SessionError::InvalidState(ConnectionState::Connecting))
            } else if scan.is_some() {
                Ok(false)
            } else {
                match session.state() {
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        *scan = Some(ActiveScan { id, cancel: cancel.clone() });
                        Ok(true)
                    },
                    other => Err(SessionError::InvalidState(other)),
                }
            }
        };

        match claimed {
            Ok(true) => {},
            Ok(false) => {
                debug!("Already scanning");
                return Ok(());
            },
            Err(err) => return Err(session.report(err)),
        }

        let discoveries = match self.start_discovery().await {
            Ok(discoveries) => discoveries,
            Err(err) => {
                session.abandon_scan(id);
                return Err(err);
            },
        };

        // stop_scan() or a connect request may have taken the slot meanwhile
        let previous = {
            let scan = session.scan.lock().expect("Failed to lock scan");
            match scan.as_ref() {
                Some(active) if active.id == id => Some(session.swap_state(ConnectionState::Scanning)),
                _ => None,
            }
        };

        let previous = match previous {
            Some(previous) => previous,
            None => {
                if let Err(err) = session.transport.stop_scan().await {
                    warn!("Failed to stop scanning: {}", err);
                }
                return Err(session.report(SessionError::Cancelled));
            },
        };
        session.notify_state(previous, ConnectionState::Scanning);

        let scan_timeout = scan_timeout.unwrap_or_else(|| session.config.scan_timeout());
        info!("Scanning for {:?}...", scan_timeout);
        tokio::spawn(scan_task(session.clone(), discoveries, cancel, id, scan_timeout));
        Ok(())
    }

    async fn start_discovery(&self) -> Result<BoxStream<'static, Discovery>, SessionError> {
        let session = &self.inner;
        self.require_adapter().await?;

        // read once; credentials saved while this scan runs show up in the next one
        let credentials = match session.credentials.entries().await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!("Failed to load stored credentials: {}", err);
                HashMap::new()
            },
        };
        session.registry.lock().expect("Failed to lock registry").reset(credentials);
        session.publish_devices();

        let services = session.config.filter_scan_by_service.then(|| vec![session.config.service_uuid]);
        match session.transport.scan(services).await {
            Ok(discoveries) => Ok(discoveries),
            Err(err) => Err(session.report(err.into())),
        }
    }

    /// Stop discovery. Does nothing when no scan is running.
    pub async fn stop_scan(&self) {
        self.inner.stop_scan(None).await;
    }

    /// Connect to a scanned device and log in with `credential`.
    ///
    /// A rejected credential is not an `Err`: it resolves with `success == false` and
    /// the device's answer as message, after disconnecting.
    pub async fn connect_with_credential(&self, device_id: &str, credential: &str) -> Result<CommandResult, SessionError> {
        let session = &self.inner;

        if !session.config.is_valid_credential(credential) {
            return Err(session.report(SessionError::InvalidCredentialFormat));
        }

        if !session.registry.lock().expect("Failed to lock registry").contains(device_id) {
            return Err(session.report(SessionError::DeviceNotFound(device_id.to_string())));
        }

        let attempt_id = session.next_id();
        let attempt = CancellationToken::new();
        let claimed = {
            let mut slot = session.attempt.lock().expect("Failed to lock attempt");
            match (slot.is_some(), session.state()) {
                (true, _) => Err(SessionError::InvalidState(ConnectionState::Connecting)),
                (false, ConnectionState::Disconnected | ConnectionState::Error | ConnectionState::Scanning) => {
                    *slot = Some(Attempt { id: attempt_id, cancel: attempt.clone() });
                    Ok(())
                },
                (false, other) => Err(SessionError::InvalidState(other)),
            }
        };
        if let Err(err) = claimed {
            return Err(session.report(err));
        }

        if let Err(err) = self.require_adapter().await {
            session.end_attempt(attempt_id);
            return Err(err);
        }
        session.stop_scan(None).await;
        session.set_state(ConnectionState::Connecting);

        let connect_timeout = session.config.connect_timeout();
        let established = tokio::select! {
            _ = attempt.cancelled() => Err(SessionError::Cancelled),
            result = timeout(connect_timeout, self.establish(device_id)) => match result {
                Err(_) => Err(SessionError::ConnectionTimeout(connect_timeout)),
                Ok(result) => result,
            },
        };

        let handle = match established {
            Ok(handle) => handle,
            Err(err) => return Err(session.fail(err).await),
        };
        session.set_state(ConnectionState::Connected);

        let command = format_command(COMMAND_CONNECT, credential);
        let response = tokio::select! {
            _ = attempt.cancelled() => Err(SessionError::Cancelled),
            result = session.correlator.send_command(
                session.transport.as_ref(),
                &handle,
                session.config.control_characteristic_uuid,
                &command,
            ) => result,
        };

        let response = match response {
            Ok(text) => ControlResponse::parse(&text),
            Err(err) => return Err(session.fail(err).await),
        };

        if !response.is_connected_family() {
            let token = response.token().to_string();
            session.report(SessionError::AuthenticationRejected(token.clone()));
            session.teardown().await;
            session.set_state(ConnectionState::Disconnected);
            return Ok(CommandResult::failed(token));
        }

        if let Err(err) = session.credentials.set(device_id, credential).await {
            warn!("Failed to store credential for {}: {}", device_id, err);
        }

        if response == ControlResponse::Connected {
            self.send_ack(&handle).await;
        }

        if let Err(err) = self.arm_data_channel(&handle).await {
            return Err(session.fail(err).await);
        }

        if attempt.is_cancelled() {
            return Err(session.fail(SessionError::Cancelled).await);
        }
        session.end_attempt(attempt_id);

        session.set_state(ConnectionState::Authenticated);
        Ok(CommandResult::ok(response.token()))
    }

    /// Connect, discover channels and start listening on the control channel.
    async fn establish(&self, device_id: &str) -> Result<ConnectionHandle, SessionError> {
        let session = &self.inner;
        let transport = session.transport.as_ref();
        let data_uuid = session.config.data_characteristic_uuid;
        let control_uuid = session.config.control_characteristic_uuid;

        let handle = transport.connect(device_id).await?;
        *session.link.lock().expect("Failed to lock link") = Some(Link {
            handle: handle.clone(),
            control: None,
            data: None,
            lost: false,
        });

        let channels = transport.discover_channels(&handle).await?;
        for required in [data_uuid, control_uuid] {
            if !channels.iter().any(|info| info.channel == required) {
                return Err(SessionError::MissingCapability(required));
            }
        }

        let subscription = transport.subscribe(&handle, control_uuid).await?;
        let cancel = CancellationToken::new();
        let active = ActiveSubscription { handle: subscription.handle, cancel: cancel.clone() };
        if !self.attach(&handle, active, false) {
            let _ = transport.unsubscribe(subscription.handle).await;
            return Err(SessionError::Cancelled);
        }

        tokio::spawn(control_task(session.clone(), handle.clone(), subscription.notifications, cancel));
        Ok(handle)
    }

    /// Store a subscription on the link, unless the link was torn down meanwhile.
    fn attach(&self, handle: &ConnectionHandle, subscription: ActiveSubscription, data: bool) -> bool {
        let mut link = self.inner.link.lock().expect("Failed to lock link");
        match link.as_mut() {
            Some(link) if &link.handle == handle => {
                if data {
                    link.data = Some(subscription);
                } else {
                    link.control = Some(subscription);
                }
                true
            },
            _ => false,
        }
    }

    async fn arm_data_channel(&self, handle: &ConnectionHandle) -> Result<(), SessionError> {
        let session = &self.inner;
        let data_uuid = session.config.data_characteristic_uuid;

        let armed = {
            let link = session.link.lock().expect("Failed to lock link");
            match link.as_ref() {
                Some(link) if &link.handle == handle => link.data.is_some(),
                _ => return Err(SessionError::Cancelled),
            }
        };
        if armed {
            debug!("Data channel already subscribed");
            return Ok(());
        }

        let subscription = session.transport.subscribe(handle, data_uuid).await?;
        let cancel = CancellationToken::new();
        let active = ActiveSubscription { handle: subscription.handle, cancel: cancel.clone() };
        if !self.attach(handle, active, true) {
            let _ = session.transport.unsubscribe(subscription.handle).await;
            return Err(SessionError::Cancelled);
        }

        let processor = DataStreamProcessor::new(
            &session.config.measurement_unit,
            session.config.stream_diagnostics,
            session.config.stream_log_interval(),
        );
        tokio::spawn(data_task(session.clone(), handle.clone(), subscription.notifications, processor, cancel));
        Ok(())
    }

    async fn disarm_data_channel(&self) {
        let session = &self.inner;
        let data = session.link.lock()
            .expect("Failed to lock link")
            .as_mut()
            .and_then(|link| link.data.take());

        if let Some(data) = data {
            data.cancel.cancel();
            if let Err(err) = session.transport.unsubscribe(data.handle).await {
                debug!("Failed to unsubscribe from data channel: {}", err);
            }
        }
    }

    // best effort: the device blinks to confirm a fresh login
    async fn send_ack(&self, handle: &ConnectionHandle) {
        let session = &self.inner;
        let fut = session.transport.write(handle, session.config.control_characteristic_uuid, COMMAND_ACK.as_bytes());

        tokio::select! {
            _ = sleep(session.config.write_timeout()) => {
                warn!("Sending acknowledgement took too long");
            }
            result = fut => {
                if let Err(err) = result {
                    warn!("Failed to send acknowledgement: {:?}", err);
                }
            }
        };
    }

    /// Log out of the device, which stops the measurement stream. The connection
    /// stays open; call [`disconnect`](Self::disconnect) to close it.
    pub async fn disconnect_with_credential(&self, credential: &str) -> Result<CommandResult, SessionError> {
        let session = &self.inner;

        if !session.config.is_valid_credential(credential) {
            return Err(session.report(SessionError::InvalidCredentialFormat));
        }

        let state = session.state();
        let handle = match (state, session.link_handle()) {
            (ConnectionState::Authenticated, Some(handle)) => handle,
            _ => return Err(session.report(SessionError::InvalidState(state))),
        };

        let command = format_command(COMMAND_DISCONNECT, credential);
        let response = session.correlator.send_command(
            session.transport.as_ref(),
            &handle,
            session.config.control_characteristic_uuid,
            &command,
        ).await;

        let response = match response {
            Ok(text) => ControlResponse::parse(&text),
            Err(err) if err.is_transport_fault() => return Err(session.fail(err).await),
            Err(err) => return Err(session.report(err)),
        };

        if response != ControlResponse::Disconnected {
            info!("Device refused to log out: {}", response.token());
            return Ok(CommandResult::failed(response.token()));
        }

        self.disarm_data_channel().await;
        session.set_state_from(ConnectionState::Authenticated, ConnectionState::Connected);
        Ok(CommandResult::ok(response.token()))
    }

    /// Write a free-form command on the control channel without waiting for an answer.
    pub async fn trigger_auxiliary_command(&self, command: &str) -> Result<(), SessionError> {
        let session = &self.inner;

        let state = session.state();
        let handle = match (state, session.link_handle()) {
            (ConnectionState::Authenticated, Some(handle)) => handle,
            _ => return Err(session.report(SessionError::InvalidState(state))),
        };

        debug!("Sending auxiliary command {:?}", command);
        let write = session.transport.write(&handle, session.config.control_characteristic_uuid, command.as_bytes());
        match timeout(session.config.write_timeout(), write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(session.fail(err.into()).await),
            Err(_) => {
                let err = TransportError::WriteTimeout(session.config.control_characteristic_uuid);
                Err(session.fail(err.into()).await)
            },
        }
    }

    /// Tear everything down, whatever the current state.
    pub async fn disconnect(&self) {
        let session = &self.inner;

        session.stop_scan(None).await;
        session.teardown().await;
        session.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and release the session.
    pub async fn dispose(self) {
        self.disconnect().await;
        self.set_callbacks(SessionCallbacks::default());
        info!("Session disposed");
    }
}

async fn scan_task(
    session: Arc<Session>,
    mut discoveries: BoxStream<'static, Discovery>,
    cancel: CancellationToken,
    id: u64,
    scan_timeout: Duration,
) {
    let expired = sleep(scan_timeout);
    tokio::pin!(expired);

    'mainloop: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            _ = &mut expired => {
                info!("Scan finished");
                session.stop_scan(Some(id)).await;
                break 'mainloop;
            },
            Some(discovery) = discoveries.next() => {
                let snapshot = {
                    let mut registry = session.registry.lock().expect("Failed to lock registry");
                    registry.observe(discovery).then(|| registry.snapshot())
                };

                if let Some(snapshot) = snapshot {
                    session.callbacks().devices_found(snapshot);
                }
            },
        }
    }
}

async fn control_task(
    session: Arc<Session>,
    handle: ConnectionHandle,
    mut notifications: BoxStream<'static, Vec<u8>>,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            frame = notifications.next() => match frame {
                Some(frame) => {
                    session.correlator.resolve(&frame);
                },
                None => {
                    if !cancel.is_cancelled() {
                        session.connection_lost(&handle).await;
                    }
                    break 'mainloop;
                },
            },
        }
    }
}

async fn data_task(
    session: Arc<Session>,
    handle: ConnectionHandle,
    mut notifications: BoxStream<'static, Vec<u8>>,
    mut processor: DataStreamProcessor,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            frame = notifications.next() => match frame {
                Some(frame) => {
                    if let Some(measurement) = processor.process(&frame) {
                        session.callbacks().measurement(measurement);
                    }
                },
                None => {
                    if !cancel.is_cancelled() {
                        session.connection_lost(&handle).await;
                    }
                    break 'mainloop;
                },
            },
        }
    }

    debug!("Data stream ended after {} frames ({} dropped)", processor.received(), processor.dropped());
}
