use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Duration, Instant};
use uuid::Uuid;

use crate::device::constants::{RESPONSE_ALREADY_CONNECTED, RESPONSE_CONNECTED, RESPONSE_DISCONNECTED};
use crate::device::transport::{ConnectionHandle, Transport};
use crate::error::{SessionError, TransportError};

/// A response token received on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Connected,
    AlreadyConnected,
    Disconnected,
    Other(String),
}

impl ControlResponse {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            RESPONSE_CONNECTED => ControlResponse::Connected,
            RESPONSE_ALREADY_CONNECTED => ControlResponse::AlreadyConnected,
            RESPONSE_DISCONNECTED => ControlResponse::Disconnected,
            other => ControlResponse::Other(other.to_string()),
        }
    }

    /// Responses that mean the credential was accepted.
    pub fn is_connected_family(&self) -> bool {
        matches!(self, ControlResponse::Connected | ControlResponse::AlreadyConnected)
    }

    pub fn token(&self) -> &str {
        match self {
            ControlResponse::Connected => RESPONSE_CONNECTED,
            ControlResponse::AlreadyConnected => RESPONSE_ALREADY_CONNECTED,
            ControlResponse::Disconnected => RESPONSE_DISCONNECTED,
            ControlResponse::Other(token) => token,
        }
    }
}

/// `VERB:argument`, the format of every command on the control channel.
pub fn format_command(verb: &str, argument: &str) -> String {
    format!("{}:{}", verb, argument)
}

struct PendingCommand {
    id: u64,
    responder: oneshot::Sender<Result<String, TransportError>>,
    deadline: Instant,
}

/// Pairs one control-channel write with the next control-channel notification.
///
/// There is a single slot, so at most one command is in flight. The slot is
/// emptied when a response arrives, when the deadline passes, when the waiting
/// future is dropped, or by [`cancel`](Self::cancel) and [`fail`](Self::fail).
pub struct CommandCorrelator {
    timeout: Duration,
    slot: Mutex<Option<PendingCommand>>,
    next_id: AtomicU64,
}

// Empties the slot when the waiting call finishes or is dropped, unless the
// slot has been taken over by someone else meanwhile.
struct SlotGuard<'a> {
    correlator: &'a CommandCorrelator,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.correlator.clear(self.id);
    }
}

impl CommandCorrelator {
    pub fn new(timeout: Duration) -> Self {
        CommandCorrelator {
            timeout,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingCommand>> {
        self.slot.lock().expect("Failed to lock correlation slot")
    }

    fn install(&self) -> Result<(SlotGuard<'_>, oneshot::Receiver<Result<String, TransportError>>, Instant), SessionError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(SessionError::CommandInFlight);
        }

        let (responder, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        *slot = Some(PendingCommand { id, responder, deadline });

        Ok((SlotGuard { correlator: self, id }, receiver, deadline))
    }

    fn clear(&self, id: u64) {
        let mut slot = self.lock();
        if slot.as_ref().map(|pending| pending.id) == Some(id) {
            *slot = None;
        }
    }

    /// Write `payload` to `channel` and wait for the response text.
    pub async fn send_command(
        &self,
        transport: &dyn Transport,
        handle: &ConnectionHandle,
        channel: Uuid,
        payload: &str,
    ) -> Result<String, SessionError> {
        let (_guard, receiver, deadline) = self.install()?;

        // the argument is usually a credential
        let verb = payload.split(':').next().unwrap_or_default();
        debug!("Sending command {} to {}", verb, handle.device_id);

        transport.write(handle, channel, payload.as_bytes()).await?;

        match timeout_at(deadline, receiver).await {
            Ok(Ok(Ok(response))) => {
                debug!("Command {} answered with {:?}", verb, response);
                Ok(response)
            },
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                warn!("Command {} was not answered within {:?}", verb, self.timeout);
                Err(SessionError::CommandTimeout(self.timeout))
            },
        }
    }

    /// Hand an inbound control frame to the waiting command, if any.
    pub fn resolve(&self, frame: &[u8]) -> bool {
        let text = String::from_utf8_lossy(frame).trim().to_string();

        match self.lock().take() {
            Some(pending) => {
                if Instant::now() > pending.deadline {
                    debug!("Response {:?} arrived after the deadline", text);
                }
                // the receiver may have given up already
                let _ = pending.responder.send(Ok(text));
                true
            },
            None => {
                debug!("Ignoring unsolicited control frame {:?}", text);
                false
            },
        }
    }

    /// Abandon the pending command; its caller gets [`SessionError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.lock().take().is_some()
    }

    /// Abandon the pending command because the link failed; its caller gets
    /// [`SessionError::TransportFault`]. Returns false when nobody received the error.
    pub fn fail(&self, error: TransportError) -> bool {
        match self.lock().take() {
            Some(pending) => pending.responder.send(Err(error)).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{make_sensor_control_uuid, COMMAND_CONNECT};
    use crate::device::fake::FakeTransport;

    async fn connected_fake() -> (FakeTransport, ConnectionHandle) {
        let transport = FakeTransport::new();
        transport.respond(COMMAND_CONNECT, None);
        let handle = transport.connect("X").await.unwrap();
        (transport, handle)
    }

    #[test]
    fn classifies_tokens() {
        assert_eq!(ControlResponse::parse("CONNECTED"), ControlResponse::Connected);
        assert_eq!(ControlResponse::parse(" ALREADY_CONNECTED\n"), ControlResponse::AlreadyConnected);
        assert_eq!(ControlResponse::parse("DISCONNECTED"), ControlResponse::Disconnected);
        assert_eq!(ControlResponse::parse("DENIED"), ControlResponse::Other("DENIED".to_string()));

        assert!(ControlResponse::Connected.is_connected_family());
        assert!(ControlResponse::AlreadyConnected.is_connected_family());
        assert!(!ControlResponse::Disconnected.is_connected_family());
        assert!(!ControlResponse::parse("connected").is_connected_family());
        assert_eq!(ControlResponse::parse("DENIED").token(), "DENIED");
    }

    #[test]
    fn formats_commands() {
        assert_eq!(format_command("CONNECT", "1234"), "CONNECT:1234");
    }

    #[tokio::test]
    async fn resolves_with_next_control_frame() {
        let (transport, handle) = connected_fake().await;
        let correlator = CommandCorrelator::new(Duration::from_secs(5));

        let (result, resolved) = tokio::join!(
            correlator.send_command(&transport, &handle, make_sensor_control_uuid(), "CONNECT:1234"),
            async {
                tokio::task::yield_now().await;
                correlator.resolve(b"CONNECTED\r\n")
            },
        );

        assert!(resolved);
        assert_eq!(result.unwrap(), "CONNECTED");
        assert!(!correlator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_frees_the_slot() {
        let (transport, handle) = connected_fake().await;
        let correlator = CommandCorrelator::new(Duration::from_secs(3));
        let control = make_sensor_control_uuid();

        let result = correlator.send_command(&transport, &handle, control, "CONNECT:1234").await;
        assert!(matches!(result, Err(SessionError::CommandTimeout(_))));
        assert!(!correlator.is_pending());

        let (result, _) = tokio::join!(
            correlator.send_command(&transport, &handle, control, "CONNECT:1234"),
            async {
                tokio::task::yield_now().await;
                correlator.resolve(b"CONNECTED")
            },
        );
        assert_eq!(result.unwrap(), "CONNECTED");
    }

    #[tokio::test]
    async fn rejects_overlapping_commands() {
        let (transport, handle) = connected_fake().await;
        let correlator = CommandCorrelator::new(Duration::from_secs(5));
        let control = make_sensor_control_uuid();

        let (first, second) = tokio::join!(
            correlator.send_command(&transport, &handle, control, "CONNECT:1234"),
            async {
                tokio::task::yield_now().await;
                let second = correlator.send_command(&transport, &handle, control, "CONNECT:5678").await;
                correlator.resolve(b"CONNECTED");
                second
            },
        );

        assert_eq!(first.unwrap(), "CONNECTED");
        assert!(matches!(second, Err(SessionError::CommandInFlight)));
    }

    #[tokio::test]
    async fn cancel_wakes_the_waiter() {
        let (transport, handle) = connected_fake().await;
        let correlator = CommandCorrelator::new(Duration::from_secs(5));

        let (result, cancelled) = tokio::join!(
            correlator.send_command(&transport, &handle, make_sensor_control_uuid(), "CONNECT:1234"),
            async {
                tokio::task::yield_now().await;
                correlator.cancel()
            },
        );

        assert!(cancelled);
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(!correlator.is_pending());
    }

    #[tokio::test]
    async fn link_failure_reaches_the_waiter() {
        let (transport, handle) = connected_fake().await;
        let correlator = CommandCorrelator::new(Duration::from_secs(5));

        let (result, delivered) = tokio::join!(
            correlator.send_command(&transport, &handle, make_sensor_control_uuid(), "CONNECT:1234"),
            async {
                tokio::task::yield_now().await;
                correlator.fail(TransportError::Closed("X".to_string()))
            },
        );

        assert!(delivered);
        assert!(matches!(
            result,
            Err(SessionError::TransportFault { source: TransportError::Closed(_) })
        ));
        assert!(!correlator.is_pending());
        assert!(!correlator.fail(TransportError::Closed("X".to_string())));
    }

    #[tokio::test]
    async fn failed_write_frees_the_slot() {
        let transport = FakeTransport::new();
        let handle = ConnectionHandle { device_id: "never-connected".to_string() };
        let correlator = CommandCorrelator::new(Duration::from_secs(5));

        let result = correlator.send_command(&transport, &handle, make_sensor_control_uuid(), "CONNECT:1234").await;
        assert!(matches!(result, Err(SessionError::TransportFault { .. })));
        assert!(!correlator.is_pending());
    }

    #[test]
    fn unsolicited_frames_are_ignored() {
        let correlator = CommandCorrelator::new(Duration::from_secs(5));
        assert!(!correlator.resolve(b"CONNECTED"));
        assert!(!correlator.cancel());
    }
}
