//! The boundary between the session logic and the bluetooth stack.
//!
//! [`BtleTransport`](crate::device::btle::BtleTransport) implements it on top of
//! btleplug, [`FakeTransport`](crate::device::fake::FakeTransport) implements it
//! in-process for tests and the `--simulate` mode.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::{AdapterState, Discovery};
use crate::error::TransportError;

/// Identifies one open connection. Only meaningful to the transport that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub service: Uuid,
    pub channel: Uuid,
}

/// An active notification subscription. The stream ends when the subscription is
/// cancelled or the connection is lost.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub notifications: BoxStream<'static, Vec<u8>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn adapter_state(&self) -> AdapterState;

    /// Start discovery. `services` narrows the scan where the platform supports it;
    /// callers must still filter the results.
    async fn scan(&self, services: Option<Vec<Uuid>>) -> Result<BoxStream<'static, Discovery>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, device_id: &str) -> Result<ConnectionHandle, TransportError>;

    async fn discover_channels(&self, handle: &ConnectionHandle) -> Result<Vec<ChannelInfo>, TransportError>;

    async fn write(&self, handle: &ConnectionHandle, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(&self, handle: &ConnectionHandle, channel: Uuid) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), TransportError>;

    async fn cancel_connection(&self, handle: &ConnectionHandle) -> Result<(), TransportError>;
}
