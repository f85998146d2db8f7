use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::device::transport::{ChannelInfo, ConnectionHandle, Subscription, SubscriptionHandle, Transport};
use crate::device::types::{AdapterState, Discovery};
use crate::error::TransportError;

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

/// [`Transport`] backed by the platform bluetooth stack.
pub struct BtleTransport {
    manager: Manager,
    write_deadline: Duration,
    scanning_adapters: Mutex<Vec<Adapter>>,
    // every peripheral seen while scanning, by address
    peripherals: PeripheralMap,
    subscriptions: Mutex<HashMap<u64, (Peripheral, Characteristic)>>,
    next_subscription: AtomicU64,
}

impl BtleTransport {
    pub async fn new(write_deadline: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;

        Ok(BtleTransport {
            manager,
            write_deadline,
            scanning_adapters: Mutex::new(Vec::new()),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self.peripherals.lock().expect("Failed to lock peripherals");
        peripherals.get(device_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(device_id.to_string()))
    }

    fn characteristic(peripheral: &Peripheral, channel: Uuid) -> Result<Characteristic, TransportError> {
        peripheral.characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == channel)
            .ok_or(TransportError::UnknownChannel(channel))
    }
}

async fn describe_peripheral(adapter: &Adapter, event: CentralEvent, peripherals: &PeripheralMap) -> Option<Discovery> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to look up discovered peripheral: {}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => {
            let address = properties.address.to_string();
            peripherals.lock()
                .expect("Failed to lock peripherals")
                .insert(address.clone(), peripheral);

            Some(Discovery {
                id: address,
                name: properties.local_name,
                rssi: properties.rssi,
            })
        },
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn adapter_state(&self) -> AdapterState {
        match self.manager.adapters().await {
            Err(btleplug::Error::PermissionDenied) => AdapterState::Unauthorized,
            Err(err) => {
                warn!("Failed to query bluetooth adapters: {}", err);
                AdapterState::Unknown
            },
            Ok(adapters) if adapters.is_empty() => AdapterState::Unsupported,
            Ok(adapters) => {
                for adapter in &adapters {
                    if adapter.adapter_info().await.is_ok() {
                        return AdapterState::PoweredOn;
                    }
                }
                AdapterState::PoweredOff
            },
        }
    }

    async fn scan(&self, services: Option<Vec<Uuid>>) -> Result<BoxStream<'static, Discovery>, TransportError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapter);
        }

        let filter = ScanFilter {
            services: services.unwrap_or_default(),
        };

        let mut streams = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            let events = adapter.events().await?;
            adapter.start_scan(filter.clone()).await?;

            let adapter = adapter.clone();
            let peripherals = self.peripherals.clone();
            streams.push(events.filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = peripherals.clone();
                async move { describe_peripheral(&adapter, event, &peripherals).await }
            }).boxed());
        }

        *self.scanning_adapters.lock().expect("Failed to lock adapters") = adapters;
        Ok(stream::select_all(streams).boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let adapters = std::mem::take(&mut *self.scanning_adapters.lock().expect("Failed to lock adapters"));

        for adapter in adapters {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {}", err);
            }
        }
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<ConnectionHandle, TransportError> {
        let peripheral = self.peripheral(device_id)?;

        info!("Connecting to peripheral {}...", device_id);
        peripheral.connect().await?;

        Ok(ConnectionHandle { device_id: device_id.to_string() })
    }

    async fn discover_channels(&self, handle: &ConnectionHandle) -> Result<Vec<ChannelInfo>, TransportError> {
        let peripheral = self.peripheral(&handle.device_id)?;

        info!("Connected; Discovering services...");
        peripheral.discover_services().await?;

        let channels = peripheral.services()
            .iter()
            .flat_map(|service| service.characteristics.iter().map(move |characteristic| ChannelInfo {
                service: service.uuid,
                channel: characteristic.uuid,
            }))
            .collect();

        Ok(channels)
    }

    async fn write(&self, handle: &ConnectionHandle, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.device_id)?;
        let characteristic = Self::characteristic(&peripheral, channel)?;

        let fut = peripheral.write(&characteristic, bytes, WriteType::WithResponse);
        match timeout(self.write_deadline, fut).await {
            Err(_) => Err(TransportError::WriteTimeout(channel)),
            Ok(result) => Ok(result?),
        }
    }

    async fn subscribe(&self, handle: &ConnectionHandle, channel: Uuid) -> Result<Subscription, TransportError> {
        let peripheral = self.peripheral(&handle.device_id)?;
        let characteristic = Self::characteristic(&peripheral, channel)?;

        info!("Subscribing to characteristic {:?} {:?}", characteristic.service_uuid, characteristic.uuid);
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock()
            .expect("Failed to lock subscriptions")
            .insert(id, (peripheral, characteristic));

        let notifications = notifications
            .filter(move |data| futures::future::ready(data.uuid == channel))
            .map(|data| data.value)
            .boxed();

        Ok(Subscription { handle: SubscriptionHandle(id), notifications })
    }

    async fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), TransportError> {
        let entry = self.subscriptions.lock()
            .expect("Failed to lock subscriptions")
            .remove(&subscription.0);

        let (peripheral, characteristic) = entry.ok_or(TransportError::UnknownSubscription(subscription.0))?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn cancel_connection(&self, handle: &ConnectionHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.device_id)?;

        self.subscriptions.lock()
            .expect("Failed to lock subscriptions")
            .retain(|_, (subscribed, _)| subscribed.id() != peripheral.id());

        peripheral.disconnect().await?;
        Ok(())
    }
}
