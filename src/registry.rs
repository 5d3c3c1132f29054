/* Device registry.
 *
 * Consumes hotplug events, owns the widget for every attached device
 * and fans notifications out to the application. Widget construction
 * may involve USB round trips (GET_UID), so it happens inline on the
 * registry task; teardown can block on transfer draining, so it is
 * pushed onto a detached cleanup task instead. */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::usb::hotplug::HotplugEvent;
use crate::usb::UsbDeviceId;
use crate::widget::{Widget, WidgetHandle, WidgetInfo};

/// Builds a widget for a newly attached device.
///
/// Returning `None` means the device is not ours or failed to
/// initialize; the registry discards it either way.
#[async_trait]
pub trait WidgetFactory<D>: Send {
    async fn create(&mut self, id: UsbDeviceId, device: &D) -> Option<(WidgetHandle, WidgetInfo)>;
}

/// Notifications delivered to the application.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    WidgetAdded(Arc<WidgetInfo>),
    WidgetRemoved(Arc<WidgetInfo>),
}

struct DeviceState {
    widget: WidgetHandle,
    info: Arc<WidgetInfo>,
}

/// The registry actor.
pub struct DeviceRegistry<D, F> {
    events: mpsc::Receiver<HotplugEvent<D>>,
    factory: F,
    notifications: mpsc::Sender<RegistryEvent>,
    devices: HashMap<UsbDeviceId, DeviceState>,
}

impl<D, F> DeviceRegistry<D, F>
where
    D: Send + 'static,
    F: WidgetFactory<D> + 'static,
{
    pub fn new(
        events: mpsc::Receiver<HotplugEvent<D>>,
        factory: F,
        notifications: mpsc::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            events,
            factory,
            notifications,
            devices: HashMap::new(),
        }
    }

    /// Run until the hotplug side shuts down, then tear down every
    /// remaining widget.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HotplugEvent::Added { id, device } => self.device_added(id, &device).await,
                HotplugEvent::Removed { id, .. } => self.device_removed(id).await,
            }
        }

        info!("hotplug channel closed, shutting down registry");
        let remaining: Vec<UsbDeviceId> = self.devices.keys().copied().collect();
        for id in remaining {
            self.device_removed(id).await;
        }
    }

    async fn device_added(&mut self, id: UsbDeviceId, device: &D) {
        if self.devices.contains_key(&id) {
            warn!(%id, "device already registered");
            return;
        }

        let Some((widget, info)) = self.factory.create(id, device).await else {
            debug!(%id, "ignoring device");
            return;
        };

        info!(
            %id,
            uid = %info.uid,
            ports = info.port_count,
            "widget ready"
        );
        let info = Arc::new(info);
        self.devices.insert(
            id,
            DeviceState {
                widget,
                info: Arc::clone(&info),
            },
        );
        let _ = self
            .notifications
            .send(RegistryEvent::WidgetAdded(info))
            .await;
    }

    async fn device_removed(&mut self, id: UsbDeviceId) {
        let Some(state) = self.devices.remove(&id) else {
            debug!(%id, "removal for unregistered device");
            return;
        };

        info!(%id, uid = %state.info.uid, "widget removed");
        let _ = self
            .notifications
            .send(RegistryEvent::WidgetRemoved(Arc::clone(&state.info)))
            .await;

        /* Shutdown waits for in-flight transfers to resolve; keep that
         * off the hotplug path. */
        tokio::spawn(async move {
            state.widget.shutdown().await;
        });
    }
}

/// The production factory for Ja Rule hardware: match on vendor and
/// product id, claim the interface, start the pumps and fetch the UID.
pub struct JaRuleFactory;

#[async_trait]
impl WidgetFactory<nusb::DeviceInfo> for JaRuleFactory {
    async fn create(
        &mut self,
        id: UsbDeviceId,
        device: &nusb::DeviceInfo,
    ) -> Option<(WidgetHandle, WidgetInfo)> {
        if !crate::usb::is_ja_rule(device) {
            return None;
        }

        let interface = match crate::usb::open_widget_interface(device) {
            Ok(interface) => interface,
            Err(error) => {
                warn!(%id, error = %format!("{error:#}"), "failed to open widget");
                return None;
            }
        };
        let port_count = interface.port_count();

        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        crate::usb::spawn_pumps(interface, out_rx, in_tx);
        let widget = Widget::spawn(port_count, out_tx, in_rx);

        let Some(uid) = widget.get_uid().await else {
            warn!(%id, "widget did not report a UID");
            widget.shutdown().await;
            return None;
        };

        let info = WidgetInfo {
            device_id: id,
            uid,
            manufacturer: device.manufacturer_string().unwrap_or_default().to_string(),
            product: device.product_string().unwrap_or_default().to_string(),
            port_count,
        };
        Some((widget, info))
    }
}
