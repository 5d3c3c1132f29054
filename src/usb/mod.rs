/* USB plumbing for Ja Rule widgets.
 *
 * Opens and claims the widget interface, then bridges the bulk
 * endpoints to the widget actor's frame channels with a pump task per
 * direction. All protocol knowledge lives above; this layer only moves
 * framed bytes and enforces the transfer timeout. */

pub mod hotplug;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_lite::StreamExt;
use nusb::transfer::{Direction, EndpointType, RequestBuffer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hotplug::WatchEvent;

pub const JA_RULE_VENDOR_ID: u16 = 0x1209;
pub const JA_RULE_PRODUCT_ID: u16 = 0xaced;

pub const INTERFACE_NUMBER: u8 = 2;
pub const IN_ENDPOINT: u8 = 0x81;
pub const OUT_ENDPOINT: u8 = 0x01;

/* Must be a multiple of the 64 byte packet size; the largest response
 * is 513 bytes of payload plus framing. */
const IN_BUFFER_SIZE: usize = 1024;

/* Bulk transfer timeout. */
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/* Reads kept posted so responses are never dropped between submits. */
const IN_FLIGHT_READS: usize = 2;

/// A device's position on the bus: `(bus number, device address)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbDeviceId {
    pub bus: u8,
    pub address: u8,
}

impl UsbDeviceId {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

pub fn device_id(info: &nusb::DeviceInfo) -> UsbDeviceId {
    UsbDeviceId::new(info.bus_number(), info.device_address())
}

pub fn is_ja_rule(info: &nusb::DeviceInfo) -> bool {
    info.vendor_id() == JA_RULE_VENDOR_ID && info.product_id() == JA_RULE_PRODUCT_ID
}

/// A claimed widget interface, ready for the pumps.
pub struct WidgetInterface {
    interface: nusb::Interface,
    port_count: u8,
}

impl WidgetInterface {
    pub fn port_count(&self) -> u8 {
        self.port_count
    }
}

/// Open the device and claim the widget interface. The port count is
/// the number of bulk IN endpoints the interface exposes.
pub fn open_widget_interface(info: &nusb::DeviceInfo) -> Result<WidgetInterface> {
    let device = info
        .open()
        .with_context(|| format!("opening USB device {}", device_id(info)))?;

    #[cfg(target_os = "linux")]
    {
        /* A kernel driver may have grabbed the interface already. */
        let _ = device.detach_kernel_driver(INTERFACE_NUMBER);
    }

    let interface = device
        .claim_interface(INTERFACE_NUMBER)
        .with_context(|| format!("claiming interface {INTERFACE_NUMBER}"))?;

    let mut port_count = 0u8;
    let configuration = device
        .active_configuration()
        .context("reading the active configuration")?;
    for group in configuration.interfaces() {
        if group.interface_number() != INTERFACE_NUMBER {
            continue;
        }
        for alt_setting in group.alt_settings() {
            let bulk_in = alt_setting
                .endpoints()
                .filter(|endpoint| {
                    endpoint.direction() == Direction::In
                        && endpoint.transfer_type() == EndpointType::Bulk
                })
                .count();
            port_count = port_count.max(bulk_in as u8);
        }
    }
    if port_count == 0 {
        anyhow::bail!("widget interface exposes no bulk IN endpoints");
    }

    debug!(id = %device_id(info), port_count, "claimed widget interface");
    Ok(WidgetInterface {
        interface,
        port_count,
    })
}

/// Start the bulk pumps bridging the interface to a widget actor's
/// frame channels. The pumps exit when the actor drops its side.
pub fn spawn_pumps(
    widget: WidgetInterface,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
) {
    let out_interface = widget.interface.clone();
    tokio::spawn(async move {
        let mut queue = out_interface.bulk_out_queue(OUT_ENDPOINT);
        while let Some(frame) = outbound.recv().await {
            queue.submit(frame);
            match tokio::time::timeout(TRANSFER_TIMEOUT, queue.next_complete()).await {
                Ok(completion) => {
                    if let Err(error) = completion.status {
                        warn!(%error, "bulk OUT transfer failed");
                        break;
                    }
                }
                Err(_) => {
                    warn!("bulk OUT transfer timed out");
                    queue.cancel_all();
                    /* Collect the cancelled transfer before reuse. */
                    let _ = queue.next_complete().await;
                }
            }
        }
        debug!("bulk OUT pump finished");
    });

    let in_interface = widget.interface;
    tokio::spawn(async move {
        let mut queue = in_interface.bulk_in_queue(IN_ENDPOINT);
        for _ in 0..IN_FLIGHT_READS {
            queue.submit(RequestBuffer::new(IN_BUFFER_SIZE));
        }
        loop {
            let completion = tokio::select! {
                completion = queue.next_complete() => completion,
                _ = inbound.closed() => break,
            };
            match completion.status {
                Ok(()) => {
                    if inbound.send(completion.data).await.is_err() {
                        break;
                    }
                    queue.submit(RequestBuffer::new(IN_BUFFER_SIZE));
                }
                Err(error) => {
                    warn!(%error, "bulk IN transfer failed");
                    break;
                }
            }
        }
        debug!("bulk IN pump finished");
    });
}

/// Start the kernel-assisted hotplug watch, translating nusb's events
/// into `(bus, address)`-keyed watch events for the hotplug agent.
pub fn spawn_hotplug_watch() -> Result<mpsc::Receiver<WatchEvent<nusb::DeviceInfo>>> {
    let mut watch = nusb::watch_devices().context("starting the USB hotplug watch")?;
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        /* nusb reports removals by its own opaque id. */
        let mut ids: HashMap<nusb::DeviceId, UsbDeviceId> = HashMap::new();
        while let Some(event) = watch.next().await {
            let translated = match event {
                nusb::hotplug::HotplugEvent::Connected(info) => {
                    let id = device_id(&info);
                    ids.insert(info.id(), id);
                    WatchEvent::Connected { id, device: info }
                }
                nusb::hotplug::HotplugEvent::Disconnected(nusb_id) => {
                    let Some(id) = ids.remove(&nusb_id) else {
                        continue;
                    };
                    WatchEvent::Disconnected { id }
                }
            };
            if tx.send(translated).await.is_err() {
                break;
            }
        }
        debug!("hotplug watch finished");
    });

    Ok(rx)
}

/// Snapshot the bus for the polling fallback.
pub fn list_bus() -> Vec<(UsbDeviceId, nusb::DeviceInfo)> {
    match nusb::list_devices() {
        Ok(devices) => devices.map(|info| (device_id(&info), info)).collect(),
        Err(error) => {
            warn!(%error, "USB enumeration failed");
            Vec::new()
        }
    }
}
