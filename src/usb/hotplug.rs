/* Hotplug agent: turns raw device observations into a deduplicated
 * stream of arrival/removal events for the registry.
 *
 * Two modes. Kernel-assisted mode consumes translated events from the
 * platform watch; the polling fallback snapshots the bus every few
 * seconds and diffs against the previous snapshot, keyed by
 * (bus, address). The agent core is generic over the device payload so
 * both modes, and the tests, share the bookkeeping. */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::usb::UsbDeviceId;

/* Bus scan cadence for the polling fallback. */
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A raw observation feeding the kernel-assisted mode.
#[derive(Debug)]
pub enum WatchEvent<D> {
    Connected { id: UsbDeviceId, device: D },
    Disconnected { id: UsbDeviceId },
}

/// What the agent reports to its observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent<D> {
    Added { id: UsbDeviceId, device: D },
    Removed { id: UsbDeviceId, device: D },
}

impl<D> HotplugEvent<D> {
    pub fn id(&self) -> UsbDeviceId {
        match self {
            Self::Added { id, .. } | Self::Removed { id, .. } => *id,
        }
    }
}

struct Shared<D> {
    devices: Mutex<HashMap<UsbDeviceId, D>>,
    suppress: AtomicBool,
}

/// The hotplug agent.
///
/// At most one `Added` is delivered per (bus, address) until the
/// matching `Removed`. After `halt_notifications` returns, no further
/// events are delivered; `stop` additionally synthesizes a `Removed`
/// for every device still known.
pub struct HotplugAgent<D> {
    tx: mpsc::Sender<HotplugEvent<D>>,
    shared: Arc<Shared<D>>,
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl<D: Clone + Send + 'static> HotplugAgent<D> {
    /// Polling fallback: scan the bus with `lister` every `interval`.
    pub fn poll_mode<F>(
        mut lister: F,
        tx: mpsc::Sender<HotplugEvent<D>>,
        interval: Duration,
    ) -> Self
    where
        F: FnMut() -> Vec<(UsbDeviceId, D)> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            devices: Mutex::new(HashMap::new()),
            suppress: AtomicBool::new(false),
        });
        let shutdown = watch::Sender::new(false);

        let worker_shared = Arc::clone(&shared);
        let worker_tx = tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let worker = tokio::spawn(async move {
            info!("hotplug scanner started");
            loop {
                let events = diff_snapshot(&worker_shared, lister());
                for event in events {
                    if worker_shared.suppress.load(Ordering::SeqCst) {
                        break;
                    }
                    if worker_tx.send(event).await.is_err() {
                        return;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            debug!("hotplug scanner finished");
        });

        Self {
            tx,
            shared,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Kernel-assisted mode: consume translated watch events.
    pub fn kernel_mode(
        mut events: mpsc::Receiver<WatchEvent<D>>,
        tx: mpsc::Sender<HotplugEvent<D>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            devices: Mutex::new(HashMap::new()),
            suppress: AtomicBool::new(false),
        });
        let shutdown = watch::Sender::new(false);

        let worker_shared = Arc::clone(&shared);
        let worker_tx = tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let worker = tokio::spawn(async move {
            info!("hotplug watch started");
            loop {
                let event = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                if worker_shared.suppress.load(Ordering::SeqCst) {
                    break;
                }

                let report = match event {
                    WatchEvent::Connected { id, device } => {
                        let mut devices =
                            worker_shared.devices.lock().expect("device map poisoned");
                        if devices.contains_key(&id) {
                            warn!(%id, "duplicate hotplug notification");
                            None
                        } else {
                            devices.insert(id, device.clone());
                            Some(HotplugEvent::Added { id, device })
                        }
                    }
                    WatchEvent::Disconnected { id } => {
                        let mut devices =
                            worker_shared.devices.lock().expect("device map poisoned");
                        match devices.remove(&id) {
                            Some(device) => Some(HotplugEvent::Removed { id, device }),
                            None => {
                                warn!(%id, "removal for unknown device");
                                None
                            }
                        }
                    }
                };

                if let Some(report) = report {
                    if worker_tx.send(report).await.is_err() {
                        break;
                    }
                }
            }
            debug!("hotplug watch finished");
        });

        Self {
            tx,
            shared,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Stop delivering events. Idempotent; once this returns no further
    /// callbacks run.
    pub async fn halt_notifications(&mut self) {
        self.shared.suppress.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.await {
                warn!(%error, "hotplug worker failed");
            }
        }
    }

    /// Halt, then synthesize a removal for every device still known.
    pub async fn stop(&mut self) {
        self.halt_notifications().await;
        let devices: Vec<(UsbDeviceId, D)> = {
            let mut map = self.shared.devices.lock().expect("device map poisoned");
            map.drain().collect()
        };
        for (id, device) in devices {
            debug!(%id, "synthesizing removal on stop");
            let _ = self.tx.send(HotplugEvent::Removed { id, device }).await;
        }
    }
}

/* One polling step: insert arrivals, drop departures, report both. */
fn diff_snapshot<D: Clone>(
    shared: &Shared<D>,
    current: Vec<(UsbDeviceId, D)>,
) -> Vec<HotplugEvent<D>> {
    if shared.suppress.load(Ordering::SeqCst) {
        return Vec::new();
    }

    let mut devices = shared.devices.lock().expect("device map poisoned");
    let mut events = Vec::new();

    let mut seen: HashMap<UsbDeviceId, ()> = HashMap::new();
    for (id, device) in current {
        seen.insert(id, ());
        if !devices.contains_key(&id) {
            devices.insert(id, device.clone());
            events.push(HotplugEvent::Added { id, device });
        }
    }

    let gone: Vec<UsbDeviceId> = devices
        .keys()
        .filter(|id| !seen.contains_key(id))
        .copied()
        .collect();
    for id in gone {
        if let Some(device) = devices.remove(&id) {
            events.push(HotplugEvent::Removed { id, device });
        }
    }

    events
}
