/* Ja Rule widget.
 *
 * A widget is one USB device carrying one or more EIA-485 ports. The
 * widget actor owns every piece of per-device protocol state: the token
 * counter, the per-port command queues and the map of commands waiting
 * on a response. Frames travel to and from the USB pumps over plain
 * byte channels, so the actor is testable without hardware and the USB
 * layer stays free of protocol knowledge. */

pub mod frame;
pub mod port;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::uid::Uid;
use crate::usb::UsbDeviceId;
use frame::{CommandClass, CommandResult};

/* Small amount of pipelining across ports; never reordering within one. */
pub const MAX_IN_FLIGHT: usize = 2;

/* Per-port queue bound. */
pub const MAX_QUEUED_MESSAGES: usize = 10;

/* USB transfer timeout; the device answers well within this. */
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/* Submission channel depth. */
const CHANNEL_DEPTH: usize = 32;

/// Identity of an initialized widget.
#[derive(Debug, Clone)]
pub struct WidgetInfo {
    pub device_id: UsbDeviceId,
    pub uid: Uid,
    pub manufacturer: String,
    pub product: String,
    pub port_count: u8,
}

/// How a command finished, plus the device's response when there is one.
///
/// `return_code`, `status_flags` and `payload` are only meaningful when
/// `result` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub result: CommandResult,
    pub return_code: u8,
    pub status_flags: u8,
    pub payload: Vec<u8>,
}

impl CommandOutcome {
    fn failed(result: CommandResult) -> Self {
        Self {
            result,
            return_code: 0,
            status_flags: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == CommandResult::Ok
    }
}

#[derive(Debug)]
enum WidgetMessage {
    Send {
        port_id: u8,
        command: CommandClass,
        payload: Vec<u8>,
        reply: oneshot::Sender<CommandOutcome>,
    },
    CancelAll {
        port_id: u8,
    },
    ClaimPort {
        port_id: u8,
        reply: oneshot::Sender<bool>,
    },
    ReleasePort {
        port_id: u8,
    },
    Shutdown,
}

/// Handle to a widget actor. Cloneable; all methods enqueue and return.
#[derive(Clone)]
pub struct WidgetHandle {
    tx: mpsc::Sender<WidgetMessage>,
    port_count: u8,
}

impl WidgetHandle {
    /// Queue a command on a port and wait for its completion.
    pub async fn send_command(
        &self,
        port_id: u8,
        command: CommandClass,
        payload: Vec<u8>,
    ) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(WidgetMessage::Send {
                port_id,
                command,
                payload,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return CommandOutcome::failed(CommandResult::SendError);
        }
        reply_rx
            .await
            .unwrap_or_else(|_| CommandOutcome::failed(CommandResult::Cancelled))
    }

    /// Fail every queued command on the port with `Cancelled`; in-flight
    /// commands resolve with `Cancelled` once their transfer does.
    pub async fn cancel_all(&self, port_id: u8) {
        let _ = self.tx.send(WidgetMessage::CancelAll { port_id }).await;
    }

    /// Bind a port to a consumer. Idempotent; false for bad port ids.
    pub async fn claim_port(&self, port_id: u8) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(WidgetMessage::ClaimPort {
                port_id,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Release a port. Idempotent.
    pub async fn release_port(&self, port_id: u8) {
        let _ = self.tx.send(WidgetMessage::ReleasePort { port_id }).await;
    }

    /// Stop the actor. Everything queued or in flight completes with
    /// `Cancelled` and the USB pumps drain.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WidgetMessage::Shutdown).await;
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Reset the device. Fire-and-forget; the device drops off the bus
    /// and re-enumerates.
    pub async fn reset_device(&self) {
        let _ = self
            .send_command(0, CommandClass::ResetDevice, Vec::new())
            .await;
    }

    /// Round-trip a payload through the device, for health checks.
    pub async fn echo(&self, payload: Vec<u8>) -> CommandOutcome {
        self.send_command(0, CommandClass::EchoCommand, payload).await
    }

    /// Ask the device for its UID; part of widget initialization.
    pub async fn get_uid(&self) -> Option<Uid> {
        let outcome = self
            .send_command(0, CommandClass::GetUid, Vec::new())
            .await;
        if !outcome.is_ok() || outcome.return_code != frame::RC_OK {
            return None;
        }
        let bytes: &[u8; 6] = outcome.payload.get(..6)?.try_into().ok()?;
        Some(Uid::from_bytes(bytes))
    }
}

struct QueuedCommand {
    command: CommandClass,
    payload: Vec<u8>,
    reply: oneshot::Sender<CommandOutcome>,
}

struct PendingCommand {
    port_id: u8,
    command: CommandClass,
    reply: oneshot::Sender<CommandOutcome>,
    deadline: Instant,
    cancelled: bool,
}

struct PortState {
    claimed: bool,
    in_flight: bool,
    queue: VecDeque<QueuedCommand>,
}

/// The widget actor.
pub struct Widget {
    rx: mpsc::Receiver<WidgetMessage>,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    ports: Vec<PortState>,
    token: u8,
    pending: HashMap<u8, PendingCommand>,
    shutting_down: bool,
}

impl Widget {
    /// Spawn the actor for a widget with `port_count` ports, speaking
    /// frames over the given channels.
    pub fn spawn(
        port_count: u8,
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> WidgetHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let widget = Widget {
            rx,
            outbound,
            inbound,
            ports: (0..port_count)
                .map(|_| PortState {
                    claimed: false,
                    in_flight: false,
                    queue: VecDeque::new(),
                })
                .collect(),
            token: 0,
            pending: HashMap::new(),
            shutting_down: false,
        };
        tokio::spawn(widget.run());
        WidgetHandle { tx, port_count }
    }

    async fn run(mut self) {
        loop {
            if self.shutting_down {
                break;
            }
            self.dispatch_queued();

            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let far_future = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                data = self.inbound.recv() => match data {
                    Some(data) => self.handle_frame(&data),
                    None => {
                        warn!("transport closed, failing outstanding commands");
                        self.fail_all(CommandResult::SendError);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or(far_future)),
                        if next_deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
        self.fail_all(CommandResult::Cancelled);
    }

    fn handle_message(&mut self, message: WidgetMessage) {
        match message {
            WidgetMessage::Send {
                port_id,
                command,
                payload,
                reply,
            } => {
                let Some(port) = self.ports.get_mut(usize::from(port_id)) else {
                    let _ = reply.send(CommandOutcome::failed(CommandResult::InvalidPort));
                    return;
                };
                if payload.len() > frame::MAX_PAYLOAD_SIZE {
                    let _ = reply.send(CommandOutcome::failed(CommandResult::Malformed));
                    return;
                }
                if port.queue.len() >= MAX_QUEUED_MESSAGES {
                    warn!(port_id, "command queue full");
                    let _ = reply.send(CommandOutcome::failed(CommandResult::QueueFull));
                    return;
                }
                port.queue.push_back(QueuedCommand {
                    command,
                    payload,
                    reply,
                });
            }
            WidgetMessage::CancelAll { port_id } => {
                debug!(port_id, "cancelling all commands");
                if let Some(port) = self.ports.get_mut(usize::from(port_id)) {
                    for queued in port.queue.drain(..) {
                        let _ = queued
                            .reply
                            .send(CommandOutcome::failed(CommandResult::Cancelled));
                    }
                }
                for pending in self.pending.values_mut() {
                    if pending.port_id == port_id {
                        pending.cancelled = true;
                    }
                }
            }
            WidgetMessage::ClaimPort { port_id, reply } => {
                let claimed = match self.ports.get_mut(usize::from(port_id)) {
                    Some(port) => {
                        port.claimed = true;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(claimed);
            }
            WidgetMessage::ReleasePort { port_id } => {
                if let Some(port) = self.ports.get_mut(usize::from(port_id)) {
                    port.claimed = false;
                }
            }
            WidgetMessage::Shutdown => {
                info!("widget shutting down");
                self.shutting_down = true;
            }
        }
    }

    /* Start transfers while we have both a free in-flight slot and a
     * port with queued work. One command per port keeps each port FIFO;
     * MAX_IN_FLIGHT across ports gives a little pipelining. */
    fn dispatch_queued(&mut self) {
        while self.pending.len() < MAX_IN_FLIGHT {
            let Some(port_id) = self
                .ports
                .iter()
                .position(|p| !p.in_flight && !p.queue.is_empty())
            else {
                break;
            };
            let queued = self.ports[port_id].queue.pop_front().expect("non-empty");
            let token = self.token;
            self.token = self.token.wrapping_add(1);

            let encoded =
                match frame::encode_command(token, port_id as u8, queued.command, &queued.payload)
                {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!(%error, "failed to frame command");
                        let _ = queued
                            .reply
                            .send(CommandOutcome::failed(CommandResult::Malformed));
                        continue;
                    }
                };

            if self.outbound.try_send(encoded).is_err() {
                warn!("transport write queue full, dropping command");
                let _ = queued
                    .reply
                    .send(CommandOutcome::failed(CommandResult::SendError));
                continue;
            }

            debug!(token, port_id, command = ?queued.command, "command sent");
            self.ports[port_id].in_flight = true;
            self.pending.insert(
                token,
                PendingCommand {
                    port_id: port_id as u8,
                    command: queued.command,
                    reply: queued.reply,
                    deadline: Instant::now() + COMMAND_TIMEOUT,
                    cancelled: false,
                },
            );
        }
    }

    fn handle_frame(&mut self, data: &[u8]) {
        let response = match frame::decode_response(data) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "dropping undecodable response");
                return;
            }
        };

        let Some(pending) = self.pending.remove(&response.token) else {
            warn!(token = response.token, "dropping response with unknown token");
            return;
        };
        if let Some(port) = self.ports.get_mut(usize::from(pending.port_id)) {
            port.in_flight = false;
        }

        if pending.cancelled {
            let _ = pending
                .reply
                .send(CommandOutcome::failed(CommandResult::Cancelled));
            return;
        }

        if response.command != pending.command as u16 {
            warn!(
                got = response.command,
                expected = pending.command as u16,
                "response command class mismatch"
            );
            let _ = pending
                .reply
                .send(CommandOutcome::failed(CommandResult::ClassMismatch));
            return;
        }

        let _ = pending.reply.send(CommandOutcome {
            result: CommandResult::Ok,
            return_code: response.return_code,
            status_flags: response.status_flags,
            payload: response.payload,
        });
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            let pending = self.pending.remove(&token).expect("token collected above");
            if let Some(port) = self.ports.get_mut(usize::from(pending.port_id)) {
                port.in_flight = false;
            }
            let result = if pending.cancelled {
                CommandResult::Cancelled
            } else {
                warn!(token, port_id = pending.port_id, "command timed out");
                CommandResult::Timeout
            };
            let _ = pending.reply.send(CommandOutcome::failed(result));
        }
    }

    fn fail_all(&mut self, result: CommandResult) {
        for port in &mut self.ports {
            for queued in port.queue.drain(..) {
                let _ = queued.reply.send(CommandOutcome::failed(result));
            }
            port.in_flight = false;
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(CommandOutcome::failed(result));
        }
    }
}
