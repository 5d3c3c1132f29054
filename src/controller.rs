/* Queueing RDM controller.
 *
 * Serializes concurrent submissions through a transport that allows only
 * one in-flight RDM transaction. Each controller runs as an actor task
 * owning the underlying transport; submissions arrive over an mpsc
 * channel and complete through oneshot senders, so every request
 * completes exactly once by construction.
 *
 * The actor also owns ACK_OVERFLOW reassembly: overflow fragments are
 * re-requested with the same transaction number and concatenated before
 * the caller sees the reply. */

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::rdm::{RdmReply, RdmRequest, RdmResponse, ResponseType, StatusCode};
use crate::uid::UidSet;

/* Submission channel depth; the bounded request queue is enforced by the
 * actor itself, this only smooths bursts. */
const CHANNEL_DEPTH: usize = 32;

/// The RDM submission interface exposed to observers.
#[async_trait]
pub trait RdmControllerInterface: Send {
    async fn send_rdm_request(&mut self, request: RdmRequest) -> RdmReply;
}

/// An RDM controller that can also enumerate the bus.
#[async_trait]
pub trait DiscoverableRdmControllerInterface: RdmControllerInterface {
    async fn run_full_discovery(&mut self) -> UidSet;
    async fn run_incremental_discovery(&mut self) -> UidSet;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    Full,
    Incremental,
}

#[derive(Debug)]
enum ControllerMessage {
    Request {
        request: RdmRequest,
        reply: oneshot::Sender<RdmReply>,
    },
    Discovery {
        kind: DiscoveryKind,
        reply: oneshot::Sender<UidSet>,
    },
    Pause,
    Resume,
    Shutdown,
}

/// Handle used to submit work to a queueing controller.
///
/// All methods enqueue and return; completion is delivered through the
/// returned future exactly once. Dropping every handle shuts the
/// controller down, failing whatever is still queued.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMessage>,
}

impl ControllerHandle {
    /// Submit a request. Resolves with the reply, or `FailedToSend` if
    /// the controller is gone or discards the request.
    pub async fn send_rdm_request(&self, request: RdmRequest) -> RdmReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ControllerMessage::Request {
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return RdmReply::from_status(StatusCode::FailedToSend);
        }
        reply_rx
            .await
            .unwrap_or_else(|_| RdmReply::from_status(StatusCode::FailedToSend))
    }

    pub async fn run_full_discovery(&self) -> UidSet {
        self.run_discovery(DiscoveryKind::Full).await
    }

    pub async fn run_incremental_discovery(&self) -> UidSet {
        self.run_discovery(DiscoveryKind::Incremental).await
    }

    async fn run_discovery(&self, kind: DiscoveryKind) -> UidSet {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ControllerMessage::Discovery {
                kind,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return UidSet::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Stop dispatching; submissions keep queueing until `resume`.
    pub async fn pause(&self) {
        let _ = self.tx.send(ControllerMessage::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.tx.send(ControllerMessage::Resume).await;
    }

    /// Shut the controller down. Queued requests complete with
    /// `FailedToSend`; queued discovery triggers with an empty set.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ControllerMessage::Shutdown).await;
    }
}

#[async_trait]
impl RdmControllerInterface for ControllerHandle {
    async fn send_rdm_request(&mut self, request: RdmRequest) -> RdmReply {
        ControllerHandle::send_rdm_request(self, request).await
    }
}

#[async_trait]
impl DiscoverableRdmControllerInterface for ControllerHandle {
    async fn run_full_discovery(&mut self) -> UidSet {
        ControllerHandle::run_full_discovery(self).await
    }

    async fn run_incremental_discovery(&mut self) -> UidSet {
        ControllerHandle::run_incremental_discovery(self).await
    }
}

struct PendingRequest {
    request: RdmRequest,
    reply: oneshot::Sender<RdmReply>,
}

struct PendingDiscovery {
    kind: DiscoveryKind,
    reply: oneshot::Sender<UidSet>,
}

/// The queueing controller actor.
pub struct QueueingController<C> {
    underlying: C,
    rx: mpsc::Receiver<ControllerMessage>,
    queue: VecDeque<PendingRequest>,
    depth: usize,
    paused: bool,
    /* Discovery triggers waiting for the next run to start. */
    discovery_pending: Vec<PendingDiscovery>,
    shutting_down: bool,
}

impl<C: DiscoverableRdmControllerInterface + 'static> QueueingController<C> {
    /// Spawn a controller over `underlying` with a request queue bounded
    /// at `depth`. On overflow the incoming request is discarded with
    /// `FailedToSend`; queued requests keep their slots.
    pub fn spawn(underlying: C, depth: usize) -> ControllerHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let controller = QueueingController {
            underlying,
            rx,
            queue: VecDeque::new(),
            depth,
            paused: false,
            discovery_pending: Vec::new(),
            shutting_down: false,
        };
        tokio::spawn(controller.run());
        ControllerHandle { tx }
    }

    async fn run(mut self) {
        loop {
            if self.shutting_down {
                break;
            }

            if !self.paused {
                /* Discovery first: queued triggers jump ahead of queued
                 * requests so the bus state they report is fresh. */
                if !self.discovery_pending.is_empty() {
                    self.run_pending_discovery().await;
                    self.drain_messages();
                    continue;
                }

                if let Some(pending) = self.queue.pop_front() {
                    let reply = self.execute_request(pending.request).await;
                    let _ = pending.reply.send(reply);
                    self.drain_messages();
                    continue;
                }
            }

            /* Idle or paused: wait for the next submission. */
            match self.rx.recv().await {
                Some(message) => {
                    self.handle_message(message);
                    self.drain_messages();
                }
                None => break,
            }
        }

        self.fail_pending();
    }

    /* Pull in everything that arrived while an operation was in flight,
     * without blocking. */
    fn drain_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Request { request, reply } => {
                if self.queue.len() >= self.depth {
                    warn!(
                        depth = self.depth,
                        "request queue full, discarding incoming request"
                    );
                    let _ = reply.send(RdmReply::from_status(StatusCode::FailedToSend));
                } else {
                    self.queue.push_back(PendingRequest { request, reply });
                }
            }
            ControllerMessage::Discovery { kind, reply } => {
                self.discovery_pending.push(PendingDiscovery { kind, reply });
            }
            ControllerMessage::Pause => {
                debug!("controller paused");
                self.paused = true;
            }
            ControllerMessage::Resume => {
                debug!("controller resumed");
                self.paused = false;
            }
            ControllerMessage::Shutdown => {
                info!("controller shutting down");
                self.shutting_down = true;
            }
        }
    }

    /* Run one discovery for every trigger collected so far. Triggers
     * that arrive while this run is in flight form the next batch and
     * share that run's result instead. */
    async fn run_pending_discovery(&mut self) {
        let batch: Vec<PendingDiscovery> = self.discovery_pending.drain(..).collect();
        let kind = batch[0].kind;
        debug!(?kind, waiters = batch.len(), "starting discovery");
        let uids = match kind {
            DiscoveryKind::Full => self.underlying.run_full_discovery().await,
            DiscoveryKind::Incremental => self.underlying.run_incremental_discovery().await,
        };
        for waiter in batch {
            let _ = waiter.reply.send(uids.clone());
        }
    }

    /* Send one request, following ACK_OVERFLOW continuations until a
     * terminal fragment or a transport failure. */
    async fn execute_request(&mut self, request: RdmRequest) -> RdmReply {
        let mut combined: Option<RdmResponse> = None;
        let mut frames = Vec::new();

        loop {
            let mut reply = self.underlying.send_rdm_request(request.clone()).await;
            frames.append(&mut reply.frames);

            if reply.status != StatusCode::CompletedOk {
                /* First reply or mid-sequence failure: surface the
                 * transport's status, keeping any captured frames. */
                return RdmReply::with_response(reply.status, reply.response, frames);
            }

            let Some(response) = reply.response.take() else {
                /* OK with no response body. Mid-overflow this means the
                 * transport lost the plot. */
                if combined.is_some() {
                    return RdmReply::with_response(StatusCode::InvalidResponse, None, frames);
                }
                return RdmReply::with_response(StatusCode::CompletedOk, None, frames);
            };

            match combined.take() {
                None => {
                    if response.response_type == ResponseType::AckOverflow {
                        debug!("ACK_OVERFLOW, re-requesting");
                        combined = Some(response);
                        continue;
                    }
                    return RdmReply::with_response(
                        StatusCode::CompletedOk,
                        Some(response),
                        frames,
                    );
                }
                Some(mut aggregate) => {
                    if response.source != aggregate.source
                        || response.destination != aggregate.destination
                        || response.sub_device != aggregate.sub_device
                        || response.command_class != aggregate.command_class
                        || response.param_id != aggregate.param_id
                    {
                        warn!("ACK_OVERFLOW fragment does not match the sequence");
                        return RdmReply::with_response(StatusCode::InvalidResponse, None, frames);
                    }

                    aggregate.param_data.extend_from_slice(&response.param_data);
                    if response.response_type == ResponseType::AckOverflow {
                        debug!("ACK_OVERFLOW continues, re-requesting");
                        combined = Some(aggregate);
                        continue;
                    }
                    aggregate.response_type = response.response_type;
                    aggregate.message_count = response.message_count;
                    return RdmReply::with_response(
                        StatusCode::CompletedOk,
                        Some(aggregate),
                        frames,
                    );
                }
            }
        }
    }

    /* Shutdown path: everything still queued completes with a failure. */
    fn fail_pending(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending
                .reply
                .send(RdmReply::from_status(StatusCode::FailedToSend));
        }
        for pending in self.discovery_pending.drain(..) {
            let _ = pending.reply.send(UidSet::new());
        }
        self.drain_failures();
    }

    /* Messages still sitting in the channel get the same treatment. */
    fn drain_failures(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                ControllerMessage::Request { reply, .. } => {
                    let _ = reply.send(RdmReply::from_status(StatusCode::FailedToSend));
                }
                ControllerMessage::Discovery { reply, .. } => {
                    let _ = reply.send(UidSet::new());
                }
                _ => {}
            }
        }
    }
}
