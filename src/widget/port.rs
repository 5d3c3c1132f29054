/* Per-port protocol layer.
 *
 * A PortHandle is the RDM-speaking view of one EIA-485 port on a
 * widget: it frames RDM requests into the right widget command class,
 * unpacks timing records and embedded RDM responses from replies, and
 * implements the discovery target operations (unmute, mute, branch).
 * PortController pairs a port with its discovery agent and is what the
 * queueing controller sits on top of. */

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::controller::{DiscoverableRdmControllerInterface, RdmControllerInterface};
use crate::discovery::{AbortHandle, DiscoveryAgent, DiscoveryTarget};
use crate::rdm::{self, RdmFrame, RdmReply, RdmRequest, RdmResponse, ResponseType, StatusCode};
use crate::uid::{Uid, UidSet};
use crate::widget::frame::{self, CommandClass, CommandResult};
use crate::widget::WidgetHandle;

/* Timing records precede the RDM data in reply payloads; fields are in
 * tenths of a microsecond. */
const GET_SET_TIMING_SIZE: usize = 6;
const DUB_TIMING_SIZE: usize = 4;

/* Tenth-of-a-microsecond to nanoseconds. */
const TIMING_SCALE: u32 = 100;

struct GetSetTiming {
    break_start: u16,
    mark_start: u16,
    mark_end: u16,
}

impl GetSetTiming {
    fn parse(payload: &[u8]) -> Option<(GetSetTiming, &[u8])> {
        if payload.len() < GET_SET_TIMING_SIZE {
            return None;
        }
        let timing = GetSetTiming {
            break_start: u16::from_le_bytes([payload[0], payload[1]]),
            mark_start: u16::from_le_bytes([payload[2], payload[3]]),
            mark_end: u16::from_le_bytes([payload[4], payload[5]]),
        };
        Some((timing, &payload[GET_SET_TIMING_SIZE..]))
    }
}

struct DubTiming {
    start: u16,
    end: u16,
}

impl DubTiming {
    fn parse(payload: &[u8]) -> Option<(DubTiming, &[u8])> {
        if payload.len() < DUB_TIMING_SIZE {
            return None;
        }
        let timing = DubTiming {
            start: u16::from_le_bytes([payload[0], payload[1]]),
            end: u16::from_le_bytes([payload[2], payload[3]]),
        };
        Some((timing, &payload[DUB_TIMING_SIZE..]))
    }
}

/* Latest-wins coalescing for streamed DMX. */
#[derive(Default)]
struct DmxState {
    in_progress: bool,
    queued: Option<Vec<u8>>,
}

/// The RDM view of one port on a widget.
#[derive(Clone)]
pub struct PortHandle {
    widget: WidgetHandle,
    port_id: u8,
    uid: Uid,
    transaction_number: u8,
    dmx: Arc<Mutex<DmxState>>,
}

impl PortHandle {
    pub fn new(widget: WidgetHandle, port_id: u8, controller_uid: Uid) -> Self {
        Self {
            widget,
            port_id,
            uid: controller_uid,
            transaction_number: 0,
            dmx: Arc::new(Mutex::new(DmxState::default())),
        }
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    fn next_transaction(&mut self) -> u8 {
        let transaction = self.transaction_number;
        self.transaction_number = self.transaction_number.wrapping_add(1);
        transaction
    }

    /// Stream a DMX frame. DMX is lossy by design: while one transfer is
    /// in flight newer frames replace the queued one, so the device
    /// always transmits the freshest buffer.
    pub fn send_dmx(&self, buffer: Vec<u8>) {
        {
            let mut state = self.dmx.lock().expect("dmx state poisoned");
            if state.in_progress {
                state.queued = Some(buffer);
                return;
            }
            state.in_progress = true;
        }

        let widget = self.widget.clone();
        let dmx = Arc::clone(&self.dmx);
        let port_id = self.port_id;
        tokio::spawn(async move {
            let mut current = buffer;
            loop {
                /* Outcome ignored: the next frame supersedes it anyway. */
                let outcome = widget
                    .send_command(port_id, CommandClass::TxDmx, current)
                    .await;
                check_status_flags(outcome.status_flags);

                let next = {
                    let mut state = dmx.lock().expect("dmx state poisoned");
                    match state.queued.take() {
                        Some(buffer) => Some(buffer),
                        None => {
                            state.in_progress = false;
                            None
                        }
                    }
                };
                match next {
                    Some(buffer) => current = buffer,
                    None => break,
                }
            }
        });
    }

    /// Send an RDM request and map the widget's reply onto an RdmReply.
    pub async fn send_rdm(&self, request: RdmRequest) -> RdmReply {
        let Ok(packet) = request.pack() else {
            return RdmReply::from_status(StatusCode::FailedToSend);
        };
        let command = command_for_request(&request);
        let outcome = self
            .widget
            .send_command(self.port_id, command, packet)
            .await;
        check_status_flags(outcome.status_flags);

        if outcome.result != CommandResult::Ok {
            return RdmReply::from_status(StatusCode::FailedToSend);
        }

        match (command, outcome.return_code) {
            (CommandClass::RdmDub, frame::RC_OK) => {
                let mut frames = Vec::new();
                if let Some((timing, data)) = DubTiming::parse(&outcome.payload) {
                    if !data.is_empty() {
                        let mut capture = RdmFrame::new(data.to_vec());
                        capture.timing.response_time = TIMING_SCALE * u32::from(timing.start);
                        capture.timing.data_time =
                            TIMING_SCALE * u32::from(timing.end.saturating_sub(timing.start));
                        frames.push(capture);
                    }
                }
                RdmReply::with_response(StatusCode::DubResponse, None, frames)
            }
            (CommandClass::RdmBroadcastRequest, frame::RC_OK) => {
                RdmReply::from_status(StatusCode::WasBroadcast)
            }
            (CommandClass::RdmBroadcastRequest, frame::RC_RDM_BCAST_RESPONSE) => {
                match GetSetTiming::parse(&outcome.payload) {
                    Some((_, data)) if !data.is_empty() => {
                        let (status, response) = unpack_rdm_response(&request, data);
                        RdmReply::with_response(status, response, Vec::new())
                    }
                    _ => RdmReply::from_status(StatusCode::InvalidResponse),
                }
            }
            (CommandClass::RdmRequest, frame::RC_OK) => {
                match GetSetTiming::parse(&outcome.payload) {
                    Some((timing, data)) if !data.is_empty() => {
                        let (status, response) = unpack_rdm_response(&request, data);
                        let mut capture = RdmFrame::new(data.to_vec());
                        capture.timing.response_time =
                            TIMING_SCALE * u32::from(timing.break_start);
                        capture.timing.break_time = TIMING_SCALE
                            * u32::from(timing.mark_start.saturating_sub(timing.break_start));
                        capture.timing.mark_time = TIMING_SCALE
                            * u32::from(timing.mark_end.saturating_sub(timing.mark_start));
                        RdmReply::with_response(status, response, vec![capture])
                    }
                    _ => RdmReply::from_status(StatusCode::InvalidResponse),
                }
            }
            (_, frame::RC_RDM_TIMEOUT) => RdmReply::from_status(StatusCode::Timeout),
            (_, frame::RC_TX_ERROR) | (_, frame::RC_BUFFER_FULL) => {
                RdmReply::from_status(StatusCode::FailedToSend)
            }
            (_, return_code) => {
                warn!(return_code, "unexpected widget return code");
                RdmReply::from_status(StatusCode::FailedToSend)
            }
        }
    }
}

fn command_for_request(request: &RdmRequest) -> CommandClass {
    if request.is_dub() {
        CommandClass::RdmDub
    } else if request.destination.is_broadcast() {
        CommandClass::RdmBroadcastRequest
    } else {
        CommandClass::RdmRequest
    }
}

/* Strip the start code and inflate the embedded RDM response, mapping
 * the response type onto the status taxonomy. */
fn unpack_rdm_response(
    request: &RdmRequest,
    data: &[u8],
) -> (StatusCode, Option<RdmResponse>) {
    if data.is_empty() || data[0] != rdm::START_CODE {
        return (StatusCode::InvalidResponse, None);
    }
    match RdmResponse::inflate(&data[1..], request) {
        Ok(response) => {
            let status = match response.response_type {
                ResponseType::Ack | ResponseType::AckOverflow => StatusCode::CompletedOk,
                ResponseType::AckTimer => StatusCode::AckTimer,
                ResponseType::NackReason => StatusCode::NackReason,
            };
            (status, Some(response))
        }
        Err(status) => (status, None),
    }
}

fn check_status_flags(status_flags: u8) {
    if status_flags & frame::LOGS_PENDING_FLAG != 0 {
        info!("widget logs pending");
    }
    if status_flags & frame::FLAGS_CHANGED_FLAG != 0 {
        info!("widget flags changed");
    }
    if status_flags & frame::MSG_TRUNCATED_FLAG != 0 {
        warn!("widget response was truncated");
    }
}

#[async_trait]
impl DiscoveryTarget for PortHandle {
    async fn unmute_all(&mut self) {
        let request =
            RdmRequest::new_unmute(self.uid, Uid::all_devices(), self.next_transaction());
        let Ok(packet) = request.pack() else {
            return;
        };
        let outcome = self
            .widget
            .send_command(self.port_id, CommandClass::RdmBroadcastRequest, packet)
            .await;
        check_status_flags(outcome.status_flags);
    }

    async fn mute_device(&mut self, target: Uid) -> bool {
        let request = RdmRequest::new_mute(self.uid, target, self.next_transaction());
        let Ok(packet) = request.pack() else {
            return false;
        };
        let outcome = self
            .widget
            .send_command(self.port_id, CommandClass::RdmRequest, packet)
            .await;
        check_status_flags(outcome.status_flags);

        if !outcome.is_ok() || outcome.return_code != frame::RC_OK {
            return false;
        }
        let Some((_, data)) = GetSetTiming::parse(&outcome.payload) else {
            return false;
        };
        if data.is_empty() {
            return false;
        }
        let (status, response) = unpack_rdm_response(&request, data);
        matches!(
            (status, response),
            (
                StatusCode::CompletedOk,
                Some(RdmResponse {
                    command_class: rdm::CommandClass::DiscoverResponse,
                    response_type: ResponseType::Ack,
                    ..
                })
            )
        )
    }

    async fn branch(&mut self, lower: Uid, upper: Uid) -> Vec<u8> {
        let request = RdmRequest::new_discovery_unique_branch(
            self.uid,
            lower,
            upper,
            self.next_transaction(),
        );
        let Ok(packet) = request.pack() else {
            return Vec::new();
        };
        debug!(%lower, %upper, "sending RDM DUB");
        let outcome = self
            .widget
            .send_command(self.port_id, CommandClass::RdmDub, packet)
            .await;
        check_status_flags(outcome.status_flags);

        if !outcome.is_ok() || outcome.return_code != frame::RC_OK {
            return Vec::new();
        }
        match DubTiming::parse(&outcome.payload) {
            Some((_, data)) => data.to_vec(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl RdmControllerInterface for PortHandle {
    async fn send_rdm_request(&mut self, request: RdmRequest) -> RdmReply {
        self.send_rdm(request).await
    }
}

/// One port plus its discovery agent: everything the queueing
/// controller needs from a transport.
pub struct PortController {
    agent: DiscoveryAgent<PortHandle>,
    port: PortHandle,
}

impl PortController {
    pub fn new(widget: WidgetHandle, port_id: u8, controller_uid: Uid) -> Self {
        let port = PortHandle::new(widget, port_id, controller_uid);
        Self {
            agent: DiscoveryAgent::new(port.clone()),
            port,
        }
    }

    pub fn port(&self) -> &PortHandle {
        &self.port
    }

    /// Abort handle for the in-flight discovery, if any.
    pub fn discovery_abort_handle(&self) -> AbortHandle {
        self.agent.abort_handle()
    }
}

#[async_trait]
impl RdmControllerInterface for PortController {
    async fn send_rdm_request(&mut self, request: RdmRequest) -> RdmReply {
        self.port.send_rdm(request).await
    }
}

#[async_trait]
impl DiscoverableRdmControllerInterface for PortController {
    async fn run_full_discovery(&mut self) -> UidSet {
        let (success, uids) = self.agent.run_full().await;
        if !success {
            warn!("full discovery completed with errors");
        }
        uids
    }

    async fn run_incremental_discovery(&mut self) -> UidSet {
        let (success, uids) = self.agent.run_incremental().await;
        if !success {
            warn!("incremental discovery completed with errors");
        }
        uids
    }
}
