/* Reply plumbing: the status-code taxonomy, raw frame captures with
 * optional sub-microsecond timing, and the RdmReply aggregate that every
 * completion path delivers. */

use std::fmt;

use crate::rdm::command::RdmResponse;

/// The outcome taxonomy for an RDM operation.
///
/// Failures travel through the same completion path as success; there is
/// no out-of-band error channel. The first five variants are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /* Non-failure classes. */
    DubResponse,
    WasBroadcast,
    CompletedOk,
    AckTimer,
    NackReason,

    /* Transport and framing failures. */
    Timeout,
    InvalidResponse,
    ChecksumIncorrect,
    PacketTooShort,
    PacketLengthMismatch,
    ParamLengthMismatch,

    /* Reply does not correspond to the request. */
    TransactionMismatch,
    SrcUidMismatch,
    DestUidMismatch,
    SubDeviceMismatch,
    CommandClassMismatch,

    /* Protocol violations. */
    WrongSubStartCode,
    InvalidResponseType,

    /* Local send failure: queue full, packing error, shutdown. */
    FailedToSend,
}

impl StatusCode {
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            Self::DubResponse
                | Self::WasBroadcast
                | Self::CompletedOk
                | Self::AckTimer
                | Self::NackReason
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timing of a captured frame, in nanoseconds. Zero means not measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTiming {
    /// Time from the end of the request to the start of the response.
    pub response_time: u32,
    pub break_time: u32,
    pub mark_time: u32,
    /// Time to receive the data portion of the frame.
    pub data_time: u32,
}

/// A raw wire capture of one response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdmFrame {
    pub data: Vec<u8>,
    pub timing: FrameTiming,
}

impl RdmFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timing: FrameTiming::default(),
        }
    }
}

/// What an RDM operation ultimately produced.
///
/// `response` is present only for the non-failure classes; `frames`
/// carries every raw capture that contributed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmReply {
    pub status: StatusCode,
    pub response: Option<RdmResponse>,
    pub frames: Vec<RdmFrame>,
}

impl RdmReply {
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            status,
            response: None,
            frames: Vec::new(),
        }
    }

    pub fn with_response(
        status: StatusCode,
        response: Option<RdmResponse>,
        frames: Vec<RdmFrame>,
    ) -> Self {
        Self {
            status,
            response,
            frames,
        }
    }
}
