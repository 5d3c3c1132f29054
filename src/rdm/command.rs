/* RDM request/response value types and the wire codec.
 *
 * Packets are laid out per ANSI E1.20: start code 0xcc, sub-start 0x01,
 * message length, destination UID, source UID, transaction number,
 * port id / response type, message count, sub-device, command class,
 * PID, PDL, parameter data, and a 16-bit additive checksum. */

use crate::rdm::reply::StatusCode;
use crate::uid::{Uid, UID_SIZE};

pub const START_CODE: u8 = 0xcc;
pub const SUB_START_CODE: u8 = 0x01;

/* Parameter data is capped by the 8-bit message length field. */
pub const MAX_PARAM_DATA: usize = 231;

/* Sub-device 0xffff addresses every sub-device of a responder. */
pub const ALL_SUB_DEVICES: u16 = 0xffff;

/* Discovery PIDs. */
pub const PID_DISC_UNIQUE_BRANCH: u16 = 0x0001;
pub const PID_DISC_MUTE: u16 = 0x0002;
pub const PID_DISC_UN_MUTE: u16 = 0x0003;

/* Number of header bytes from the start code up to and including the PDL. */
const HEADER_SIZE: usize = 24;
const CHECKSUM_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandClass {
    Discover = 0x10,
    DiscoverResponse = 0x11,
    Get = 0x20,
    GetResponse = 0x21,
    Set = 0x30,
    SetResponse = 0x31,
}

impl CommandClass {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::Discover),
            0x11 => Some(Self::DiscoverResponse),
            0x20 => Some(Self::Get),
            0x21 => Some(Self::GetResponse),
            0x30 => Some(Self::Set),
            0x31 => Some(Self::SetResponse),
            _ => None,
        }
    }

    /* The response class a responder pairs with this request class. */
    pub fn response_class(&self) -> CommandClass {
        match self {
            Self::Discover => Self::DiscoverResponse,
            Self::Get => Self::GetResponse,
            Self::Set => Self::SetResponse,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Ack = 0x00,
    AckTimer = 0x01,
    NackReason = 0x02,
    AckOverflow = 0x03,
}

impl ResponseType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Ack),
            0x01 => Some(Self::AckTimer),
            0x02 => Some(Self::NackReason),
            0x03 => Some(Self::AckOverflow),
            _ => None,
        }
    }
}

/// An RDM request.
///
/// The transaction number is owned by the port that sends the request and
/// is monotonic per source UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmRequest {
    pub source: Uid,
    pub destination: Uid,
    pub transaction_number: u8,
    pub port_id: u8,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: CommandClass,
    pub param_id: u16,
    pub param_data: Vec<u8>,
}

impl RdmRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Uid,
        destination: Uid,
        transaction_number: u8,
        port_id: u8,
        sub_device: u16,
        command_class: CommandClass,
        param_id: u16,
        param_data: Vec<u8>,
    ) -> Self {
        Self {
            source,
            destination,
            transaction_number,
            port_id,
            message_count: 0,
            sub_device,
            command_class,
            param_id,
            param_data,
        }
    }

    /// A DISC_MUTE request for a single responder.
    pub fn new_mute(source: Uid, destination: Uid, transaction_number: u8) -> Self {
        Self::new(
            source,
            destination,
            transaction_number,
            1,
            0,
            CommandClass::Discover,
            PID_DISC_MUTE,
            Vec::new(),
        )
    }

    /// A DISC_UN_MUTE request; usually broadcast to all devices.
    pub fn new_unmute(source: Uid, destination: Uid, transaction_number: u8) -> Self {
        Self::new(
            source,
            destination,
            transaction_number,
            1,
            0,
            CommandClass::Discover,
            PID_DISC_UN_MUTE,
            Vec::new(),
        )
    }

    /// A DISC_UNIQUE_BRANCH request covering the inclusive range
    /// `(lower, upper)`.
    pub fn new_discovery_unique_branch(
        source: Uid,
        lower: Uid,
        upper: Uid,
        transaction_number: u8,
    ) -> Self {
        let mut param_data = Vec::with_capacity(2 * UID_SIZE);
        param_data.extend_from_slice(&lower.pack());
        param_data.extend_from_slice(&upper.pack());
        Self::new(
            source,
            Uid::all_devices(),
            transaction_number,
            1,
            0,
            CommandClass::Discover,
            PID_DISC_UNIQUE_BRANCH,
            param_data,
        )
    }

    /// True for DUB requests, which never get a framed response.
    pub fn is_dub(&self) -> bool {
        self.command_class == CommandClass::Discover && self.param_id == PID_DISC_UNIQUE_BRANCH
    }

    /// Serialize to the full wire form, start code included.
    ///
    /// Fails with `FailedToSend` when the parameter data exceeds the
    /// protocol limit.
    pub fn pack(&self) -> Result<Vec<u8>, StatusCode> {
        if self.param_data.len() > MAX_PARAM_DATA {
            return Err(StatusCode::FailedToSend);
        }
        Ok(pack_packet(
            &self.destination,
            &self.source,
            self.transaction_number,
            self.port_id,
            self.message_count,
            self.sub_device,
            self.command_class as u8,
            self.param_id,
            &self.param_data,
        ))
    }
}

/// An RDM response, mirroring the request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmResponse {
    pub source: Uid,
    pub destination: Uid,
    pub transaction_number: u8,
    pub response_type: ResponseType,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: CommandClass,
    pub param_id: u16,
    pub param_data: Vec<u8>,
}

impl RdmResponse {
    /// Serialize to the full wire form, start code included.
    ///
    /// Used by responder mocks in tests and by the echo paths; responses
    /// obey the same size cap as requests.
    pub fn pack(&self) -> Result<Vec<u8>, StatusCode> {
        if self.param_data.len() > MAX_PARAM_DATA {
            return Err(StatusCode::FailedToSend);
        }
        Ok(pack_packet(
            &self.destination,
            &self.source,
            self.transaction_number,
            self.response_type as u8,
            self.message_count,
            self.sub_device,
            self.command_class as u8,
            self.param_id,
            &self.param_data,
        ))
    }

    /// Deserialize and validate a response against the request it answers.
    ///
    /// `data` is the packet with the 0xcc start code stripped; the caller
    /// has already verified the start code. Validation failures surface as
    /// the matching `StatusCode`.
    pub fn inflate(data: &[u8], request: &RdmRequest) -> Result<RdmResponse, StatusCode> {
        /* Header (less the start code) plus checksum. */
        if data.len() < HEADER_SIZE - 1 + CHECKSUM_SIZE {
            return Err(StatusCode::PacketTooShort);
        }

        if data[0] != SUB_START_CODE {
            return Err(StatusCode::WrongSubStartCode);
        }

        /* The message length counts the start code through the parameter
         * data; the checksum is excluded. */
        let message_length = data[1] as usize;
        if message_length + CHECKSUM_SIZE != data.len() + 1 {
            return Err(StatusCode::PacketLengthMismatch);
        }

        let checksum_offset = data.len() - CHECKSUM_SIZE;
        let mut computed: u16 = u16::from(START_CODE);
        for byte in &data[..checksum_offset] {
            computed = computed.wrapping_add(u16::from(*byte));
        }
        let received =
            u16::from_be_bytes([data[checksum_offset], data[checksum_offset + 1]]);
        if computed != received {
            return Err(StatusCode::ChecksumIncorrect);
        }

        let pdl = data[22] as usize;
        if pdl != checksum_offset - 23 {
            return Err(StatusCode::ParamLengthMismatch);
        }

        let response_type =
            ResponseType::from_u8(data[15]).ok_or(StatusCode::InvalidResponseType)?;
        let command_class =
            CommandClass::from_u8(data[19]).ok_or(StatusCode::CommandClassMismatch)?;

        let response = RdmResponse {
            destination: Uid::from_bytes(data[2..8].try_into().expect("6 byte slice")),
            source: Uid::from_bytes(data[8..14].try_into().expect("6 byte slice")),
            transaction_number: data[14],
            response_type,
            message_count: data[16],
            sub_device: u16::from_be_bytes([data[17], data[18]]),
            command_class,
            param_id: u16::from_be_bytes([data[20], data[21]]),
            param_data: data[23..23 + pdl].to_vec(),
        };

        /* Correspondence with the request: transaction number first, so
         * a stale frame reports as stale even when other fields are
         * wrong too, then the UIDs, the sub-device and finally the
         * command class pairing. */
        if response.transaction_number != request.transaction_number {
            return Err(StatusCode::TransactionMismatch);
        }
        if !request.destination.is_broadcast() && response.source != request.destination {
            return Err(StatusCode::SrcUidMismatch);
        }
        if response.destination != request.source {
            return Err(StatusCode::DestUidMismatch);
        }
        if request.sub_device != ALL_SUB_DEVICES && response.sub_device != request.sub_device {
            return Err(StatusCode::SubDeviceMismatch);
        }
        if response.command_class != request.command_class.response_class() {
            return Err(StatusCode::CommandClassMismatch);
        }

        Ok(response)
    }
}

#[allow(clippy::too_many_arguments)]
fn pack_packet(
    destination: &Uid,
    source: &Uid,
    transaction_number: u8,
    port_or_response_type: u8,
    message_count: u8,
    sub_device: u16,
    command_class: u8,
    param_id: u16,
    param_data: &[u8],
) -> Vec<u8> {
    let message_length = HEADER_SIZE + param_data.len();
    let mut packet = Vec::with_capacity(message_length + CHECKSUM_SIZE);
    packet.push(START_CODE);
    packet.push(SUB_START_CODE);
    packet.push(message_length as u8);
    packet.extend_from_slice(&destination.pack());
    packet.extend_from_slice(&source.pack());
    packet.push(transaction_number);
    packet.push(port_or_response_type);
    packet.push(message_count);
    packet.extend_from_slice(&sub_device.to_be_bytes());
    packet.push(command_class);
    packet.extend_from_slice(&param_id.to_be_bytes());
    packet.push(param_data.len() as u8);
    packet.extend_from_slice(param_data);

    let mut checksum: u16 = 0;
    for byte in &packet {
        checksum = checksum.wrapping_add(u16::from(*byte));
    }
    packet.extend_from_slice(&checksum.to_be_bytes());
    packet
}
