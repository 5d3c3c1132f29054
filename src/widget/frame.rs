/* Ja Rule USB framing.
 *
 * Every command is one bulk OUT transfer:
 *
 *   SOF, token, port id, command class (u16 LE), payload length (u16 LE),
 *   payload, EOF
 *
 * plus a single 0x00 pad byte when the total lands on a multiple of the
 * USB packet size, so the device side sees the transfer terminate.
 * Responses share the shell, drop the port id and insert a return code
 * and status flags before the payload; they are matched to commands by
 * token. */

use thiserror::Error;

pub const SOF_IDENTIFIER: u8 = 0x5a;
pub const EOF_IDENTIFIER: u8 = 0xa5;

pub const MAX_PAYLOAD_SIZE: usize = 513;
pub const USB_PACKET_SIZE: usize = 64;

/* SOF, token, command (2), length (2), return code, status flags, EOF. */
pub const MIN_RESPONSE_SIZE: usize = 9;

/* Command header plus EOF. */
const COMMAND_OVERHEAD: usize = 8;

/* Status flag bits carried on every response. */
pub const LOGS_PENDING_FLAG: u8 = 0x01;
pub const FLAGS_CHANGED_FLAG: u8 = 0x02;
pub const MSG_TRUNCATED_FLAG: u8 = 0x04;

/* Ja Rule return codes. */
pub const RC_OK: u8 = 0;
pub const RC_UNKNOWN: u8 = 1;
pub const RC_BUFFER_FULL: u8 = 2;
pub const RC_BAD_PARAM: u8 = 3;
pub const RC_TX_ERROR: u8 = 4;
pub const RC_RDM_TIMEOUT: u8 = 5;
pub const RC_RDM_BCAST_RESPONSE: u8 = 6;
pub const RC_RDM_INVALID_RESPONSE: u8 = 7;

/// The Ja Rule command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandClass {
    ResetDevice = 0x00,
    SetMode = 0x01,
    GetUid = 0x02,
    SetBreakTime = 0x10,
    GetBreakTime = 0x11,
    SetMabTime = 0x12,
    GetMabTime = 0x13,
    SetRdmBroadcastListen = 0x20,
    GetRdmBroadcastListen = 0x21,
    SetRdmWaitTime = 0x22,
    GetRdmWaitTime = 0x23,
    TxDmx = 0x30,
    RdmDub = 0x40,
    RdmRequest = 0x41,
    RdmBroadcastRequest = 0x42,
    EchoCommand = 0xf0,
    GetLog = 0xf1,
    GetFlags = 0xf2,
    WriteLog = 0xf3,
}

/// How a widget command ultimately resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// The command was sent and a response was received.
    Ok,
    /// The command was malformed (oversize payload).
    Malformed,
    /// The command could not be handed to the transport.
    SendError,
    /// The port's command queue was full.
    QueueFull,
    /// No response arrived within the transfer timeout.
    Timeout,
    /// The response's command class did not match the request.
    ClassMismatch,
    /// The command was cancelled.
    Cancelled,
    /// The port id does not exist on this widget.
    InvalidPort,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),

    #[error("frame of {0} bytes is below the minimum")]
    TooShort(usize),

    #[error("SOF mismatch: {0:#04x}")]
    BadSof(u8),

    #[error("EOF mismatch: {0:#04x}")]
    BadEof(u8),

    #[error("declared payload of {declared} bytes exceeds the {available} available")]
    LengthMismatch { declared: usize, available: usize },
}

/// A decoded response frame.
///
/// The command class is left raw: an unknown class is reported as a
/// mismatch by the dispatch layer rather than a framing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub token: u8,
    pub command: u16,
    pub return_code: u8,
    pub status_flags: u8,
    pub payload: Vec<u8>,
}

/// Frame a command for the bulk OUT endpoint.
pub fn encode_command(
    token: u8,
    port_id: u8,
    command: CommandClass,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(COMMAND_OVERHEAD + payload.len() + 1);
    frame.push(SOF_IDENTIFIER);
    frame.push(token);
    frame.push(port_id);
    frame.extend_from_slice(&(command as u16).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(EOF_IDENTIFIER);

    /* Pad so the transfer is never an exact multiple of the packet size,
     * otherwise the device side waits for a zero-length packet. */
    if frame.len() % USB_PACKET_SIZE == 0 {
        frame.push(0x00);
    }
    Ok(frame)
}

/// Parse a command frame. Used by the device side of the protocol and by
/// tests standing in for a widget.
pub fn decode_command(data: &[u8]) -> Result<(u8, u8, u16, Vec<u8>), FrameError> {
    if data.len() < COMMAND_OVERHEAD {
        return Err(FrameError::TooShort(data.len()));
    }
    if data[0] != SOF_IDENTIFIER {
        return Err(FrameError::BadSof(data[0]));
    }
    let token = data[1];
    let port_id = data[2];
    let command = u16::from_le_bytes([data[3], data[4]]);
    let length = usize::from(u16::from_le_bytes([data[5], data[6]]));
    if length + COMMAND_OVERHEAD > data.len() {
        return Err(FrameError::LengthMismatch {
            declared: length,
            available: data.len() - COMMAND_OVERHEAD,
        });
    }
    if data[7 + length] != EOF_IDENTIFIER {
        return Err(FrameError::BadEof(data[7 + length]));
    }
    Ok((token, port_id, command, data[7..7 + length].to_vec()))
}

/// Frame a response for the bulk IN endpoint. Used by the device side
/// and by tests.
pub fn encode_response(
    token: u8,
    command: u16,
    return_code: u8,
    status_flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(MIN_RESPONSE_SIZE + payload.len());
    frame.push(SOF_IDENTIFIER);
    frame.push(token);
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.push(return_code);
    frame.push(status_flags);
    frame.extend_from_slice(payload);
    frame.push(EOF_IDENTIFIER);

    if frame.len() % USB_PACKET_SIZE == 0 {
        frame.push(0x00);
    }
    Ok(frame)
}

/// Parse a response frame.
///
/// Trailing bytes after the EOF (bulk read slack, padding) are ignored.
pub fn decode_response(data: &[u8]) -> Result<ResponseFrame, FrameError> {
    if data.len() < MIN_RESPONSE_SIZE {
        return Err(FrameError::TooShort(data.len()));
    }
    if data[0] != SOF_IDENTIFIER {
        return Err(FrameError::BadSof(data[0]));
    }
    let token = data[1];
    let command = u16::from_le_bytes([data[2], data[3]]);
    let length = usize::from(u16::from_le_bytes([data[4], data[5]]));
    let return_code = data[6];
    let status_flags = data[7];
    if length + MIN_RESPONSE_SIZE > data.len() {
        return Err(FrameError::LengthMismatch {
            declared: length,
            available: data.len() - MIN_RESPONSE_SIZE,
        });
    }
    if data[8 + length] != EOF_IDENTIFIER {
        return Err(FrameError::BadEof(data[8 + length]));
    }
    Ok(ResponseFrame {
        token,
        command,
        return_code,
        status_flags,
        payload: data[8..8 + length].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout() {
        let frame = encode_command(7, 1, CommandClass::EchoCommand, &[0xde, 0xad]).unwrap();
        assert_eq!(
            frame,
            vec![0x5a, 7, 1, 0xf0, 0x00, 0x02, 0x00, 0xde, 0xad, 0xa5]
        );
    }

    #[test]
    fn command_round_trip() {
        let payload: Vec<u8> = (0..100).collect();
        let frame = encode_command(42, 3, CommandClass::TxDmx, &payload).unwrap();
        let (token, port_id, command, decoded) = decode_command(&frame).unwrap();
        assert_eq!(token, 42);
        assert_eq!(port_id, 3);
        assert_eq!(command, CommandClass::TxDmx as u16);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn command_pads_on_packet_boundary() {
        /* 56 bytes of payload plus the 8 byte overhead is exactly one
         * USB packet, so a pad byte must be appended. */
        let payload = vec![0u8; 56];
        let frame = encode_command(0, 0, CommandClass::TxDmx, &payload).unwrap();
        assert_eq!(frame.len(), 65);
        assert_eq!(frame[63], EOF_IDENTIFIER);
        assert_eq!(frame[64], 0x00);

        /* One byte fewer and no pad is needed. */
        let frame = encode_command(0, 0, CommandClass::TxDmx, &payload[..55]).unwrap();
        assert_eq!(frame.len(), 63);
        assert_eq!(*frame.last().unwrap(), EOF_IDENTIFIER);
    }

    #[test]
    fn command_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            encode_command(0, 0, CommandClass::TxDmx, &payload),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn response_round_trip() {
        let frame =
            encode_response(9, CommandClass::GetUid as u16, RC_OK, 0, &[1, 2, 3, 4, 5, 6])
                .unwrap();
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded.token, 9);
        assert_eq!(decoded.command, CommandClass::GetUid as u16);
        assert_eq!(decoded.return_code, RC_OK);
        assert_eq!(decoded.status_flags, 0);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn empty_response_is_minimum_size() {
        let frame = encode_response(0, 0x02, RC_OK, 0, &[]).unwrap();
        assert_eq!(frame.len(), MIN_RESPONSE_SIZE);
        assert!(decode_response(&frame).is_ok());
    }

    #[test]
    fn response_ignores_trailing_slack() {
        let mut frame = encode_response(1, 0x30, RC_OK, LOGS_PENDING_FLAG, &[7]).unwrap();
        frame.extend_from_slice(&[0u8; 20]);
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded.payload, vec![7]);
        assert_eq!(decoded.status_flags, LOGS_PENDING_FLAG);
    }

    #[test]
    fn response_structural_errors() {
        assert_eq!(decode_response(&[0x5a, 0, 0]), Err(FrameError::TooShort(3)));

        let mut frame = encode_response(1, 0x30, RC_OK, 0, &[7]).unwrap();
        frame[0] = 0x00;
        assert_eq!(decode_response(&frame), Err(FrameError::BadSof(0x00)));

        let mut frame = encode_response(1, 0x30, RC_OK, 0, &[7]).unwrap();
        let last = frame.len() - 1;
        frame[last] = 0x00;
        assert_eq!(decode_response(&frame), Err(FrameError::BadEof(0x00)));

        let mut frame = encode_response(1, 0x30, RC_OK, 0, &[7]).unwrap();
        frame[4] = 0xff;
        frame[5] = 0x01;
        assert!(matches!(
            decode_response(&frame),
            Err(FrameError::LengthMismatch { .. })
        ));
    }
}
