/* RDM command model: request/response value types, the ANSI E1.20 wire
 * codec and the status-code taxonomy shared by every layer of the core. */

pub mod command;
pub mod reply;

pub use command::{
    CommandClass, RdmRequest, RdmResponse, ResponseType, ALL_SUB_DEVICES, MAX_PARAM_DATA,
    PID_DISC_MUTE, PID_DISC_UNIQUE_BRANCH, PID_DISC_UN_MUTE, START_CODE, SUB_START_CODE,
};
pub use reply::{FrameTiming, RdmFrame, RdmReply, StatusCode};
