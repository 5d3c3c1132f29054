/* RDM controller core for USB DMX widgets.
 *
 * The crate is organized bottom-up:
 *
 *   uid        48-bit identifiers and ordered sets
 *   rdm        request/response model and the E1.20 wire codec
 *   discovery  binary-search enumeration over a DiscoveryTarget
 *   controller single-flight queueing with ACK_OVERFLOW reassembly
 *   widget     Ja Rule framing, per-port queues, the port RDM layer
 *   usb        nusb transport pumps and the hotplug agent
 *   registry   device lifecycle and notification fan-out
 *
 * A hosting daemon wires it together roughly as: hotplug agent ->
 * registry -> widget -> PortController per claimed port ->
 * QueueingController, and talks to the ControllerHandle. */

pub mod controller;
pub mod discovery;
pub mod logging;
pub mod rdm;
pub mod registry;
pub mod uid;
pub mod usb;
pub mod widget;

pub use controller::{
    ControllerHandle, DiscoverableRdmControllerInterface, QueueingController,
    RdmControllerInterface,
};
pub use discovery::{DiscoveryAgent, DiscoveryTarget};
pub use rdm::{RdmReply, RdmRequest, RdmResponse, StatusCode};
pub use uid::{Uid, UidSet};
pub use widget::port::{PortController, PortHandle};
pub use widget::{Widget, WidgetHandle, WidgetInfo};
