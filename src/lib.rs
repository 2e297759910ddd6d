//! Host-side driver for the Kirale Bus Interface (KBI), the binary serial
//! protocol spoken by KiNOS Thread radio modules: byte-stuffing framing,
//! the command/response/notification frame layer, the request/response
//! session with its socket registry, and the firmware-update block
//! protocol.

mod codec;
mod command;
mod error;
mod firmware;
mod frame;
mod session;
mod socket;
mod transport;

pub use command::{AutoJoinMode, Channel, Command, HwMode, LedMode, NoneSubStatus, Role, Status, SteeringMode, TxPower};
pub use error::{CodecError, Error};
pub use frame::{encode_raw, CommandFunction, Frame, FrameClass, NotificationFunction, ResponseFunction, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
pub use session::{Clock, FakeClock, Session, SystemClock};
pub use socket::{OutboundDatagram, PeerAddressKind, SocketHandler};
pub use transport::{ByteTransport, LoopbackTransport, RecvOutcome, ScriptedTransport, SerialTransport};

pub use firmware::{BLOCK_SIZE, DFU_SUFFIX_SIZE};
