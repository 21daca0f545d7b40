//! Protocol module: upstream frame codec, message classification and the
//! correlation-id counter.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_frame, encode_frame, Frame, FrameDecoder, ProtocolError};
pub use messages::{PushMessage, UpstreamFault, UpstreamMessage, UpstreamRequest};
pub use sequence::SequenceCounter;
