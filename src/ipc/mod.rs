//! Control-plane wire protocol and client connection lifecycle.
//!
//! All traffic is length-prefixed JSON frames (4-byte big-endian length +
//! UTF-8 body). Some messages (game payload, weight payload) are followed by
//! a raw byte stream with its own length prefix.

mod connection;
mod encoding;
mod protocol;
mod router;
mod server;

pub use connection::{ClientConnection, ConnectionRegistry};
pub use encoding::{
    discard_payload, read_frame, read_payload, receive_payload_to_file, write_frame,
    write_payload, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};
pub use protocol::{
    decode_message, encode_message, ClientRole, MatchRecord, MctsMetrics, Message, ProtocolError,
};
pub use router::{spawn_recv_loop, LoopFlow, RecvHandler};
pub use server::Acceptor;
