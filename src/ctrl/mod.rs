//! Side channels connecting the two peers out of band, and the handshake
//! that carries connection metadata over them.

pub mod channel;
pub use channel::{HandshakeError, Handshaker, SideChannel};

pub mod cm;
pub use cm::CmChannel;

pub mod message;
pub use message::{MessageError, RemoteInfo, Value};

pub mod tcp;
pub use tcp::TcpChannel;
