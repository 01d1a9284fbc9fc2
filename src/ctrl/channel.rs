//! Side channel abstraction and the handshake built on top of it.

use std::fmt::Write as _;
use std::io;

use thiserror::Error;

use super::message::{self, MessageError, RemoteInfo, Value, SENTINEL};

/// Width of the rules framing printed sections.
pub const RULE_WIDTH: usize = 80;

/// Get a horizontal rule.
pub fn rule() -> String {
    "-".repeat(RULE_WIDTH)
}

/// Out-of-band connection to the peer, used before and around the data path.
pub trait SideChannel {
    /// Short name of the channel kind for messages, e.g. `TCP`.
    fn kind(&self) -> &'static str;

    /// Send `msg` to the peer, then receive the peer's message.
    ///
    /// Both sides call this in lockstep.
    fn exchange(&mut self, msg: &[u8]) -> io::Result<Vec<u8>>;

    /// Close the connection. Further exchanges fail.
    fn close(&mut self) -> io::Result<()>;
}

impl<C: SideChannel + ?Sized> SideChannel for Box<C> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn exchange(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
        (**self).exchange(msg)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Handshake error type.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The side channel failed.
    #[error("{kind} side channel failed")]
    Channel {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer's message is not valid UTF-8.
    #[error("{kind} peer sent a non-UTF-8 message")]
    NotUtf8 { kind: &'static str },

    /// The peer's message failed to encode or decode.
    #[error("bad handshake message over {kind}")]
    Message {
        kind: &'static str,
        #[source]
        source: MessageError,
    },

    /// A barrier received something other than the sentinel.
    #[error("{kind} barrier received {received:?} instead of the sentinel")]
    NotSynchronized {
        kind: &'static str,
        received: String,
    },
}

/// Typed key/value exchange over a [`SideChannel`].
pub struct Handshaker<C: SideChannel> {
    channel: C,
}

impl<C: SideChannel> Handshaker<C> {
    /// Wrap a connected side channel.
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Get the underlying side channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Exchange items with the peer. Both ends should send the same keys.
    ///
    /// Local and remote items are printed. Without items, this is a
    /// [`barrier`](Self::barrier) and returns empty remote info.
    pub fn handshake(&mut self, items: &[(&str, Value)]) -> Result<RemoteInfo, HandshakeError> {
        self.handshake_printing(items, &mut io::stdout())
    }

    /// Handshake, printing the local info before the exchange and the
    /// remote info after it to `out`.
    fn handshake_printing(
        &mut self,
        items: &[(&str, Value)],
        out: &mut impl io::Write,
    ) -> Result<RemoteInfo, HandshakeError> {
        if items.is_empty() {
            self.barrier()?;
            return Ok(RemoteInfo::default());
        }

        let kind = self.channel.kind();
        let msg = message::encode(items).map_err(|source| HandshakeError::Message { kind, source })?;
        // Output is best effort and must not fail the handshake.
        let local = format_info("Local Info", items.iter().map(|(k, v)| (*k, v)));
        let _ = out.write_all(local.as_bytes());
        let _ = out.flush();

        let received = self.exchange_str(&msg)?;
        let remote =
            message::parse(&received).map_err(|source| HandshakeError::Message { kind, source })?;
        let remote_info = format_info(
            "Remote Info",
            remote.items().iter().map(|(k, v)| (k.as_str(), v)),
        );
        let _ = out.write_all(remote_info.as_bytes());
        Ok(remote)
    }

    /// Exchange the sentinel to synchronize with the peer.
    pub fn barrier(&mut self) -> Result<(), HandshakeError> {
        let received = self.exchange_str(SENTINEL)?;
        if received != SENTINEL {
            return Err(HandshakeError::NotSynchronized {
                kind: self.channel.kind(),
                received,
            });
        }
        Ok(())
    }

    /// Close the side channel.
    pub fn close(mut self) -> Result<(), HandshakeError> {
        let kind = self.channel.kind();
        self.channel
            .close()
            .map_err(|source| HandshakeError::Channel { kind, source })
    }

    fn exchange_str(&mut self, msg: &str) -> Result<String, HandshakeError> {
        let kind = self.channel.kind();
        log::trace!("{} send: {}", kind, msg);
        let received = self
            .channel
            .exchange(msg.as_bytes())
            .map_err(|source| HandshakeError::Channel { kind, source })?;
        let received = String::from_utf8(received).map_err(|_| HandshakeError::NotUtf8 { kind })?;
        log::trace!("{} recv: {}", kind, received);
        Ok(received)
    }
}

/// Format a `-- <title>` section with one `key : value` line per item,
/// closed by a rule.
pub fn format_info<'a>(title: &str, items: impl IntoIterator<Item = (&'a str, &'a Value)>) -> String {
    let mut out = format!("-- {}\n", title);
    for (key, value) in items {
        // Writing into a `String` cannot fail.
        let _ = writeln!(out, "{} : {}", key, value);
    }
    out.push_str(&rule());
    out.push('\n');
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::rdma::gid::Gid;

    /// Channel answering every exchange with a scripted reply.
    pub(crate) struct ScriptedChannel {
        pub replies: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
        /// Shared so that it stays observable after the handshaker is consumed.
        pub closed: Rc<Cell<bool>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
            Self {
                replies: replies.into_iter().map(|r| r.as_bytes().to_vec()).collect(),
                sent: Vec::new(),
                closed: Rc::new(Cell::new(false)),
            }
        }
    }

    impl SideChannel for ScriptedChannel {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn exchange(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
            if self.closed.get() {
                return Err(io::ErrorKind::NotConnected.into());
            }
            self.sent.push(msg.to_vec());
            self.replies
                .pop_front()
                .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed.set(true);
            Ok(())
        }
    }

    #[test]
    fn handshake_sends_and_decodes() {
        let mut hs = Handshaker::new(ScriptedChannel::new(["qpn:int:99,gid:GID:fe80::1"]));
        let gid = "fe80::2".parse().unwrap();
        let remote = hs
            .handshake(&[("qpn", Value::from(7u32)), ("gid", Value::Gid(gid))])
            .unwrap();
        assert_eq!(remote.int("qpn").unwrap(), 99);
        assert_eq!(remote.gid("gid").unwrap(), "fe80::1".parse::<Gid>().unwrap());
        assert_eq!(
            hs.channel().sent,
            [b"qpn:int:7,gid:GID:fe80:0000:0000:0000:0000:0000:0000:0002".to_vec()]
        );
    }

    #[test]
    fn empty_handshake_is_a_barrier() {
        let mut hs = Handshaker::new(ScriptedChannel::new([SENTINEL, SENTINEL]));
        assert!(hs.handshake(&[]).unwrap().items().is_empty());
        hs.barrier().unwrap();
        assert_eq!(hs.channel().sent, [SENTINEL.as_bytes(), SENTINEL.as_bytes()]);
    }

    #[test]
    fn barrier_rejects_other_messages() {
        let mut hs = Handshaker::new(ScriptedChannel::new(["qpn:int:1"]));
        match hs.barrier() {
            Err(HandshakeError::NotSynchronized { kind, received }) => {
                assert_eq!(kind, "scripted");
                assert_eq!(received, "qpn:int:1");
            }
            other => panic!("unexpected barrier result: {:?}", other),
        }
    }

    #[test]
    fn bad_replies_are_errors() {
        let mut hs = Handshaker::new(ScriptedChannel::new(["qpn:bogus:1"]));
        assert!(matches!(
            hs.handshake(&[("qpn", Value::Int(1))]),
            Err(HandshakeError::Message {
                source: MessageError::UnknownType(_),
                ..
            })
        ));

        let mut hs = Handshaker::new(ScriptedChannel::new(Vec::<&str>::new()));
        assert!(matches!(
            hs.barrier(),
            Err(HandshakeError::Channel { kind: "scripted", .. })
        ));
    }

    #[test]
    fn close_closes_channel() {
        let channel = ScriptedChannel::new([SENTINEL]);
        let closed = Rc::clone(&channel.closed);
        let hs = Handshaker::new(channel);
        assert!(!closed.get());
        hs.close().unwrap();
        assert!(closed.get());

        // A closed channel refuses further exchanges.
        let mut channel = ScriptedChannel::new([SENTINEL]);
        channel.close().unwrap();
        let mut hs = Handshaker::new(channel);
        assert!(matches!(
            hs.barrier(),
            Err(HandshakeError::Channel { kind: "scripted", .. })
        ));
        assert!(hs.channel().sent.is_empty());
    }

    #[test]
    fn local_info_is_printed_before_the_exchange() {
        let mut hs = Handshaker::new(ScriptedChannel::new(Vec::<&str>::new()));
        let mut out = Vec::new();
        assert!(hs
            .handshake_printing(&[("qpn", Value::Int(3))], &mut out)
            .is_err());
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("-- Local Info\nqpn : 3\n"));
        assert!(!out.contains("Remote Info"));

        let mut hs = Handshaker::new(ScriptedChannel::new(["qpn:int:4"]));
        let mut out = Vec::new();
        hs.handshake_printing(&[("qpn", Value::Int(3))], &mut out)
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        let remote_at = out.find("-- Remote Info\nqpn : 4\n").unwrap();
        assert!(out.find("-- Local Info").unwrap() < remote_at);
    }

    #[test]
    fn info_format() {
        let qpn = Value::Int(5);
        let text = format_info("Local Info", [("qpn", &qpn)]);
        assert_eq!(text, format!("-- Local Info\nqpn : 5\n{}\n", "-".repeat(80)));
    }
}
