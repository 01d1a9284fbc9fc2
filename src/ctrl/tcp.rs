//! TCP side channel.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use super::channel::SideChannel;

/// Largest frame accepted from the peer.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// Interval between connection attempts of a client.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

fn stream_write(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    stream.write_all(&(buf.len() as u64).to_le_bytes())?;
    stream.write_all(buf)?;
    stream.flush()
}

fn stream_read(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len = [0; std::mem::size_of::<u64>()];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Pick the first IPv4 address, since the server only listens on IPv4.
fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>, host: &str) -> io::Result<SocketAddr> {
    addrs.into_iter().find(SocketAddr::is_ipv4).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolves to no IPv4 address", host),
        )
    })
}

fn connect_until_success(server_addr: SocketAddr, wait_on_failure: Duration) -> TcpStream {
    loop {
        match TcpStream::connect(server_addr) {
            Ok(stream) => break stream,
            Err(e) => {
                log::trace!("cannot connect to {} yet: {}", server_addr, e);
                thread::sleep(wait_on_failure);
            }
        }
    }
}

/// Side channel over one TCP connection, framing each message with its
/// length as a little-endian `u64`.
pub struct TcpChannel {
    stream: TcpStream,
    is_client: bool,
    closed: bool,
}

impl TcpChannel {
    /// Listen on `0.0.0.0:<port>` and accept exactly one client.
    pub fn server(port: u16) -> io::Result<Self> {
        let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        // `SO_REUSEADDR` is set by the standard library on Unix.
        let listener = TcpListener::bind(inaddr_any)?;
        log::info!("waiting for a client on TCP port {}", port);
        Self::accept(listener)
    }

    /// Accept exactly one client on `listener`, then drop the listener.
    pub fn accept(listener: TcpListener) -> io::Result<Self> {
        let (stream, peer) = listener.accept()?;
        log::debug!("accepted TCP client {}", peer);
        Ok(Self {
            stream,
            is_client: false,
            closed: false,
        })
    }

    /// Connect to `<host>:<port>`, retrying until the server listens.
    pub fn client(host: &str, port: u16) -> io::Result<Self> {
        let server_addr = first_ipv4((host, port).to_socket_addrs()?, host)?;
        let stream = connect_until_success(server_addr, RETRY_INTERVAL);
        log::debug!("connected to TCP server {}", server_addr);
        Ok(Self {
            stream,
            is_client: true,
            closed: false,
        })
    }

    /// Whether this end connected to the other.
    pub fn is_client(&self) -> bool {
        self.is_client
    }
}

impl SideChannel for TcpChannel {
    fn kind(&self) -> &'static str {
        "TCP"
    }

    fn exchange(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "TCP side channel is closed",
            ));
        }
        stream_write(&mut self.stream, msg)?;
        stream_read(&mut self.stream)
    }

    fn close(&mut self) -> io::Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        if self.is_client {
            match self.stream.shutdown(Shutdown::Both) {
                // The server may already have gone.
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::channel::Handshaker;
    use crate::ctrl::message::Value;

    fn local_pair<T: Send + 'static>(
        client: impl FnOnce(TcpChannel) -> T + Send + 'static,
    ) -> (TcpChannel, thread::JoinHandle<T>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || client(TcpChannel::client("127.0.0.1", port).unwrap()));
        (TcpChannel::accept(listener).unwrap(), handle)
    }

    #[test]
    fn client_prefers_ipv4() {
        let v4: SocketAddr = "127.0.0.1:7471".parse().unwrap();
        let v6: SocketAddr = "[::1]:7471".parse().unwrap();
        assert_eq!(first_ipv4([v6, v4], "localhost").unwrap(), v4);

        let err = first_ipv4([v6], "localhost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(first_ipv4(Vec::new(), "nowhere").is_err());
    }

    #[test]
    fn client_retries_until_server_listens() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = thread::spawn(move || {
            let mut ch = TcpChannel::client("127.0.0.1", port).unwrap();
            ch.exchange(b"late server").unwrap()
        });

        // Long enough for at least two failed attempts.
        thread::sleep(RETRY_INTERVAL * 3);
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let mut server = TcpChannel::accept(listener).unwrap();
        assert_eq!(server.exchange(b"here").unwrap(), b"late server");
        assert_eq!(client.join().unwrap(), b"here");
    }

    #[test]
    fn back_to_back_messages_stay_framed() {
        let (mut server, client) = local_pair(|mut ch| {
            let first = ch.exchange(b"one").unwrap();
            let second = ch.exchange(b"two, longer").unwrap();
            let third = ch.exchange(b"").unwrap();
            ch.close().unwrap();
            (first, second, third)
        });
        assert!(!server.is_client());

        assert_eq!(server.exchange(b"alpha").unwrap(), b"one");
        assert_eq!(server.exchange(b"beta").unwrap(), b"two, longer");
        assert_eq!(server.exchange(b"gamma gamma").unwrap(), b"");

        let (first, second, third) = client.join().unwrap();
        assert_eq!(first, b"alpha");
        assert_eq!(second, b"beta");
        assert_eq!(third, b"gamma gamma");
    }

    #[test]
    fn handshake_over_tcp() {
        let (server, client) = local_pair(|ch| {
            let mut hs = Handshaker::new(ch);
            hs.barrier().unwrap();
            let remote = hs.handshake(&[("qpn", Value::Int(2))]).unwrap();
            hs.barrier().unwrap();
            hs.close().unwrap();
            remote.int("qpn").unwrap()
        });

        let mut hs = Handshaker::new(server);
        hs.handshake(&[]).unwrap();
        let remote = hs.handshake(&[("qpn", Value::Int(1))]).unwrap();
        hs.barrier().unwrap();
        assert_eq!(remote.int("qpn").unwrap(), 2);
        assert_eq!(client.join().unwrap(), 1);
        hs.close().unwrap();
    }

    #[test]
    fn closed_channel_refuses_exchange() {
        let (mut server, client) = local_pair(|mut ch| {
            assert!(ch.is_client());
            ch.close().unwrap();
            ch.close().unwrap();
            ch.exchange(b"late").unwrap_err().kind()
        });
        assert_eq!(client.join().unwrap(), io::ErrorKind::NotConnected);

        // The peer shut down, so the read side sees EOF.
        assert!(server.exchange(b"anyone?").is_err());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let (mut server, client) = local_pair(|ch| {
            let mut stream = ch.stream;
            stream.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).unwrap();
            stream
        });
        let _stream = client.join().unwrap();
        let err = stream_read(&mut server.stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
