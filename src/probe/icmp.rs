//! ICMP echo probe on datagram sockets.
//!
//! Uses blocking sockets in spawn_blocking so the receive loop can hold a
//! hard OS-level deadline while the async caller stays cancellable.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes, checksum};
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;

use super::{Pinger, ProbeError, ProbeResult, resolve_addr};

/// ICMP header size (fixed).
const ICMP_HEADER_SIZE: usize = 8;
/// Echo payload carried in every request.
const ECHO_PAYLOAD: &[u8] = b"deadman";
/// ICMPv6 Echo Request / Echo Reply type codes.
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// ICMP echo pinger backed by datagram (unprivileged) sockets, falling back
/// to raw sockets where datagram ICMP is unsupported.
///
/// The identifier is fixed per engine; the sequence counter is engine-scoped
/// so multiple engines can coexist in tests. Concurrent probes share the
/// identifier and are discriminated by sequence number.
pub struct IcmpPinger {
    ident: u16,
    seq: AtomicU16,
}

impl IcmpPinger {
    pub fn new() -> Self {
        Self {
            ident: (std::process::id() & 0xffff) as u16,
            seq: AtomicU16::new(0),
        }
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> ProbeResult {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let ip = resolve_addr(addr).await?;
        let ident = self.ident;
        let seq = self.next_seq();

        let task = tokio::task::spawn_blocking(move || blocking_ping(ip, ident, seq, timeout));

        // The blocking task keeps running after cancellation but dies on its
        // own once the socket read deadline expires.
        tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            joined = task => match joined {
                Ok(result) => result,
                Err(e) => Err(ProbeError::Other(format!("probe task failed: {e}"))),
            },
        }
    }
}

fn blocking_ping(ip: IpAddr, ident: u16, seq: u16, timeout: Duration) -> ProbeResult {
    let socket = open_icmp_socket(ip)?;
    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| map_io_error(&e, timeout))?;

    let packet = build_echo_request(ident, seq, ip.is_ipv6());

    let start = Instant::now();
    let deadline = start + timeout;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| map_io_error(&e, timeout))?;
    socket.send(&packet).map_err(|e| map_io_error(&e, timeout))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| map_io_error(&e, timeout))?;

        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) => return Err(map_io_error(&e, timeout)),
        };
        // SAFETY: recv initialized `len` bytes.
        let datagram: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if let Some(rtt) = match_echo_reply(datagram, ident, seq, ip.is_ipv6(), start) {
            return Ok(rtt);
        }
        // Someone else's reply (shared identifier, different sequence) or a
        // non-echo message; keep waiting for ours.
    }
}

/// Open an ICMP socket for the address family, preferring unprivileged
/// datagram mode.
fn open_icmp_socket(ip: IpAddr) -> Result<Socket, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    Socket::new(domain, Type::DGRAM, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::RAW, Some(protocol)))
        .map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                ProbeError::PermissionDenied(format!("icmp socket: {e}"))
            } else {
                ProbeError::Network(format!("icmp socket: {e}"))
            }
        })
}

fn map_io_error(e: &io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
        io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e.to_string()),
        _ => ProbeError::Network(e.to_string()),
    }
}

/// Build an echo request tagged with `{identifier, sequence}`.
///
/// For IPv6 the checksum is left to the kernel (it covers the pseudo-header
/// and datagram sockets fill it in).
pub(crate) fn build_echo_request(ident: u16, seq: u16, ipv6: bool) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + ECHO_PAYLOAD.len()];

    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .expect("buffer sized for echo request header");
        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        packet.payload_mut().copy_from_slice(ECHO_PAYLOAD);
    }

    if !ipv6 {
        let cksum = checksum(&IcmpPacket::new(&buffer).expect("buffer holds an icmp packet"));
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .expect("buffer sized for echo request header");
        packet.set_checksum(cksum);
    }

    buffer
}

/// Check a received datagram for the echo reply matching `{ident, seq}`.
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message;
/// datagram sockets (and all IPv6 sockets) deliver the ICMP message alone.
pub(crate) fn match_echo_reply(
    datagram: &[u8],
    ident: u16,
    seq: u16,
    ipv6: bool,
    sent_at: Instant,
) -> Option<Duration> {
    let message = if !ipv6 && datagram.first().is_some_and(|b| b >> 4 == 4) {
        let header_len = (datagram[0] & 0x0f) as usize * 4;
        datagram.get(header_len..)?
    } else {
        datagram
    };

    if ipv6 {
        if message.len() < ICMP_HEADER_SIZE || message[0] != ICMPV6_ECHO_REPLY {
            return None;
        }
        let reply_ident = u16::from_be_bytes([message[4], message[5]]);
        let reply_seq = u16::from_be_bytes([message[6], message[7]]);
        if reply_ident != ident || reply_seq != seq {
            return None;
        }
        return Some(sent_at.elapsed());
    }

    let reply = EchoReplyPacket::new(message)?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    if reply.get_identifier() != ident || reply.get_sequence_number() != seq {
        return None;
    }
    Some(sent_at.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_from_request(mut request: Vec<u8>) -> Vec<u8> {
        request[0] = 0; // Echo Reply
        request
    }

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(0x1234, 0x0042, false);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + ECHO_PAYLOAD.len());
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x42]);
        let cksum = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(cksum, 0);
    }

    #[test]
    fn echo_request_layout_ipv6() {
        let packet = build_echo_request(7, 9, true);
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        // Checksum is left for the kernel.
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn matches_own_reply_only() {
        let sent = Instant::now();
        let reply = reply_from_request(build_echo_request(100, 7, false));

        assert!(match_echo_reply(&reply, 100, 7, false, sent).is_some());
        // Wrong sequence: another in-flight probe on the shared identifier.
        assert!(match_echo_reply(&reply, 100, 8, false, sent).is_none());
        // Wrong identifier: someone else's ping entirely.
        assert!(match_echo_reply(&reply, 101, 7, false, sent).is_none());
    }

    #[test]
    fn ignores_non_reply_messages() {
        let sent = Instant::now();
        // An echo *request* observed on the wire must not match.
        let request = build_echo_request(100, 7, false);
        assert!(match_echo_reply(&request, 100, 7, false, sent).is_none());
        // Truncated garbage.
        assert!(match_echo_reply(&[0u8; 3], 100, 7, false, sent).is_none());
        assert!(match_echo_reply(&[], 100, 7, false, sent).is_none());
    }

    #[test]
    fn skips_raw_socket_ip_header() {
        let sent = Instant::now();
        let reply = reply_from_request(build_echo_request(5, 6, false));

        // Prepend a minimal 20-byte IPv4 header (version 4, IHL 5).
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        raw.extend_from_slice(&reply);

        assert!(match_echo_reply(&raw, 5, 6, false, sent).is_some());
    }

    #[test]
    fn matches_ipv6_reply() {
        let sent = Instant::now();
        let reply = reply_from_request(build_echo_request(21, 3, true));
        // reply_from_request set type 0; fix to ICMPv6 Echo Reply.
        let mut reply = reply;
        reply[0] = ICMPV6_ECHO_REPLY;

        assert!(match_echo_reply(&reply, 21, 3, true, sent).is_some());
        assert!(match_echo_reply(&reply, 21, 4, true, sent).is_none());
    }

    #[test]
    fn sequence_counter_wraps() {
        let pinger = IcmpPinger::new();
        pinger.seq.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(pinger.next_seq(), u16::MAX);
        assert_eq!(pinger.next_seq(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let pinger = IcmpPinger::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pinger
            .ping("127.0.0.1", Duration::from_millis(10), &cancel)
            .await;
        assert_eq!(result, Err(ProbeError::Cancelled));
    }
}
