//! Native ICMP echo transport.
//!
//! Uses a non-blocking socket2 socket registered with the tokio reactor, so a
//! session can wait for replies, its next send slot and a stop request at the
//! same time.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

use super::{EchoReply, EchoTransport, ProbeError};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// 8 byte header + 56 byte payload, like the classic `ping`.
const PACKET_SIZE: usize = 64;

/// Echo transport bound to one destination.
pub struct IcmpTransport {
    socket: AsyncFd<Socket>,
    dest: IpAddr,
    identifier: u16,
    /// RAW sockets see every echo reply on the host (and, for IPv4, the IP
    /// header). DGRAM sockets are already filtered by the kernel, which also
    /// rewrites the identifier.
    raw: bool,
}

impl IcmpTransport {
    /// Open a socket for `dest`, trying RAW (privileged) first, then DGRAM.
    pub fn open(dest: IpAddr) -> Result<Self, ProbeError> {
        let (domain, protocol) = match dest {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(s) => (s, true),
            Err(_) => {
                let s = Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| {
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        ProbeError::Permission(format!("cannot open ICMP socket: {}", e))
                    } else {
                        ProbeError::Network(format!("failed to create ICMP socket: {}", e))
                    }
                })?;
                (s, false)
            }
        };
        tracing::debug!(
            "Ping probe: using native ICMP ({} socket)",
            if raw { "RAW" } else { "DGRAM" }
        );

        socket
            .set_nonblocking(true)
            .map_err(|e| ProbeError::Network(format!("failed to set non-blocking: {}", e)))?;
        socket
            .connect(&SocketAddr::new(dest, 0).into())
            .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

        let socket = AsyncFd::new(socket)
            .map_err(|e| ProbeError::Network(format!("failed to register socket: {}", e)))?;

        Ok(Self {
            socket,
            dest,
            identifier: rand::random(),
            raw,
        })
    }
}

#[async_trait]
impl EchoTransport for IcmpTransport {
    async fn send(&self, seq: u16) -> Result<(), ProbeError> {
        let packet = match self.dest {
            IpAddr::V4(_) => build_icmp_echo_request(self.identifier, seq),
            IpAddr::V6(_) => build_icmpv6_echo_request(self.identifier, seq),
        };

        loop {
            let mut guard = self
                .socket
                .writable()
                .await
                .map_err(|e| ProbeError::Network(format!("socket not writable: {}", e)))?;
            match guard.try_io(|inner| inner.get_ref().send(&packet)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(ProbeError::Permission(format!("failed to send: {}", e)))
                }
                Ok(Err(e)) => return Err(ProbeError::Network(format!("failed to send: {}", e))),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> Result<EchoReply, ProbeError> {
        loop {
            let mut guard = self
                .socket
                .readable()
                .await
                .map_err(|e| ProbeError::Network(format!("socket not readable: {}", e)))?;

            let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
            let len = match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => return Err(ProbeError::Network(format!("failed to receive: {}", e))),
                Err(_would_block) => continue,
            };
            // SAFETY: recv initialized `len` bytes
            let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            let expected_id = self.raw.then_some(self.identifier);
            let parsed = match self.dest {
                IpAddr::V4(_) => parse_icmp_echo_reply(data, expected_id),
                IpAddr::V6(_) => parse_icmpv6_echo_reply(data, expected_id),
            };
            // Anything else (other hosts' replies, errors) is skipped.
            if let Some((seq, bytes, ttl)) = parsed {
                return Ok(EchoReply {
                    seq,
                    bytes,
                    from: self.dest,
                    ttl,
                });
            }
        }
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
pub(crate) fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_packet(ICMP_ECHO_REQUEST, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The checksum covers a pseudo header and is filled in by the kernel.
pub(crate) fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    echo_packet(ICMPV6_ECHO_REQUEST, identifier, sequence)
}

fn echo_packet(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    packet
}

/// Parse an IPv4 echo reply; returns `(sequence, icmp bytes, ttl)`.
///
/// RAW sockets deliver the IP header in front of the ICMP message.
pub(crate) fn parse_icmp_echo_reply(
    buf: &[u8],
    expected_id: Option<u16>,
) -> Option<(u16, usize, Option<u8>)> {
    let (icmp, ttl) = if buf.first().map(|b| b >> 4) == Some(4) {
        let header_len = usize::from(buf[0] & 0x0F) * 4;
        (buf.get(header_len..)?, buf.get(8).copied())
    } else {
        (buf, None)
    };
    parse_echo(icmp, ICMP_ECHO_REPLY, expected_id).map(|seq| (seq, icmp.len(), ttl))
}

/// Parse an ICMPv6 echo reply; the kernel never passes the IPv6 header.
pub(crate) fn parse_icmpv6_echo_reply(
    buf: &[u8],
    expected_id: Option<u16>,
) -> Option<(u16, usize, Option<u8>)> {
    parse_echo(buf, ICMPV6_ECHO_REPLY, expected_id).map(|seq| (seq, buf.len(), None))
}

fn parse_echo(icmp: &[u8], reply_type: u8, expected_id: Option<u16>) -> Option<u16> {
    if icmp.len() < 8 || icmp[0] != reply_type {
        return None;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    if expected_id.is_some_and(|expected| expected != id) {
        return None;
    }
    Some(u16::from_be_bytes([icmp[6], icmp[7]]))
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet carrying its own checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0x01]), !0x0100u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
    }

    #[test]
    fn test_build_icmpv6_packet() {
        let packet = build_icmpv6_echo_request(0xbeef, 7);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[6..8], [0x00, 0x07]);
    }

    fn reply_from(request: &[u8]) -> Vec<u8> {
        let mut reply = request.to_vec();
        reply[0] = ICMP_ECHO_REPLY;
        reply
    }

    #[test]
    fn test_parse_dgram_reply() {
        let reply = reply_from(&build_icmp_echo_request(0x1111, 3));
        // DGRAM: kernel rewrote the identifier, so it is not checked.
        assert_eq!(parse_icmp_echo_reply(&reply, None), Some((3, 64, None)));
    }

    #[test]
    fn test_parse_raw_reply_with_ip_header() {
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram[8] = 57; // TTL
        datagram.extend(reply_from(&build_icmp_echo_request(0x2222, 9)));

        assert_eq!(
            parse_icmp_echo_reply(&datagram, Some(0x2222)),
            Some((9, 64, Some(57)))
        );
        assert_eq!(parse_icmp_echo_reply(&datagram, Some(0x3333)), None);
    }

    #[test]
    fn test_parse_ignores_requests_and_short_packets() {
        let request = build_icmp_echo_request(1, 1);
        assert_eq!(parse_icmp_echo_reply(&request, None), None);
        assert_eq!(parse_icmp_echo_reply(&[0, 0, 0], None), None);
    }

    #[test]
    fn test_parse_icmpv6_reply() {
        let mut reply = build_icmpv6_echo_request(0x4444, 2);
        reply[0] = ICMPV6_ECHO_REPLY;
        assert_eq!(parse_icmpv6_echo_reply(&reply, Some(0x4444)), Some((2, 64, None)));
    }
}
