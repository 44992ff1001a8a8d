//! client for sending DNS queries to other servers
//!
//! The engine only speaks UDP outbound, for two call sites: NOTIFY
//! datagrams to secondaries and SOA/DS lookups against parent servers.
//! Each exchange binds an ephemeral socket, so no listener state is shared
//! with the serving path and no lock is held across network IO.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer};
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "no response within timeout")]
    TimeOut,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Synchronous UDP exchange with per-attempt timeout.
pub struct DnsNetworkClient {
    timeout: Duration,
    attempts: usize,
    total_sent: AtomicUsize,
    total_failed: AtomicUsize,
}

impl DnsNetworkClient {
    pub fn new(timeout: Duration, attempts: usize) -> DnsNetworkClient {
        DnsNetworkClient {
            timeout,
            attempts: attempts.max(1),
            total_sent: AtomicUsize::new(0),
            total_failed: AtomicUsize::new(0),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Relaxed)
    }

    /// Send `packet` and wait for the matching response.
    ///
    /// The packet id is assigned here; responses with a different id are
    /// dropped and the attempt keeps waiting until its timeout.
    pub fn exchange(&self, packet: &mut DnsPacket, server: SocketAddr) -> Result<DnsPacket> {
        let id = random::<u16>();
        packet.header.id = id;

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer)?;
        let request = &req_buffer.buf[0..req_buffer.pos];

        let mut last_err = ClientError::TimeOut;
        for attempt in 0..self.attempts {
            self.total_sent.fetch_add(1, Ordering::Relaxed);

            let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
                Ok(socket) => socket,
                Err(e) => {
                    log::error!("failed to bind outbound UDP socket: {}", e);
                    self.total_failed.fetch_add(1, Ordering::Relaxed);
                    last_err = ClientError::Io(e);
                    continue;
                }
            };
            if let Err(e) = socket.set_read_timeout(Some(self.timeout)) {
                last_err = ClientError::Io(e);
                continue;
            }
            if let Err(e) = socket.send_to(request, server) {
                log::warn!(
                    "send to {} failed on attempt {}: {}",
                    server,
                    attempt + 1,
                    e
                );
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                last_err = ClientError::Io(e);
                continue;
            }

            let mut res_buffer = BytePacketBuffer::new();
            match socket.recv_from(&mut res_buffer.buf) {
                Ok((_, src)) if src.ip() != server.ip() => {
                    log::debug!("dropping response from unexpected source {}", src);
                    continue;
                }
                Ok(_) => {
                    res_buffer.seek(0)?;
                    let response = DnsPacket::from_buffer(&mut res_buffer)?;
                    if response.header.id != id {
                        log::debug!(
                            "dropping response with mismatched id {} (expected {})",
                            response.header.id,
                            id
                        );
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    self.total_failed.fetch_add(1, Ordering::Relaxed);
                    last_err = ClientError::Io(e);
                    continue;
                }
            }
        }

        Err(last_err)
    }

    /// Convenience wrapper: one question, no recursion.
    pub fn send_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: SocketAddr,
    ) -> Result<DnsPacket> {
        let mut packet = DnsPacket::new();
        packet.header.recursion_desired = false;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));
        self.exchange(&mut packet, server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_exchange_against_local_responder() {
        // A tiny UDP echo peer that flips the response bit.
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = responder.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let (len, src) = responder.recv_from(&mut buf).unwrap();
            // QR bit lives at the top of byte 2.
            buf[2] |= 0x80;
            responder.send_to(&buf[..len], src).unwrap();
        });

        let client = DnsNetworkClient::new(Duration::from_secs(2), 1);
        let response = client
            .send_query("example.com", QueryType::Soa, addr)
            .unwrap();

        assert!(response.header.response);
        assert_eq!(response.questions.len(), 1);
        assert_eq!(response.questions[0].name, "example.com");
        handle.join().unwrap();
    }

    #[test]
    fn test_exchange_times_out() {
        // Nobody listens here; expect a timeout-ish failure quickly.
        let client = DnsNetworkClient::new(Duration::from_millis(100), 2);
        let result = client.send_query(
            "example.com",
            QueryType::Soa,
            "127.0.0.1:1".parse().unwrap(),
        );
        assert!(result.is_err());
        assert_eq!(client.sent_count(), 2);
    }
}
