//! Outbound NOTIFY dispatch (RFC 1996)
//!
//! A commit arms the dispatcher; ten seconds later one burst of NOTIFY
//! datagrams goes out to the zone's secondaries. Repeat commits while the
//! arm is pending are coalesced into that burst. Target computation is
//! deferred to fire time so the burst always carries the newest SOA, and a
//! shared in-flight set keeps at most one outstanding NOTIFY per target.
//! Nothing here ever blocks the committer: arming is a lock-free-ish flag
//! flip and all network IO happens on worker threads.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::Builder;
use std::time::Duration;

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::dns::client::DnsNetworkClient;
use crate::dns::protocol::{
    DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, OPCODE_NOTIFY,
};

/// Delay between a commit and the NOTIFY burst it arms.
pub const NOTIFY_DELAY: Duration = Duration::from_secs(10);
/// Per-attempt response timeout.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// Send attempts per target per burst.
pub const NOTIFY_ATTEMPTS: usize = 5;

/// Who gets notified on zone change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyPolicy {
    /// Nobody; the dispatcher stays silent.
    None,
    /// The zone's own NS RRSet, minus the primary name server.
    ZoneNameServers,
    /// An admin-maintained address list.
    SpecifiedNameServers,
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        NotifyPolicy::ZoneNameServers
    }
}

/// One armed burst: the SOA to advertise and where to send it.
#[derive(Debug, Clone)]
pub struct NotifyJob {
    pub zone: String,
    pub soa: DnsRecord,
    pub targets: Vec<SocketAddr>,
}

/// Per-zone NOTIFY dispatcher.
pub struct NotifyDispatcher {
    zone: String,
    delay: Duration,
    /// Cancel channel of the pending arm; Some means armed.
    armed: Arc<Mutex<Option<Sender<()>>>>,
    /// Targets with a NOTIFY currently outstanding.
    in_flight: Arc<Mutex<HashSet<SocketAddr>>>,
    client: Arc<DnsNetworkClient>,
}

impl NotifyDispatcher {
    pub fn new(zone: &str) -> NotifyDispatcher {
        NotifyDispatcher::with_delay(zone, NOTIFY_DELAY)
    }

    /// Test hook: same dispatcher, shorter fuse.
    pub fn with_delay(zone: &str, delay: Duration) -> NotifyDispatcher {
        NotifyDispatcher {
            zone: zone.to_string(),
            delay,
            armed: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            client: Arc::new(DnsNetworkClient::new(NOTIFY_TIMEOUT, NOTIFY_ATTEMPTS)),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Arm a burst. While one is pending further triggers are coalesced.
    ///
    /// `build_job` runs on the worker thread at fire time, so it sees the
    /// zone as of the newest commit; returning None skips the burst.
    pub fn trigger<F>(&self, build_job: F)
    where
        F: FnOnce() -> Option<NotifyJob> + Send + 'static,
    {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return;
        }

        let (cancel, signal) = mpsc::channel();
        *armed = Some(cancel);
        drop(armed);

        let zone = self.zone.clone();
        let delay = self.delay;
        let armed_slot = Arc::clone(&self.armed);
        let in_flight = Arc::clone(&self.in_flight);
        let client = Arc::clone(&self.client);

        let spawned = Builder::new()
            .name(format!("notify-{}", zone))
            .spawn(move || {
                match signal.recv_timeout(delay) {
                    Ok(()) => {
                        log::debug!("pending NOTIFY for zone {} cancelled", zone);
                        *armed_slot.lock() = None;
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        *armed_slot.lock() = None;
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
                // Disarm before sending so commits during the burst re-arm.
                *armed_slot.lock() = None;

                let job = match build_job() {
                    Some(job) => job,
                    None => return,
                };
                dispatch_burst(job, in_flight, client);
            });

        if spawned.is_err() {
            log::error!("failed to spawn notify thread for zone {}", self.zone);
            *self.armed.lock() = None;
        }
    }

    /// Drop a pending arm, if any. In-flight sends finish on their own
    /// timeout; they are never aborted mid-flight.
    pub fn cancel_pending(&self) {
        if let Some(cancel) = self.armed.lock().take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for NotifyDispatcher {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

fn dispatch_burst(
    job: NotifyJob,
    in_flight: Arc<Mutex<HashSet<SocketAddr>>>,
    client: Arc<DnsNetworkClient>,
) {
    for target in job.targets {
        {
            let mut outstanding = in_flight.lock();
            if !outstanding.insert(target) {
                log::debug!(
                    "NOTIFY to {} for zone {} already in flight, skipping",
                    target,
                    job.zone
                );
                continue;
            }
        }

        let zone = job.zone.clone();
        let soa = job.soa.clone();
        let in_flight_thread = Arc::clone(&in_flight);
        let client = Arc::clone(&client);

        let spawned = Builder::new()
            .name(format!("notify-send-{}", zone))
            .spawn(move || {
                send_notify(&client, &zone, soa, target);
                in_flight_thread.lock().remove(&target);
            });
        if spawned.is_err() {
            log::error!("failed to spawn notify sender for zone {}", job.zone);
            in_flight.lock().remove(&target);
        }
    }
}

/// Build and send one NOTIFY, logging the outcome.
fn send_notify(client: &DnsNetworkClient, zone: &str, soa: DnsRecord, target: SocketAddr) {
    let serial = match &soa {
        DnsRecord::Soa { serial, .. } => *serial,
        _ => 0,
    };

    let mut packet = DnsPacket::new();
    packet.header.opcode = OPCODE_NOTIFY;
    packet.header.authoritative_answer = true;
    packet
        .questions
        .push(DnsQuestion::new(zone.to_string(), QueryType::Soa));
    packet.answers.push(soa);

    log::info!(
        "sending NOTIFY for zone {} (serial {}) to {}",
        zone,
        serial,
        target
    );

    match client.exchange(&mut packet, target) {
        Ok(response) => match response.header.rescode {
            // NotImpl counts as delivered: the secondary heard us even if
            // it does not implement NOTIFY.
            ResultCode::NOERROR | ResultCode::NOTIMP => {
                log::info!("NOTIFY for zone {} acknowledged by {}", zone, target);
            }
            other => {
                log::warn!(
                    "NOTIFY for zone {} refused by {} with {:?}",
                    zone,
                    target,
                    other
                );
            }
        },
        Err(e) => {
            log::warn!("NOTIFY for zone {} to {} failed: {}", zone, target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::BytePacketBuffer;
    use crate::dns::protocol::TransientTtl;
    use std::net::UdpSocket;
    use std::thread;

    fn test_soa(serial: u32) -> DnsRecord {
        DnsRecord::Soa {
            domain: "example.com".to_string(),
            m_name: "ns1.example.com".to_string(),
            r_name: "admin.example.com".to_string(),
            serial,
            refresh: 900,
            retry: 300,
            expire: 604800,
            minimum: 900,
            ttl: TransientTtl(900),
        }
    }

    #[test]
    fn test_notify_burst_reaches_secondary() {
        let secondary = UdpSocket::bind("127.0.0.1:0").unwrap();
        secondary
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let addr = secondary.local_addr().unwrap();

        let receiver = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let (len, src) = secondary.recv_from(&mut buf).unwrap();

            let mut buffer = BytePacketBuffer::new();
            buffer.buf[..len].copy_from_slice(&buf[..len]);
            let packet = DnsPacket::from_buffer(&mut buffer).unwrap();

            // Acknowledge so the sender does not retry.
            buf[2] |= 0x80;
            secondary.send_to(&buf[..len], src).unwrap();
            packet
        });

        let dispatcher = NotifyDispatcher::with_delay("example.com", Duration::from_millis(20));
        dispatcher.trigger(move || {
            Some(NotifyJob {
                zone: "example.com".to_string(),
                soa: test_soa(7),
                targets: vec![addr],
            })
        });

        let packet = receiver.join().unwrap();
        assert_eq!(packet.header.opcode, OPCODE_NOTIFY);
        assert!(packet.header.authoritative_answer);
        assert_eq!(packet.questions[0].qtype, QueryType::Soa);
        assert_eq!(packet.questions[0].name, "example.com");
        match &packet.answers[0] {
            DnsRecord::Soa { serial, .. } => assert_eq!(*serial, 7),
            _ => panic!("expected SOA answer"),
        }
    }

    #[test]
    fn test_triggers_coalesce_while_armed() {
        let dispatcher = NotifyDispatcher::with_delay("example.com", Duration::from_secs(30));

        dispatcher.trigger(|| None);
        assert!(dispatcher.is_armed());

        // A second trigger while armed is absorbed.
        dispatcher.trigger(|| panic!("coalesced trigger must not build a job"));
        assert!(dispatcher.is_armed());

        dispatcher.cancel_pending();
        // The worker clears the armed flag shortly after the cancel lands.
        for _ in 0..50 {
            if !dispatcher.is_armed() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!dispatcher.is_armed());
    }

    #[test]
    fn test_cancel_prevents_burst() {
        let dispatcher = NotifyDispatcher::with_delay("example.com", Duration::from_millis(200));

        dispatcher.trigger(|| panic!("cancelled arm must not fire"));
        dispatcher.cancel_pending();
        thread::sleep(Duration::from_millis(400));
    }
}
