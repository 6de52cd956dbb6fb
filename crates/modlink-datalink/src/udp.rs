//! Modbus UDP session. Connectionless: every exchange uses a fresh socket.

use crate::config::SocketConfig;
use crate::tcp::{encode_request, with_deadline, Expected};
use crate::{next_transaction_id, DataLink, DataLinkError};
use async_trait::async_trait;
use modlink_core::encoding::Reader;
use modlink_core::frame::tcp::{self, MbapHeader};
use modlink_core::pdu::MAX_PDU_LEN;
use modlink_core::Transport;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct UdpSession {
    config: SocketConfig,
    lock: Mutex<()>,
}

impl UdpSession {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    async fn resolve(&self) -> Result<SocketAddr, DataLinkError> {
        let deadline = Instant::now() + self.config.timeouts.connect;
        let mut addrs = with_deadline(deadline, async {
            Ok::<_, DataLinkError>(lookup_host(self.config.endpoint()).await?)
        })
        .await?;
        addrs
            .next()
            .ok_or(DataLinkError::InvalidResponse("endpoint resolved to no addresses"))
    }
}

#[async_trait]
impl DataLink for UdpSession {
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError> {
        let transaction_id = next_transaction_id();
        let protocol_id = self.config.protocol_id;
        let request = encode_request(transaction_id, protocol_id, unit_id, request_pdu)?;
        let expected = Expected {
            transaction_id,
            protocol_id,
            unit_id,
        };

        let _guard = self.lock.lock().await;
        let peer = self.resolve().await?;
        let local_ip = match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        // Always ephemeral; `local_port` only applies to TCP.
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;

        trace!(
            transaction_id,
            unit_id,
            pdu_len = request_pdu.len(),
            %peer,
            "sending modbus udp request"
        );
        let send_deadline = Instant::now() + self.config.timeouts.send;
        with_deadline(send_deadline, async {
            socket.send_to(&request, peer).await?;
            Ok::<(), DataLinkError>(())
        })
        .await?;

        let deadline = Instant::now() + self.config.timeouts.receive;
        let mut datagram = [0u8; tcp::MBAP_HEADER_LEN + MAX_PDU_LEN + 1];
        loop {
            let (len, from) = with_deadline(deadline, async {
                Ok::<_, DataLinkError>(socket.recv_from(&mut datagram).await?)
            })
            .await?;
            // Stray datagrams and runts are ignored until the deadline.
            if from != peer || len < tcp::MBAP_HEADER_LEN {
                continue;
            }

            let mut reader = Reader::new(&datagram[..len]);
            let header = MbapHeader::decode(&mut reader)?;
            let pdu_len = header.pdu_len();
            if pdu_len > MAX_PDU_LEN {
                return Err(DataLinkError::InvalidResponse("response pdu too large"));
            }
            if reader.remaining() != pdu_len {
                return Err(DataLinkError::InvalidResponse(
                    "datagram length does not match mbap length",
                ));
            }
            expected.check(&header)?;
            if pdu_len > response_pdu.len() {
                return Err(DataLinkError::ResponseBufferTooSmall {
                    needed: pdu_len,
                    available: response_pdu.len(),
                });
            }
            response_pdu[..pdu_len].copy_from_slice(reader.rest());
            trace!(transaction_id, unit_id, pdu_len, "received modbus udp response");
            return Ok(pdu_len);
        }
    }

    fn transport(&self) -> Transport {
        Transport::Udp
    }
}
