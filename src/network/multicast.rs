use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout_at;
use tracing::{debug, error, trace, warn};

use crate::core::{Error, Result, MAX_PATH_LEN, MAX_PATH_SEGMENTS};
use crate::protocol::message::{content_format, next_message_id, path_segments};
use crate::protocol::{decode_datagram, Message, MessageType, Method};
use crate::util::{Deadline, Wait};
use super::pool::BufferPool;

/// Largest response datagram accepted while collecting
const MAX_RESPONSE_SIZE: usize = 1152;

/// Sends one non-confirmable request to a group and collects the answers
///
/// Each session holds one pool buffer for its whole lifetime, so the pool
/// size bounds the number of concurrent sessions.
pub struct MulticastEngine {
    pool: Arc<BufferPool>,
    group: SocketAddr,
    message_ids: AtomicU16,
}

impl MulticastEngine {
    pub fn new(pool: Arc<BufferPool>, group: SocketAddr) -> Self {
        MulticastEngine {
            pool,
            group,
            message_ids: AtomicU16::new(next_message_id()),
        }
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Sends `method path` with `payload` and feeds every response to `on_response`
    ///
    /// Collection runs until `wait` elapses, which is the normal way for a
    /// session to end. Returns the number of responses delivered.
    pub async fn send_and_collect<F>(
        &self,
        method: Method,
        path: &str,
        payload: &[u8],
        wait: Wait,
        mut on_response: F,
    ) -> Result<usize>
    where
        F: FnMut(&Message, SocketAddr),
    {
        check_path(path)?;

        let mut buf = self.pool.allocate()?;

        let id = self.message_ids.fetch_add(1, Ordering::Relaxed);
        let mut request = Message::request(MessageType::NonConfirmable, method, id, path);
        if !payload.is_empty() {
            request.set_content_format(content_format::JSON);
            request.payload = bytes::Bytes::copy_from_slice(payload);
        }
        let len = request.encode_into(&mut buf)?;

        let deadline = Deadline::start(wait);
        let socket = self.open_socket()?;
        socket.send_to(&buf[..len], self.group).await.map_err(|e| {
            error!("Failed to send multicast request to {}, err {}", self.group, e);
            Error::transport(format!("Failed to send multicast request: {}", e))
        })?;
        debug!("Multicast {:?} {} sent to {}", method, path, self.group);

        let mut received = 0;
        let mut recv_buf = vec![0u8; MAX_RESPONSE_SIZE];

        while !deadline.expired() {
            let result = match deadline.instant() {
                Some(end) => match timeout_at(end, socket.recv_from(&mut recv_buf)).await {
                    Ok(result) => result,
                    Err(_) => break,
                },
                None => socket.recv_from(&mut recv_buf).await,
            };

            let (n, from) = result
                .map_err(|e| Error::transport(format!("Failed to receive multicast response: {}", e)))?;

            let message = match decode_datagram(&recv_buf[..n]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Failed to parse multicast response from {}: {}", from, e);
                    continue;
                }
            };
            if message.token != request.token || !message.code.is_response() {
                trace!("Ignoring unrelated datagram from {}", from);
                continue;
            }

            received += 1;
            on_response(&message, from);
        }

        debug!("Multicast {} collected {} responses", path, received);
        Ok(received)
    }

    fn open_socket(&self) -> Result<UdpSocket> {
        let (domain, local): (Domain, SocketAddr) = match self.group {
            SocketAddr::V4(_) => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into()),
            SocketAddr::V6(_) => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into()),
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::transport(format!("Failed to create socket: {}", e)))?;
        if self.group.is_ipv4() {
            socket.set_multicast_loop_v4(true)?;
        } else {
            socket.set_multicast_loop_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&local.into())
            .map_err(|e| Error::transport(format!("Failed to bind socket: {}", e)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

/// Rejects paths the request cannot carry
pub fn check_path(path: &str) -> Result<()> {
    if path.len() > MAX_PATH_LEN {
        return Err(Error::PathTooLong {
            len: path.len(),
            max: MAX_PATH_LEN,
        });
    }
    let count = path_segments(path).count();
    if count > MAX_PATH_SEGMENTS {
        return Err(Error::TooManySegments {
            count,
            max: MAX_PATH_SEGMENTS,
        });
    }
    Ok(())
}
