use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::core::{Error, ExchangeConfig, Result, DEFAULT_PORT};
use crate::protocol::message::{content_format, next_message_id, Block2};
use crate::protocol::{decode_datagram, Code, Message, MessageType, Method, Token};

/// Final outcome of a unicast exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub payload: Bytes,
    pub source: SocketAddr,
}

impl Response {
    /// Payload of a successful response, or the response code as an error
    pub fn into_content(self) -> Result<Bytes> {
        if self.code.is_success() {
            Ok(self.payload)
        } else {
            Err(Error::Response(self.code))
        }
    }
}

/// The exchange currently outstanding on an endpoint
struct PendingRequest {
    ticket: u64,
    path: String,
    /// Fired at most once, to cancel the waiting caller
    cancel: oneshot::Sender<()>,
}

/// Outbound path of a device: one server address plus the request machinery
///
/// At most one exchange is in flight; starting another cancels it first.
pub struct ClientEndpoint {
    addr: RwLock<Option<SocketAddr>>,
    pending: Mutex<Option<PendingRequest>>,
    tickets: AtomicU64,
    message_ids: AtomicU16,
    config: ExchangeConfig,
}

impl ClientEndpoint {
    pub fn new(config: ExchangeConfig) -> Self {
        ClientEndpoint {
            addr: RwLock::new(None),
            pending: Mutex::new(None),
            tickets: AtomicU64::new(0),
            message_ids: AtomicU16::new(next_message_id()),
            config,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read()
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        debug!("Client endpoint bound to {}", addr);
        *self.addr.write() = Some(addr);
    }

    pub fn set_ipv4(&self, ip: Ipv4Addr, port: u16) {
        self.set_addr(SocketAddr::new(IpAddr::V4(ip), port));
    }

    pub fn set_ipv6(&self, ip: Ipv6Addr, port: u16) {
        self.set_addr(SocketAddr::new(IpAddr::V6(ip), port));
    }

    /// Binds to a textual address on the default port
    pub fn set_ip_str(&self, ip: &str) -> Result<()> {
        let ip: IpAddr = ip
            .trim_end_matches('\0')
            .parse()
            .map_err(|e| Error::invalid_argument(format!("Invalid address {:?}: {}", ip, e)))?;
        self.set_addr(SocketAddr::new(ip, DEFAULT_PORT));
        Ok(())
    }

    pub fn clear_addr(&self) {
        *self.addr.write() = None;
    }

    /// Cancels the outstanding exchange, if any
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(pending) => {
                debug!("Cancelling pending request to {}", pending.path);
                let _ = pending.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.exchange(Method::Get, path, Bytes::new()).await
    }

    pub async fn put(&self, path: &str, payload: Bytes) -> Result<Response> {
        self.exchange(Method::Put, path, payload).await
    }

    /// Runs one confirmable request/response exchange
    ///
    /// Any exchange already outstanding on this endpoint is cancelled first.
    /// Non-success response codes are returned in the [`Response`].
    pub async fn exchange(&self, method: Method, path: &str, payload: Bytes) -> Result<Response> {
        let target = self
            .addr()
            .ok_or_else(|| Error::not_connected("client endpoint has no server address"))?;

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let previous = self.pending.lock().replace(PendingRequest {
            ticket,
            path: path.to_string(),
            cancel: cancel_tx,
        });
        if let Some(previous) = previous {
            debug!("Cancelling pending request to {}", previous.path);
            let _ = previous.cancel.send(());
        }

        let result = self
            .run_exchange(target, method, path, payload, &mut cancel_rx)
            .await;

        let mut pending = self.pending.lock();
        if pending.as_ref().map(|p| p.ticket) == Some(ticket) {
            *pending = None;
        }

        result
    }

    fn next_id(&self) -> u16 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn run_exchange(
        &self,
        target: SocketAddr,
        method: Method,
        path: &str,
        payload: Bytes,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<Response> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await.map_err(|e| {
            error!("Failed to create socket, err {}", e);
            Error::transport(format!("Failed to create socket: {}", e))
        })?;

        let token = Token::random();
        let mut body = BytesMut::new();
        let mut next_block: Option<Block2> = None;

        loop {
            let mut request = Message::new(MessageType::Confirmable, method.code(), self.next_id(), token);
            request.set_path(path);
            if let Some(block) = next_block {
                request.set_block2(block);
            }
            if !payload.is_empty() {
                request.set_content_format(content_format::TEXT_PLAIN);
                request.payload = payload.clone();
            }

            let (response, source) = self.transact(&socket, target, &request, cancel).await?;

            let block2 = response.block2()?;
            if block2.is_some() && body.len() + response.payload.len() > self.config.max_body_size {
                warn!("Block2 body of {} exceeds {} bytes", path, self.config.max_body_size);
                return Err(Error::protocol(format!(
                    "Block2 body larger than {} bytes",
                    self.config.max_body_size
                )));
            }

            match block2 {
                Some(block) if block.more && response.code == Code::CONTENT => {
                    debug!("Received block {} of {} ({} bytes)", block.num, path, response.payload.len());
                    body.extend_from_slice(&response.payload);
                    next_block = Some(Block2 {
                        num: block.num + 1,
                        more: false,
                        szx: block.szx,
                    });
                }
                _ => {
                    body.extend_from_slice(&response.payload);
                    return Ok(Response {
                        code: response.code,
                        payload: body.freeze(),
                        source,
                    });
                }
            }
        }
    }

    /// Sends `request` and waits for the message that completes it
    async fn transact(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        request: &Message,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<(Message, SocketAddr)> {
        let wire = request.to_bytes();
        send(socket, &wire, target).await?;

        let mut interval = self.config.ack_timeout;
        let mut retransmits = 0;
        let mut acknowledged = false;
        let mut deadline = Instant::now() + interval;
        let mut buf = vec![0u8; self.config.max_message_size];

        loop {
            tokio::select! {
                _ = &mut *cancel => {
                    return Err(Error::Cancelled);
                }

                _ = sleep_until(deadline) => {
                    if acknowledged {
                        return Err(Error::timeout(format!("no separate response from {}", target)));
                    }
                    if retransmits >= self.config.max_retransmit {
                        return Err(Error::timeout(format!(
                            "no response from {} after {} retransmissions",
                            target, retransmits
                        )));
                    }
                    retransmits += 1;
                    interval *= 2;
                    deadline = Instant::now() + interval;
                    debug!("Retransmitting request {} ({}/{})", request.message_id, retransmits, self.config.max_retransmit);
                    send(socket, &wire, target).await?;
                }

                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received
                        .map_err(|e| Error::transport(format!("Failed to receive response: {}", e)))?;
                    let message = match decode_datagram(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Failed to parse CoAP response from {}: {}", from, e);
                            continue;
                        }
                    };

                    match message.kind {
                        MessageType::Acknowledgement if message.message_id == request.message_id => {
                            if message.code.is_empty() {
                                acknowledged = true;
                                deadline = Instant::now() + self.config.response_timeout;
                            } else if message.token == request.token {
                                return Ok((message, from));
                            }
                        }
                        MessageType::Reset if message.message_id == request.message_id => {
                            return Err(Error::transport(format!("request reset by {}", from)));
                        }
                        MessageType::Confirmable | MessageType::NonConfirmable
                            if message.token == request.token && message.code.is_response() =>
                        {
                            if message.kind == MessageType::Confirmable {
                                send(socket, &Message::empty_ack(message.message_id).to_bytes(), from).await?;
                            }
                            return Ok((message, from));
                        }
                        _ => debug!("Ignoring unrelated message {} from {}", message.message_id, from),
                    }
                }
            }
        }
    }
}

async fn send(socket: &UdpSocket, wire: &[u8], target: SocketAddr) -> Result<()> {
    socket.send_to(wire, target).await.map_err(|e| {
        error!("Failed to send CoAP request, err {}", e);
        Error::transport(format!("Failed to send to {}: {}", target, e))
    })?;
    Ok(())
}
