use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, trace, warn};

use crate::core::{Error, Result};
use crate::protocol::message::next_message_id;
use crate::protocol::{CoapCodec, Message, MessageType, Method};
use crate::resource::{Request, ResourceTable};

const MAX_REQUEST_SIZE: usize = 1152;

struct Running {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// CoAP server answering requests from a [`ResourceTable`]
pub struct CoapServer {
    addr: SocketAddr,
    multicast_group: Option<IpAddr>,
    table: Arc<ResourceTable>,
    running: Mutex<Option<Running>>,
}

impl CoapServer {
    pub fn new(addr: SocketAddr, table: Arc<ResourceTable>) -> Self {
        CoapServer {
            addr,
            multicast_group: None,
            table,
            running: Mutex::new(None),
        }
    }

    /// Also receive requests sent to `group`
    pub fn with_multicast(mut self, group: IpAddr) -> Self {
        self.multicast_group = Some(group);
        self
    }

    pub fn table(&self) -> &Arc<ResourceTable> {
        &self.table
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Binds the socket and spawns the serving task
    ///
    /// Starting a running server is a no-op. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        let socket = self.bind()?;
        let local_addr = socket.local_addr()?;
        let table = Arc::clone(&self.table);
        let task = tokio::spawn(serve(socket, table));

        info!("CoAP server listening on {}", local_addr);
        *running = Some(Running { local_addr, task });
        Ok(local_addr)
    }

    /// Stops the serving task, returning whether it was running
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                running.task.abort();
                info!("CoAP server on {} stopped", running.local_addr);
                true
            }
            None => false,
        }
    }

    fn bind(&self) -> Result<UdpSocket> {
        let domain = match self.addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::transport(format!("Failed to create server socket: {}", e)))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.addr.into()).map_err(|e| {
            error!("Failed to bind CoAP server to {}, err {}", self.addr, e);
            Error::transport(format!("Failed to bind {}: {}", self.addr, e))
        })?;

        match (self.multicast_group, self.addr) {
            (Some(IpAddr::V4(group)), SocketAddr::V4(_)) => {
                if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                    warn!("Failed to join multicast group {}, err {}", group, e);
                }
            }
            (Some(IpAddr::V6(group)), SocketAddr::V6(_)) => {
                if let Err(e) = socket.join_multicast_v6(&group, 0) {
                    warn!("Failed to join multicast group {}, err {}", group, e);
                }
            }
            (Some(group), addr) => {
                warn!("Multicast group {} does not match server address family {}", group, addr);
            }
            (None, _) => {}
        }

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

impl Drop for CoapServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(socket: UdpSocket, table: Arc<ResourceTable>) {
    let message_ids = AtomicU16::new(next_message_id());
    let mut codec = CoapCodec::new();
    let mut recv_buffer = BytesMut::zeroed(MAX_REQUEST_SIZE);
    let mut send_buffer = BytesMut::new();

    loop {
        let (len, from) = match socket.recv_from(&mut recv_buffer).await {
            Ok(received) => received,
            Err(e) => {
                warn!("CoAP server receive failed: {}", e);
                continue;
            }
        };

        let mut datagram = BytesMut::from(&recv_buffer[..len]);
        let request = match codec.decode(&mut datagram) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", from, e);
                continue;
            }
        };

        let response = match respond(&table, &request, from, || message_ids.fetch_add(1, Ordering::Relaxed)) {
            Some(response) => response,
            None => continue,
        };

        send_buffer.clear();
        if let Err(e) = codec.encode(response, &mut send_buffer) {
            warn!("Failed to encode response to {}: {}", from, e);
            continue;
        }
        if let Err(e) = socket.send_to(&send_buffer, from).await {
            warn!("Failed to send response to {}: {}", from, e);
        }
    }
}

/// Builds the reply to one inbound message, if it needs one
fn respond(
    table: &ResourceTable,
    request: &Message,
    from: SocketAddr,
    next_id: impl FnOnce() -> u16,
) -> Option<Message> {
    match request.kind {
        MessageType::Acknowledgement | MessageType::Reset => return None,
        _ => {}
    }

    let method = match Method::from_code(request.code) {
        Some(method) => method,
        None if request.kind == MessageType::Confirmable => {
            // ping or a stray response
            return Some(Message::reset(request.message_id));
        }
        None => return None,
    };

    let path = request.path();
    trace!("{:?} {} from {}", method, path, from);
    let reply = table.dispatch(&Request {
        method,
        path: &path,
        payload: &request.payload,
        source: from,
    });

    let mut response = Message::response_to(request, reply.code, next_id());
    if let Some(format) = reply.format {
        response.set_content_format(format);
    }
    response.payload = reply.payload;
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExchangeConfig;
    use crate::network::ClientEndpoint;
    use crate::protocol::payload::StateDocument;
    use crate::protocol::{payload, Code, Token};
    use crate::resource::{Reply, Resource};

    struct Fixed;

    impl Resource for Fixed {
        fn get(&self, _request: &Request<'_>) -> Reply {
            Reply::json(&StateDocument::new(true))
        }
    }

    fn table() -> Arc<ResourceTable> {
        let table = Arc::new(ResourceTable::new());
        table.register("e0/state", Arc::new(Fixed)).unwrap();
        table
    }

    #[tokio::test]
    async fn test_serves_table() {
        let server = CoapServer::new("127.0.0.1:0".parse().unwrap(), table());
        let addr = server.start().unwrap();
        assert_eq!(server.start().unwrap(), addr);

        let client = ClientEndpoint::new(ExchangeConfig::default());
        client.set_addr(addr);

        let response = client.get("e0/state").await.unwrap();
        let doc: StateDocument = payload::decode(&response.into_content().unwrap()).unwrap();
        assert!(doc.is_on().unwrap());

        let listing = client.get(".well-known/core").await.unwrap();
        assert_eq!(&listing.payload[..], b"</e0/state>");

        let missing = client.get("nothing/here").await.unwrap();
        assert_eq!(missing.code, Code::NOT_FOUND);

        let wrong = client.put("e0/state", bytes::Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(wrong.code, Code::METHOD_NOT_ALLOWED);

        assert!(server.stop());
        assert!(!server.stop());
        assert!(!server.is_running());
    }

    #[test]
    fn test_respond_message_kinds() {
        let table = table();
        let from: SocketAddr = "127.0.0.1:1000".parse().unwrap();

        let non = Message::request(MessageType::NonConfirmable, Method::Get, 5, "e0/state");
        let response = respond(&table, &non, from, || 77).unwrap();
        assert_eq!(response.kind, MessageType::NonConfirmable);
        assert_eq!(response.message_id, 77);
        assert_eq!(response.token, non.token);

        let ping = Message::new(MessageType::Confirmable, Code::EMPTY, 9, Token::default());
        let response = respond(&table, &ping, from, || 0).unwrap();
        assert_eq!(response.kind, MessageType::Reset);
        assert_eq!(response.message_id, 9);

        assert!(respond(&table, &Message::empty_ack(3), from, || 0).is_none());
    }
}
