use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error};

use crate::core::{Error, Result, WELL_KNOWN_CORE_PATH};
use crate::protocol::message::content_format;
use crate::protocol::{payload, Code, Method};

/// An inbound request as seen by a resource
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub payload: &'a [u8],
    pub source: SocketAddr,
}

/// What a resource answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub format: Option<u16>,
    pub payload: Bytes,
}

impl Reply {
    /// 2.05 with a JSON document
    pub fn json<T: Serialize>(document: &T) -> Self {
        match payload::encode(document) {
            Ok(body) => Reply {
                code: Code::CONTENT,
                format: Some(content_format::JSON),
                payload: body,
            },
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                Reply::status(Code::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// 2.04 without a body
    pub fn changed() -> Self {
        Reply::status(Code::CHANGED)
    }

    /// 2.05 with an empty body
    pub fn empty() -> Self {
        Reply::status(Code::CONTENT)
    }

    pub fn status(code: Code) -> Self {
        Reply {
            code,
            format: None,
            payload: Bytes::new(),
        }
    }

    pub fn link_format(listing: String) -> Self {
        Reply {
            code: Code::CONTENT,
            format: Some(content_format::LINK_FORMAT),
            payload: Bytes::from(listing),
        }
    }
}

/// Server-side handler bound to one path
///
/// Implementations carry their own typed context. Methods a resource does
/// not override answer 4.05.
pub trait Resource: Send + Sync {
    fn get(&self, _request: &Request<'_>) -> Reply {
        Reply::status(Code::METHOD_NOT_ALLOWED)
    }

    fn put(&self, _request: &Request<'_>) -> Reply {
        Reply::status(Code::METHOD_NOT_ALLOWED)
    }

    fn post(&self, _request: &Request<'_>) -> Reply {
        Reply::status(Code::METHOD_NOT_ALLOWED)
    }
}

/// Path to resource mapping shared by the server and its owners
#[derive(Default)]
pub struct ResourceTable {
    entries: RwLock<BTreeMap<String, Arc<dyn Resource>>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `resource` to `path`; a path can be bound only once
    pub fn register(&self, path: &str, resource: Arc<dyn Resource>) -> Result<()> {
        let path = normalize(path);
        if path.is_empty() || path == WELL_KNOWN_CORE_PATH {
            return Err(Error::invalid_argument(format!("cannot register resource at {:?}", path)));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&path) {
            return Err(Error::invalid_argument(format!("resource {} already registered", path)));
        }
        debug!("Registered resource {}", path);
        entries.insert(path, resource);
        Ok(())
    }

    pub fn unregister(&self, path: &str) -> bool {
        self.entries.write().remove(&normalize(path)).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.read().contains_key(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// CoRE link-format listing of every bound path
    pub fn link_listing(&self) -> String {
        self.entries
            .read()
            .keys()
            .map(|path| payload::core_link(path))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Routes a request to its resource
    pub fn dispatch(&self, request: &Request<'_>) -> Reply {
        let path = normalize(request.path);

        if path == WELL_KNOWN_CORE_PATH {
            return match request.method {
                Method::Get => Reply::link_format(self.link_listing()),
                _ => Reply::status(Code::METHOD_NOT_ALLOWED),
            };
        }

        let resource = match self.entries.read().get(&path) {
            Some(resource) => Arc::clone(resource),
            None => {
                debug!("No resource at {}", path);
                return Reply::status(Code::NOT_FOUND);
            }
        };

        match request.method {
            Method::Get => resource.get(request),
            Method::Put => resource.put(request),
            Method::Post => resource.post(request),
            Method::Delete => Reply::status(Code::METHOD_NOT_ALLOWED),
        }
    }
}

fn normalize(path: &str) -> String {
    crate::protocol::message::path_segments(path)
        .collect::<Vec<_>>()
        .join("/")
}
