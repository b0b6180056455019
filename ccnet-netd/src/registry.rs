//! The server registry: one HTTP handler and/or one WS handler per port.
//!
//! Both roles may share a port; each role is exactly-one. Handlers run as
//! continuations on the daemon task, so they must not block; long work
//! belongs in the future an HTTP handler returns.

use core::future::Future;
use core::pin::Pin;

use std::collections::HashMap;
use std::sync::Arc;

use embassy_time::Instant;

use ccnet_link::NodeId;
use ccnet_proto::msg::Service;

use crate::{HttpRequest, HttpResponse, NetError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An HTTP handler: takes the request, returns a future for the response.
/// The daemon drives these futures concurrently and correlates replies by
/// request id, so a slow handler delays only its own response.
pub type HttpHandler = Arc<dyn Fn(HttpRequest) -> BoxFuture<HttpResponse> + Send + Sync>;

/// Wraps an async closure into an [`HttpHandler`].
pub fn http_handler<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Lifecycle and traffic events delivered to a WS handler.
#[derive(Clone, Debug)]
pub enum WsEvent {
    Open { connection_id: String, peer: NodeId },
    Message { connection_id: String, data: String },
    Closed { connection_id: String },
}

/// A WS handler: invoked inline per event, replies through the supplied
/// [`WsSender`].
pub type WsHandler = Arc<dyn Fn(WsEvent, &WsSender) + Send + Sync>;

/// Sends data frames on an established server-side connection. Frames are
/// enqueued to the daemon; a full queue drops the frame.
#[derive(Clone)]
pub struct WsSender {
    connection_id: String,
    post: Arc<dyn Fn(&str, String) + Send + Sync>,
}

impl WsSender {
    pub(crate) fn new(
        connection_id: String,
        post: Arc<dyn Fn(&str, String) + Send + Sync>,
    ) -> Self {
        Self {
            connection_id,
            post,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn send(&self, data: impl Into<String>) {
        (self.post)(&self.connection_id, data.into());
    }
}

#[derive(Default)]
struct PortServers {
    http: Option<HttpHandler>,
    ws: Option<WsHandler>,
    #[allow(dead_code)]
    created: Option<Instant>,
}

/// port → handlers.
#[derive(Default)]
pub struct ServerRegistry {
    map: HashMap<u16, PortServers>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_http(&mut self, port: u16, handler: HttpHandler) -> Result<(), NetError> {
        let entry = self.map.entry(port).or_default();
        if entry.http.is_some() {
            return Err(NetError::AddrInUse);
        }

        entry.http = Some(handler);
        entry.created.get_or_insert_with(Instant::now);

        Ok(())
    }

    pub fn register_ws(&mut self, port: u16, handler: WsHandler) -> Result<(), NetError> {
        let entry = self.map.entry(port).or_default();
        if entry.ws.is_some() {
            return Err(NetError::AddrInUse);
        }

        entry.ws = Some(handler);
        entry.created.get_or_insert_with(Instant::now);

        Ok(())
    }

    /// Removes both roles on `port`. Returns whether anything was bound.
    pub fn unregister(&mut self, port: u16) -> bool {
        self.map.remove(&port).is_some()
    }

    pub fn http(&self, port: u16) -> Option<HttpHandler> {
        self.map.get(&port).and_then(|entry| entry.http.clone())
    }

    pub fn ws(&self, port: u16) -> Option<WsHandler> {
        self.map.get(&port).and_then(|entry| entry.ws.clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// What this node announces: one service entry per bound role.
    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .map
            .iter()
            .flat_map(|(port, entry)| {
                entry
                    .http
                    .is_some()
                    .then(|| Service {
                        name: "http".into(),
                        port: *port,
                    })
                    .into_iter()
                    .chain(entry.ws.is_some().then(|| Service {
                        name: "ws".into(),
                        port: *port,
                    }))
            })
            .collect();

        services.sort_by(|a, b| (a.port, &a.name).cmp(&(b.port, &b.name)));

        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_http() -> HttpHandler {
        http_handler(|_req| async { HttpResponse::ok("") })
    }

    fn noop_ws() -> WsHandler {
        Arc::new(|_event, _sender| {})
    }

    #[test]
    fn one_handler_per_role_per_port() {
        let mut registry = ServerRegistry::new();

        registry.register_http(80, noop_http()).unwrap();
        assert_eq!(
            registry.register_http(80, noop_http()),
            Err(NetError::AddrInUse)
        );

        // the WS role on the same port is independent
        registry.register_ws(80, noop_ws()).unwrap();
        assert_eq!(registry.register_ws(80, noop_ws()), Err(NetError::AddrInUse));

        assert!(registry.http(80).is_some());
        assert!(registry.ws(80).is_some());
    }

    #[test]
    fn unregister_clears_both_roles() {
        let mut registry = ServerRegistry::new();

        registry.register_http(80, noop_http()).unwrap();
        registry.register_ws(80, noop_ws()).unwrap();

        assert!(registry.unregister(80));
        assert!(!registry.unregister(80));
        assert!(registry.http(80).is_none());
        assert!(registry.ws(80).is_none());
    }

    #[test]
    fn services_lists_each_bound_role() {
        let mut registry = ServerRegistry::new();

        registry.register_http(80, noop_http()).unwrap();
        registry.register_ws(8080, noop_ws()).unwrap();

        let services = registry.services();

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "http");
        assert_eq!(services[0].port, 80);
        assert_eq!(services[1].name, "ws");
        assert_eq!(services[1].port, 8080);
    }
}
