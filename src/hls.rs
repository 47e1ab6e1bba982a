use crate::client::{ClientHandle, HlsClient};
use crate::config::Hls as HlsSettings;
use crate::errors::{HlsError, Result};
use crate::metrics::Metrics;
use crate::transport::{
    HlsReply, HlsRequest, PathManagerHandle, RequestReceiver, RequestSender, ServiceMessage,
    ServiceReceiver,
};
use crate::PathName;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Routes decoded requests to per-path clients, creating a client on the
/// first request for a path and dropping it when it announces its close.
pub struct Service {
    settings: HlsSettings,
    manager: PathManagerHandle,
    metrics: Arc<Metrics>,
    clients: HashMap<PathName, ClientHandle>,
    notify_tx: crate::transport::ServiceHandle,
    notify_rx: Option<ServiceReceiver>,
    next_client_id: u64,
}

enum Event {
    Request(HlsRequest),
    Notify(ServiceMessage),
    Stop,
}

impl Service {
    pub fn new(settings: HlsSettings, manager: PathManagerHandle, metrics: Arc<Metrics>) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            manager,
            metrics,
            clients: HashMap::new(),
            notify_tx,
            notify_rx: Some(notify_rx),
            next_client_id: 0,
        }
    }

    pub async fn run(mut self, mut requests: RequestReceiver, mut shutdown: oneshot::Receiver<()>) {
        let mut notify_rx = match self.notify_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let event = tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => Event::Request(req),
                    None => Event::Stop,
                },
                Some(msg) = notify_rx.recv() => Event::Notify(msg),
                _ = &mut shutdown => Event::Stop,
            };
            match event {
                Event::Request(req) => self.route(req),
                Event::Notify(msg) => self.process(msg),
                Event::Stop => break,
            }
        }

        // graceful shutdown: close every client, wait for their
        // acknowledgements, then release any dispatcher still blocked
        for handle in self.clients.values_mut() {
            handle.close();
        }
        while !self.clients.is_empty() {
            match notify_rx.recv().await {
                Some(msg) => self.process(msg),
                None => break,
            }
        }

        requests.close();
        while let Ok(req) = requests.try_recv() {
            let _ = req.responder.send(HlsReply::NotFound);
        }
    }

    fn route(&mut self, req: HlsRequest) {
        let path = req.path.clone();
        if !self.clients.contains_key(&path) {
            let client = self.new_client(&path);
            self.clients.insert(path.clone(), client);
        }

        let handle = self.clients.get(&path).unwrap();
        if let Err(req) = handle.on_request(req) {
            // the client drained between routing decisions; start a fresh one
            let client = self.new_client(&path);
            let _ = client.on_request(req);
            self.clients.insert(path, client);
        }
    }

    fn process(&mut self, msg: ServiceMessage) {
        match msg {
            ServiceMessage::ClientClose {
                client_id,
                path_name,
                done,
            } => {
                if self
                    .clients
                    .get(&path_name)
                    .map(|handle| handle.client_id() == client_id)
                    .unwrap_or(false)
                {
                    self.clients.remove(&path_name);
                }
                let _ = done.send(());
            }
        }
    }

    fn new_client(&mut self, path: &str) -> ClientHandle {
        self.next_client_id += 1;
        HlsClient::new(
            self.next_client_id,
            self.settings.clone(),
            path.to_string(),
            self.manager.clone(),
            self.notify_tx.clone(),
            self.metrics.clone(),
        )
    }
}

/// HTTP front door: decodes the URL into `(path, subpath)`, forwards the
/// request record and copies the replied bytes into the response.
pub async fn run_http_server(
    port: i32,
    requests: RequestSender,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr =
        format!("[::]:{}", port)
            .parse()
            .map_err(|e| HlsError::ConfigError {
                message: format!("invalid listen address: {}", e),
            })?;

    let make_service = make_service_fn(move |conn: &AddrStream| {
        let remote = conn.remote_addr();
        let requests = requests.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_http(req, remote, requests.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| HlsError::NetworkError {
            message: e.to_string(),
        })?
        .serve(make_service);
    log::info!("HLS listener opened on {}", addr);

    server
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await
        .map_err(|e| HlsError::NetworkError {
            message: e.to_string(),
        })
}

pub async fn handle_http(
    req: Request<Body>,
    remote: SocketAddr,
    requests: RequestSender,
) -> std::result::Result<Response<Body>, Infallible> {
    log::info!("{} {} from {}", req.method(), req.uri().path(), remote);

    let path = req.uri().path().trim_start_matches('/').to_string();
    if path.is_empty() || path == "favicon.ico" {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }

    let (path, subpath) = match path.split_once('/') {
        None => {
            let response = Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(hyper::header::LOCATION, format!("{}/", path))
                .body(Body::empty())
                .unwrap();
            return Ok(response);
        }
        Some((path, subpath)) => (path.to_string(), subpath.to_string()),
    };

    let (parts, _body) = req.into_parts();
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = HlsRequest {
        path,
        subpath,
        parts,
        remote,
        responder: reply_tx,
    };
    if requests.send(request).is_err() {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }

    // a dropped responder counts as a not-found reply
    let reply = reply_rx.await.unwrap_or(HlsReply::NotFound);
    Ok(reply_to_response(reply))
}

fn reply_to_response(reply: HlsReply) -> Response<Body> {
    match reply {
        HlsReply::Payload { content_type, body } => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap(),
        HlsReply::NotFound => status_response(StatusCode::NOT_FOUND),
        HlsReply::Unauthorized { realm } => {
            let mut builder = Response::builder().status(StatusCode::UNAUTHORIZED);
            if let Some(realm) = realm {
                builder = builder.header(
                    hyper::header::WWW_AUTHENTICATE,
                    format!("Basic realm=\"{}\"", realm),
                );
            }
            builder.body(Body::empty()).unwrap()
        }
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::request_channel;

    #[tokio::test]
    async fn test_redirect_without_trailing_slash() {
        let (tx, _rx) = request_channel();
        let req = Request::builder()
            .uri("/mypath")
            .body(Body::empty())
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let response = handle_http(req, remote, tx).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "mypath/"
        );
    }

    #[tokio::test]
    async fn test_empty_path_and_favicon() {
        for uri in ["/", "/favicon.ico"] {
            let (tx, _rx) = request_channel();
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let response = handle_http(req, remote, tx).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {}", uri);
        }
    }

    #[tokio::test]
    async fn test_forwards_path_and_subpath() {
        let (tx, mut rx) = request_channel();
        let req = Request::builder()
            .uri("/mypath/stream.m3u8")
            .body(Body::empty())
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let dispatcher = tokio::spawn(handle_http(req, remote, tx));

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.path, "mypath");
        assert_eq!(forwarded.subpath, "stream.m3u8");
        assert_eq!(forwarded.remote, remote);
        let _ = forwarded.responder.send(HlsReply::Payload {
            content_type: "application/vnd.apple.mpegurl",
            body: bytes::Bytes::from_static(b"#EXTM3U\n"),
        });

        let response = dispatcher.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"#EXTM3U\n");
    }

    #[tokio::test]
    async fn test_dropped_responder_releases_dispatcher() {
        let (tx, mut rx) = request_channel();
        let req = Request::builder()
            .uri("/mypath/nope.ts")
            .body(Body::empty())
            .unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let dispatcher = tokio::spawn(handle_http(req, remote, tx));

        let forwarded = rx.recv().await.unwrap();
        drop(forwarded.responder);

        let response = dispatcher.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unauthorized_reply_carries_realm() {
        let response = reply_to_response(HlsReply::Unauthorized {
            realm: Some("rtsp-simple-server"),
        });
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(hyper::header::WWW_AUTHENTICATE)
                .unwrap(),
            "Basic realm=\"rtsp-simple-server\""
        );
    }
}
