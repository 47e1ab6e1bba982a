use crate::auth::IpRule;
use crate::errors::Result;
use crate::PathName;
use bytes::Bytes;
use hyper::http::request::Parts;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub type Responder<P> = oneshot::Sender<P>;

pub type TrackId = usize;

/// One RTP payload record as delivered by a source: the full RTP packet
/// (header included) of one track.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub track_id: TrackId,
    pub payload: Bytes,
}

/// Sending half of the ingestion ring. `send` never blocks; receivers that
/// fall behind skip the oldest records (`RecvError::Lagged`), and dropping
/// the source is the close a consumer observes as `RecvError::Closed`.
pub type FrameSource = broadcast::Sender<FramePacket>;
pub type FrameWatcher = broadcast::Receiver<FramePacket>;

pub fn frame_channel(capacity: usize) -> (FrameSource, FrameWatcher) {
    broadcast::channel(capacity)
}

/// Codec parameters a source registers for one track.
#[derive(Debug, Clone)]
pub enum TrackParams {
    H264 {
        sps: Bytes,
        pps: Bytes,
    },
    /// `config` is the MPEG-4 AudioSpecificConfig bytes.
    Aac {
        config: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub params: TrackParams,
}

/// Per-path configuration snapshot handed to readers at setup.
#[derive(Debug)]
pub struct PathConf {
    pub read_ips: Vec<IpRule>,
    pub read_user: String,
    pub read_pass: String,
}

pub enum PathMessage {
    Publish {
        path_name: PathName,
        tracks: Vec<Track>,
        responder: Responder<Result<FrameSource>>,
    },
    Unpublish {
        path_name: PathName,
    },
    SetupPlay {
        path_name: PathName,
        responder: Responder<Result<SetupPlayReply>>,
    },
    Play {
        path_name: PathName,
        responder: Responder<Result<PlayReply>>,
    },
    ClientRemove {
        path_name: PathName,
        responder: Responder<()>,
    },
}

pub struct SetupPlayReply {
    pub tracks: Vec<Track>,
    pub conf: Arc<PathConf>,
}

pub struct PlayReply {
    pub watcher: FrameWatcher,
}

pub type PathManagerHandle = mpsc::UnboundedSender<PathMessage>;
pub(crate) type PathMessageReceiver = mpsc::UnboundedReceiver<PathMessage>;

/// An HTTP request decoded by the dispatcher and routed to a client.
pub struct HlsRequest {
    pub path: PathName,
    pub subpath: String,
    pub parts: Parts,
    pub remote: SocketAddr,
    pub responder: Responder<HlsReply>,
}

/// Tagged reply record; the dispatcher turns it into the HTTP response.
/// Dropping the responder without a reply reads as `NotFound` so a blocked
/// dispatcher is always released.
#[derive(Debug)]
pub enum HlsReply {
    Payload {
        content_type: &'static str,
        body: Bytes,
    },
    NotFound,
    Unauthorized {
        realm: Option<&'static str>,
    },
}

pub type RequestSender = mpsc::UnboundedSender<HlsRequest>;
pub type RequestReceiver = mpsc::UnboundedReceiver<HlsRequest>;

pub fn request_channel() -> (RequestSender, RequestReceiver) {
    mpsc::unbounded_channel()
}

/// Notifications from clients back to the routing service. `client_id`
/// guards against removing a newer client that reused the path name.
pub enum ServiceMessage {
    ClientClose {
        client_id: u64,
        path_name: PathName,
        done: Responder<()>,
    },
}

pub type ServiceHandle = mpsc::UnboundedSender<ServiceMessage>;
pub type ServiceReceiver = mpsc::UnboundedReceiver<ServiceMessage>;
