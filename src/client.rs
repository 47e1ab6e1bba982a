use crate::auth;
use crate::codec::aac::{AacConfig, RtpAacDepacketizer};
use crate::codec::h264::{DtsEstimator, RtpH264Depacketizer, UnitType};
use crate::config::Hls as HlsSettings;
use crate::errors::{HlsError, Result};
use crate::metrics::Metrics;
use crate::segment::{SegmentNamer, SegmentWindow, TsSegment};
use crate::transport::{
    HlsReply, HlsRequest, PathManagerHandle, PathMessage, PlayReply, RequestReceiver,
    RequestSender, ServiceHandle, ServiceMessage, SetupPlayReply, TrackId, TrackParams,
};
use crate::PathName;
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Keeps every PTS positive and ahead of the estimated DTS during startup.
const PTS_OFFSET: Duration = Duration::from_secs(2);

/// An audio-only segment is never cut before this many access units.
const SEGMENT_MIN_AU_COUNT: usize = 100;

const CLOSE_CHECK_PERIOD: Duration = Duration::from_secs(1);

const BASIC_AUTH_REALM: &str = "rtsp-simple-server";

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
#video {
	width: 600px;
	height: 600px;
	background: black;
}
</style>
</head>
<body>

<script src="https://cdn.jsdelivr.net/npm/hls.js@1.0.0"></script>
<video id="video" muted controls></video>
<script>

const create = () => {
	const video = document.getElementById('video');

	const hls = new Hls({
		progressive: false,
	});

	hls.on(Hls.Events.ERROR, (evt, data) => {
		if (data.fatal) {
			hls.destroy();

			setTimeout(() => {
				create();
			}, 2000);
		}
	});

	hls.loadSource('stream.m3u8');
	hls.attachMedia(video);

	video.play();
}
create();

</script>

</body>
</html>
"#;

struct VideoTrackState {
    id: TrackId,
    sps: Bytes,
    pps: Bytes,
    depacketizer: RtpH264Depacketizer,
}

struct AudioTrackState {
    id: TrackId,
    config: AacConfig,
    depacketizer: RtpAacDepacketizer,
}

/// Consumes the ingestion ring, reassembles access units and writes them
/// into the current segment, rolling the window at cut points.
struct Writer {
    path_name: PathName,
    watcher: crate::transport::FrameWatcher,
    video: Option<VideoTrackState>,
    audio: Option<AudioTrackState>,
    window: Arc<Mutex<SegmentWindow>>,
    namer: SegmentNamer,
    cur: Arc<TsSegment>,
    segment_duration: Duration,
    start_pcr: Instant,
    video_buf: Vec<Bytes>,
    dts_estimator: DtsEstimator,
    audio_au_count: usize,
    metrics: Arc<Metrics>,
}

impl Writer {
    async fn run(mut self, stop: oneshot::Receiver<()>) -> Result<()> {
        let result = self.run_loop(stop).await;
        self.cur.close();
        result
    }

    async fn run_loop(&mut self, mut stop: oneshot::Receiver<()>) -> Result<()> {
        loop {
            let packet = tokio::select! {
                _ = &mut stop => return Ok(()),
                recv = self.watcher.recv() => match recv {
                    Ok(packet) => packet,
                    Err(RecvError::Closed) => return Err(HlsError::StreamClosed),
                    Err(RecvError::Lagged(count)) => {
                        self.metrics.frames_dropped(count);
                        continue;
                    }
                },
            };
            self.handle_packet(&packet)?;
        }
    }

    fn handle_packet(&mut self, packet: &crate::transport::FramePacket) -> Result<()> {
        if let Some(id) = self.video.as_ref().map(|v| v.id) {
            if packet.track_id == id {
                return self.handle_video(&packet.payload);
            }
        }
        if let Some(id) = self.audio.as_ref().map(|a| a.id) {
            if packet.track_id == id {
                return self.handle_audio(&packet.payload);
            }
        }
        Ok(())
    }

    fn handle_video(&mut self, payload: &Bytes) -> Result<()> {
        let decoded = {
            let video = self.video.as_mut().unwrap();
            video.depacketizer.decode(payload)
        };
        let (nalus, pts) = match decoded {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!(
                    "[client hls/{}] unable to decode video track: {}",
                    self.path_name,
                    e
                );
                return Ok(());
            }
        };

        let (sps, pps) = {
            let video = self.video.as_ref().unwrap();
            (video.sps.clone(), video.pps.clone())
        };
        for nalu in nalus {
            let kind = match UnitType::of(&nalu) {
                Ok(kind) => kind,
                Err(e) => {
                    log::warn!("[client hls/{}] {}", self.path_name, e);
                    continue;
                }
            };
            match kind {
                // parameter sets are re-inserted from the track config
                UnitType::SequenceParameterSet
                | UnitType::PictureParameterSet
                | UnitType::AccessUnitDelimiter => continue,
                UnitType::IdrPicture => {
                    self.video_buf.push(sps.clone());
                    self.video_buf.push(pps.clone());
                }
                _ => {}
            }
            self.video_buf.push(nalu);
        }

        // the RTP marker closes the access unit
        if payload.len() < 2 || (payload[1] >> 7) & 0x1 == 0 {
            return Ok(());
        }
        if self.video_buf.is_empty() {
            return Ok(());
        }

        let is_idr = self
            .video_buf
            .iter()
            .any(|nalu| matches!(UnitType::of(nalu), Ok(UnitType::IdrPicture)));

        if is_idr {
            if self.cur.first_written() && self.cur.age() >= self.segment_duration {
                self.roll_segment()?;
            }
        } else if !self.cur.first_written() {
            // a segment must start at an IDR
            self.video_buf.clear();
            return Ok(());
        }

        self.cur.set_pcr(self.start_pcr.elapsed())?;
        let pts = pts + PTS_OFFSET;
        let dts = self.dts_estimator.feed(pts);
        let nalus = std::mem::take(&mut self.video_buf);
        self.cur.write_h264(dts, pts, is_idr, &nalus)?;
        Ok(())
    }

    fn handle_audio(&mut self, payload: &Bytes) -> Result<()> {
        let decoded = {
            let audio = self.audio.as_mut().unwrap();
            audio.depacketizer.decode(payload)
        };
        let (aus, pts) = match decoded {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!(
                    "[client hls/{}] unable to decode audio track: {}",
                    self.path_name,
                    e
                );
                return Ok(());
            }
        };

        if self.video.is_some() {
            // video opens every segment; audio before that is dropped
            if !self.cur.first_written() {
                return Ok(());
            }
        } else if self.cur.first_written()
            && self.cur.age() >= self.segment_duration
            && self.audio_au_count >= SEGMENT_MIN_AU_COUNT
        {
            self.roll_segment()?;
            self.audio_au_count = 0;
        }

        let config = self.audio.as_ref().unwrap().config;
        for (i, au) in aus.iter().enumerate() {
            self.audio_au_count += 1;
            self.cur.set_pcr(self.start_pcr.elapsed())?;
            let au_pts = pts
                + Duration::from_nanos(i as u64 * 1_000_000_000 / config.sample_rate as u64)
                + PTS_OFFSET;
            self.cur.write_aac(&config, au_pts, au)?;
        }
        Ok(())
    }

    fn roll_segment(&mut self) -> Result<()> {
        self.cur.close();
        let segment = Arc::new(TsSegment::new(
            self.namer.next(),
            self.video.is_some(),
            self.audio.is_some(),
        )?);

        let evicted = self.window.lock().unwrap().append(segment.clone());
        if evicted.is_some() {
            self.metrics.segment_deleted();
        }
        self.metrics.segment_created();
        self.cur = segment;
        Ok(())
    }
}

/// Answers index, playlist and segment requests from the window the writer
/// is filling.
struct RequestHandler {
    path_name: PathName,
    window: Arc<Mutex<SegmentWindow>>,
    conf: Arc<crate::transport::PathConf>,
    last_request_time: Arc<AtomicI64>,
    segment_duration_secs: u64,
    metrics: Arc<Metrics>,
}

impl RequestHandler {
    async fn run(self, mut requests: RequestReceiver, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                req = requests.recv() => match req {
                    Some(req) => self.handle(req),
                    None => return,
                },
            }
        }

        // the request channel is closed exactly once, here; anything already
        // in flight still gets a reply so no dispatcher stays blocked
        requests.close();
        while let Ok(req) = requests.try_recv() {
            let _ = req.responder.send(HlsReply::NotFound);
        }
    }

    fn handle(&self, req: HlsRequest) {
        self.last_request_time
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.metrics.request_served();

        if !self.conf.read_ips.is_empty() {
            let ip = req.remote.ip();
            if !auth::ip_allowed(ip, &self.conf.read_ips) {
                log::info!("[client hls/{}] ERR: ip '{}' not allowed", self.path_name, ip);
                let _ = req.responder.send(HlsReply::Unauthorized { realm: None });
                return;
            }
        }

        if !self.conf.read_user.is_empty() {
            let header = req
                .parts
                .headers
                .get(hyper::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !auth::check_basic_auth(header, &self.conf.read_user, &self.conf.read_pass) {
                let _ = req.responder.send(HlsReply::Unauthorized {
                    realm: Some(BASIC_AUTH_REALM),
                });
                return;
            }
        }

        let reply = match req.subpath.as_str() {
            "" => HlsReply::Payload {
                content_type: "text/html",
                body: Bytes::from_static(INDEX_PAGE.as_bytes()),
            },
            "stream.m3u8" => {
                let window = self.window.lock().unwrap();
                if window.is_empty() {
                    HlsReply::NotFound
                } else {
                    let (names, deleted) = window.snapshot();
                    drop(window);
                    HlsReply::Payload {
                        content_type: "application/vnd.apple.mpegurl",
                        body: Bytes::from(render_playlist(
                            &names,
                            deleted,
                            self.segment_duration_secs,
                        )),
                    }
                }
            }
            subpath if subpath.ends_with(".ts") => {
                let name = subpath.trim_end_matches(".ts");
                let segment = self.window.lock().unwrap().lookup(name);
                match segment {
                    Some(segment) => HlsReply::Payload {
                        content_type: "video/mp2t",
                        body: segment.reader(),
                    },
                    None => HlsReply::NotFound,
                }
            }
            _ => HlsReply::NotFound,
        };
        let _ = req.responder.send(reply);
    }
}

fn render_playlist(names: &[String], deleted_count: u64, target_duration: u64) -> String {
    let mut cnt = String::from("#EXTM3U\n");
    cnt += "#EXT-X-VERSION:3\n";
    cnt += "#EXT-X-ALLOW-CACHE:NO\n";
    cnt += &format!("#EXT-X-TARGETDURATION:{}\n", target_duration);
    cnt += &format!("#EXT-X-MEDIA-SEQUENCE:{}\n", deleted_count);
    for name in names {
        cnt += &format!("#EXTINF:{},\n", target_duration);
        cnt += &format!("{}.ts\n", name);
    }
    cnt
}

/// Handle the routing service keeps per client.
pub struct ClientHandle {
    client_id: u64,
    request: RequestSender,
    terminate: Option<oneshot::Sender<()>>,
}

impl ClientHandle {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Forwards a request; the request comes back when the client is gone.
    pub fn on_request(&self, req: HlsRequest) -> std::result::Result<(), HlsRequest> {
        self.request.send(req).map_err(|e| e.0)
    }

    /// One-shot external close signal.
    pub fn close(&mut self) {
        if let Some(terminate) = self.terminate.take() {
            let _ = terminate.send(());
        }
    }
}

enum DrainReason {
    Inactivity,
    WriterDone(Result<()>),
    Terminate,
}

/// One HLS client: created on the first request for a path, attaches to the
/// path, runs its writer and request handler, and tears everything down on
/// inactivity, writer failure or an external close.
pub struct HlsClient {
    client_id: u64,
    settings: HlsSettings,
    path_name: PathName,
    manager: PathManagerHandle,
    service: ServiceHandle,
    metrics: Arc<Metrics>,
    last_request_time: Arc<AtomicI64>,
}

impl HlsClient {
    pub fn new(
        client_id: u64,
        settings: HlsSettings,
        path_name: PathName,
        manager: PathManagerHandle,
        service: ServiceHandle,
        metrics: Arc<Metrics>,
    ) -> ClientHandle {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let client = Self {
            client_id,
            settings,
            path_name,
            manager,
            service,
            metrics,
            last_request_time: Arc::new(AtomicI64::new(Utc::now().timestamp())),
        };
        tokio::spawn(client.run(request_rx, terminate_rx));

        ClientHandle {
            client_id,
            request: request_tx,
            terminate: Some(terminate_tx),
        }
    }

    async fn run(self, request_rx: RequestReceiver, terminate_rx: oneshot::Receiver<()>) {
        self.metrics.client_connected();
        log::info!("[client hls/{}] connected (HLS)", self.path_name);

        self.run_inner(request_rx, terminate_rx).await;

        log::info!("[client hls/{}] disconnected", self.path_name);
        self.metrics.client_disconnected();
    }

    async fn run_inner(
        &self,
        request_rx: RequestReceiver,
        mut terminate_rx: oneshot::Receiver<()>,
    ) {
        let (video, audio, conf) = match self.setup().await {
            Ok(state) => state,
            Err((err, attached)) => {
                return self.run_setup_failed(err, attached, request_rx).await;
            }
        };

        let mut namer = SegmentNamer::new();
        let first = match TsSegment::new(namer.next(), video.is_some(), audio.is_some()) {
            Ok(segment) => Arc::new(segment),
            Err(err) => {
                return self.run_setup_failed(err, true, request_rx).await;
            }
        };
        let window = Arc::new(Mutex::new(SegmentWindow::new(self.settings.segment_count)));
        window.lock().unwrap().append(first.clone());
        self.metrics.segment_created();

        let handler = RequestHandler {
            path_name: self.path_name.clone(),
            window: window.clone(),
            conf,
            last_request_time: self.last_request_time.clone(),
            segment_duration_secs: self.settings.segment_duration,
            metrics: self.metrics.clone(),
        };
        let (handler_stop_tx, handler_stop_rx) = oneshot::channel();
        let handler_handle = tokio::spawn(handler.run(request_rx, handler_stop_rx));

        let PlayReply { watcher } = match self.play().await {
            Ok(reply) => reply,
            Err(err) => {
                log::info!("[client hls/{}] ERR: {}", self.path_name, err);
                self.client_remove().await;
                let _ = handler_stop_tx.send(());
                let _ = handler_handle.await;
                return self.notify_close().await;
            }
        };

        let writer = Writer {
            path_name: self.path_name.clone(),
            watcher,
            video,
            audio,
            window,
            namer,
            cur: first,
            segment_duration: Duration::from_secs(self.settings.segment_duration),
            start_pcr: Instant::now(),
            video_buf: Vec::new(),
            dts_estimator: DtsEstimator::new(),
            audio_au_count: 0,
            metrics: self.metrics.clone(),
        };
        let (writer_stop_tx, writer_stop_rx) = oneshot::channel();
        let mut writer_handle: JoinHandle<Result<()>> = tokio::spawn(writer.run(writer_stop_rx));

        log::info!(
            "[client hls/{}] is reading from path '{}'",
            self.path_name,
            self.path_name
        );

        let mut ticker = interval(CLOSE_CHECK_PERIOD);
        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let last = self.last_request_time.load(Ordering::Relaxed);
                    let idle = Utc::now().timestamp() - last;
                    if idle >= self.settings.close_after_inactivity as i64 {
                        log::info!("[client hls/{}] closing due to inactivity", self.path_name);
                        break DrainReason::Inactivity;
                    }
                }
                res = &mut writer_handle => {
                    let result = match res {
                        Ok(result) => result,
                        Err(e) => Err(HlsError::InternalError { message: e.to_string() }),
                    };
                    break DrainReason::WriterDone(result);
                }
                _ = &mut terminate_rx => break DrainReason::Terminate,
            }
        };

        // draining, in order: writer, path, request handler, parent
        let writer_result = match reason {
            DrainReason::WriterDone(result) => result,
            _ => {
                let _ = writer_stop_tx.send(());
                match writer_handle.await {
                    Ok(result) => result,
                    Err(e) => Err(HlsError::InternalError {
                        message: e.to_string(),
                    }),
                }
            }
        };
        if let Err(err) = writer_result {
            log::info!("[client hls/{}] ERR: {}", self.path_name, err);
        }

        self.client_remove().await;

        let _ = handler_stop_tx.send(());
        let _ = handler_handle.await;

        self.notify_close().await;
    }

    /// Requests the path's tracks and validates them: at most one H.264 and
    /// one AAC track, with usable codec parameters. The flag reports whether
    /// the path was reached, so the caller knows to detach.
    async fn setup(
        &self,
    ) -> std::result::Result<
        (
            Option<VideoTrackState>,
            Option<AudioTrackState>,
            Arc<crate::transport::PathConf>,
        ),
        (HlsError, bool),
    > {
        let (tx, rx) = oneshot::channel();
        self.manager
            .send(PathMessage::SetupPlay {
                path_name: self.path_name.clone(),
                responder: tx,
            })
            .map_err(|e| (HlsError::from(e), false))?;
        let SetupPlayReply { tracks, conf } = match rx.await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err((err, false)),
            Err(e) => {
                return Err((
                    HlsError::InternalError {
                        message: e.to_string(),
                    },
                    false,
                ))
            }
        };

        let mut video = None;
        let mut audio = None;
        for (i, track) in tracks.iter().enumerate() {
            match &track.params {
                TrackParams::H264 { sps, pps } => {
                    if video.is_some() {
                        return Err((HlsError::TooManyTracks { index: i + 1 }, true));
                    }
                    if sps.is_empty() || pps.is_empty() {
                        return Err((
                            HlsError::CodecError {
                                message: "missing SPS/PPS".to_string(),
                            },
                            true,
                        ));
                    }
                    video = Some(VideoTrackState {
                        id: track.id,
                        sps: sps.clone(),
                        pps: pps.clone(),
                        depacketizer: RtpH264Depacketizer::new(),
                    });
                }
                TrackParams::Aac { config } => {
                    if audio.is_some() {
                        return Err((HlsError::TooManyTracks { index: i + 1 }, true));
                    }
                    let config = match AacConfig::decode(config) {
                        Ok(config) => config,
                        Err(e) => return Err((e.into(), true)),
                    };
                    audio = Some(AudioTrackState {
                        id: track.id,
                        depacketizer: RtpAacDepacketizer::new(config.sample_rate),
                        config,
                    });
                }
            }
        }

        if video.is_none() && audio.is_none() {
            return Err((HlsError::NoMediaTracks, true));
        }
        Ok((video, audio, conf))
    }

    async fn play(&self) -> Result<PlayReply> {
        let (tx, rx) = oneshot::channel();
        self.manager.send(PathMessage::Play {
            path_name: self.path_name.clone(),
            responder: tx,
        })?;
        rx.await.map_err(|e| HlsError::InternalError {
            message: e.to_string(),
        })?
    }

    async fn run_setup_failed(&self, err: HlsError, attached: bool, request_rx: RequestReceiver) {
        log::info!("[client hls/{}] ERR: {}", self.path_name, err);
        if attached {
            self.client_remove().await;
        }
        self.finish_answering(request_rx).await;
    }

    /// Notifies the parent and keeps answering 404 until it acknowledges;
    /// used when no request-handler task was ever started.
    async fn finish_answering(&self, mut request_rx: RequestReceiver) {
        let (done_tx, mut done_rx) = oneshot::channel();
        let sent = self
            .service
            .send(ServiceMessage::ClientClose {
                client_id: self.client_id,
                path_name: self.path_name.clone(),
                done: done_tx,
            })
            .is_ok();
        if sent {
            loop {
                tokio::select! {
                    _ = &mut done_rx => break,
                    Some(req) = request_rx.recv() => {
                        let _ = req.responder.send(HlsReply::NotFound);
                    }
                }
            }
        }
        request_rx.close();
        while let Ok(req) = request_rx.try_recv() {
            let _ = req.responder.send(HlsReply::NotFound);
        }
    }

    async fn notify_close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .service
            .send(ServiceMessage::ClientClose {
                client_id: self.client_id,
                path_name: self.path_name.clone(),
                done: done_tx,
            })
            .is_ok();
        if sent {
            let _ = done_rx.await;
        }
    }

    async fn client_remove(&self) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .manager
            .send(PathMessage::ClientRemove {
                path_name: self.path_name.clone(),
                responder: tx,
            })
            .is_ok();
        if sent {
            let _ = rx.await;
        }
    }
}
