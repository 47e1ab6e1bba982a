use crate::auth::parse_ip_rules;
use crate::config::Settings;
use crate::errors::{HlsError, Result};
use crate::transport::{
    frame_channel, FrameSource, PathConf, PathManagerHandle, PathMessage, PathMessageReceiver,
    PlayReply, SetupPlayReply, Track,
};
use crate::PathName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct PathEntry {
    source: FrameSource,
    tracks: Vec<Track>,
}

/// Owns the published paths: which tracks each one carries and the broadcast
/// channel its frames flow through. Every operation arrives as a message
/// record with a oneshot reply channel.
pub struct PathManager {
    handle: PathManagerHandle,
    incoming: PathMessageReceiver,
    paths: HashMap<PathName, PathEntry>,
    conf: Arc<PathConf>,
    read_buffer_count: usize,
}

impl PathManager {
    pub fn new(settings: &Settings) -> Result<Self> {
        let (handle, incoming) = mpsc::unbounded_channel();
        let conf = Arc::new(PathConf {
            read_ips: parse_ip_rules(&settings.auth.read_ips)?,
            read_user: settings.auth.read_user.clone(),
            read_pass: settings.auth.read_pass.clone(),
        });

        Ok(Self {
            handle,
            incoming,
            paths: HashMap::new(),
            conf,
            read_buffer_count: settings.hls.read_buffer_count,
        })
    }

    pub fn handle(&self) -> PathManagerHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) {
        while let Some(message) = self.incoming.recv().await {
            self.process_message(message);
        }
    }

    fn process_message(&mut self, message: PathMessage) {
        match message {
            PathMessage::Publish {
                path_name,
                tracks,
                responder,
            } => {
                if self.paths.contains_key(&path_name) {
                    let _ = responder.send(Err(HlsError::PathAlreadyPublished { path_name }));
                    return;
                }
                let (source, _watcher) = frame_channel(self.read_buffer_count);
                log::info!("path '{}' published with {} track(s)", path_name, tracks.len());
                self.paths.insert(path_name, PathEntry {
                    source: source.clone(),
                    tracks,
                });
                let _ = responder.send(Ok(source));
            }
            PathMessage::Unpublish { path_name } => {
                if self.paths.remove(&path_name).is_some() {
                    log::info!("path '{}' unpublished", path_name);
                }
            }
            PathMessage::SetupPlay {
                path_name,
                responder,
            } => {
                let reply = match self.paths.get(&path_name) {
                    Some(entry) => Ok(SetupPlayReply {
                        tracks: entry.tracks.clone(),
                        conf: self.conf.clone(),
                    }),
                    None => Err(HlsError::PathNotFound { path_name }),
                };
                let _ = responder.send(reply);
            }
            PathMessage::Play {
                path_name,
                responder,
            } => {
                let reply = match self.paths.get(&path_name) {
                    Some(entry) => Ok(PlayReply {
                        watcher: entry.source.subscribe(),
                    }),
                    None => Err(HlsError::PathNotFound { path_name }),
                };
                let _ = responder.send(reply);
            }
            PathMessage::ClientRemove {
                path_name,
                responder,
            } => {
                log::debug!("reader removed from path '{}'", path_name);
                let _ = responder.send(());
            }
        }
    }
}
