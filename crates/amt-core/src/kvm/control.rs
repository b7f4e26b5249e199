//! Control sub-protocol carried as text frames on the tunnel data channel.

use super::files::{join_path, LocalFiles};
use super::frame::{classify, Chunk, ControlFrame};
use super::peer::DataChannel;
use super::platform::{Platform, SessionLocker};
use super::transfer::{DownloadContext, UploadContext};
use crate::error::TunnelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::rc::Rc;
use tracing::{debug, warn};

/// Chunks pushed back-to-back when the console acknowledges a download.
pub const DOWNLOAD_WINDOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadCommand {
    Start,
    Startack,
    Ack,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadCommand {
    Start,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlRequest {
    Ping,
    Lock,
    Ls {
        #[serde(default)]
        path: String,
        #[serde(default)]
        reqid: Option<Value>,
    },
    Mkdir {
        path: String,
    },
    Rm {
        path: String,
        #[serde(default)]
        delfiles: Vec<String>,
    },
    Rename {
        path: String,
        oldname: String,
        newname: String,
    },
    Copy {
        scpath: String,
        dspath: String,
        #[serde(default)]
        names: Vec<String>,
    },
    Move {
        scpath: String,
        dspath: String,
        #[serde(default)]
        names: Vec<String>,
    },
    Download {
        sub: DownloadCommand,
        #[serde(default)]
        id: Value,
        #[serde(default)]
        path: String,
    },
    Upload {
        sub: UploadCommand,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        reqid: Option<Value>,
    },
}

impl ControlRequest {
    pub fn parse(text: &str) -> Result<Self, TunnelError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Roots every path the request carries.
    pub fn normalize_paths(&mut self, platform: Platform) {
        let fix = |p: &mut String| *p = platform.normalize_path(p);
        match self {
            ControlRequest::Ls { path, .. }
            | ControlRequest::Mkdir { path }
            | ControlRequest::Rm { path, .. }
            | ControlRequest::Rename { path, .. }
            | ControlRequest::Download { path, .. } => fix(path),
            ControlRequest::Copy { scpath, dspath, .. }
            | ControlRequest::Move { scpath, dspath, .. } => {
                fix(scpath);
                fix(dspath);
            }
            ControlRequest::Upload { path, .. } => {
                if let Some(p) = path.as_mut().filter(|p| !p.is_empty()) {
                    fix(p);
                }
            }
            ControlRequest::Ping | ControlRequest::Lock => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadReply {
    Start,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadReply {
    Start,
    Error,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlReply {
    Pong,
    Download {
        sub: DownloadReply,
        id: Value,
    },
    Upload {
        sub: UploadReply,
        #[serde(skip_serializing_if = "Option::is_none")]
        reqid: Option<Value>,
    },
}

/// Per-tunnel control state: at most one download and one upload in flight.
pub struct ControlSession {
    platform: Platform,
    files: Rc<LocalFiles>,
    locker: Rc<dyn SessionLocker>,
    download: Option<DownloadContext>,
    upload: Option<UploadContext>,
}

impl ControlSession {
    pub fn new(platform: Platform, files: Rc<LocalFiles>, locker: Rc<dyn SessionLocker>) -> Self {
        Self {
            platform,
            files,
            locker,
            download: None,
            upload: None,
        }
    }

    pub fn download_active(&self) -> bool {
        self.download.is_some()
    }

    pub fn upload_active(&self) -> bool {
        self.upload.is_some()
    }

    /// Drops any in-flight transfer, closing its file.
    pub fn close_transfers(&mut self) {
        self.download = None;
        self.upload = None;
    }

    pub fn handle_frame(&mut self, channel: &mut dyn DataChannel, frame: &str) {
        match classify(frame) {
            ControlFrame::Chunk(data) => self.on_upload_chunk(channel, data),
            ControlFrame::Json(text) => {
                debug!(frame = text, "control frame");
                let mut request = match ControlRequest::parse(text) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(error = %e, "invalid control frame");
                        return;
                    }
                };
                request.normalize_paths(self.platform);
                self.dispatch(channel, request);
            }
        }
    }

    fn dispatch(&mut self, channel: &mut dyn DataChannel, request: ControlRequest) {
        match request {
            ControlRequest::Ping => send(channel, &ControlReply::Pong),
            ControlRequest::Lock => {
                if let Err(e) = self.locker.lock() {
                    warn!(error = %e, "failed to lock session");
                }
            }
            ControlRequest::Ls { path, reqid } => {
                let mut listing = self.files.list(&path);
                listing.reqid = reqid;
                send(channel, &listing);
            }
            ControlRequest::Mkdir { path } => self.files.make_dir(&path),
            ControlRequest::Rm { path, delfiles } => self.files.remove(&path, &delfiles),
            ControlRequest::Rename {
                path,
                oldname,
                newname,
            } => self.files.rename(&path, &oldname, &newname),
            ControlRequest::Copy {
                scpath,
                dspath,
                names,
            } => self.files.transfer(&scpath, &dspath, &names, false),
            ControlRequest::Move {
                scpath,
                dspath,
                names,
            } => self.files.transfer(&scpath, &dspath, &names, true),
            ControlRequest::Download { sub, id, path } => self.on_download(channel, sub, id, &path),
            ControlRequest::Upload {
                sub,
                path,
                name,
                reqid,
            } => self.on_upload(channel, sub, path, name, reqid),
        }
    }

    fn on_download(
        &mut self,
        channel: &mut dyn DataChannel,
        sub: DownloadCommand,
        id: Value,
        path: &str,
    ) {
        let window = match sub {
            DownloadCommand::Start => {
                if let Some(old) = self.download.take() {
                    send(
                        channel,
                        &ControlReply::Download {
                            sub: DownloadReply::Cancel,
                            id: old.id,
                        },
                    );
                }
                match DownloadContext::open(id.clone(), &self.files.resolve(path)) {
                    Ok(ctx) => {
                        self.download = Some(ctx);
                        send(
                            channel,
                            &ControlReply::Download {
                                sub: DownloadReply::Start,
                                id,
                            },
                        );
                    }
                    Err(e) => {
                        debug!(path, error = %e, "download open failed");
                        send(
                            channel,
                            &ControlReply::Download {
                                sub: DownloadReply::Cancel,
                                id,
                            },
                        );
                    }
                }
                0
            }
            _ if self.download.as_ref().map(|d| d.id != id).unwrap_or(true) => 0,
            DownloadCommand::Startack => DOWNLOAD_WINDOW,
            DownloadCommand::Ack => 1,
            DownloadCommand::Stop => {
                self.download = None;
                0
            }
        };
        for _ in 0..window {
            if !self.send_next_chunk(channel) {
                break;
            }
        }
    }

    /// Returns false once the download is finished or aborted.
    fn send_next_chunk(&mut self, channel: &mut dyn DataChannel) -> bool {
        let Some(ctx) = self.download.as_mut() else {
            return false;
        };
        match ctx.next_chunk() {
            Ok(chunk) => {
                let last = chunk.header.is_final();
                if let Err(e) = channel.write_text(&chunk.encode()) {
                    warn!(error = %e, "failed to write download chunk");
                }
                if last {
                    debug!(bytes = ctx.sent(), "download complete");
                    self.download = None;
                }
                !last
            }
            Err(e) => {
                warn!(error = %e, "download read failed");
                if let Some(old) = self.download.take() {
                    send(
                        channel,
                        &ControlReply::Download {
                            sub: DownloadReply::Cancel,
                            id: old.id,
                        },
                    );
                }
                false
            }
        }
    }

    fn on_upload(
        &mut self,
        channel: &mut dyn DataChannel,
        sub: UploadCommand,
        path: Option<String>,
        name: Option<String>,
        reqid: Option<Value>,
    ) {
        match sub {
            UploadCommand::Start => {
                self.upload = None;
                let (Some(path), Some(name)) = (
                    path.filter(|p| !p.is_empty()),
                    name.filter(|n| !n.is_empty()),
                ) else {
                    return;
                };
                let target = self.files.resolve(&join_path(&[&path, &name]));
                match UploadContext::create(reqid.clone(), &target) {
                    Ok(ctx) => {
                        self.upload = Some(ctx);
                        send(
                            channel,
                            &ControlReply::Upload {
                                sub: UploadReply::Start,
                                reqid,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(path = %target.display(), error = %e, "upload open failed");
                        send(
                            channel,
                            &ControlReply::Upload {
                                sub: UploadReply::Error,
                                reqid,
                            },
                        );
                    }
                }
            }
            UploadCommand::Cancel => self.upload = None,
        }
    }

    fn on_upload_chunk(&mut self, channel: &mut dyn DataChannel, data: &str) {
        let Some(upload) = self.upload.as_mut() else {
            return;
        };
        let chunk = match Chunk::decode(data) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "undecodable upload chunk");
                return;
            }
        };
        if let Err(e) = upload.write(&chunk.payload) {
            warn!(error = %e, "upload write failed, abandoning upload");
            let reqid = upload.reqid.clone();
            self.upload = None;
            send(
                channel,
                &ControlReply::Upload {
                    sub: UploadReply::Error,
                    reqid,
                },
            );
            return;
        }
        send(
            channel,
            &ControlReply::Upload {
                sub: UploadReply::Ack,
                reqid: upload.reqid.clone(),
            },
        );
        if chunk.header.is_final() {
            self.upload = None;
        }
    }
}

fn send<T: Serialize>(channel: &mut dyn DataChannel, message: &T) {
    let result = serde_json::to_string(message)
        .map_err(TunnelError::from)
        .and_then(|text| channel.write_text(&text));
    if let Err(e) = result {
        warn!(error = %e, "failed to write control reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_parse_by_action() {
        assert_eq!(
            ControlRequest::parse(r#"{"action":"ping"}"#).unwrap(),
            ControlRequest::Ping
        );
        let req =
            ControlRequest::parse(r#"{"action":"download","sub":"startack","id":7}"#).unwrap();
        assert_eq!(
            req,
            ControlRequest::Download {
                sub: DownloadCommand::Startack,
                id: json!(7),
                path: String::new(),
            }
        );
        assert!(ControlRequest::parse(r#"{"action":"format"}"#).is_err());
    }

    #[test]
    fn paths_are_rooted_off_windows() {
        let mut req = ControlRequest::parse(r#"{"action":"ls","path":"a/b"}"#).unwrap();
        req.normalize_paths(Platform::Linux);
        assert_eq!(
            req,
            ControlRequest::Ls {
                path: "/a/b".to_string(),
                reqid: None
            }
        );
        let mut req =
            ControlRequest::parse(r#"{"action":"copy","scpath":"x","dspath":"/y","names":[]}"#)
                .unwrap();
        req.normalize_paths(Platform::Linux);
        assert_eq!(
            req,
            ControlRequest::Copy {
                scpath: "/x".to_string(),
                dspath: "/y".to_string(),
                names: vec![],
            }
        );
    }

    #[test]
    fn replies_match_wire_shape() {
        assert_eq!(
            serde_json::to_value(ControlReply::Pong).unwrap(),
            json!({"action": "pong"})
        );
        assert_eq!(
            serde_json::to_value(ControlReply::Download {
                sub: DownloadReply::Cancel,
                id: json!("d1"),
            })
            .unwrap(),
            json!({"action": "download", "sub": "cancel", "id": "d1"})
        );
        assert_eq!(
            serde_json::to_value(ControlReply::Upload {
                sub: UploadReply::Ack,
                reqid: None,
            })
            .unwrap(),
            json!({"action": "upload", "sub": "ack"})
        );
    }
}
