//! Remote desktop tunnel.
//!
//! Signaling arrives through the engine's out-of-band data channel. Once a
//! peer connection exposes its data channel, text frames carry the control
//! sub-protocol and binary frames are piped to the screen producer.

pub mod control;
pub mod files;
pub mod frame;
pub mod peer;
pub mod platform;
pub mod transfer;

use crate::error::TunnelError;
use control::ControlSession;
use files::LocalFiles;
use peer::{ChannelEvent, DataChannel, PeerConnection, PeerConnector, PeerEvent, ScreenSource, ScreenStream};
use platform::{Platform, SessionLocker};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::{debug, info, warn};

pub const SIGNAL_VERSION: u32 = 1;

/// Identifies the peer connection a callback belongs to. Each answered
/// offer gets a fresh id.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SignalRequest {
    Present,
    Offer { sdp: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SignalReply {
    Present { ver: u32, platform: String },
    Answer { ver: u32, sdp: String },
    Restart { ver: u32 },
}

impl SignalReply {
    pub fn restart() -> Self {
        SignalReply::Restart { ver: SIGNAL_VERSION }
    }

    pub fn to_json(&self) -> Result<String, TunnelError> {
        Ok(serde_json::to_string(self)?)
    }
}

struct TunnelSession {
    id: SessionId,
    connection: Box<dyn PeerConnection>,
    channel: Option<Box<dyn DataChannel>>,
    screen: Option<Box<dyn ScreenStream>>,
    control: ControlSession,
}

pub struct KvmTunnel {
    platform: Platform,
    connector: Box<dyn PeerConnector>,
    screen: Box<dyn ScreenSource>,
    files: Rc<LocalFiles>,
    locker: Rc<dyn SessionLocker>,
    session: Option<TunnelSession>,
    next_id: SessionId,
}

impl KvmTunnel {
    pub fn new(
        platform: Platform,
        connector: Box<dyn PeerConnector>,
        screen: Box<dyn ScreenSource>,
        files: LocalFiles,
        locker: Rc<dyn SessionLocker>,
    ) -> Self {
        Self {
            platform,
            connector,
            screen,
            files: Rc::new(files),
            locker,
            session: None,
            next_id: 0,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Id of the live session. Events for any other id are dropped.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn has_data_channel(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.channel.is_some())
            .unwrap_or(false)
    }

    /// Handles one decoded message from the out-of-band data channel and
    /// returns the reply to write back, if any.
    pub fn handle_signal(&mut self, text: &str) -> Option<SignalReply> {
        let request: SignalRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "ignoring signaling message");
                return None;
            }
        };
        match request {
            SignalRequest::Present => Some(SignalReply::Present {
                ver: SIGNAL_VERSION,
                platform: self.platform.wire_name().to_string(),
            }),
            SignalRequest::Offer { sdp } => match self.accept_offer(&sdp) {
                Ok((_, answer)) => Some(SignalReply::Answer {
                    ver: SIGNAL_VERSION,
                    sdp: answer,
                }),
                Err(e) => {
                    warn!(error = %e, "failed to answer tunnel offer");
                    None
                }
            },
        }
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<(SessionId, String), TunnelError> {
        self.cleanup();
        let mut connection = self.connector.create_connection()?;
        let answer = match connection.set_offer(sdp) {
            Ok(answer) => answer,
            Err(e) => {
                let _ = connection.close();
                return Err(e);
            }
        };
        self.next_id += 1;
        let id = self.next_id;
        self.session = Some(TunnelSession {
            id,
            connection,
            channel: None,
            screen: None,
            control: ControlSession::new(self.platform, self.files.clone(), self.locker.clone()),
        });
        info!(session = id, "tunnel offer answered");
        Ok((id, answer))
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().map(|s| s.id == id).unwrap_or(false)
    }

    pub fn on_peer_event(&mut self, id: SessionId, event: PeerEvent) {
        if !self.is_current(id) {
            debug!(session = id, "dropping event from a closed tunnel session");
            if let PeerEvent::DataChannel(mut channel) = event {
                let _ = channel.close();
            }
            return;
        }
        match event {
            PeerEvent::Connected => debug!("tunnel peer connected"),
            PeerEvent::Disconnected => {
                debug!("tunnel peer disconnected");
                self.cleanup();
            }
            PeerEvent::DataChannel(channel) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if let Some(mut old) = session.screen.take() {
                    if let Err(e) = old.end() {
                        debug!(error = %e, "screen stream end failed");
                    }
                }
                match self.screen.open_stream() {
                    Ok(stream) => session.screen = Some(stream),
                    Err(e) => warn!(error = %e, "unable to open screen stream"),
                }
                if let Some(mut old) = session.channel.replace(channel) {
                    let _ = old.close();
                }
                info!("tunnel data channel open");
            }
        }
    }

    pub fn on_channel_event(&mut self, id: SessionId, event: ChannelEvent) {
        if !self.is_current(id) {
            debug!(session = id, "dropping channel event from a closed tunnel session");
            return;
        }
        match event {
            ChannelEvent::Text(text) => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(channel) = session.channel.as_mut() {
                        session.control.handle_frame(channel.as_mut(), &text);
                    }
                }
            }
            ChannelEvent::Binary(data) => {
                let Some(screen) = self.session.as_mut().and_then(|s| s.screen.as_mut()) else {
                    return;
                };
                if let Err(e) = screen.write(&data) {
                    warn!(error = %e, "screen stream write failed");
                }
            }
            ChannelEvent::End => self.cleanup(),
        }
    }

    /// Pushes screen output to the remote side.
    pub fn forward_screen(&mut self, data: &[u8]) {
        let Some(channel) = self.session.as_mut().and_then(|s| s.channel.as_mut()) else {
            return;
        };
        if let Err(e) = channel.write_binary(data) {
            warn!(error = %e, "tunnel data channel write failed");
        }
    }

    /// Releases the session. Safe to call repeatedly or with nothing open.
    pub fn cleanup(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        debug!("tunnel cleanup");
        session.control.close_transfers();
        if let Some(mut channel) = session.channel.take() {
            if let Err(e) = channel.close() {
                debug!(error = %e, "data channel close failed");
            }
        }
        if let Err(e) = session.connection.close() {
            debug!(error = %e, "peer connection close failed");
        }
        if let Some(mut screen) = session.screen.take() {
            if let Err(e) = screen.end() {
                debug!(error = %e, "screen stream end failed");
            }
        }
    }
}
