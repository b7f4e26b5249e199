//! Seams to the peer-connection library and the screen producer.

use crate::error::TunnelError;

pub trait DataChannel {
    fn write_text(&mut self, text: &str) -> Result<(), TunnelError>;
    fn write_binary(&mut self, data: &[u8]) -> Result<(), TunnelError>;
    fn close(&mut self) -> Result<(), TunnelError>;
}

pub trait PeerConnection {
    /// Applies the remote offer and returns the local answer.
    fn set_offer(&mut self, sdp: &str) -> Result<String, TunnelError>;
    fn close(&mut self) -> Result<(), TunnelError>;
}

pub trait PeerConnector {
    fn create_connection(&mut self) -> Result<Box<dyn PeerConnection>, TunnelError>;
}

pub trait ScreenStream {
    /// Input from the remote side (mouse, keyboard, protocol control).
    fn write(&mut self, data: &[u8]) -> Result<(), TunnelError>;
    fn end(&mut self) -> Result<(), TunnelError>;
}

pub trait ScreenSource {
    fn open_stream(&mut self) -> Result<Box<dyn ScreenStream>, TunnelError>;
}

pub enum PeerEvent {
    Connected,
    Disconnected,
    DataChannel(Box<dyn DataChannel>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Connected => f.write_str("Connected"),
            PeerEvent::Disconnected => f.write_str("Disconnected"),
            PeerEvent::DataChannel(_) => f.write_str("DataChannel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Text(String),
    Binary(Vec<u8>),
    End,
}
