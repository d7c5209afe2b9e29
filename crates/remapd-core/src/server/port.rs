// Remapd Control Port
// Unix-socket message stream toward the configuration front-end

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Frames larger than this are a protocol violation.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const MSG_ACTIVE_CONTEXTS: u8 = 1;
const MSG_CONFIGURATION: u8 = 2;
const MSG_TRIGGERED_ACTION: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Messages received from the front-end. A new configuration wholly
/// replaces the prior one.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ActiveContexts(Vec<usize>),
    Configuration(String),
}

/// Listening side of the front-end connection.
///
/// Frames are length-delimited: a little-endian `u32` payload length
/// followed by a one-byte message type and the body. At most one client is
/// served; the daemon keeps running standalone when none is attached.
pub struct ControlPort {
    listener: UnixListener,
    socket_path: PathBuf,
    client: Option<UnixStream>,
    recv: Vec<u8>,
}

/// Default socket path: `$XDG_RUNTIME_DIR/remapd.sock`, `/tmp` fallback.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir =
        std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    Path::new(&runtime_dir).join("remapd.sock")
}

impl ControlPort {
    pub fn bind() -> Result<Self, PortError> {
        Self::bind_at(default_socket_path())
    }

    pub fn bind_at(socket_path: PathBuf) -> Result<Self, PortError> {
        // A stale socket from a crashed instance blocks bind.
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        log::info!("Control socket listening at {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
            client: None,
            recv: Vec::new(),
        })
    }

    /// Fd the driver may add to its poll set to wake on client activity.
    pub fn interrupt_fd(&self) -> i32 {
        match &self.client {
            Some(stream) => stream.as_raw_fd(),
            None => self.listener.as_raw_fd(),
        }
    }

    pub fn client_connected(&self) -> bool {
        self.client.is_some()
    }

    fn disconnect(&mut self, reason: &str) {
        if self.client.take().is_some() {
            log::info!("Front-end disconnected: {}", reason);
        }
        self.recv.clear();
    }

    /// Accept a pending connection and drain available messages without
    /// blocking.
    pub fn poll_messages(&mut self) -> Result<Vec<ClientMessage>, PortError> {
        if self.client.is_none() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    log::info!("Front-end connected");
                    self.client = Some(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(PortError::Io(e)),
            }
        }

        let mut messages = Vec::new();
        let mut drop_reason: Option<&str> = None;
        if let Some(stream) = &mut self.client {
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        drop_reason = Some("connection closed");
                        break;
                    }
                    Ok(n) => self.recv.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("Control socket read failed: {}", e);
                        drop_reason = Some("read error");
                        break;
                    }
                }
            }
        }
        if let Some(reason) = drop_reason {
            let pending = std::mem::take(&mut self.recv);
            self.disconnect(reason);
            // Frames fully received before the hangup still count.
            self.recv = pending;
        }

        while let Some(frame) = self.take_frame() {
            match parse_message(&frame) {
                Some(message) => messages.push(message),
                None => {
                    log::warn!("Malformed control message ({} bytes)", frame.len());
                    self.disconnect("protocol error");
                    break;
                }
            }
        }
        if self.client.is_none() {
            self.recv.clear();
        }
        Ok(messages)
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.recv.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([self.recv[0], self.recv[1], self.recv[2], self.recv[3]])
            as usize;
        if len > MAX_FRAME_LEN {
            log::warn!("Oversized control frame ({} bytes)", len);
            self.disconnect("protocol error");
            return None;
        }
        if self.recv.len() < 4 + len {
            return None;
        }
        let frame = self.recv[4..4 + len].to_vec();
        self.recv.drain(..4 + len);
        Some(frame)
    }

    /// Report an action-key Down to the front-end. Best-effort: a write
    /// failure drops the client, never the daemon.
    pub fn send_triggered_action(&mut self, index: usize) {
        let Some(stream) = &mut self.client else {
            return;
        };
        let mut frame = Vec::with_capacity(9);
        frame.extend_from_slice(&5u32.to_le_bytes());
        frame.push(MSG_TRIGGERED_ACTION);
        frame.extend_from_slice(&(index as u32).to_le_bytes());
        if let Err(e) = stream.write_all(&frame) {
            log::warn!("Sending triggered action failed: {}", e);
            self.disconnect("write error");
        }
    }
}

impl Drop for ControlPort {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn parse_message(frame: &[u8]) -> Option<ClientMessage> {
    let (&message_type, body) = frame.split_first()?;
    match message_type {
        MSG_ACTIVE_CONTEXTS => {
            if body.len() < 4 {
                return None;
            }
            let count = u32::from_le_bytes(body[..4].try_into().ok()?) as usize;
            let indices = &body[4..];
            if indices.len() != count * 4 {
                return None;
            }
            Some(ClientMessage::ActiveContexts(
                indices
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as usize)
                    .collect(),
            ))
        }
        MSG_CONFIGURATION => String::from_utf8(body.to_vec())
            .ok()
            .map(ClientMessage::Configuration),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_active_contexts() {
        let mut frame = vec![MSG_ACTIVE_CONTEXTS];
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&3u32.to_le_bytes());
        assert_eq!(
            parse_message(&frame),
            Some(ClientMessage::ActiveContexts(vec![0, 3]))
        );
    }

    #[test]
    fn test_parse_configuration() {
        let mut frame = vec![MSG_CONFIGURATION];
        frame.extend_from_slice(b"exit_sequence = \"LEFT_CTRL-Q\"");
        match parse_message(&frame) {
            Some(ClientMessage::Configuration(text)) => {
                assert!(text.contains("exit_sequence"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_truncated_contexts() {
        let mut frame = vec![MSG_ACTIVE_CONTEXTS];
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(parse_message(&frame), None);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert_eq!(parse_message(&[99, 1, 2, 3]), None);
    }
}
