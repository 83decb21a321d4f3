//! SOCKET listener mode (spec §4.7): the legacy VOEvent Transport Protocol
//! client. VTP frames a packet as a 4-byte big-endian length prefix followed
//! by that many bytes of payload (VOEvent XML, almost always); there is no
//! topic concept, so every frame is a notice candidate.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::SocketConfig;

use super::{ListenerError, MessageSource, RawMessage, StartPosition};

/// VTP "IAmAlive" keepalive packet, sent by the transport peer and echoed
/// back so the connection isn't closed as idle.
const IAMALIVE_MARKER: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?><trn:Transport";

pub struct SocketMessageSource {
    config: SocketConfig,
    stream: Option<TcpStream>,
    next_address: usize,
}

impl SocketMessageSource {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            stream: None,
            next_address: 0,
        }
    }

    /// Cycle through configured addresses on each reconnect attempt (spec
    /// §4.7 "address cycling"), rather than always retrying the first one.
    fn next_addr(&mut self) -> Option<&str> {
        if self.config.addresses.is_empty() {
            return None;
        }
        let addr = &self.config.addresses[self.next_address % self.config.addresses.len()];
        self.next_address = self.next_address.wrapping_add(1);
        Some(addr.as_str())
    }

    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

#[async_trait]
impl MessageSource for SocketMessageSource {
    async fn connect(&mut self, _start_at: StartPosition) -> Result<(), ListenerError> {
        // SOCKET mode has no notion of replay position; backdate only
        // applies to the STREAM broker client.
        let addr = self
            .next_addr()
            .ok_or_else(|| ListenerError::Socket("no configured transport addresses".to_string()))?
            .to_string();

        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(self.config.max_reconnect_backoff_secs);

        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let socket_ref = socket2::SockRef::from(&stream);
                    let keepalive = socket2::TcpKeepalive::new()
                        .with_time(Duration::from_secs(self.config.keepalive_secs));
                    let _ = socket_ref.set_tcp_keepalive(&keepalive);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, backoff_secs = backoff.as_secs(), "socket connect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    async fn recv(&mut self) -> Result<Option<RawMessage>, ListenerError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ListenerError::Socket("recv called before connect".to_string()))?;

        loop {
            let frame = Self::read_frame(stream)
                .await
                .map_err(|e| ListenerError::Socket(e.to_string()))?;

            let Some(bytes) = frame else {
                return Ok(None);
            };

            if bytes.starts_with(IAMALIVE_MARKER) || bytes.windows(b"IAmAlive".len()).any(|w| w == b"IAmAlive") {
                // Echo the keepalive back, per VTP, then loop for the next
                // frame rather than surfacing this as a heartbeat-bearing
                // notice candidate.
                if stream.write_all(&bytes).await.is_err() {
                    return Ok(None);
                }
                continue;
            }

            return Ok(Some(RawMessage {
                topic: "vtp".to_string(),
                bytes,
                is_heartbeat: false,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_cycling_wraps_around() {
        let mut source = SocketMessageSource::new(SocketConfig {
            addresses: vec!["a:1".to_string(), "b:2".to_string()],
            keepalive_secs: 90,
            max_reconnect_backoff_secs: 8,
        });
        assert_eq!(source.next_addr(), Some("a:1"));
        assert_eq!(source.next_addr(), Some("b:2"));
        assert_eq!(source.next_addr(), Some("a:1"));
    }
}
