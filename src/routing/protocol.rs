/// Wire-protocol awareness for the router
///
/// The router is byte-transparent except for two things: emitting error
/// packets to clients it turns away, and watching the handshake exchange go
/// by so it knows when the session is established. Both depend on which
/// protocol the route carries, picked at construction.
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Classic,
    X,
}

impl ProtocolKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classic" => Some(ProtocolKind::Classic),
            "x" => Some(ProtocolKind::X),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolKind::Classic => 3306,
            ProtocolKind::X => 33060,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Classic => "classic",
            ProtocolKind::X => "x",
        }
    }
}

/// Per-protocol behaviour consumed by the router.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Send a protocol-level error packet to a client being turned away.
    async fn send_error(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        code: u16,
        message: &str,
        sql_state: &str,
        route_name: &str,
    ) -> io::Result<()>;

    /// Forward one freshly read chunk to `sink`. While the handshake is in
    /// progress the implementation watches the packet stream go by and
    /// returns whether this chunk completed the exchange.
    async fn copy_packets(
        &self,
        data: &[u8],
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        handshake_done: bool,
        from_server: bool,
    ) -> io::Result<bool>;

    /// Called on the server-side stream when the client host just got
    /// blocked after an aborted handshake.
    async fn on_block_client_host(&self, server: &mut (dyn AsyncWrite + Send + Unpin), route_name: &str);
}

pub fn create_protocol(kind: ProtocolKind) -> Box<dyn Protocol> {
    match kind {
        ProtocolKind::Classic => Box::new(ClassicProtocol),
        ProtocolKind::X => Box::new(XProtocol),
    }
}

/// The classic protocol: 3-byte little-endian payload length, one sequence
/// byte, then the payload. The server speaks first; the handshake is done
/// once the server's packet with sequence >= 2 (the auth result) has been
/// forwarded.
pub struct ClassicProtocol;

impl ClassicProtocol {
    fn error_packet(code: u16, message: &str, sql_state: &str, sequence: u8) -> Vec<u8> {
        let mut sql_state_bytes = [b' '; 5];
        for (i, b) in sql_state.bytes().take(5).enumerate() {
            sql_state_bytes[i] = b;
        }

        let payload_len = 1 + 2 + 1 + 5 + message.len();
        let mut packet = Vec::with_capacity(4 + payload_len);
        packet.extend_from_slice(&(payload_len as u32).to_le_bytes()[..3]);
        packet.push(sequence);
        packet.push(0xff);
        packet.extend_from_slice(&code.to_le_bytes());
        packet.push(b'#');
        packet.extend_from_slice(&sql_state_bytes);
        packet.extend_from_slice(message.as_bytes());
        packet
    }

    /// Highest packet sequence number among the complete headers in `data`.
    fn last_sequence(data: &[u8]) -> Option<u8> {
        let mut last = None;
        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let payload_len =
                u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], 0]) as usize;
            last = Some(data[offset + 3]);
            offset += 4 + payload_len;
        }
        last
    }
}

#[async_trait]
impl Protocol for ClassicProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Classic
    }

    async fn send_error(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        code: u16,
        message: &str,
        sql_state: &str,
        _route_name: &str,
    ) -> io::Result<()> {
        let packet = Self::error_packet(code, message, sql_state, 0);
        sink.write_all(&packet).await?;
        sink.flush().await
    }

    async fn copy_packets(
        &self,
        data: &[u8],
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        handshake_done: bool,
        from_server: bool,
    ) -> io::Result<bool> {
        let mut handshake_complete = false;
        if !handshake_done && from_server {
            if let Some(sequence) = Self::last_sequence(data) {
                // greeting is 0, client reply 1; the server's auth result
                // closes the exchange
                handshake_complete = sequence >= 2;
            }
        }

        sink.write_all(data).await?;
        sink.flush().await?;
        Ok(handshake_complete)
    }

    async fn on_block_client_host(&self, server: &mut (dyn AsyncWrite + Send + Unpin), route_name: &str) {
        log::debug!("[{route_name}] fake response sent to server after aborted handshake");
        // an empty auth reply keeps the server from counting the aborted
        // handshake against the proxy host
        let packet = [0u8, 0, 0, 1];
        let _ = server.write_all(&packet).await;
        let _ = server.flush().await;
    }
}

/// The extended protocol: u32 little-endian frame length (counting the type
/// byte), one type byte, then a protobuf-encoded message body.
pub struct XProtocol;

const X_SERVER_MESSAGE_ERROR: u8 = 11;
const X_SERVER_MESSAGE_AUTHENTICATE_OK: u8 = 4;
const X_ERROR_SEVERITY_FATAL: u64 = 1;

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn put_field_varint(out: &mut Vec<u8>, field: u8, value: u64) {
    out.push(field << 3);
    put_varint(out, value);
}

fn put_field_bytes(out: &mut Vec<u8>, field: u8, value: &[u8]) {
    out.push((field << 3) | 2);
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

impl XProtocol {
    fn error_frame(code: u16, message: &str, sql_state: &str) -> Vec<u8> {
        // Mysqlx.Error { severity = 1, code = 2, msg = 3, sql_state = 4 }
        let mut body = Vec::with_capacity(16 + message.len());
        put_field_varint(&mut body, 1, X_ERROR_SEVERITY_FATAL);
        put_field_varint(&mut body, 2, u64::from(code));
        put_field_bytes(&mut body, 3, message.as_bytes());
        put_field_bytes(&mut body, 4, sql_state.as_bytes());

        let mut frame = Vec::with_capacity(5 + body.len());
        frame.extend_from_slice(&((body.len() + 1) as u32).to_le_bytes());
        frame.push(X_SERVER_MESSAGE_ERROR);
        frame.extend_from_slice(&body);
        frame
    }

    /// Whether a complete frame of the given type starts somewhere in `data`.
    fn contains_frame_type(data: &[u8], wanted: u8) -> bool {
        let mut offset = 0usize;
        while offset + 5 <= data.len() {
            let frame_len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            if data[offset + 4] == wanted {
                return true;
            }
            offset += 4 + frame_len;
        }
        false
    }
}

#[async_trait]
impl Protocol for XProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::X
    }

    async fn send_error(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        code: u16,
        message: &str,
        sql_state: &str,
        _route_name: &str,
    ) -> io::Result<()> {
        let frame = Self::error_frame(code, message, sql_state);
        sink.write_all(&frame).await?;
        sink.flush().await
    }

    async fn copy_packets(
        &self,
        data: &[u8],
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        handshake_done: bool,
        from_server: bool,
    ) -> io::Result<bool> {
        let handshake_complete = !handshake_done
            && from_server
            && Self::contains_frame_type(data, X_SERVER_MESSAGE_AUTHENTICATE_OK);

        sink.write_all(data).await?;
        sink.flush().await?;
        Ok(handshake_complete)
    }

    async fn on_block_client_host(&self, _server: &mut (dyn AsyncWrite + Send + Unpin), route_name: &str) {
        log::debug!("[{route_name}] client host blocked during extended-protocol handshake");
    }
}
