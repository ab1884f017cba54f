//! Command transport between a generator and a storage server.
//!
//! Newline-delimited JSON over TCP. Each request is `{"command", "data"}`,
//! each response is `{"ok": true, "data"?}` or `{"error": {"message"}}`.
//! Commands: `add_pulse`, `get_last_pulse`, `add_certificate`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::{PulseSink, PulseStore, StorageError};
use crate::types::{CertificateRecord, Pulse};

pub const ADD_PULSE: &str = "add_pulse";
pub const GET_LAST_PULSE: &str = "get_last_pulse";
pub const ADD_CERTIFICATE: &str = "add_certificate";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandResponse {
    Ok {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        error: ErrorBody,
    },
}

impl CommandResponse {
    pub fn ok(data: Option<Value>) -> Self {
        CommandResponse::Ok { ok: true, data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandResponse::Error { error: ErrorBody { message: message.into() } }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Result<T, String> {
    let data = data.ok_or_else(|| "missing data".to_string())?;
    serde_json::from_value(data).map_err(|e| format!("invalid data: {}", e))
}

/// Execute one command against the store.
pub fn dispatch(store: &PulseStore, request: CommandRequest) -> CommandResponse {
    let result = match request.command.as_str() {
        ADD_PULSE => parse_data::<Pulse>(request.data).and_then(|pulse| {
            store.append(&pulse).map_err(|e| e.to_string())?;
            info!("📥 Stored pulse {} of chain {}", pulse.pulse_index, pulse.chain_index);
            Ok(None)
        }),
        GET_LAST_PULSE => store
            .latest()
            .map_err(|e| e.to_string())
            .and_then(|last| serde_json::to_value(last).map(Some).map_err(|e| e.to_string())),
        ADD_CERTIFICATE => parse_data::<CertificateRecord>(request.data).and_then(|record| {
            store.register_certificate(&record).map_err(|e| e.to_string())?;
            Ok(None)
        }),
        other => Err(format!("unknown command: {}", other)),
    };

    match result {
        Ok(data) => CommandResponse::ok(data),
        Err(message) => {
            warn!("Command {} failed: {}", request.command, message);
            CommandResponse::error(message)
        }
    }
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, store: Arc<PulseStore>) -> Result<(), TransportError> {
    info!("📡 Command transport listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            debug!("command connection from {}", peer);
            if let Err(e) = handle_connection(stream, store).await {
                warn!("Command connection {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, store: Arc<PulseStore>) -> Result<(), TransportError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => dispatch(&store, request),
            Err(e) => CommandResponse::error(format!("malformed request: {}", e)),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client side of the command transport. Requests are serialized over one
/// connection.
pub struct CommandClient {
    connection: Mutex<Connection>,
}

impl CommandClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            connection: Mutex::new(Connection { reader: BufReader::new(reader), writer }),
        })
    }

    /// Send one command and wait for its response data.
    pub async fn request(&self, command: &str, data: Option<Value>) -> Result<Option<Value>, TransportError> {
        let request = CommandRequest { command: command.to_string(), data };
        let mut out = serde_json::to_vec(&request)?;
        out.push(b'\n');

        let mut conn = self.connection.lock().await;
        conn.writer.write_all(&out).await?;

        let mut line = String::new();
        if conn.reader.read_line(&mut line).await? == 0 {
            return Err(TransportError::Closed);
        }
        match serde_json::from_str::<CommandResponse>(&line)? {
            CommandResponse::Ok { ok: true, data } => Ok(data),
            CommandResponse::Ok { ok: false, .. } => {
                Err(TransportError::Server(format!("{} not acknowledged", command)))
            }
            CommandResponse::Error { error } => Err(TransportError::Server(error.message)),
        }
    }
}

impl From<TransportError> for StorageError {
    fn from(e: TransportError) -> Self {
        StorageError::Remote(e.to_string())
    }
}

#[async_trait]
impl PulseSink for CommandClient {
    async fn latest_pulse(&self) -> Result<Option<Pulse>, StorageError> {
        match self.request(GET_LAST_PULSE, None).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn append(&self, pulse: &Pulse) -> Result<(), StorageError> {
        self.request(ADD_PULSE, Some(serde_json::to_value(pulse)?)).await?;
        Ok(())
    }

    async fn register_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        self.request(ADD_CERTIFICATE, Some(serde_json::to_value(record)?)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PulseChainBuilder;
    use crate::crypto::{KeypairSigner, Signer};
    use crate::skiplist::SkipLayers;
    use crate::types::{parse_timestamp, ByteHash};
    use tempfile::tempdir;

    async fn start_server() -> (tempfile::TempDir, Arc<PulseStore>, std::net::SocketAddr) {
        let dir = tempdir().unwrap();
        let store = Arc::new(PulseStore::open(dir.path()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, store.clone()));
        (dir, store, addr)
    }

    async fn two_pulses(signer: &KeypairSigner) -> (Pulse, Pulse) {
        let b = PulseChainBuilder::new("http://beacon.test", "2.0", 60_000, SkipLayers::new(27, 5).unwrap());
        let now = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        let mut p0 = b.init(signer, 0, ByteHash::new(vec![1; 64]), None, now).unwrap();
        b.finalize(signer, &mut p0, None, &ByteHash::new(vec![2; 64])).await.unwrap();
        let mut p1 = b.init(signer, 0, ByteHash::new(vec![2; 64]), Some(&p0), now).unwrap();
        b.finalize(signer, &mut p1, Some(&p0), &ByteHash::new(vec![3; 64])).await.unwrap();
        (p0, p1)
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(CommandResponse::ok(None)).unwrap();
        assert_eq!(ok, serde_json::json!({"ok": true}));

        let err = serde_json::to_value(CommandResponse::error("boom")).unwrap();
        assert_eq!(err, serde_json::json!({"error": {"message": "boom"}}));

        let parsed: CommandResponse = serde_json::from_str(r#"{"error":{"message":"x"}}"#).unwrap();
        assert_eq!(parsed, CommandResponse::error("x"));
    }

    #[tokio::test]
    async fn test_client_roundtrip() {
        let (_dir, store, addr) = start_server().await;
        let client = CommandClient::connect(addr).await.unwrap();
        let signer = KeypairSigner::generate();
        let (p0, p1) = two_pulses(&signer).await;

        assert!(client.latest_pulse().await.unwrap().is_none());
        client.register_certificate(&signer.certificate().record()).await.unwrap();
        client.append(&p0).await.unwrap();
        client.append(&p1).await.unwrap();

        assert_eq!(client.latest_pulse().await.unwrap(), Some(p1.clone()));
        assert_eq!(store.get(0, 0).unwrap(), Some(p0));
        assert!(store.certificate(signer.certificate_id()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejected_append_reports_error() {
        let (_dir, _store, addr) = start_server().await;
        let client = CommandClient::connect(addr).await.unwrap();
        let signer = KeypairSigner::generate();
        let (_, p1) = two_pulses(&signer).await;

        let result = client.append(&p1).await;
        assert!(matches!(result, Err(StorageError::Remote(_))));

        // connection stays usable after an error
        assert!(client.latest_pulse().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unacknowledged_response_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Some(_line) = lines.next_line().await.unwrap() {
                writer.write_all(b"{\"ok\":false,\"data\":null}\n").await.unwrap();
            }
        });

        let client = CommandClient::connect(addr).await.unwrap();
        let signer = KeypairSigner::generate();
        let (p0, _) = two_pulses(&signer).await;

        let result = client.request(GET_LAST_PULSE, None).await;
        assert!(matches!(result, Err(TransportError::Server(m)) if m.contains(GET_LAST_PULSE)));
        assert!(matches!(client.append(&p0).await, Err(StorageError::Remote(_))));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_commands() {
        let (_dir, _store, addr) = start_server().await;
        let client = CommandClient::connect(addr).await.unwrap();

        let result = client.request("drop_table", None).await;
        assert!(matches!(result, Err(TransportError::Server(m)) if m.contains("unknown command")));

        let result = client.request(ADD_PULSE, Some(serde_json::json!({"uri": 1}))).await;
        assert!(matches!(result, Err(TransportError::Server(m)) if m.contains("invalid data")));
    }
}
