//! The remote queue endpoint (SPEC_FULL.md §4.1, §10.4): a capability over
//! three named channels, backed either by a real TCP connection or, for
//! tests, an in-memory script. There is no server in this repository (an
//! explicit non-goal), so `TcpRemoteQueue` is validated against
//! `MockRemoteQueue` rather than a live peer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use shared::{Bundle, PipelineError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Scoped capability over the remote queue's three logical channels. The
/// endpoint is acquired once by the Coordinator and shared read-only with the
/// Scheduler (`get_scheduled`) and Collector (`put_completed`); only the
/// Coordinator calls `put_terminator` and `close`.
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    /// Pull the next bundle from `scheduled`. `Ok(None)` is the disconnect
    /// sentinel; `Err(PipelineError::Empty(_))` means nothing arrived within
    /// `wait` and the caller should self-loop.
    async fn get_scheduled(&self, wait: Duration) -> Result<Option<Bundle>, PipelineError>;

    /// Hand a bundle of finished tasks to the server.
    async fn put_completed(&self, bundle: Bundle) -> Result<(), PipelineError>;

    /// Single-shot publication of the terminal task id at shutdown.
    async fn put_terminator(&self, terminal_id: Vec<u8>) -> Result<(), PipelineError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum ClientFrame {
    Hello { auth: String, nonce: [u8; 16] },
    Completed(Bundle),
    Terminator(Vec<u8>),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum ServerFrame {
    Ack { tag: [u8; 32] },
    Reject,
    Scheduled(Option<Bundle>),
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    frame: &impl serde::Serialize,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(frame).expect("frame types are always serializable");
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await
}

async fn read_frame<R: AsyncReadExt + Unpin, T: serde::de::DeserializeOwned>(
    stream: &mut R,
) -> std::io::Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// An authenticated TCP connection to the server's queue endpoint.
///
/// Access to the stream is serialized behind a single `tokio::sync::Mutex`
/// (SPEC_FULL.md §5: "the endpoint must serialize its own wire access"),
/// shared by whichever stages hold a clone of this queue.
pub struct TcpRemoteQueue {
    stream: Mutex<TcpStream>,
}

impl TcpRemoteQueue {
    /// Open the connection and complete the authentication handshake. The
    /// server is expected to echo back a keyed hash of the client's nonce
    /// under the shared secret; the client recomputes the same tag and
    /// compares it in constant time, the same way this workspace already
    /// guards its HTTP API key check.
    pub async fn connect(host: &str, port: u16, auth: &str) -> Result<Self, PipelineError> {
        let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
            PipelineError::Auth(format!("failed to connect to {host}:{port}: {e}"))
        })?;

        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);

        write_frame(
            &mut stream,
            &ClientFrame::Hello {
                auth: auth.to_string(),
                nonce,
            },
        )
        .await
        .map_err(|e| PipelineError::Auth(format!("hello frame failed: {e}")))?;

        let reply: ServerFrame = read_frame(&mut stream)
            .await
            .map_err(|e| PipelineError::Auth(format!("no handshake reply: {e}")))?;

        match reply {
            ServerFrame::Ack { tag } => {
                let expected = expected_tag(auth, &nonce);
                use subtle::ConstantTimeEq;
                if !bool::from(tag.ct_eq(&expected)) {
                    return Err(PipelineError::Auth("handshake tag mismatch".into()));
                }
            }
            ServerFrame::Reject => {
                return Err(PipelineError::Auth("server rejected shared secret".into()))
            }
            ServerFrame::Scheduled(_) => {
                return Err(PipelineError::Auth("unexpected frame during handshake".into()))
            }
        }

        Ok(Self {
            stream: Mutex::new(stream),
        })
    }
}

/// `blake3` keyed hash of the nonce under the shared secret, used as the
/// mutual-authentication tag both sides compute independently.
fn expected_tag(auth: &str, nonce: &[u8; 16]) -> [u8; 32] {
    let key = blake3::hash(auth.as_bytes());
    *blake3::keyed_hash(key.as_bytes(), nonce).as_bytes()
}

#[async_trait]
impl RemoteQueue for TcpRemoteQueue {
    async fn get_scheduled(&self, wait: Duration) -> Result<Option<Bundle>, PipelineError> {
        let mut stream = self.stream.lock().await;
        match timeout(wait, read_frame::<_, ServerFrame>(&mut *stream)).await {
            Ok(Ok(ServerFrame::Scheduled(bundle))) => Ok(bundle),
            Ok(Ok(_)) => Err(PipelineError::Protocol("unexpected frame on scheduled".into())),
            Ok(Err(_)) => Ok(None), // connection closed: treat as disconnect sentinel
            Err(_) => Err(PipelineError::Empty(wait)),
        }
    }

    async fn put_completed(&self, bundle: Bundle) -> Result<(), PipelineError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &ClientFrame::Completed(bundle))
            .await
            .map_err(|_| PipelineError::Disconnected)
    }

    async fn put_terminator(&self, terminal_id: Vec<u8>) -> Result<(), PipelineError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &ClientFrame::Terminator(terminal_id))
            .await
            .map_err(|_| PipelineError::Disconnected)
    }

    async fn close(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }
}

/// In-memory stand-in for the server, used to drive the end-to-end scenarios
/// in SPEC_FULL.md §8 without a network dependency.
pub struct MockRemoteQueue {
    script: Mutex<VecDeque<ScriptedItem>>,
    completed: Mutex<Vec<Bundle>>,
    terminator: Mutex<Option<Vec<u8>>>,
}

enum ScriptedItem {
    Bundle(Bundle),
    /// Pause this long (relative to the previous item) before the bundle
    /// becomes available — used to exercise the Collector's time-based flush.
    DelayedBundle(Duration, Bundle),
    Disconnect,
}

pub struct MockRemoteQueueBuilder {
    script: VecDeque<ScriptedItem>,
}

impl MockRemoteQueueBuilder {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
        }
    }

    pub fn bundle(mut self, bundle: Bundle) -> Self {
        self.script.push_back(ScriptedItem::Bundle(bundle));
        self
    }

    pub fn delayed_bundle(mut self, delay: Duration, bundle: Bundle) -> Self {
        self.script.push_back(ScriptedItem::DelayedBundle(delay, bundle));
        self
    }

    pub fn disconnect(mut self) -> Self {
        self.script.push_back(ScriptedItem::Disconnect);
        self
    }

    pub fn build(self) -> Arc<MockRemoteQueue> {
        Arc::new(MockRemoteQueue {
            script: Mutex::new(self.script),
            completed: Mutex::new(Vec::new()),
            terminator: Mutex::new(None),
        })
    }
}

impl MockRemoteQueue {
    pub fn builder() -> MockRemoteQueueBuilder {
        MockRemoteQueueBuilder::new()
    }

    pub async fn completed_bundles(&self) -> Vec<Bundle> {
        self.completed.lock().await.clone()
    }

    pub async fn terminator(&self) -> Option<Vec<u8>> {
        self.terminator.lock().await.clone()
    }
}

#[async_trait]
impl RemoteQueue for MockRemoteQueue {
    async fn get_scheduled(&self, wait: Duration) -> Result<Option<Bundle>, PipelineError> {
        let mut script = self.script.lock().await;
        match script.pop_front() {
            Some(ScriptedItem::Bundle(bundle)) => Ok(Some(bundle)),
            Some(ScriptedItem::DelayedBundle(delay, bundle)) => {
                tokio::time::sleep(delay).await;
                Ok(Some(bundle))
            }
            Some(ScriptedItem::Disconnect) => Ok(None),
            None => Err(PipelineError::Empty(wait)),
        }
    }

    async fn put_completed(&self, bundle: Bundle) -> Result<(), PipelineError> {
        self.completed.lock().await.push(bundle);
        Ok(())
    }

    async fn put_terminator(&self, terminal_id: Vec<u8>) -> Result<(), PipelineError> {
        *self.terminator.lock().await = Some(terminal_id);
        Ok(())
    }

    async fn close(&self) {}
}
