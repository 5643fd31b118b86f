//! Call abstraction consumed by runner pools and placers
//!
//! The request-handling layer supplies anything implementing [`RunnerCall`].
//! [`InvocationCall`] is the in-memory implementation used by the operator
//! binary and tests.

use std::collections::{BTreeMap, HashMap};
use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Read-once request body stream
pub type RequestBody = Box<dyn AsyncRead + Send + Unpin>;

/// Whether the caller waits for the function's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Caller waits for the response
    #[default]
    Sync,
    /// Caller is answered as soon as a runner accepts
    Detached,
}

/// Immutable call metadata shipped to the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallModel {
    pub id: Uuid,
    pub app_id: String,
    pub fn_id: String,
    pub image: String,
    #[serde(default)]
    pub call_type: CallType,
    /// Maximum execution time in seconds
    pub timeout_secs: u32,
    /// How long an idle hot container is kept, in seconds
    pub idle_timeout_secs: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl CallModel {
    /// Create a call model with default limits
    pub fn new(
        app_id: impl Into<String>,
        fn_id: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            app_id: app_id.into(),
            fn_id: fn_id.into(),
            image: image.into(),
            call_type: CallType::Sync,
            timeout_secs: 30,
            idle_timeout_secs: 30,
            memory_mb: 128,
            config: BTreeMap::new(),
            headers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = call_type;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_timeouts(mut self, timeout_secs: u32, idle_timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self.idle_timeout_secs = idle_timeout_secs;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Stable routing key for the execution slot this call needs
    ///
    /// Two calls share a key iff a runner could serve both from the same hot
    /// container: same function, image, resource limits and configuration.
    pub fn slot_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.app_id, &self.fn_id, &self.image] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.memory_mb.to_be_bytes());
        hasher.update(self.timeout_secs.to_be_bytes());
        hasher.update(self.idle_timeout_secs.to_be_bytes());
        for (key, value) in &self.config {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Write-once response sink: a head, then body chunks
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    async fn write_head(&self, status: u16, headers: Vec<(String, String)>) -> io::Result<()>;
    async fn write_body(&self, chunk: &[u8]) -> io::Result<()>;
}

/// Closable diagnostic output stream (the function's stderr)
#[async_trait]
pub trait DiagnosticStream: Send + Sync {
    async fn write(&self, data: &[u8]) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

/// Everything a runner pool and placer need from one invocation request
pub trait RunnerCall: Send + Sync {
    /// Routing key; stable for the whole placement
    fn slot_hash_id(&self) -> &str;

    /// Side-channel attributes forwarded to the runner
    fn extensions(&self) -> &HashMap<String, String>;

    /// Take the request body. Returns `None` once taken.
    fn request_body(&self) -> Option<RequestBody>;

    fn response_writer(&self) -> &dyn ResponseWriter;

    fn std_err(&self) -> &dyn DiagnosticStream;

    fn model(&self) -> &CallModel;
}

#[derive(Debug, Default)]
struct ResponseState {
    head: Option<(u16, Vec<(String, String)>)>,
    body: Vec<u8>,
}

/// In-memory response sink
#[derive(Debug, Default)]
pub struct BufferedResponse {
    state: Mutex<ResponseState>,
}

impl BufferedResponse {
    /// Status code, if a head was written
    pub fn status(&self) -> Option<u16> {
        self.state.lock().head.as_ref().map(|(status, _)| *status)
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .head
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }

    pub fn body(&self) -> Vec<u8> {
        self.state.lock().body.clone()
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponse {
    async fn write_head(&self, status: u16, headers: Vec<(String, String)>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.head.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "response head already written",
            ));
        }
        state.head = Some((status, headers));
        Ok(())
    }

    async fn write_body(&self, chunk: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        // Body without an explicit head implies 200, as in HTTP
        if state.head.is_none() {
            state.head = Some((200, Vec::new()));
        }
        state.body.extend_from_slice(chunk);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DiagnosticState {
    data: Vec<u8>,
    closed: bool,
}

/// In-memory diagnostic stream that can be read back
#[derive(Debug, Default)]
pub struct BufferedDiagnostics {
    state: Mutex<DiagnosticState>,
}

impl BufferedDiagnostics {
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl DiagnosticStream for BufferedDiagnostics {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "diagnostic stream closed",
            ));
        }
        state.data.extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// In-memory [`RunnerCall`]
pub struct InvocationCall {
    model: CallModel,
    slot_hash_id: String,
    extensions: HashMap<String, String>,
    body: Mutex<Option<RequestBody>>,
    response: BufferedResponse,
    diagnostics: BufferedDiagnostics,
}

impl std::fmt::Debug for InvocationCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCall")
            .field("id", &self.model.id)
            .field("slot_hash_id", &self.slot_hash_id)
            .finish_non_exhaustive()
    }
}

impl InvocationCall {
    /// Call with an empty body, routed by the model's slot key
    pub fn new(model: CallModel) -> Self {
        let slot_hash_id = model.slot_key();
        Self {
            model,
            slot_hash_id,
            extensions: HashMap::new(),
            body: Mutex::new(Some(Box::new(tokio::io::empty()))),
            response: BufferedResponse::default(),
            diagnostics: BufferedDiagnostics::default(),
        }
    }

    pub fn with_body(self, body: impl Into<Vec<u8>>) -> Self {
        self.with_reader(Box::new(io::Cursor::new(body.into())))
    }

    pub fn with_reader(mut self, reader: RequestBody) -> Self {
        self.body = Mutex::new(Some(reader));
        self
    }

    /// Override the routing key
    pub fn with_slot_hash_id(mut self, slot_hash_id: impl Into<String>) -> Self {
        self.slot_hash_id = slot_hash_id.into();
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn response(&self) -> &BufferedResponse {
        &self.response
    }

    pub fn diagnostics(&self) -> &BufferedDiagnostics {
        &self.diagnostics
    }
}

impl RunnerCall for InvocationCall {
    fn slot_hash_id(&self) -> &str {
        &self.slot_hash_id
    }

    fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }

    fn request_body(&self) -> Option<RequestBody> {
        self.body.lock().take()
    }

    fn response_writer(&self) -> &dyn ResponseWriter {
        &self.response
    }

    fn std_err(&self) -> &dyn DiagnosticStream {
        &self.diagnostics
    }

    fn model(&self) -> &CallModel {
        &self.model
    }
}
