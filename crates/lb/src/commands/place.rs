// Place a single call from the command line
//
// The request body is read from a file or stdin, the response body streams to
// stdout, and the function's diagnostics stream to stderr. The placement
// summary is printed to stderr as JSON once the runner reports completion.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_placement::call::RequestBody;
use switchyard_placement::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::{build_factory, build_pool, shutdown_pool};
use crate::config::LbConfig;

/// What to run, as given on the command line
#[derive(Debug, Clone)]
pub struct PlaceArgs {
    pub app: String,
    pub function: String,
    pub image: String,
    pub slot: Option<String>,
    pub memory_mb: u64,
    pub timeout_secs: u32,
    /// `None` reads stdin
    pub body: Option<PathBuf>,
    pub extensions: Vec<(String, String)>,
}

/// Response sink writing the body straight to stdout
#[derive(Default)]
struct StdoutResponse {
    head: OnceLock<(u16, Vec<(String, String)>)>,
    out: tokio::sync::Mutex<Option<tokio::io::Stdout>>,
}

impl StdoutResponse {
    fn status(&self) -> Option<u16> {
        self.head.get().map(|(status, _)| *status)
    }

    async fn flush(&self) -> io::Result<()> {
        match self.out.lock().await.as_mut() {
            Some(out) => out.flush().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResponseWriter for StdoutResponse {
    async fn write_head(&self, status: u16, headers: Vec<(String, String)>) -> io::Result<()> {
        self.head.set((status, headers)).map_err(|_| {
            io::Error::new(io::ErrorKind::AlreadyExists, "response head already written")
        })
    }

    async fn write_body(&self, chunk: &[u8]) -> io::Result<()> {
        let _ = self.head.set((200, Vec::new()));
        let mut out = self.out.lock().await;
        out.get_or_insert_with(tokio::io::stdout)
            .write_all(chunk)
            .await
    }
}

/// Diagnostic stream forwarding to stderr
#[derive(Default)]
struct StderrDiagnostics {
    closed: AtomicBool,
}

#[async_trait]
impl DiagnosticStream for StderrDiagnostics {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "diagnostic stream closed",
            ));
        }
        let mut err = tokio::io::stderr();
        err.write_all(data).await?;
        err.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct CliCall {
    model: CallModel,
    slot_hash_id: String,
    extensions: HashMap<String, String>,
    body: Mutex<Option<RequestBody>>,
    response: StdoutResponse,
    diagnostics: StderrDiagnostics,
}

impl CliCall {
    fn new(args: &PlaceArgs, body: Vec<u8>) -> Self {
        let model = CallModel::new(&args.app, &args.function, &args.image)
            .with_memory_mb(args.memory_mb)
            .with_timeouts(args.timeout_secs, args.timeout_secs);
        let slot_hash_id = args.slot.clone().unwrap_or_else(|| model.slot_key());
        Self {
            model,
            slot_hash_id,
            extensions: args.extensions.iter().cloned().collect(),
            body: Mutex::new(Some(Box::new(io::Cursor::new(body)))),
            response: StdoutResponse::default(),
            diagnostics: StderrDiagnostics::default(),
        }
    }
}

impl RunnerCall for CliCall {
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

async fn read_body(path: Option<&PathBuf>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read request body from {}", path.display())),
        None => {
            let mut body = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut body)
                .await
                .context("Failed to read request body from stdin")?;
            Ok(body)
        }
    }
}

pub async fn run(config: &LbConfig, args: PlaceArgs) -> Result<()> {
    let body = read_body(args.body.as_ref()).await?;
    let call = CliCall::new(&args, body);

    let factory = build_factory(config).await?;
    let pool = build_pool(config, factory).await?;
    let placer = OrderedPlacer::new(config.placer.clone());

    let ctx = CallContext::background();
    let interrupt = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, abandoning placement");
                ctx.cancel();
            }
        })
    };

    info!(call_id = %call.model.id, slot = %call.slot_hash_id, "Placing call");
    let result = placer.place_call(pool.as_ref(), &ctx, &call).await;
    interrupt.abort();

    call.response.flush().await?;
    shutdown_pool(pool.as_ref(), config).await;

    let placement = result.context("Placement failed")?;
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "call_id": call.model.id,
            "runner": placement.runner,
            "attempts": placement.attempts,
            "status": call.response.status(),
            "completion": placement.completion,
        }))?
    );

    if !placement.completion.success {
        bail!(
            "Call failed on {}: {}",
            placement.runner,
            placement
                .completion
                .error_str
                .as_deref()
                .unwrap_or(&placement.completion.details)
        );
    }
    Ok(())
}
