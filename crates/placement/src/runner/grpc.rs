// gRPC runner client
// Decision: One Engage stream per call; the body is streamed only after the runner commits
// Decision: Failures after commit are reported in the CallCompletion, never as Err, so a
//           committed call is never offered to a second runner

use async_trait::async_trait;
use switchyard_protocol::proto::{self, runner_msg, ClientMsg, RunnerMsg};
use switchyard_protocol::{proto_timestamp_to_datetime, RunnerProtocolClient};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, info, instrument, warn};

use super::drain::InFlightGate;
use super::{CallCompletion, Runner, RunnerError, RunnerStatus, TryOutcome};
use crate::call::{RequestBody, RunnerCall};
use crate::context::CallContext;

/// Size of request body frames sent to the runner
const BODY_CHUNK_SIZE: usize = 32 * 1024;

/// Outbound frames buffered per Engage stream
const OUTBOUND_BUFFER: usize = 8;

/// Runner client over the gRPC runner protocol
pub struct GrpcRunner {
    address: String,
    client: RunnerProtocolClient<Channel>,
    gate: InFlightGate,
}

impl std::fmt::Debug for GrpcRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcRunner")
            .field("address", &self.address)
            .field("in_flight", &self.gate.in_flight())
            .field("closed", &self.gate.is_closed())
            .finish()
    }
}

impl GrpcRunner {
    /// Wrap an established channel
    pub fn new(address: impl Into<String>, channel: Channel) -> Self {
        Self {
            address: address.into(),
            client: RunnerProtocolClient::new(channel),
            gate: InFlightGate::new(),
        }
    }

    /// Number of try_exec/status calls currently running
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Stream the body and collect the result of a committed call
    async fn exchange(
        &self,
        call: &dyn RunnerCall,
        outbound: mpsc::Sender<ClientMsg>,
        inbound: &mut Streaming<RunnerMsg>,
    ) -> CallCompletion {
        let upload = send_body(call.request_body(), outbound);
        tokio::pin!(upload);
        let download = receive_result(call, inbound);
        tokio::pin!(download);

        let mut uploaded = false;
        loop {
            tokio::select! {
                result = &mut upload, if !uploaded => {
                    uploaded = true;
                    if let Err(e) = result {
                        warn!(runner = %self.address, error = %e, "Failed to stream request body");
                    }
                }
                completion = &mut download => return completion,
            }
        }
    }
}

#[async_trait]
impl Runner for GrpcRunner {
    #[instrument(skip_all, fields(runner = %self.address, call_id = %call.model().id))]
    async fn try_exec(
        &self,
        ctx: &CallContext,
        call: &dyn RunnerCall,
    ) -> Result<TryOutcome, RunnerError> {
        let _guard = self.gate.enter().ok_or(RunnerError::Closed)?;
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let try_call = proto::TryCall {
            call_json: serde_json::to_string(call.model())?,
            slot_hash_id: call.slot_hash_id().to_string(),
            extensions: call.extensions().clone(),
        };

        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        outbound
            .send(ClientMsg::try_call(try_call))
            .await
            .map_err(|_| RunnerError::Protocol("request stream closed".to_string()))?;

        let mut client = self.client.clone();
        let response = ctx.run(client.engage(ReceiverStream::new(rx))).await??;
        let mut inbound = response.into_inner();

        let first = ctx.run(inbound.message()).await??;
        match first.and_then(|msg| msg.body) {
            Some(runner_msg::Body::Acknowledged(ack)) if !ack.committed => {
                debug!(details = %ack.details, "Runner declined call");
                return Ok(TryOutcome::Declined);
            }
            Some(runner_msg::Body::Acknowledged(ack)) => {
                debug!(details = %ack.details, "Runner committed to call");
            }
            Some(other) => {
                return Err(RunnerError::Protocol(format!(
                    "expected acknowledgement, got {:?}",
                    other
                )));
            }
            None => {
                return Err(RunnerError::Protocol(
                    "stream ended before acknowledgement".to_string(),
                ));
            }
        }

        // The call belongs to this runner from here on
        let completion = tokio::select! {
            completion = self.exchange(call, outbound, &mut inbound) => completion,
            err = ctx.done() => CallCompletion::failed(format!("abandoned after commit: {}", err)),
        };

        if let Err(e) = call.std_err().close().await {
            debug!(error = %e, "Failed to close diagnostic stream");
        }

        Ok(TryOutcome::Accepted(completion))
    }

    #[instrument(skip_all, fields(runner = %self.address))]
    async fn status(&self, ctx: &CallContext) -> Result<RunnerStatus, RunnerError> {
        let _guard = self.gate.enter().ok_or(RunnerError::Closed)?;
        let mut client = self.client.clone();
        let response = ctx.run(client.status(proto::StatusRequest {})).await??;
        Ok(status_from_proto(response.into_inner()))
    }

    async fn close(&self, ctx: &CallContext) -> Result<(), RunnerError> {
        if !self.gate.is_closed() {
            info!(
                runner = %self.address,
                in_flight = self.gate.in_flight(),
                "Closing runner client"
            );
        }
        ctx.run(self.gate.close()).await?;
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

async fn send_body(
    body: Option<RequestBody>,
    outbound: mpsc::Sender<ClientMsg>,
) -> Result<(), RunnerError> {
    let closed = || RunnerError::Protocol("request stream closed".to_string());

    match body {
        Some(mut body) => {
            let mut buf = vec![0u8; BODY_CHUNK_SIZE];
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                outbound
                    .send(ClientMsg::data(buf[..n].to_vec(), false))
                    .await
                    .map_err(|_| closed())?;
            }
        }
        None => debug!("Request body already consumed, sending empty body"),
    }

    outbound
        .send(ClientMsg::data(Vec::new(), true))
        .await
        .map_err(|_| closed())
}

async fn receive_result(
    call: &dyn RunnerCall,
    inbound: &mut Streaming<RunnerMsg>,
) -> CallCompletion {
    loop {
        let msg = match inbound.message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                return CallCompletion::failed("runner closed stream before finishing call")
            }
            Err(status) => {
                return CallCompletion::failed(format!("runner stream failed: {}", status))
            }
        };

        match msg.body {
            Some(runner_msg::Body::ResultStart(start)) => {
                let status = u16::try_from(start.status_code).unwrap_or(502);
                let headers = start
                    .headers
                    .into_iter()
                    .map(|header| (header.key, header.value))
                    .collect();
                if let Err(e) = call.response_writer().write_head(status, headers).await {
                    return CallCompletion::failed(format!("failed to write response head: {}", e));
                }
            }
            Some(runner_msg::Body::Data(frame)) => {
                if frame.data.is_empty() {
                    continue;
                }
                if let Err(e) = call.response_writer().write_body(&frame.data).await {
                    return CallCompletion::failed(format!("failed to write response body: {}", e));
                }
            }
            Some(runner_msg::Body::Log(frame)) => {
                if let Err(e) = call.std_err().write(&frame.data).await {
                    debug!(error = %e, "Dropping diagnostic output");
                }
            }
            Some(runner_msg::Body::Finished(finished)) => return completion_from_proto(finished),
            Some(runner_msg::Body::Acknowledged(_)) => {
                return CallCompletion::failed("runner acknowledged the call twice")
            }
            None => debug!("Ignoring empty runner message"),
        }
    }
}

fn completion_from_proto(finished: proto::CallFinished) -> CallCompletion {
    CallCompletion {
        success: finished.success,
        details: finished.details,
        error_code: (finished.error_code != 0).then_some(finished.error_code),
        error_str: (!finished.error_str.is_empty()).then_some(finished.error_str),
    }
}

fn status_from_proto(status: proto::RunnerStatus) -> RunnerStatus {
    RunnerStatus {
        active_request_count: status.active.max(0) as u32,
        status_failed: status.failed,
        status_id: status.id,
        details: status.details,
        error_code: (status.error_code != 0).then_some(status.error_code),
        error_str: (!status.error_str.is_empty()).then_some(status.error_str),
        created_at: status.created_at.as_ref().and_then(proto_timestamp_to_datetime),
        started_at: status.started_at.as_ref().and_then(proto_timestamp_to_datetime),
        completed_at: status
            .completed_at
            .as_ref()
            .and_then(proto_timestamp_to_datetime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use switchyard_protocol::datetime_to_proto_timestamp;

    #[test]
    fn test_status_conversion() {
        let created = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let status = status_from_proto(proto::RunnerStatus {
            active: 3,
            failed: false,
            id: "status-1".into(),
            details: "ok".into(),
            error_code: 0,
            error_str: String::new(),
            created_at: Some(datetime_to_proto_timestamp(created)),
            started_at: None,
            completed_at: Some(proto::Timestamp::default()),
        });

        assert_eq!(status.active_request_count, 3);
        assert_eq!(status.status_id, "status-1");
        assert_eq!(status.error_code, None);
        assert_eq!(status.error_str, None);
        assert_eq!(status.created_at, Some(created));
        assert_eq!(status.started_at, None);
        assert_eq!(status.completed_at, None);
    }

    #[test]
    fn test_negative_active_count_clamps() {
        let status = status_from_proto(proto::RunnerStatus {
            active: -1,
            failed: true,
            error_code: 503,
            error_str: "draining".into(),
            ..Default::default()
        });
        assert_eq!(status.active_request_count, 0);
        assert!(!status.is_healthy());
        assert_eq!(status.error_code, Some(503));
        assert_eq!(status.error_str.as_deref(), Some("draining"));
    }

    #[test]
    fn test_completion_conversion() {
        let completion = completion_from_proto(proto::CallFinished {
            success: false,
            details: "function crashed".into(),
            error_code: 502,
            error_str: "exit status 1".into(),
        });
        assert!(!completion.success);
        assert_eq!(completion.error_code, Some(502));
        assert_eq!(completion.error_str.as_deref(), Some("exit status 1"));
    }
}
