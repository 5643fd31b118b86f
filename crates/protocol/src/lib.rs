// Runner Protocol for Load Balancer <-> Runner Communication
//
// Decision: gRPC with tonic, bidirectional Engage stream per call
// Decision: Proto is transport layer, Rust types in switchyard-placement remain source of truth

use chrono::{DateTime, TimeZone, Utc};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("switchyard.runner");
}

// Re-export for convenience
pub use proto::runner_protocol_client::RunnerProtocolClient;
pub use proto::runner_protocol_server::{RunnerProtocol, RunnerProtocolServer};

/// Convert from proto Timestamp to chrono DateTime<Utc>
///
/// Returns `None` for the zero timestamp, which runners send for phases that
/// have not happened yet.
pub fn proto_timestamp_to_datetime(value: &proto::Timestamp) -> Option<DateTime<Utc>> {
    if value.seconds == 0 && value.nanos == 0 {
        return None;
    }
    Utc.timestamp_opt(value.seconds, value.nanos.max(0) as u32)
        .single()
}

/// Convert from chrono DateTime<Utc> to proto Timestamp
pub fn datetime_to_proto_timestamp(value: DateTime<Utc>) -> proto::Timestamp {
    proto::Timestamp {
        seconds: value.timestamp(),
        nanos: value.timestamp_subsec_nanos() as i32,
    }
}

impl proto::ClientMsg {
    /// Opening message of an Engage stream
    pub fn try_call(call: proto::TryCall) -> Self {
        Self {
            body: Some(proto::client_msg::Body::Call(call)),
        }
    }

    /// Request body chunk
    pub fn data(data: Vec<u8>, eof: bool) -> Self {
        Self {
            body: Some(proto::client_msg::Body::Data(proto::DataFrame { data, eof })),
        }
    }
}

impl proto::RunnerMsg {
    /// Runner's answer to a TryCall
    pub fn acknowledged(committed: bool, details: impl Into<String>) -> Self {
        Self {
            body: Some(proto::runner_msg::Body::Acknowledged(
                proto::CallAcknowledged {
                    committed,
                    details: details.into(),
                },
            )),
        }
    }

    /// Response status line and headers
    pub fn result_start(status_code: i32, headers: Vec<(String, String)>) -> Self {
        Self {
            body: Some(proto::runner_msg::Body::ResultStart(proto::CallResultStart {
                status_code,
                headers: headers
                    .into_iter()
                    .map(|(key, value)| proto::HttpHeader { key, value })
                    .collect(),
            })),
        }
    }

    /// Response body chunk
    pub fn data(data: Vec<u8>, eof: bool) -> Self {
        Self {
            body: Some(proto::runner_msg::Body::Data(proto::DataFrame { data, eof })),
        }
    }

    /// Diagnostic output chunk
    pub fn log(data: Vec<u8>) -> Self {
        Self {
            body: Some(proto::runner_msg::Body::Log(proto::LogFrame { data })),
        }
    }

    /// Final report for a committed call
    pub fn finished(success: bool, details: impl Into<String>) -> Self {
        Self {
            body: Some(proto::runner_msg::Body::Finished(proto::CallFinished {
                success,
                details: details.into(),
                error_code: 0,
                error_str: String::new(),
            })),
        }
    }
}
