// gRPC runner client against an in-process tonic runner
// Run with: cargo test -p switchyard-placement --test grpc_runner_test

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use switchyard_placement::prelude::*;
use switchyard_placement::runner::build_mtls_runner;
use switchyard_protocol::proto::{self, client_msg, ClientMsg, RunnerMsg, StatusRequest, TryCall};
use switchyard_protocol::{datetime_to_proto_timestamp, RunnerProtocol, RunnerProtocolServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Decline,
    Reverse,
}

/// Runner that either declines everything or answers with the reversed body
#[derive(Clone)]
struct TestRunner {
    mode: Mode,
    offers: Arc<Mutex<Vec<TryCall>>>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestRunner {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            offers: Arc::new(Mutex::new(Vec::new())),
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[tonic::async_trait]
impl RunnerProtocol for TestRunner {
    type EngageStream = ReceiverStream<Result<RunnerMsg, Status>>;

    async fn engage(
        &self,
        request: Request<Streaming<ClientMsg>>,
    ) -> Result<Response<Self::EngageStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let runner = self.clone();

        tokio::spawn(async move {
            let try_call = match inbound.message().await {
                Ok(Some(ClientMsg {
                    body: Some(client_msg::Body::Call(call)),
                })) => call,
                _ => {
                    let _ = tx
                        .send(Err(Status::invalid_argument("expected TryCall")))
                        .await;
                    return;
                }
            };
            let fn_id = serde_json::from_str::<serde_json::Value>(&try_call.call_json)
                .ok()
                .and_then(|model| model["fn_id"].as_str().map(str::to_string))
                .unwrap_or_default();
            runner.offers.lock().push(try_call);

            if runner.mode == Mode::Decline {
                let _ = tx.send(Ok(RunnerMsg::acknowledged(false, "at capacity"))).await;
                return;
            }
            let _ = tx.send(Ok(RunnerMsg::acknowledged(true, "committed"))).await;

            let mut body = Vec::new();
            while let Ok(Some(msg)) = inbound.message().await {
                if let Some(client_msg::Body::Data(frame)) = msg.body {
                    body.extend_from_slice(&frame.data);
                    if frame.eof {
                        break;
                    }
                }
            }
            runner.bodies.lock().push(body.clone());

            let mut reversed = body;
            reversed.reverse();
            let frames = vec![
                RunnerMsg::result_start(
                    201,
                    vec![("content-type".into(), "application/octet-stream".into())],
                ),
                RunnerMsg::log(format!("running {}\n", fn_id).into_bytes()),
                RunnerMsg::data(reversed, true),
                RunnerMsg::finished(true, "done"),
            ];
            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<proto::RunnerStatus>, Status> {
        let created = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        Ok(Response::new(proto::RunnerStatus {
            active: 2,
            failed: false,
            id: "probe-1".into(),
            details: "ok".into(),
            created_at: Some(datetime_to_proto_timestamp(created)),
            ..Default::default()
        }))
    }
}

async fn serve(runner: TestRunner) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        Server::builder()
            .add_service(RunnerProtocolServer::new(runner))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    address
}

/// Certificate authority for test runners and clients
struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// PEM encoded leaf certificate and its key
struct Issued {
    cert: String,
    key: String,
}

impl Authority {
    fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    fn pem(&self) -> String {
        self.cert.pem()
    }

    fn issue(&self, name: &str) -> Issued {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Issued {
            cert: cert.pem(),
            key: key.serialize_pem(),
        }
    }
}

/// Serve over TLS, requiring client certificates issued by `ca`
async fn serve_tls(runner: TestRunner, ca: &Authority, identity: &Issued) -> String {
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(&identity.cert, &identity.key))
        .client_ca_root(Certificate::from_pem(ca.pem()));
    let mut server = Server::builder().tls_config(tls).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        // Rejected handshakes may end the accept loop
        let _ = server
            .add_service(RunnerProtocolServer::new(runner))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    address
}

fn client_pki(ca: &Authority, client: &Issued) -> PkiData {
    PkiData::new(ca.pem(), client.key.clone(), client.cert.clone())
}

fn call() -> InvocationCall {
    InvocationCall::new(CallModel::new("app-1", "fn-1", "registry/fn:1"))
        .with_slot_hash_id("slot-1")
        .with_extension("trace_id", "abc")
}

#[test_log::test(tokio::test)]
async fn test_decline_leaves_body_untouched() {
    let server = TestRunner::new(Mode::Decline);
    let address = serve(server.clone()).await;
    let runner = InsecureRunnerFactory::new().connect(&address).await.unwrap();
    let call = call().with_body(b"payload".to_vec());

    let outcome = runner
        .try_exec(&CallContext::background(), &call)
        .await
        .unwrap();

    assert_eq!(outcome, TryOutcome::Declined);
    assert_eq!(server.offers.lock().len(), 1);
    assert!(call.request_body().is_some());
    assert_eq!(call.response().status(), None);
}

#[test_log::test(tokio::test)]
async fn test_accept_streams_body_and_result() {
    let server = TestRunner::new(Mode::Reverse);
    let address = serve(server.clone()).await;
    let runner = InsecureRunnerFactory::new().connect(&address).await.unwrap();

    // Larger than one frame
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let call = call().with_body(body.clone());

    let outcome = runner
        .try_exec(&CallContext::background(), &call)
        .await
        .unwrap();

    let TryOutcome::Accepted(completion) = outcome else {
        panic!("expected acceptance, got {:?}", outcome);
    };
    assert!(completion.success);
    assert_eq!(completion.details, "done");

    assert_eq!(server.bodies.lock().as_slice(), &[body.clone()]);
    let offer = server.offers.lock()[0].clone();
    assert_eq!(offer.slot_hash_id, "slot-1");
    assert_eq!(offer.extensions.get("trace_id").map(String::as_str), Some("abc"));

    let mut reversed = body;
    reversed.reverse();
    assert_eq!(call.response().status(), Some(201));
    assert_eq!(
        call.response().headers(),
        vec![(
            "content-type".to_string(),
            "application/octet-stream".to_string()
        )]
    );
    assert_eq!(call.response().body(), reversed);
    assert_eq!(call.diagnostics().contents(), b"running fn-1\n");
    assert!(call.diagnostics().is_closed());
    assert_eq!(runner.in_flight(), 0);
}

#[tokio::test]
async fn test_status_probe() {
    let address = serve(TestRunner::new(Mode::Reverse)).await;
    let runner = InsecureRunnerFactory::new().connect(&address).await.unwrap();

    let status = runner.status(&CallContext::background()).await.unwrap();

    assert!(status.is_healthy());
    assert_eq!(status.active_request_count, 2);
    assert_eq!(status.status_id, "probe-1");
    assert_eq!(
        status.created_at,
        Utc.timestamp_opt(1_700_000_000, 0).single()
    );
    assert_eq!(status.started_at, None);
    assert_eq!(status.error_code, None);
}

#[tokio::test]
async fn test_canceled_context_never_reaches_runner() {
    let server = TestRunner::new(Mode::Reverse);
    let address = serve(server.clone()).await;
    let runner = InsecureRunnerFactory::new().connect(&address).await.unwrap();
    let ctx = CallContext::background();
    ctx.cancel();

    let err = runner.try_exec(&ctx, &call()).await.unwrap_err();

    assert!(matches!(err, RunnerError::Context(ContextError::Canceled)));
    assert!(server.offers.lock().is_empty());
}

#[tokio::test]
async fn test_closed_runner_refuses_work() {
    let address = serve(TestRunner::new(Mode::Reverse)).await;
    let runner = InsecureRunnerFactory::new().connect(&address).await.unwrap();

    runner.close(&CallContext::background()).await.unwrap();
    runner.close(&CallContext::background()).await.unwrap();

    let err = runner
        .try_exec(&CallContext::background(), &call())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Closed));
    assert!(matches!(
        runner.status(&CallContext::background()).await,
        Err(RunnerError::Closed)
    ));
}

#[test_log::test(tokio::test)]
async fn test_placement_fails_over_to_accepting_runner() {
    let busy = serve(TestRunner::new(Mode::Decline)).await;
    let free = serve(TestRunner::new(Mode::Reverse)).await;
    let pool = StaticRunnerPool::from_addresses(
        &[busy.clone(), free.clone()],
        &InsecureRunnerFactory::new(),
    )
    .await;
    let call = call().with_body(b"abc".to_vec());

    let placement = OrderedPlacer::default()
        .place_call(&pool, &CallContext::background(), &call)
        .await
        .unwrap();

    assert_eq!(placement.runner, free);
    assert_eq!(placement.attempts, 2);
    assert_eq!(call.response().body(), b"cba");

    pool.shutdown(&CallContext::background()).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_mtls_runner_accepts_call() {
    let ca = Authority::new("switchyard test ca");
    let server = TestRunner::new(Mode::Reverse);
    let address = serve_tls(server.clone(), &ca, &ca.issue("runner.internal")).await;
    let pki = client_pki(&ca, &ca.issue("lb.internal"));

    let factory = MtlsRunnerFactory::new("runner.internal", pki.clone())
        .with_connect_timeout(Duration::from_secs(5));
    let runner = factory.build(&address).await.unwrap();
    let call = call().with_body(b"secure".to_vec());

    let outcome = runner
        .try_exec(&CallContext::background(), &call)
        .await
        .unwrap();

    assert!(matches!(outcome, TryOutcome::Accepted(ref completion) if completion.success));
    assert_eq!(call.response().body(), b"eruces");
    assert_eq!(server.offers.lock().len(), 1);
    runner.close(&CallContext::background()).await.unwrap();

    let direct = build_mtls_runner(&address, "runner.internal", &pki)
        .await
        .unwrap();
    let status = direct.status(&CallContext::background()).await.unwrap();
    assert_eq!(status.status_id, "probe-1");
}

#[test_log::test(tokio::test)]
async fn test_mtls_rejects_mismatched_common_name() {
    let ca = Authority::new("switchyard test ca");
    let server = TestRunner::new(Mode::Reverse);
    let address = serve_tls(server.clone(), &ca, &ca.issue("runner.internal")).await;
    let pki = client_pki(&ca, &ca.issue("lb.internal"));
    let factory = MtlsRunnerFactory::new("other.internal", pki)
        .with_connect_timeout(Duration::from_secs(5));

    let Err(err) = factory.build(&address).await else {
        panic!("runner with the wrong name should not be built");
    };

    assert!(matches!(err, FactoryError::Connect { .. }), "{}", err);
    assert!(server.offers.lock().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_mtls_rejects_untrusted_client_certificate() {
    let ca = Authority::new("switchyard test ca");
    let rogue = Authority::new("rogue ca");
    let server = TestRunner::new(Mode::Reverse);
    let address = serve_tls(server.clone(), &ca, &ca.issue("runner.internal")).await;
    // Trusts the real CA but presents a certificate the runner never issued
    let pki = client_pki(&ca, &rogue.issue("lb.internal"));
    let factory = MtlsRunnerFactory::new("runner.internal", pki)
        .with_connect_timeout(Duration::from_secs(5));

    // TLS 1.3 clients may only see the rejection on first use
    let rejected = match factory.build(&address).await {
        Ok(runner) => runner
            .try_exec(
                &CallContext::with_timeout_from_now(Duration::from_secs(5)),
                &call(),
            )
            .await
            .is_err(),
        Err(err) => matches!(
            err,
            FactoryError::Connect { .. } | FactoryError::ConnectTimeout { .. }
        ),
    };

    assert!(rejected);
    assert!(server.offers.lock().is_empty());
}
