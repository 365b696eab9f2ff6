//! Shared test support: in-memory catalog and queue fakes, a tiny upstream
//! server, and raw HTTP/TLS clients.

#![allow(dead_code)]

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use platform_gateway::frontends::{FrontendRecord, FrontendStore, StoreError};
use platform_gateway::queue::{QueueApi, QueueError, QueueMessage};
use platform_gateway::services::{
    ContainerDefinition, RegistryError, ServiceDescription, ServiceRegistry, TaskDefinition,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-memory service registry with call counting
#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<HashMap<String, ServiceEntry>>,
    pub describe_calls: AtomicUsize,
}

struct ServiceEntry {
    status: String,
    hostname: String,
    port: u16,
}

impl MemoryRegistry {
    pub fn insert(&self, name: &str, hostname: &str, port: u16) {
        self.services.lock().insert(
            name.to_string(),
            ServiceEntry {
                status: "ACTIVE".to_string(),
                hostname: hostname.to_string(),
                port,
            },
        );
    }

    pub fn remove(&self, name: &str) {
        self.services.lock().remove(name);
    }

    pub fn describe_count(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn list_services(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.services.lock().keys().cloned().collect())
    }

    async fn describe_service(&self, name: &str) -> Result<ServiceDescription, RegistryError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);

        self.services
            .lock()
            .get(name)
            .map(|entry| ServiceDescription {
                name: name.to_string(),
                status: entry.status.clone(),
                task_definition: name.to_string(),
            })
            .ok_or(RegistryError::ServiceNotFound)
    }

    async fn describe_task_definition(&self, id: &str) -> Result<TaskDefinition, RegistryError> {
        let services = self.services.lock();
        let entry = services
            .get(id)
            .ok_or_else(|| RegistryError::Api(format!("task definition not found: {}", id)))?;

        let mut labels = HashMap::new();
        labels.insert(
            "com.off-sync.platform.proxy.port".to_string(),
            entry.port.to_string(),
        );

        Ok(TaskDefinition {
            container_definitions: vec![ContainerDefinition {
                name: "server".to_string(),
                hostname: entry.hostname.clone(),
                labels,
            }],
        })
    }
}

/// In-memory frontend store
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, FrontendRecord>>,
}

impl MemoryStore {
    pub fn insert(&self, record: FrontendRecord) {
        self.records.lock().insert(record.name.clone(), record);
    }

    pub fn remove(&self, name: &str) {
        self.records.lock().remove(name);
    }
}

#[async_trait]
impl FrontendStore for MemoryStore {
    async fn scan_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<FrontendRecord>, StoreError> {
        Ok(self.records.lock().get(name).cloned())
    }
}

/// Plaintext frontend record
pub fn frontend_record(name: &str, url: &str, service: &str) -> FrontendRecord {
    FrontendRecord {
        name: name.to_string(),
        url: url.to_string(),
        service_name: service.to_string(),
        ..Default::default()
    }
}

/// Self-signed certificate and key PEM for a host
pub fn self_signed_pem(host: &str) -> (String, String) {
    let key =
        rcgen::generate_simple_self_signed(vec![host.to_string()]).expect("generate certificate");
    (key.cert.pem(), key.key_pair.serialize_pem())
}

/// In-memory queue with at-least-once visibility semantics left to the test
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MemoryQueue {
    pub fn push(&self, body: &str) {
        let receipt = format!("r-{}", self.messages.lock().len());
        self.messages.lock().push_back(QueueMessage {
            body: body.to_string(),
            receipt_handle: receipt,
        });
    }
}

#[async_trait]
impl QueueApi for MemoryQueue {
    async fn queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::MissingQueueName);
        }
        Ok(format!("memory://{}", queue_name))
    }

    async fn receive_messages(&self, _queue_url: &str) -> Result<Vec<QueueMessage>, QueueError> {
        let drained: Vec<QueueMessage> = self.messages.lock().drain(..).collect();
        if drained.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(drained)
    }

    async fn delete_message(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        self.deleted.lock().push(receipt_handle.to_string());
        Ok(())
    }
}

/// Start a tiny upstream HTTP server that answers
/// `<marker> <path> proto=<x-forwarded-proto> host=<x-forwarded-host>` and
/// counts hits.
pub async fn start_upstream(marker: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let loop_hits = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };

            let hits = Arc::clone(&loop_hits);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("-")
                                .to_string()
                        };
                        let body = format!(
                            "{} {} proto={} host={}",
                            marker,
                            req.uri().path(),
                            header("x-forwarded-proto"),
                            header("x-forwarded-host"),
                        );
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                    }
                });

                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// Send a raw HTTP/1.1 request with the provided Host header and return the
/// full response text.
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

/// Certificate verifier that accepts anything; tests pin trust elsewhere
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Open a TLS connection with the provided SNI name and send a raw HTTP/1.1
/// request. Returns the full response text, or an error when the handshake
/// fails.
pub async fn https_get(
    addr: SocketAddr,
    sni: &str,
    path: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await?;
    let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())?;
    let mut tls = connector.connect(server_name, stream).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, sni
    );
    tls.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    let _ = tls.read_to_string(&mut response).await;
    Ok(response)
}

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
