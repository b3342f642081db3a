//! Shared test fixtures: a fake receiver speaking just enough HTTP to hand
//! out an endless MPEG-TS byte stream, plus orchestrator/app builders wired
//! to stub runners and an in-memory store.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use xg2g::config::Config;
use xg2g::metrics::Metrics;
use xg2g::models::SessionState;
use xg2g::orchestrator::SessionOrchestrator;
use xg2g::runner::{Runner, RunnerFactory};
use xg2g::store::Store;
use xg2g::upstream::UpstreamFetcher;
use xg2g::web::AppState;

/// Minimal receiver: answers every request with an endless TS stream
pub async fn spawn_fake_receiver() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake receiver");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = [0u8; 2048];
                let _ = socket.read(&mut request).await;
                let header = "HTTP/1.1 200 OK\r\nContent-Type: video/mpeg\r\nConnection: close\r\n\r\n";
                if socket.write_all(header.as_bytes()).await.is_err() {
                    return;
                }
                let chunk = [0x47u8; 1316];
                loop {
                    if socket.write_all(&chunk).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            });
        }
    });
    (addr, handle)
}

pub fn test_config(receiver_addr: SocketAddr, data_dir: &Path, hls_root: &Path) -> Config {
    let mut config = Config::default();
    config.receiver.base_url = format!("http://{}", receiver_addr.ip());
    config.receiver.stream_port = receiver_addr.port();
    config.storage.backend = "memory".to_string();
    config.storage.data_dir = data_dir.to_path_buf();
    config.storage.hls_root = hls_root.to_path_buf();
    config.sessions.grace = Duration::from_millis(250);
    config.sessions.cleanup_deadline = Duration::from_secs(2);
    config.sessions.idempotency_ttl = Duration::from_secs(5);
    config.upstream.connect_timeout = Duration::from_secs(1);
    config.upstream.backoff_initial = Duration::from_millis(50);
    config.upstream.backoff_max = Duration::from_millis(500);
    config
}

/// Runner factory built from a closure
pub struct FnRunnerFactory {
    f: Box<dyn Fn() -> Box<dyn Runner> + Send + Sync>,
}

impl FnRunnerFactory {
    pub fn new<R, F>(f: F) -> Self
    where
        R: Runner + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        FnRunnerFactory {
            f: Box::new(move || Box::new(f())),
        }
    }
}

impl RunnerFactory for FnRunnerFactory {
    fn create(&self) -> Box<dyn Runner> {
        (self.f)()
    }
}

pub struct TestHarness {
    pub config: Config,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
}

pub async fn harness(config: Config, factory: Arc<dyn RunnerFactory>) -> TestHarness {
    tokio::fs::create_dir_all(config.storage.hls_root.join("sessions"))
        .await
        .expect("hls root");
    tokio::fs::create_dir_all(&config.storage.data_dir)
        .await
        .expect("data dir");

    let store = Store::open_in_memory().await.expect("store");
    let metrics = Arc::new(Metrics::new());
    let fetcher = UpstreamFetcher::new(config.upstream.clone(), config.receiver.clone())
        .expect("fetcher");
    let orchestrator = SessionOrchestrator::new(
        config.clone(),
        store.clone(),
        fetcher,
        factory,
        metrics.clone(),
    );
    TestHarness {
        config,
        orchestrator,
        store,
        metrics,
    }
}

impl TestHarness {
    pub fn app(&self) -> axum_test::TestServer {
        let state = AppState::new(
            &self.config,
            self.orchestrator.clone(),
            self.store.clone(),
            self.metrics.clone(),
        );
        axum_test::TestServer::new(xg2g::web::router(state, None)).expect("test server")
    }

    pub async fn wait_for_state(&self, session_id: &str, state: SessionState, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self
                .orchestrator
                .query(session_id)
                .await
                .expect("query")
                .expect("session exists");
            if snapshot.state == state {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {session_id} stuck in {:?} waiting for {state:?}",
                snapshot.state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub const SERVICE_REF: &str = "1:0:19:EF75:3F9:1:C00000:0:0:0";
