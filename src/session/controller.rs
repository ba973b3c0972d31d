//! Session controller
//!
//! Binds the listener for one session, accepts the front end, and drives the
//! session event loop until there is nothing left to serve.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionState};
use crate::launch::{LaunchError, RuntimeLocator};
use crate::process::{ProcessError, ProcessEvent, ProcessExit};
use crate::server::{self, ProtocolError, ProtocolResult, SessionListener};

/// Default time to wait for a process after asking it to stop
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Errors that can occur while running a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind session listener on {addr}: {source}")]
    Bind {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Session listener has no local address: {0}")]
    Address(#[source] std::io::Error),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Session is already running or finished")]
    AlreadyStarted,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address the listener binds to
    pub bind: IpAddr,
    /// Where the runtime binary lives
    pub locator: RuntimeLocator,
    /// Environment added to every launched process
    pub env: HashMap<String, String>,
    /// How long to wait for a process after requesting termination
    pub linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            locator: RuntimeLocator::default(),
            env: HashMap::new(),
            linger: DEFAULT_LINGER,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Set the runtime locator
    pub fn with_locator(mut self, locator: RuntimeLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Set the extra process environment
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the linger duration
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

/// What a finished session observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Exit of the launched process, if it was observed
    pub exit: Option<ProcessExit>,
    /// Termination signals sent to the process
    pub termination_signals: usize,
}

impl SessionSummary {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            state: session.state(),
            exit: session.exit().cloned(),
            termination_signals: session.termination_signals(),
        }
    }

    fn never_connected(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::Listening,
            exit: None,
            termination_signals: 0,
        }
    }

    /// Exit code of the launched process, if it was observed
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.as_ref().map(|exit| exit.exit_code)
    }
}

/// Serves exactly one front-end connection
pub struct SessionController {
    id: Uuid,
    config: SessionConfig,
    listener: SessionListener,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// One turn of the session event loop
enum Step {
    Inbound(Option<ProtocolResult<String>>),
    Process(Option<ProcessEvent>),
    Shutdown,
    LingerElapsed,
}

impl SessionController {
    /// Bind the listener on an OS-assigned port
    pub async fn bind(config: SessionConfig) -> SessionResult<Self> {
        let listener = SessionListener::bind(config.bind)
            .await
            .map_err(|source| SessionError::Bind {
                addr: config.bind,
                source,
            })?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let id = Uuid::new_v4();

        if let Ok(addr) = listener.local_addr() {
            debug!("Session {} listening on {}", id, addr);
        }

        Ok(Self {
            id,
            config,
            listener,
            started: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SessionResult<SocketAddr> {
        self.listener.local_addr().map_err(SessionError::Address)
    }

    /// Port the front end should connect to
    pub fn port(&self) -> SessionResult<u16> {
        Ok(self.local_addr()?.port())
    }

    /// Trigger session shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept the front end and serve it until the session finishes
    pub async fn run(&self) -> SessionResult<SessionSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let (stream, peer) = tokio::select! {
            accepted = self.listener.accept() => accepted.map_err(SessionError::Accept)?,
            _ = shutdown_rx.recv() => {
                info!("Session {} shut down before a client connected", self.id);
                return Ok(SessionSummary::never_connected(self.id));
            }
        };
        info!("Session {}: client connected from {}", self.id, peer);

        let (mut inbound, outbound, writer) = server::split(stream, peer);
        let mut session = Session::new(
            self.id,
            self.config.locator.clone(),
            self.config.env.clone(),
            outbound,
        );

        let mut transport_open = true;
        let mut shutdown_requested = false;
        let mut linger_deadline: Option<Instant> = None;

        while !session.is_finished(transport_open) {
            if linger_deadline.is_none() && session.termination_requested() {
                linger_deadline = Some(Instant::now() + self.config.linger);
            }

            let step = tokio::select! {
                frame = inbound.next(), if transport_open => Step::Inbound(frame),
                event = session.next_process_event() => Step::Process(event),
                _ = shutdown_rx.recv(), if !shutdown_requested => Step::Shutdown,
                _ = sleep_until(linger_deadline.unwrap_or_else(Instant::now)), if linger_deadline.is_some() => {
                    Step::LingerElapsed
                }
            };

            match step {
                Step::Inbound(Some(Ok(text))) => {
                    debug!("Session {}: received {}", self.id, text);
                    session.dispatch(&text).await;
                }
                Step::Inbound(Some(Err(e))) => {
                    warn!("Session {}: transport error from {}: {}", self.id, peer, e);
                    transport_open = false;
                    session.on_transport_closed();
                }
                Step::Inbound(None) => {
                    info!("Session {}: client {} disconnected", self.id, peer);
                    transport_open = false;
                    session.on_transport_closed();
                }
                Step::Process(Some(event)) => session.relay(event).await,
                Step::Process(None) => session.on_process_gone(),
                Step::Shutdown => {
                    info!("Session {}: shutdown requested", self.id);
                    shutdown_requested = true;
                    transport_open = false;
                    session.on_transport_closed();
                }
                Step::LingerElapsed => {
                    linger_deadline = None;
                    session.detach();
                }
            }
        }

        let summary = SessionSummary::from_session(&session);

        // Dropping the session closes the outbound queue so the writer can flush
        drop(session);
        if let Err(e) = writer.await {
            warn!("Session {}: writer task failed: {}", self.id, e);
        }

        info!("Session {} finished in state {}", self.id, summary.state);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DapCodec, ProtocolMessage, Response};
    use futures_util::SinkExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    const WAIT: Duration = Duration::from_secs(10);

    /// Minimal front end speaking the framed protocol
    struct TestClient {
        framed: Framed<TcpStream, DapCodec>,
        seq: i64,
    }

    impl TestClient {
        async fn connect(port: u16) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            Self {
                framed: Framed::new(stream, DapCodec::new()),
                seq: 0,
            }
        }

        async fn request(&mut self, command: &str, arguments: Option<Value>) -> i64 {
            self.seq += 1;
            let mut message = json!({"seq": self.seq, "type": "request", "command": command});
            if let Some(arguments) = arguments {
                message["arguments"] = arguments;
            }
            self.framed.send(message.to_string()).await.unwrap();
            self.seq
        }

        /// Write bytes to the socket without framing them
        async fn send_raw(&mut self, bytes: &[u8]) {
            let stream = self.framed.get_mut();
            stream.write_all(bytes).await.unwrap();
            stream.flush().await.unwrap();
        }

        /// Skip messages until the response to `request_seq`
        async fn response_to(&mut self, request_seq: i64) -> Response {
            loop {
                match self.next().await.expect("connection closed before response") {
                    ProtocolMessage::Response(r) if r.request_seq == request_seq => return r,
                    _ => {}
                }
            }
        }

        async fn next(&mut self) -> Option<ProtocolMessage> {
            let text = tokio::time::timeout(WAIT, self.framed.next())
                .await
                .expect("timed out waiting for message")?
                .unwrap();
            Some(ProtocolMessage::from_json(&text).unwrap())
        }

        /// Read until the server closes the connection
        async fn collect(&mut self) -> Vec<ProtocolMessage> {
            let mut messages = Vec::new();
            while let Some(message) = self.next().await {
                messages.push(message);
            }
            messages
        }
    }

    fn event_names(messages: &[ProtocolMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Event(e) => Some(e.event.clone()),
                _ => None,
            })
            .collect()
    }

    fn exited_codes(messages: &[ProtocolMessage]) -> Vec<i64> {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Event(e) if e.event == "exited" => {
                    e.body.as_ref().and_then(|b| b["exitCode"].as_i64())
                }
                _ => None,
            })
            .collect()
    }

    fn stdout_of(messages: &[ProtocolMessage]) -> String {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Event(e) if e.event == "output" => e.body.clone(),
                _ => None,
            })
            .filter(|body| body["category"] == "stdout")
            .filter_map(|body| body["output"].as_str().map(str::to_string))
            .collect()
    }

    async fn start(config: SessionConfig) -> (u16, JoinHandle<SessionResult<SessionSummary>>) {
        let controller = SessionController::bind(config).await.unwrap();
        let port = controller.port().unwrap();
        let handle = tokio::spawn(async move { controller.run().await });
        (port, handle)
    }

    #[cfg(unix)]
    fn shell_runtime() -> (tempfile::TempDir, RuntimeLocator) {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join("bin")).unwrap();
        std::os::unix::fs::symlink("/bin/sh", home.path().join("bin").join("java")).unwrap();
        let locator = RuntimeLocator::new().with_home(Some(home.path().to_path_buf()));
        (home, locator)
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let controller = SessionController::bind(SessionConfig::new()).await.unwrap();
        assert_ne!(controller.port().unwrap(), 0);
        assert!(controller.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_shutdown_while_listening() {
        let controller = Arc::new(SessionController::bind(SessionConfig::new()).await.unwrap());
        let runner = Arc::clone(&controller);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();

        let summary = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.state, SessionState::Listening);
        assert!(summary.exit.is_none());

        assert!(matches!(
            controller.run().await,
            Err(SessionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_initialize_then_disconnect() {
        let (port, handle) = start(SessionConfig::new()).await;
        let mut client = TestClient::connect(port).await;

        let init_seq = client.request("initialize", Some(json!({"clientID": "test"}))).await;
        client.request("disconnect", None).await;
        let messages = client.collect().await;

        assert_eq!(messages.len(), 3);
        match &messages[0] {
            ProtocolMessage::Response(r) => {
                assert_eq!(r.request_seq, init_seq);
                assert_eq!(r.seq, 1);
                assert!(r.success);
            }
            other => panic!("Expected Response, got {:?}", other),
        }
        match &messages[1] {
            ProtocolMessage::Event(e) => {
                assert_eq!(e.event, "initialized");
                assert_eq!(e.seq, 2);
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        assert!(matches!(&messages[2], ProtocolMessage::Response(r) if r.command == "disconnect"));

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.state, SessionState::Terminated);
        assert_eq!(summary.termination_signals, 0);
    }

    #[tokio::test]
    async fn test_missing_runtime_binary_reports_terminated() {
        let home = tempfile::tempdir().unwrap();
        let locator = RuntimeLocator::new().with_home(Some(home.path().to_path_buf()));
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        client.request("launch", Some(json!({"mainClass": "com.foo.Main"}))).await;
        let response = client.next().await.unwrap();
        assert!(matches!(&response, ProtocolMessage::Response(r) if !r.success));
        let terminated = client.next().await.unwrap();
        assert!(matches!(&terminated, ProtocolMessage::Event(e) if e.event == "terminated"));

        client.request("disconnect", None).await;
        let rest = client.collect().await;
        assert!(event_names(&rest).is_empty());

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.exit.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_exit_zero_reports_exited() {
        let (_home, locator) = shell_runtime();
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "echo out; echo err >&2; exit 0"})))
            .await;

        let mut messages = Vec::new();
        loop {
            let message = client.next().await.unwrap();
            let done = matches!(&message, ProtocolMessage::Event(e) if e.event == "exited");
            messages.push(message);
            if done {
                break;
            }
        }
        client.request("disconnect", None).await;
        messages.extend(client.collect().await);

        let events = event_names(&messages);
        assert_eq!(events.iter().filter(|e| *e == "exited").count(), 1);
        assert!(!events.contains(&"terminated".to_string()));

        let exited = messages
            .iter()
            .find_map(|m| match m {
                ProtocolMessage::Event(e) if e.event == "exited" => e.body.clone(),
                _ => None,
            })
            .unwrap();
        assert_eq!(exited, json!({"exitCode": 0}));

        let output = |category: &str| -> String {
            messages
                .iter()
                .filter_map(|m| match m {
                    ProtocolMessage::Event(e) if e.event == "output" => e.body.clone(),
                    _ => None,
                })
                .filter(|body| body["category"] == category)
                .filter_map(|body| body["output"].as_str().map(str::to_string))
                .collect()
        };
        assert_eq!(output("stdout"), "out\n");
        assert_eq!(output("stderr"), "err\n");

        // Sequence numbers are strictly increasing from 1
        let seqs: Vec<i64> = messages.iter().map(ProtocolMessage::seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_code(), Some(0));
        assert_eq!(summary.termination_signals, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_repeated_disconnect_signals_once() {
        let (_home, locator) = shell_runtime();
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        client
            .request(
                "launch",
                Some(json!({"vmArgs": "-c", "mainClass": "trap '' TERM; echo ready; sleep 2"})),
            )
            .await;

        // Wait until the trap is installed
        loop {
            match client.next().await.unwrap() {
                ProtocolMessage::Event(e) if e.event == "output" => {
                    if e.body.as_ref().and_then(|b| b["output"].as_str()) == Some("ready\n") {
                        break;
                    }
                }
                _ => {}
            }
        }

        client.request("disconnect", None).await;
        client.request("disconnect", None).await;
        let messages = client.collect().await;

        let acks = messages
            .iter()
            .filter(|m| matches!(m, ProtocolMessage::Response(r) if r.command == "disconnect" && r.success))
            .count();
        assert_eq!(acks, 2);
        assert_eq!(
            event_names(&messages).iter().filter(|e| *e == "exited").count(),
            1
        );

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.termination_signals, 1);
        assert_eq!(summary.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_hangup_terminates_process() {
        let (_home, locator) = shell_runtime();
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "exec sleep 30"})))
            .await;
        let response = client.next().await.unwrap();
        assert!(matches!(&response, ProtocolMessage::Response(r) if r.success));
        drop(client);

        let summary = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.termination_signals, 1);
        assert_eq!(summary.exit_code(), Some(-15));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_linger_detaches_stubborn_process() {
        let (_home, locator) = shell_runtime();
        let config = SessionConfig::new()
            .with_locator(locator)
            .with_linger(Duration::from_millis(200));
        let (port, handle) = start(config).await;
        let mut client = TestClient::connect(port).await;

        client
            .request(
                "launch",
                Some(json!({"vmArgs": "-c", "mainClass": "trap '' TERM; echo ready; sleep 5"})),
            )
            .await;
        loop {
            if let ProtocolMessage::Event(e) = client.next().await.unwrap() {
                if e.event == "output" {
                    break;
                }
            }
        }

        client.request("disconnect", None).await;
        let messages = client.collect().await;
        assert!(!event_names(&messages).contains(&"exited".to_string()));

        let summary = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.state, SessionState::Terminated);
        assert!(summary.exit.is_none());
        assert_eq!(summary.termination_signals, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_while_launched_relays_exit() {
        let (_home, locator) = shell_runtime();
        let controller = Arc::new(
            SessionController::bind(SessionConfig::new().with_locator(locator))
                .await
                .unwrap(),
        );
        let port = controller.port().unwrap();
        let runner = Arc::clone(&controller);
        let handle = tokio::spawn(async move { runner.run().await });
        let mut client = TestClient::connect(port).await;

        let launch = client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "exec sleep 30"})))
            .await;
        assert!(client.response_to(launch).await.success);

        controller.shutdown();
        let messages = client.collect().await;
        assert_eq!(exited_codes(&messages), vec![-15]);

        let summary = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.termination_signals, 1);
        assert_eq!(summary.exit_code(), Some(-15));
        assert_eq!(summary.state, SessionState::Terminated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_malformed_frame_terminates_process() {
        let (_home, locator) = shell_runtime();
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        let launch = client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "exec sleep 30"})))
            .await;
        assert!(client.response_to(launch).await.success);

        client.send_raw(b"Content-Length: abc\r\n\r\n{}").await;
        let messages = client.collect().await;
        assert_eq!(exited_codes(&messages), vec![-15]);

        let summary = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.termination_signals, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_env_overrides_bridge_env() {
        let (_home, locator) = shell_runtime();
        let mut env = HashMap::new();
        env.insert("JRUN_MODE".to_string(), "bridge".to_string());
        env.insert("JRUN_KEEP".to_string(), "base".to_string());
        let config = SessionConfig::new().with_locator(locator).with_env(env);
        let (port, handle) = start(config).await;
        let mut client = TestClient::connect(port).await;

        client
            .request(
                "launch",
                Some(json!({
                    "vmArgs": "-c",
                    "mainClass": "echo $JRUN_MODE $JRUN_KEEP",
                    "env": {"JRUN_MODE": "launch"}
                })),
            )
            .await;

        let mut messages = Vec::new();
        while exited_codes(&messages).is_empty() {
            messages.push(client.next().await.unwrap());
        }
        client.request("disconnect", None).await;
        messages.extend(client.collect().await);

        assert_eq!(stdout_of(&messages), "launch base\n");
        assert_eq!(exited_codes(&messages), vec![0]);
        handle.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_launch_leaves_running_process_alone() {
        let (_home, locator) = shell_runtime();
        let (port, handle) = start(SessionConfig::new().with_locator(locator)).await;
        let mut client = TestClient::connect(port).await;

        let first = client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "exec sleep 30"})))
            .await;
        assert!(client.response_to(first).await.success);

        let second = client
            .request("launch", Some(json!({"vmArgs": "-c", "mainClass": "exit 7"})))
            .await;
        let rejected = client.response_to(second).await;
        assert!(!rejected.success);
        assert!(rejected.message.unwrap().contains("cannot launch"));

        client.request("disconnect", None).await;
        let messages = client.collect().await;
        assert!(!event_names(&messages).contains(&"terminated".to_string()));
        assert_eq!(exited_codes(&messages), vec![-15]);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.termination_signals, 1);
        assert_eq!(summary.exit_code(), Some(-15));
    }
}
