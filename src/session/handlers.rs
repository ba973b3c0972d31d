//! Request handlers and event relay for one session
//!
//! `Session` is the state machine behind a connected front end. It reacts to
//! decoded requests and process events, and queues every response and event
//! on the single outbound channel.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SessionError, SessionResult, SessionState};
use crate::launch::{build_arguments, LaunchConfiguration, RuntimeLocator};
use crate::process::{ProcessEvent, ProcessExit, RuntimeProcess, TerminationOutcome};
use crate::server::{
    ClientRequest, DisconnectArguments, InitializeArguments, OutboundSender, Outgoing,
    ProtocolMessage, Reply, Request, SessionEvent,
};

/// A connected session and the process it launched
pub struct Session {
    /// Session identifier, for logs
    id: Uuid,
    /// Current lifecycle state
    state: SessionState,
    /// Where the runtime binary lives
    locator: RuntimeLocator,
    /// Environment added to every launch
    base_env: HashMap<String, String>,
    /// Queue to the transport writer
    outbound: OutboundSender,
    /// The launched process, until it exits or is detached
    process: Option<RuntimeProcess>,
    /// Whether the front end asked to disconnect
    disconnected: bool,
    /// Exit of the launched process, once observed
    exit: Option<ProcessExit>,
    /// Termination signals actually sent
    termination_signals: usize,
}

impl Session {
    /// Create a session for a freshly connected front end
    pub fn new(
        id: Uuid,
        locator: RuntimeLocator,
        base_env: HashMap<String, String>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            locator,
            base_env,
            outbound,
            process: None,
            disconnected: false,
            exit: None,
            termination_signals: 0,
        }
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Exit of the launched process, if it has been observed
    pub fn exit(&self) -> Option<&ProcessExit> {
        self.exit.as_ref()
    }

    /// Number of termination signals sent to the process
    pub fn termination_signals(&self) -> usize {
        self.termination_signals
    }

    /// Whether the front end sent `disconnect`
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Whether a launched process is still attached
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Whether termination of the attached process has been requested
    pub fn termination_requested(&self) -> bool {
        self.process
            .as_ref()
            .is_some_and(RuntimeProcess::termination_requested)
    }

    /// Whether the session has nothing left to do
    pub fn is_finished(&self, transport_open: bool) -> bool {
        !self.has_process() && (!transport_open || self.is_disconnected())
    }

    /// Wait for the next event of the attached process
    ///
    /// Pends forever when there is no process.
    pub async fn next_process_event(&mut self) -> Option<ProcessEvent> {
        match self.process.as_mut() {
            Some(process) => process.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handle one inbound frame body
    pub async fn dispatch(&mut self, text: &str) {
        match ProtocolMessage::from_json(text) {
            Ok(ProtocolMessage::Request(request)) => self.handle_request(request).await,
            Ok(other) => debug!(
                "Session {}: ignoring non-request message seq {}",
                self.id,
                other.seq()
            ),
            Err(e) => warn!("Session {}: dropping undecodable message: {}", self.id, e),
        }
    }

    /// Route a request to its handler
    pub async fn handle_request(&mut self, request: Request) {
        debug!(
            "Session {}: request '{}' (seq {})",
            self.id, request.command, request.seq
        );

        match ClientRequest::parse(&request) {
            Ok(ClientRequest::Initialize(args)) => self.on_initialize(&request, args).await,
            Ok(ClientRequest::Launch(config)) => self.on_launch(&request, config).await,
            Ok(ClientRequest::Disconnect(args)) => {
                self.on_disconnect(&request, args).await;
            }
            Ok(ClientRequest::Threads) => {
                let reply = Reply::success(&request).with_body(json!({ "threads": [] }));
                self.send(reply).await;
            }
            Ok(ClientRequest::Unknown(command)) => {
                debug!("Session {}: unrecognized request '{}'", self.id, command);
                self.send(Reply::error(&request, "unrecognized request")).await;
            }
            Err(e) if request.command == "launch" => {
                self.fail_launch(&request, SessionError::Protocol(e)).await;
            }
            Err(e) => self.send(Reply::error(&request, e.to_string())).await,
        }
    }

    /// Answer `initialize` with an empty capability set, then signal readiness
    pub async fn on_initialize(&mut self, request: &Request, args: InitializeArguments) {
        info!(
            "Session {}: initialize from {}",
            self.id,
            args.client_name
                .as_deref()
                .or(args.client_id.as_deref())
                .unwrap_or("unknown client")
        );
        self.send(Reply::success(request).with_body(json!({}))).await;
        self.send(SessionEvent::Initialized).await;
    }

    /// Spawn the runtime for a launch configuration
    ///
    /// Any failure answers the request unsuccessfully and ends the session
    /// with a `terminated` event.
    pub async fn on_launch(&mut self, request: &Request, config: LaunchConfiguration) {
        if !self.state.can_launch() {
            warn!(
                "Session {}: launch rejected in state {}",
                self.id, self.state
            );
            let message = format!("session cannot launch in state {}", self.state);
            self.send(Reply::error(request, message)).await;
            return;
        }

        match self.spawn(&config) {
            Ok(process) => {
                info!(
                    "Session {}: launched {} (pid {:?})",
                    self.id,
                    config.main_class,
                    process.pid()
                );
                self.process = Some(process);
                self.state = SessionState::Launched;
                self.send(Reply::success(request)).await;
            }
            Err(e) => self.fail_launch(request, e).await,
        }
    }

    /// Ask the process to stop; repeated calls never signal twice
    pub async fn on_disconnect(&mut self, request: &Request, args: DisconnectArguments) {
        debug!(
            "Session {}: disconnect (terminateDebuggee={:?})",
            self.id, args.terminate_debuggee
        );
        self.disconnected = true;
        self.request_termination();
        self.state = SessionState::Terminated;
        self.send(Reply::success(request)).await;
    }

    /// The transport went away; stop the process the same way as disconnect
    pub fn on_transport_closed(&mut self) {
        if self.request_termination() == TerminationOutcome::Signalled {
            info!(
                "Session {}: transport closed, terminating process",
                self.id
            );
        }
        self.state = SessionState::Terminated;
    }

    /// Forward a process event to the front end
    pub async fn relay(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output { category, text } => {
                self.send(SessionEvent::Output {
                    category,
                    output: text,
                })
                .await;
            }
            ProcessEvent::Exited(exit) => {
                info!(
                    "Session {}: pid {:?} exited with code {} ({:?})",
                    self.id, exit.pid, exit.exit_code, exit.reason
                );
                self.send(SessionEvent::Exited {
                    exit_code: exit.exit_code,
                })
                .await;
                self.exit = Some(exit);
                self.process = None;
                self.state = SessionState::Terminated;
            }
        }
    }

    /// The process event channel closed without an exit event
    pub fn on_process_gone(&mut self) {
        warn!("Session {}: lost track of process", self.id);
        self.process = None;
        self.state = SessionState::Terminated;
    }

    /// Stop waiting for a process that ignores termination
    pub fn detach(&mut self) {
        if let Some(process) = self.process.take() {
            warn!(
                "Session {}: detaching from pid {:?} that has not exited",
                self.id,
                process.pid()
            );
        }
        self.state = SessionState::Terminated;
    }

    fn spawn(&self, config: &LaunchConfiguration) -> SessionResult<RuntimeProcess> {
        config.validate()?;
        let binary = self.locator.resolve()?;
        let args = build_arguments(config);

        let mut env = self.base_env.clone();
        env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        debug!(
            "Session {}: spawning {} {:?}",
            self.id,
            binary.display(),
            args
        );
        Ok(RuntimeProcess::spawn(
            &binary,
            &args,
            config.cwd.as_deref(),
            &env,
        )?)
    }

    async fn fail_launch(&mut self, request: &Request, error: SessionError) {
        warn!("Session {}: launch failed: {}", self.id, error);
        self.send(Reply::error(request, error.to_string())).await;
        self.send(SessionEvent::Terminated).await;
        self.state = SessionState::Terminated;
    }

    fn request_termination(&mut self) -> TerminationOutcome {
        let Some(process) = self.process.as_mut() else {
            return TerminationOutcome::NotRunning;
        };

        let outcome = process.terminate();
        if outcome == TerminationOutcome::Signalled {
            self.termination_signals += 1;
            info!(
                "Session {}: sent termination signal to pid {:?}",
                self.id,
                process.pid()
            );
        }
        outcome
    }

    /// Queue a message, waiting while the writer is behind
    ///
    /// Dropped silently once the transport is gone.
    async fn send(&self, message: impl Into<Outgoing>) {
        if self.outbound.send(message.into()).await.is_err() {
            debug!("Session {}: transport closed, message dropped", self.id);
        }
    }
}
