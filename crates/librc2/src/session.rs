//! A live workspace: its clients, its compute connection and the translation
//! between client commands and the compute protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rc2_protocol::{
    ComputeErrorCode, ComputeState, ComputeStatusData, ErrorData, ExecCompleteData, ExecuteData,
    ExecuteFileData, ExecuteParams, FileChangedData, FileId, FileOperation, FileOperationData,
    HelpData, InfoData, ResultsData, SaveData, SessionCommand, SessionError, SessionResponse,
    ShowOutputData, VariableValueData, VariablesData, Workspace,
};

use crate::coder::{self, ComputeCoder, ComputeResponse, OpenParams};
use crate::config::AppConfig;
use crate::dao::Rc2Dao;
use crate::error::ComputeError;
use crate::orchestration::Orchestrator;
use crate::socket::{ClientSocket, SocketId, encode_response};
use crate::worker::{ComputeEvent, ComputeTarget, ComputeWorker, WorkerConfig};

/// Everything a session needs to reach its compute engine.
#[derive(Clone)]
pub struct SessionConfig {
    pub target: ComputeTarget,
    pub connect_timeout: Option<Duration>,
    /// Upper bound on establishing the compute connection. `None` relies on
    /// the connect timeout alone.
    pub start_timeout: Option<Duration>,
    pub max_frame_len: usize,
    /// Files at least this large are sent to clients without their contents.
    pub max_file_bytes: u64,
    pub db_host: String,
    pub db_user: String,
    pub db_name: String,
    pub db_password: Option<String>,
}

impl SessionConfig {
    /// Direct mode unless an orchestrator is given.
    pub fn from_app_config(config: &AppConfig, orchestrator: Option<Arc<dyn Orchestrator>>) -> Self {
        let (target, start_timeout) = match (orchestrator, &config.orchestration) {
            (Some(orchestrator), Some(orch)) => (
                ComputeTarget::Orchestrated {
                    orchestrator,
                    poll_interval: orch.poll_interval(),
                },
                Some(orch.launch_timeout()),
            ),
            (Some(orchestrator), None) => (
                ComputeTarget::Orchestrated {
                    orchestrator,
                    poll_interval: Duration::from_secs(1),
                },
                None,
            ),
            (None, _) => (
                ComputeTarget::Direct {
                    host: config.compute.host.clone(),
                    port: config.compute.port,
                },
                None,
            ),
        };
        Self {
            target,
            connect_timeout: config.connect_timeout(),
            start_timeout,
            max_frame_len: config.compute.max_frame_bytes,
            max_file_bytes: config.max_websocket_file_bytes(),
            db_host: config.compute_db_host().to_string(),
            db_user: config.database.user.clone(),
            db_name: config.database.name.clone(),
            db_password: config.database.password.clone(),
        }
    }
}

/// Returned by [`Session::add_client`] once the session has begun shutting down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("session is shutting down")]
pub struct SessionClosed;

struct SessionState {
    clients: BTreeMap<SocketId, Arc<ClientSocket>>,
    /// Set while the client set is empty.
    idle_since: Option<Instant>,
    watching_variables: bool,
    is_open: bool,
    closing: bool,
}

pub struct Session {
    workspace: Workspace,
    session_id: i64,
    dao: Arc<dyn Rc2Dao>,
    coder: ComputeCoder,
    worker: ComputeWorker,
    max_file_bytes: u64,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl Session {
    /// Create the session record, connect to compute and open the workspace.
    /// Returns once the engine has been sent `open`.
    pub async fn start(
        workspace: Workspace,
        dao: Arc<dyn Rc2Dao>,
        config: &SessionConfig,
    ) -> Result<Arc<Session>, SessionError> {
        let wspace_id = workspace.id;
        let session_id = dao.create_session_record(wspace_id).await.map_err(|e| {
            error!(wspace_id, error = %e, "failed to create session record");
            SessionError::from(e)
        })?;
        info!(session_id, wspace_id, "starting session");

        let file_changes = match dao.subscribe_file_changes(wspace_id).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(session_id, error = %e, "failed to watch workspace files");
                close_record(dao.as_ref(), session_id).await;
                return Err(e.into());
            }
        };

        let (worker, events) = ComputeWorker::spawn(WorkerConfig {
            target: config.target.clone(),
            wspace_id,
            session_id,
            connect_timeout: config.connect_timeout,
            max_frame_len: config.max_frame_len,
        });

        let session = Arc::new(Session {
            workspace,
            session_id,
            dao,
            coder: ComputeCoder::new(),
            worker,
            max_file_bytes: config.max_file_bytes,
            state: Mutex::new(SessionState {
                clients: BTreeMap::new(),
                idle_since: Some(Instant::now()),
                watching_variables: false,
                is_open: false,
                closing: false,
            }),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        });
        tokio::spawn(run_events(
            Arc::downgrade(&session),
            events,
            file_changes,
            session.cancel.clone(),
        ));

        let connected = match config.start_timeout {
            Some(limit) => tokio::time::timeout(limit, session.worker.wait_connected())
                .await
                .unwrap_or_else(|_| {
                    Err(ComputeError::FailedToConnect(format!(
                        "no compute connection after {limit:?}"
                    )))
                }),
            None => session.worker.wait_connected().await,
        };
        if let Err(e) = connected.and_then(|()| session.send_open(config)) {
            error!(session_id, wspace_id, error = %e, "failed to start compute");
            session.shutdown().await;
            return Err(SessionError::FailedToConnectToCompute);
        }
        Ok(session)
    }

    fn send_open(&self, config: &SessionConfig) -> Result<(), ComputeError> {
        let open = self.coder.open(&OpenParams {
            wspace_id: self.workspace.id,
            session_rec_id: self.session_id,
            db_host: config.db_host.clone(),
            db_user: config.db_user.clone(),
            db_name: config.db_name.clone(),
            db_password: config.db_password.clone(),
        })?;
        self.worker.send(open)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Id of the session record backing this session.
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn compute_state(&self) -> ComputeState {
        self.worker.state()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open
    }

    /// Attach a client and send everyone the user's info bundle.
    pub async fn add_client(&self, socket: Arc<ClientSocket>) -> Result<(), SessionClosed> {
        let info = self.dao.get_user_info(socket.user().id).await;
        let mut state = self.state.lock().await;
        if state.closing {
            return Err(SessionClosed);
        }
        info!(
            session_id = self.session_id,
            socket_id = socket.id(),
            user = %socket.user().login,
            "client attached"
        );
        state.clients.insert(socket.id(), socket);
        state.idle_since = None;
        match info {
            Ok(info) => broadcast(&state, &SessionResponse::Connected(info)),
            Err(e) => error!(session_id = self.session_id, error = %e, "failed to load user info"),
        }
        Ok(())
    }

    /// Detach a client. Returns the number of clients left.
    pub async fn remove_client(&self, socket_id: SocketId) -> usize {
        let mut state = self.state.lock().await;
        if state.clients.remove(&socket_id).is_none() {
            return state.clients.len();
        }
        info!(session_id = self.session_id, socket_id, "client detached");
        if state.clients.is_empty() {
            state.idle_since = Some(Instant::now());
        }
        if state.watching_variables && !state.clients.values().any(|c| c.watching_variables()) {
            match self.send_compute(self.coder.toggle_variable_watch(false)) {
                Ok(()) => state.watching_variables = false,
                Err(e) => warn!(session_id = self.session_id, error = %e, "failed to stop variable watch"),
            }
        }
        state.clients.len()
    }

    /// How long the session has been without clients.
    pub async fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .await
            .idle_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Stop accepting clients if idle for at least `threshold`. Returns true
    /// when the session was marked, after which it must be shut down.
    pub async fn close_if_idle(&self, threshold: Duration, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        let idle = state
            .idle_since
            .is_some_and(|since| now.saturating_duration_since(since) >= threshold);
        if idle && state.clients.is_empty() {
            state.closing = true;
        }
        state.closing
    }

    /// Close the compute connection, disconnect every client and close the
    /// session record. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock().await;
            state.closing = true;
            for client in state.clients.values() {
                client.close();
            }
            state.clients.clear();
        }
        if self.worker.state() == ComputeState::Connected {
            let sent = self
                .send_compute(self.coder.save_environment())
                .and_then(|()| self.send_compute(self.coder.close()));
            if let Err(e) = sent {
                debug!(session_id = self.session_id, error = %e, "close not sent");
            }
        }
        self.worker.shutdown();
        self.cancel.cancel();
        close_record(self.dao.as_ref(), self.session_id).await;
        info!(session_id = self.session_id, wspace_id = self.workspace.id, "session shut down");
    }

    /// Dispatch one client command.
    pub async fn handle(&self, command: SessionCommand, socket: &ClientSocket) {
        debug!(session_id = self.session_id, socket_id = socket.id(), ?command, "command");
        match command {
            SessionCommand::Execute(params) => self.handle_execute(params, socket).await,
            SessionCommand::ExecuteFile {
                transaction_id,
                file_id,
                file_version,
            } => {
                self.handle_execute_file(transaction_id, file_id, file_version, socket)
                    .await
            }
            SessionCommand::FileOperation {
                transaction_id,
                operation,
                file_id,
                file_version,
                new_name,
            } => {
                self.handle_file_operation(transaction_id, operation, file_id, file_version, new_name)
                    .await
            }
            SessionCommand::GetVariable { name, .. } => {
                let cmd = self.coder.get_variable(&name, Some(socket.id()));
                self.forward(cmd, None, socket);
            }
            SessionCommand::WatchVariables { watch, .. } => {
                self.handle_watch_variables(watch, socket).await
            }
            SessionCommand::Save {
                transaction_id,
                file_id,
                file_version,
                content,
            } => {
                self.handle_save(transaction_id, file_id, file_version, content)
                    .await
            }
            SessionCommand::Help { topic } => {
                self.forward(self.coder.help(&topic), None, socket);
            }
            SessionCommand::ClearEnvironment { environment_id } => {
                self.forward(self.coder.clear_environment(environment_id), None, socket);
            }
            SessionCommand::Info => self.send_info().await,
        }
    }

    async fn handle_execute(&self, params: ExecuteParams, socket: &ClientSocket) {
        let state = self.state.lock().await;
        if params.is_user_initiated {
            broadcast(
                &state,
                &SessionResponse::EchoExecute(ExecuteData {
                    transaction_id: params.transaction_id.clone(),
                    source: params.source.clone(),
                    context_id: params.context_id,
                }),
            );
        }
        let cmd = self
            .coder
            .execute_script(&params.transaction_id, &params.source);
        self.forward(cmd, Some(params.transaction_id), socket);
    }

    async fn handle_execute_file(
        &self,
        transaction_id: String,
        file_id: FileId,
        file_version: Option<i32>,
        socket: &ClientSocket,
    ) {
        let state = self.state.lock().await;
        broadcast(
            &state,
            &SessionResponse::EchoExecuteFile(ExecuteFileData {
                transaction_id: transaction_id.clone(),
                file_id,
                file_version,
            }),
        );
        let cmd = self
            .coder
            .execute_file(&transaction_id, file_id, file_version);
        self.forward(cmd, Some(transaction_id), socket);
    }

    async fn handle_file_operation(
        &self,
        transaction_id: String,
        operation: FileOperation,
        file_id: FileId,
        file_version: i32,
        new_name: Option<String>,
    ) {
        let result = match (operation, new_name) {
            (FileOperation::Remove, _) => self.dao.delete_file(file_id).await.map(|()| None),
            (FileOperation::Rename, Some(name)) => self
                .dao
                .rename_file(file_id, file_version, &name)
                .await
                .map(|_| None),
            (FileOperation::Duplicate, Some(name)) => {
                self.dao.duplicate_file(file_id, &name).await.map(Some)
            }
            (FileOperation::Rename | FileOperation::Duplicate, None) => {
                Err(crate::error::DaoError::InvalidFile)
            }
        };
        let data = match result {
            Ok(file) => FileOperationData {
                transaction_id,
                operation,
                success: true,
                file_id: file.as_ref().map_or(file_id, |f| f.id),
                file,
                error: None,
            },
            Err(e) => {
                warn!(session_id = self.session_id, file_id, ?operation, error = %e, "file operation failed");
                FileOperationData {
                    transaction_id,
                    operation,
                    success: false,
                    file_id,
                    file: None,
                    error: Some(e.to_session_error()),
                }
            }
        };
        self.broadcast(&SessionResponse::FileOperation(data)).await;
        self.send_info().await;
    }

    async fn handle_watch_variables(&self, watch: bool, socket: &ClientSocket) {
        let mut state = self.state.lock().await;
        if socket.watching_variables() == watch {
            return;
        }
        socket.set_watching_variables(watch);
        let should_watch = state.clients.values().any(|c| c.watching_variables());
        let cmd = if should_watch && state.watching_variables {
            // already watching: fetch a full list for the new watcher
            self.coder.list_variables(false)
        } else {
            self.coder.toggle_variable_watch(should_watch)
        };
        match self.send_compute(cmd) {
            Ok(()) => state.watching_variables = should_watch,
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "failed to change variable watch");
                reply_error(socket, None, compute_session_error(&e));
            }
        }
    }

    async fn handle_save(
        &self,
        transaction_id: String,
        file_id: FileId,
        file_version: i32,
        content: Vec<u8>,
    ) {
        let data = match self.dao.set_file(content, file_id, Some(file_version)).await {
            Ok(file) => SaveData {
                transaction_id,
                success: true,
                file: Some(file),
                error: None,
            },
            Err(e) => {
                warn!(session_id = self.session_id, file_id, error = %e, "save failed");
                SaveData {
                    transaction_id,
                    success: false,
                    file: None,
                    error: Some(e.to_session_error()),
                }
            }
        };
        self.broadcast(&SessionResponse::Save(data)).await;
    }

    async fn send_info(&self) {
        match self.dao.get_files(self.workspace.id).await {
            Ok(files) => {
                self.broadcast(&SessionResponse::Info(InfoData {
                    workspace: self.workspace.clone(),
                    files,
                }))
                .await
            }
            Err(e) => warn!(session_id = self.session_id, error = %e, "failed to load workspace files"),
        }
    }

    /// Send an encoded command to compute, telling the requesting socket if
    /// that is impossible.
    fn forward(
        &self,
        cmd: Result<Bytes, ComputeError>,
        transaction_id: Option<String>,
        socket: &ClientSocket,
    ) {
        if let Err(e) = self.send_compute(cmd) {
            warn!(session_id = self.session_id, error = %e, "failed to forward command");
            reply_error(socket, transaction_id, compute_session_error(&e));
        }
    }

    fn send_compute(&self, cmd: Result<Bytes, ComputeError>) -> Result<(), ComputeError> {
        self.worker.send(cmd?)
    }

    pub async fn broadcast(&self, response: &SessionResponse) {
        broadcast(&*self.state.lock().await, response);
    }

    /// Send to one client. Returns false if it is not attached.
    pub async fn unicast(&self, socket_id: SocketId, response: &SessionResponse) -> bool {
        let state = self.state.lock().await;
        match state.clients.get(&socket_id) {
            Some(client) => client.send_response(response),
            None => false,
        }
    }

    async fn handle_compute_event(&self, event: ComputeEvent) {
        match event {
            ComputeEvent::StateChanged(state) => {
                self.broadcast(&SessionResponse::ComputeStatus(ComputeStatusData { state }))
                    .await;
                if state.is_terminal() {
                    self.broadcast(&error_response(None, SessionError::FailedToConnectToCompute))
                        .await;
                }
            }
            ComputeEvent::Message(payload) => match self.coder.decode(&payload) {
                Ok(response) => self.handle_compute_response(response).await,
                Err(e) => warn!(
                    session_id = self.session_id,
                    error = %e,
                    payload = %String::from_utf8_lossy(&payload),
                    "undecodable compute message"
                ),
            },
            ComputeEvent::Error(e) => {
                warn!(session_id = self.session_id, error = %e, "compute error");
            }
        }
    }

    async fn handle_compute_response(&self, response: ComputeResponse) {
        match response {
            ComputeResponse::Open {
                success,
                error_message,
            } => {
                self.state.lock().await.is_open = success;
                if success {
                    info!(session_id = self.session_id, "compute workspace open");
                } else {
                    error!(
                        session_id = self.session_id,
                        error = error_message.as_deref().unwrap_or_default(),
                        "compute failed to open workspace"
                    );
                    self.broadcast(&error_response(None, SessionError::FailedToConnectToCompute))
                        .await;
                }
            }
            ComputeResponse::ExecComplete(data) => self.handle_exec_complete(data).await,
            ComputeResponse::Results(data) => {
                self.broadcast(&SessionResponse::Results(ResultsData {
                    transaction_id: data.transaction_id,
                    output: data.text,
                    is_error: data.is_stderr,
                }))
                .await
            }
            ComputeResponse::ShowFile(data) => self.handle_show_file(data).await,
            ComputeResponse::VariableValue(data) => {
                let response = SessionResponse::VariableValue(VariableValueData {
                    value: data.variable,
                    context_id: data.context_id,
                });
                match data.client_ident {
                    Some(socket_id) => {
                        if !self.unicast(socket_id, &response).await {
                            debug!(session_id = self.session_id, socket_id, "variable requester gone");
                        }
                    }
                    None => self.broadcast(&response).await,
                }
            }
            ComputeResponse::Variables(data) => {
                debug!(
                    session_id = self.session_id,
                    count = data.variables.len(),
                    delta = data.delta,
                    "variable update"
                );
                self.broadcast(&SessionResponse::Variables(VariablesData {
                    variables: data.variables,
                    removed: data.removed,
                    delta: data.delta,
                    context_id: data.context_id,
                }))
                .await
            }
            ComputeResponse::Help { topic, paths } => {
                self.broadcast(&SessionResponse::Help(HelpData {
                    items: help_items(&paths),
                    topic,
                }))
                .await
            }
            ComputeResponse::Error(data) => {
                let transaction_id = data.transaction_id.clone();
                self.broadcast(&error_response(
                    transaction_id.clone(),
                    SessionError::Compute {
                        code: data.code,
                        details: data.details,
                        transaction_id,
                    },
                ))
                .await
            }
        }
    }

    async fn handle_exec_complete(&self, data: coder::ExecCompleteData) {
        let images = match self.dao.get_images(&data.image_ids).await {
            Ok(images) => images,
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "failed to load images");
                Vec::new()
            }
        };
        self.broadcast(&SessionResponse::ExecComplete(ExecCompleteData {
            transaction_id: data.transaction_id,
            batch_id: data.batch_id.unwrap_or(0),
            expect_show_output: data.expect_show_output,
            images,
            file_id: data.file_id,
        }))
        .await
    }

    async fn handle_show_file(&self, data: coder::ShowFileData) {
        let file = match self.dao.get_file(data.file_id, self.workspace.user_id).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                warn!(session_id = self.session_id, file_id = data.file_id, "show output for unknown file");
                let transaction_id = Some(data.transaction_id);
                self.broadcast(&error_response(
                    transaction_id.clone(),
                    SessionError::Compute {
                        code: ComputeErrorCode::UNKNOWN_FILE,
                        details: "unknown file requested".to_string(),
                        transaction_id,
                    },
                ))
                .await;
                return;
            }
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "failed to load output file");
                return;
            }
        };
        let file_data = if file.file_size < self.max_file_bytes {
            match self.dao.get_file_data(file.id).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(session_id = self.session_id, error = %e, "failed to load output file data");
                    None
                }
            }
        } else {
            None
        };
        self.broadcast(&SessionResponse::ShowOutput(ShowOutputData {
            transaction_id: data.transaction_id,
            file,
            file_data,
        }))
        .await
    }

    async fn handle_file_changed(&self, change: FileChangedData) {
        debug!(
            session_id = self.session_id,
            file_id = change.file_id,
            change_type = ?change.change_type,
            "file changed"
        );
        self.broadcast(&SessionResponse::FileChanged(change)).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_events(
    session: Weak<Session>,
    mut events: mpsc::UnboundedReceiver<ComputeEvent>,
    mut file_changes: mpsc::Receiver<FileChangedData>,
    cancel: CancellationToken,
) {
    let mut watching_files = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(session) = session.upgrade() else { break };
                session.handle_compute_event(event).await;
            }
            change = file_changes.recv(), if watching_files => match change {
                Some(change) => {
                    let Some(session) = session.upgrade() else { break };
                    session.handle_file_changed(change).await;
                }
                None => watching_files = false,
            },
        }
    }
}

async fn close_record(dao: &dyn Rc2Dao, session_id: i64) {
    if let Err(e) = dao.close_session_record(session_id).await {
        warn!(session_id, error = %e, "failed to close session record");
    }
}

/// Encode once and queue the same bytes for every client.
fn broadcast(state: &SessionState, response: &SessionResponse) {
    match encode_response(response) {
        Ok(payload) => {
            for client in state.clients.values() {
                client.send(payload.clone());
            }
        }
        Err(e) => warn!(error = %e, "failed to encode broadcast"),
    }
}

fn error_response(transaction_id: Option<String>, error: SessionError) -> SessionResponse {
    SessionResponse::Error(ErrorData {
        transaction_id,
        error,
    })
}

fn reply_error(socket: &ClientSocket, transaction_id: Option<String>, error: SessionError) {
    socket.send_response(&error_response(transaction_id, error));
}

fn compute_session_error(err: &ComputeError) -> SessionError {
    match err {
        ComputeError::InvalidFormat(_) => SessionError::InvalidRequest,
        _ => SessionError::FailedToConnectToCompute,
    }
}

/// Map engine help paths (`/usr/lib/R/library/stats/help/Normal`) to
/// browsable pages (`/stats/html/Normal.html`) keyed by `"Normal (stats)"`.
pub fn help_items(paths: &[String]) -> BTreeMap<String, String> {
    const LIBRARY: &str = "/library/";
    let mut items = BTreeMap::new();
    for path in paths {
        let Some(idx) = path.find(LIBRARY) else {
            continue;
        };
        let page = format!(
            "{}.html",
            path[idx + LIBRARY.len() - 1..].replace("/help/", "/html/")
        );
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some(topic) = components.last() else {
            continue;
        };
        let package = if components.len() > 3 {
            components[components.len() - 3]
        } else {
            "Base"
        };
        items.insert(format!("{topic} ({package})"), page);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_paths_are_rewritten() {
        let items = help_items(&[
            "/usr/lib/R/library/stats/help/Normal".to_string(),
            "/usr/lib/R/library/base/help/print".to_string(),
        ]);
        assert_eq!(items.len(), 2);
        assert_eq!(items["Normal (stats)"], "/stats/html/Normal.html");
        assert_eq!(items["print (base)"], "/base/html/print.html");
    }

    #[test]
    fn shallow_help_path_uses_base_package() {
        let items = help_items(&["/library/help/x".to_string()]);
        assert_eq!(items["x (Base)"], "/html/x.html");
    }

    #[test]
    fn help_paths_outside_library_are_skipped() {
        assert!(help_items(&["/opt/docs/foo".to_string()]).is_empty());
    }

    #[test]
    fn compute_errors_map_for_clients() {
        assert_eq!(
            compute_session_error(&ComputeError::NotConnected),
            SessionError::FailedToConnectToCompute
        );
        assert_eq!(
            compute_session_error(&ComputeError::InvalidFormat("x".into())),
            SessionError::InvalidRequest
        );
    }
}
