//! Process Orchestrator
//!
//! Server-side remote shells backed by the system `ssh` client. Each session
//! gets one OpenSSH ControlMaster and one worker task; commands are run through
//! the master, so authentication happens once per connect.
//!
//! Passwords and key passphrases are answered by an `SSH_ASKPASS` helper that
//! echoes a secret passed in the helper's environment.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use super::emitter::{EventEmitter, SessionEmitter};
use super::{Orchestrator, OrchestratorError, OrchestratorResult};
use crate::config::{ConnectionProfile, ProfileAuth, SshSettings};
use crate::profiles::ProfileStore;
use crate::protocol::{ConnectionId, ProfileRef};

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$SSHDECK_ASKPASS_SECRET\"\n";
const CHECK_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const NOT_FOUND: &str = "Connection not found";

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    pub fn from_profile(profile: &ConnectionProfile) -> Self {
        let identity = match &profile.auth {
            ProfileAuth::Key { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            identity,
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Arguments that start a ControlMaster for `target` on `control_path`
pub fn master_args(
    target: &SshTarget,
    settings: &SshSettings,
    control_path: &Path,
    has_secret: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-M".into(), "-N".into(), "-S".into(), control_path.into()];

    let mut option = |value: String| {
        args.push("-o".into());
        args.push(value.into());
    };
    option("ControlPersist=no".to_string());
    option(format!("ConnectTimeout={}", settings.connect_timeout_secs));
    option(format!("StrictHostKeyChecking={}", settings.strict_host_key_checking));
    option("ServerAliveInterval=15".to_string());
    if has_secret {
        option("NumberOfPasswordPrompts=1".to_string());
    } else {
        option("BatchMode=yes".to_string());
    }

    if let Some(identity) = &target.identity {
        args.push("-i".into());
        args.push(identity.into());
        args.push("-o".into());
        args.push("IdentitiesOnly=yes".into());
    }

    args.push("-p".into());
    args.push(target.port.to_string().into());
    args.push(target.destination().into());
    args
}

/// Arguments that run `command` through an existing master
pub fn exec_args(target: &SshTarget, control_path: &Path, command: &str) -> Vec<OsString> {
    vec![
        "-S".into(),
        control_path.into(),
        "-T".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-p".into(),
        target.port.to_string().into(),
        target.destination().into(),
        command.into(),
    ]
}

/// Arguments for a master control request (`check`, `exit`)
pub fn control_args(target: &SshTarget, control_path: &Path, request: &str) -> Vec<OsString> {
    vec![
        "-S".into(),
        control_path.into(),
        "-O".into(),
        request.into(),
        "-p".into(),
        target.port.to_string().into(),
        target.destination().into(),
    ]
}

enum WorkerCommand {
    Run(String),
    Close,
}

struct WorkerHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

/// Orchestrator running remote shells through the system ssh client
pub struct ProcessOrchestrator {
    settings: SshSettings,
    binary: PathBuf,
    profiles: Arc<ProfileStore>,
    emitter: EventEmitter,
    workers: Arc<DashMap<ConnectionId, WorkerHandle>>,
    /// Holds control sockets and the askpass helper; removed on drop
    runtime_dir: Arc<TempDir>,
    askpass: PathBuf,
    socket_counter: AtomicU64,
}

impl ProcessOrchestrator {
    /// Create an orchestrator, resolving the ssh binary on PATH
    pub fn new(
        settings: SshSettings,
        profiles: Arc<ProfileStore>,
        emitter: EventEmitter,
    ) -> OrchestratorResult<Self> {
        let binary = which::which(&settings.binary)
            .map_err(|_| OrchestratorError::BinaryNotFound(settings.binary.clone()))?;
        Self::with_binary(settings, profiles, emitter, binary)
    }

    /// Create an orchestrator using an explicit binary
    pub fn with_binary(
        settings: SshSettings,
        profiles: Arc<ProfileStore>,
        emitter: EventEmitter,
        binary: PathBuf,
    ) -> OrchestratorResult<Self> {
        let runtime_dir = tempfile::Builder::new().prefix("sshdeck-").tempdir()?;
        let askpass = runtime_dir.path().join("askpass.sh");
        std::fs::write(&askpass, ASKPASS_SCRIPT)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&askpass, std::fs::Permissions::from_mode(0o700))?;
        }

        debug!(
            "Process orchestrator using {} in {}",
            binary.display(),
            runtime_dir.path().display()
        );

        Ok(Self {
            settings,
            binary,
            profiles,
            emitter,
            workers: Arc::new(DashMap::new()),
            runtime_dir: Arc::new(runtime_dir),
            askpass,
            socket_counter: AtomicU64::new(0),
        })
    }

    /// Number of live workers
    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    /// Close every shell (socket closed)
    pub fn shutdown_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.workers.iter().map(|w| w.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                let _ = handle.commands.send(WorkerCommand::Close);
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Shut down {} remote shells", closed);
        }
        closed
    }

    fn next_control_path(&self) -> PathBuf {
        let n = self.socket_counter.fetch_add(1, Ordering::SeqCst);
        self.runtime_dir.path().join(format!("ctl-{}", n))
    }
}

impl Orchestrator for ProcessOrchestrator {
    fn connect(&self, id: &ConnectionId, _profile: Option<&ProfileRef>) -> OrchestratorResult<()> {
        let Some(profile) = self.profiles.get(id) else {
            warn!("ssh_connect for unknown profile {}", id);
            self.emitter.begin(id).error(NOT_FOUND);
            return Ok(());
        };

        if !self.workers.contains_key(id) && self.workers.len() >= self.settings.max_sessions {
            self.emitter
                .begin(id)
                .error(OrchestratorError::SessionLimit(self.settings.max_sessions).to_string());
            return Ok(());
        }

        let session = self.emitter.begin(id);
        if let Some((_, previous)) = self.workers.remove(id) {
            info!("Replacing open shell for {}", id);
            let _ = previous.commands.send(WorkerCommand::Close);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.insert(
            id.clone(),
            WorkerHandle {
                generation: session.generation(),
                commands: tx,
            },
        );

        let worker = ShellWorker {
            target: SshTarget::from_profile(profile),
            secret: profile.auth.secret().map(String::from),
            settings: self.settings.clone(),
            binary: self.binary.clone(),
            control_path: self.next_control_path(),
            askpass: self.askpass.clone(),
            emitter: session,
            workers: self.workers.clone(),
            _runtime_dir: self.runtime_dir.clone(),
        };

        info!("Opening shell {} to {}", id, worker.target.destination());
        tokio::spawn(worker.run(rx));
        Ok(())
    }

    fn send_command(&self, id: &ConnectionId, command: &str) -> OrchestratorResult<()> {
        let sent = self
            .workers
            .get(id)
            .map(|w| w.commands.send(WorkerCommand::Run(command.to_string())).is_ok())
            .unwrap_or(false);

        if !sent {
            self.emitter.session(id).error(NOT_FOUND);
        }
        Ok(())
    }

    fn disconnect(&self, id: &ConnectionId) -> OrchestratorResult<()> {
        match self.workers.remove(id) {
            Some((_, handle)) => {
                let _ = handle.commands.send(WorkerCommand::Close);
            }
            // Nothing open: confirm anyway so the client can settle
            None => {
                self.emitter.session(id).disconnected();
            }
        }
        Ok(())
    }

    fn orchestrator_type(&self) -> &'static str {
        "process"
    }
}

/// One remote shell: owns the master process and is the only emitter for its id
struct ShellWorker {
    target: SshTarget,
    secret: Option<String>,
    settings: SshSettings,
    binary: PathBuf,
    control_path: PathBuf,
    askpass: PathBuf,
    emitter: SessionEmitter,
    workers: Arc<DashMap<ConnectionId, WorkerHandle>>,
    _runtime_dir: Arc<TempDir>,
}

impl ShellWorker {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let mut master = match self.start_master().await {
            Ok(master) => master,
            Err(message) => {
                error!("Shell {} failed to open: {}", self.emitter.id(), message);
                self.emitter.error(message);
                // a client waiting in Disconnecting still needs its confirmation
                if self.close_requested(&mut commands) {
                    self.emitter.disconnected();
                }
                self.finish();
                return;
            }
        };

        info!("Shell {} open", self.emitter.id());
        self.emitter
            .connected(Some(format!("Connected to {}", self.target.destination())));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Run(command)) => self.run_command(&command).await,
                    Some(WorkerCommand::Close) | None => {
                        self.close_master(&mut master).await;
                        self.emitter.disconnected();
                        break;
                    }
                },
                status = master.wait() => {
                    warn!("Shell {} master exited: {:?}", self.emitter.id(), status);
                    self.emitter.disconnected();
                    break;
                }
            }
        }

        info!("Shell {} closed", self.emitter.id());
        self.finish();
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    async fn start_master(&self) -> Result<Child, String> {
        let mut command = self.command();
        command
            .args(master_args(
                &self.target,
                &self.settings,
                &self.control_path,
                self.secret.is_some(),
            ))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        if let Some(secret) = &self.secret {
            command
                .env("SSH_ASKPASS", &self.askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("SSHDECK_ASKPASS_SECRET", secret);
        }

        let mut master = command
            .spawn()
            .map_err(|e| format!("Failed to start {}: {}", self.binary.display(), e))?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.connect_timeout_secs);
        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(&mut master).await;
                    return Err(failure_message(status, &stderr));
                }
                Ok(None) => {}
                Err(e) => return Err(format!("Failed to wait for ssh: {}", e)),
            }

            if self.control("check").await {
                return Ok(master);
            }

            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(format!(
                    "Connection timed out after {}s",
                    self.settings.connect_timeout_secs
                ));
            }
            sleep(CHECK_INTERVAL).await;
        }
    }

    /// Send a control request to the master; true if it succeeded
    async fn control(&self, request: &str) -> bool {
        let mut command = self.command();
        command
            .args(control_args(&self.target, &self.control_path, request))
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match timeout(EXIT_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }

    async fn run_command(&self, text: &str) {
        debug!("Shell {} running: {}", self.emitter.id(), text);

        let mut command = self.command();
        command.args(exec_args(&self.target, &self.control_path, text));

        let limit = Duration::from_secs(self.settings.command_timeout_secs);
        match timeout(limit, command.output()).await {
            Ok(Ok(output)) => {
                self.emitter.output(
                    non_empty(&output.stdout),
                    non_empty(&output.stderr),
                    output.status.code(),
                );
            }
            Ok(Err(e)) => {
                self.emitter
                    .output(None, Some(format!("Failed to run command: {}", e)), None);
            }
            Err(_) => {
                self.emitter.output(
                    None,
                    Some(format!(
                        "Command timed out after {}s",
                        self.settings.command_timeout_secs
                    )),
                    None,
                );
            }
        }
    }

    async fn close_master(&self, master: &mut Child) {
        if !self.control("exit").await {
            debug!("Control exit failed for {}, killing master", self.emitter.id());
        }
        if let Ok(None) = master.try_wait() {
            let _ = master.kill().await;
        }
    }

    /// Whether a disconnect reached this worker while it was still connecting
    fn close_requested(&self, commands: &mut mpsc::UnboundedReceiver<WorkerCommand>) -> bool {
        while let Ok(command) = commands.try_recv() {
            if matches!(command, WorkerCommand::Close) {
                return true;
            }
        }
        let generation = self.emitter.generation();
        !self
            .workers
            .get(self.emitter.id())
            .map(|handle| handle.generation == generation)
            .unwrap_or(false)
    }

    /// Deregister, unless a newer worker already took the id
    fn finish(&self) {
        let generation = self.emitter.generation();
        self.workers
            .remove_if(self.emitter.id(), |_, handle| handle.generation == generation);
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut text).await;
    }
    text
}

/// Last meaningful stderr line, or the exit status
fn failure_message(status: ExitStatus, stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Warning:"))
        .last()
        .map(String::from)
        .unwrap_or_else(|| format!("ssh exited with {}", status))
}

fn non_empty(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerEnvelope, ServerMessage};

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.7".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            identity: None,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn profile(id: i64) -> ConnectionProfile {
        ConnectionProfile {
            id: ConnectionId::from(id),
            name: format!("host-{}", id),
            host: "127.0.0.1".to_string(),
            port: 22,
            username: "nobody".to_string(),
            auth: ProfileAuth::Agent,
            group: None,
            tags: None,
            notes: None,
        }
    }

    fn orchestrator(
        settings: SshSettings,
        profiles: Vec<ConnectionProfile>,
    ) -> (ProcessOrchestrator, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = ProcessOrchestrator::with_binary(
            settings,
            Arc::new(ProfileStore::new(profiles)),
            EventEmitter::new(tx),
            PathBuf::from("false"),
        )
        .unwrap();
        (orchestrator, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEnvelope>) -> ServerMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .message
    }

    #[test]
    fn test_master_args() {
        let args = strings(master_args(
            &target(),
            &SshSettings::default(),
            Path::new("/tmp/ctl-0"),
            false,
        ));

        assert_eq!(&args[..4], &["-M", "-N", "-S", "/tmp/ctl-0"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert_eq!(&args[args.len() - 3..], &["-p", "2222", "deploy@10.0.0.7"]);
    }

    #[test]
    fn test_master_args_with_key_and_secret() {
        let mut target = target();
        target.identity = Some(PathBuf::from("/keys/id_ed25519"));
        let args = strings(master_args(&target, &SshSettings::default(), Path::new("ctl"), true));

        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/id_ed25519");
    }

    #[test]
    fn test_exec_and_control_args() {
        let args = strings(exec_args(&target(), Path::new("ctl"), "ls -la"));
        assert_eq!(args.last().unwrap(), "ls -la");
        assert!(args.contains(&"-T".to_string()));

        let args = strings(control_args(&target(), Path::new("ctl"), "exit"));
        assert_eq!(&args[..4], &["-S", "ctl", "-O", "exit"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_message_prefers_stderr() {
        let status = std::process::Command::new("false").status().unwrap();
        assert_eq!(
            failure_message(
                status,
                "Warning: Permanently added '10.0.0.7'\ndeploy@10.0.0.7: Permission denied (publickey).\n"
            ),
            "deploy@10.0.0.7: Permission denied (publickey)."
        );
        assert!(failure_message(status, "").starts_with("ssh exited with"));
    }

    #[tokio::test]
    async fn test_unknown_profile_reports_not_found() {
        let (orchestrator, mut rx) = orchestrator(SshSettings::default(), Vec::new());

        orchestrator.connect(&ConnectionId::from(1), None).unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::SshError {
                connection_id: Some(ConnectionId::from(1)),
                message: "Connection not found".to_string(),
            }
        );

        orchestrator.send_command(&ConnectionId::from(1), "ls").unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::SshError { .. }));

        orchestrator.disconnect(&ConnectionId::from(1)).unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::SshDisconnected {
                connection_id: ConnectionId::from(1)
            }
        );
    }

    #[tokio::test]
    async fn test_session_limit() {
        let settings = SshSettings {
            max_sessions: 0,
            ..SshSettings::default()
        };
        let (orchestrator, mut rx) = orchestrator(settings, vec![profile(1)]);

        orchestrator.connect(&ConnectionId::from(1), None).unwrap();
        match next(&mut rx).await {
            ServerMessage::SshError { message, .. } => assert!(message.contains("Maximum")),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_master_exit_yields_single_error() {
        let (orchestrator, mut rx) = orchestrator(SshSettings::default(), vec![profile(3)]);

        orchestrator.connect(&ConnectionId::from(3), None).unwrap();
        match next(&mut rx).await {
            ServerMessage::SshError { connection_id, message } => {
                assert_eq!(connection_id, Some(ConnectionId::from(3)));
                assert!(message.starts_with("ssh exited with"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // worker deregisters itself once done
        for _ in 0..50 {
            if orchestrator.active_count() == 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(orchestrator.active_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_while_connecting_is_confirmed() {
        let (orchestrator, mut rx) = orchestrator(SshSettings::default(), vec![profile(1)]);
        let id = ConnectionId::from(1);

        orchestrator.connect(&id, None).unwrap();
        orchestrator.disconnect(&id).unwrap();

        assert!(matches!(next(&mut rx).await, ServerMessage::SshError { .. }));
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::SshDisconnected { connection_id: id }
        );
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_askpass_helper_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (orchestrator, _rx) = orchestrator(SshSettings::default(), Vec::new());
        let mode = std::fs::metadata(&orchestrator.askpass).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
