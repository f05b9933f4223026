use std::{
    collections::{HashMap, VecDeque},
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use chrono::Local;
use encoding_rs::Encoding;

use crate::{
    downloader::DOWNLOAD_PAGE_URL,
    encoding::{candidate_encodings, decode_chunk},
    paths::CLIENT_EXECUTABLE_NAME,
};

pub const LOG_MAX_ENTRIES: usize = 2000;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type LogCallback = Box<dyn Fn(&str) + Send + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub line: String,
}

type SharedLog = Arc<Mutex<VecDeque<LogEntry>>>;

struct TunnelProcess {
    profile_name: String,
    child: Option<Child>,
    running: Arc<AtomicBool>,
    logs: SharedLog,
    reader: Option<JoinHandle<()>>,
}

impl TunnelProcess {
    fn idle(profile_name: &str) -> Self {
        Self {
            profile_name: profile_name.to_string(),
            child: None,
            running: Arc::new(AtomicBool::new(false)),
            logs: SharedLog::default(),
            reader: None,
        }
    }

    fn launch(
        profile_name: &str,
        server: &str,
        key: &str,
        client_path: &Path,
        logs: SharedLog,
        on_log: LogCallback,
    ) -> Result<Self, String> {
        if !client_path.exists() {
            return Err(format!(
                "Cannot find {}.\n\nUse the automatic download, or fetch the client from {} and place {} in the core directory.",
                client_path.display(),
                DOWNLOAD_PAGE_URL,
                CLIENT_EXECUTABLE_NAME,
            ));
        }

        let (pipe_reader, pipe_writer) = std::io::pipe()
            .map_err(|error| format!("Failed to create output pipe: {error}"))?;
        let stdout_writer = pipe_writer
            .try_clone()
            .map_err(|error| format!("Failed to clone output pipe: {error}"))?;

        let mut command = Command::new(client_path);
        command
            .args(["-s", server, "-k", key, "-l", "stdout"])
            .stdin(Stdio::null())
            .stdout(stdout_writer)
            .stderr(pipe_writer);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(0x08000000);
        }

        log::info!(
            "[supervisor] spawning for '{profile_name}': {} -s {server} -k *** -l stdout",
            client_path.display(),
        );

        let child = command
            .spawn()
            .map_err(|error| format!("Failed to launch {}: {error}", client_path.display()))?;
        // The Command still holds copies of the pipe writers; they must go
        // away or the reader never sees EOF after the child exits.
        drop(command);

        let running = Arc::new(AtomicBool::new(true));
        let reader_running = running.clone();
        let reader_logs = logs.clone();
        let reader_name = profile_name.to_string();
        let reader = std::thread::spawn(move || {
            read_child_output(pipe_reader, &reader_name, &reader_running, &reader_logs, on_log);
        });

        Ok(Self {
            profile_name: profile_name.to_string(),
            child: Some(child),
            running,
            logs,
            reader: Some(reader),
        })
    }

    fn is_running(&mut self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            self.running.store(false, Ordering::SeqCst);
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                log::info!(
                    "[supervisor] '{}' exited on its own: {status}",
                    self.profile_name
                );
                self.running.store(false, Ordering::SeqCst);
                self.child = None;
                false
            }
            Ok(None) => true,
            Err(error) => {
                log::warn!("[supervisor] failed to poll '{}': {error}", self.profile_name);
                true
            }
        }
    }

    fn stop(&mut self) -> (bool, String) {
        if !self.is_running() {
            return (false, "Tunnel is not running".to_string());
        }
        let Some(mut child) = self.child.take() else {
            return (false, "Tunnel is not running".to_string());
        };

        send_terminate_signal(&child);

        let attempts = STOP_TIMEOUT.as_millis() / STOP_POLL_INTERVAL.as_millis();
        let mut exited = false;
        for attempt in 0..attempts {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!(
                        "[terminate] '{}' exited gracefully (attempt {attempt}, status={status})",
                        self.profile_name
                    );
                    exited = true;
                    break;
                }
                Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
                Err(error) => {
                    log::warn!("[terminate] wait error for '{}': {error}", self.profile_name);
                    break;
                }
            }
        }

        let mut forced = false;
        if !exited {
            log::warn!(
                "[terminate] graceful shutdown timed out for '{}', killing",
                self.profile_name
            );
            if let Err(error) = child.kill() {
                log::warn!("[terminate] kill failed for '{}': {error}", self.profile_name);
            }
            forced = true;
        }
        match child.wait() {
            Ok(status) => log::info!("[terminate] '{}' reaped: {status}", self.profile_name),
            Err(error) => log::warn!("[terminate] wait failed for '{}': {error}", self.profile_name),
        }

        self.running.store(false, Ordering::SeqCst);
        self.join_reader();

        if forced {
            (true, "Tunnel force-stopped".to_string())
        } else {
            (true, "Tunnel stopped".to_string())
        }
    }

    fn join_reader(&mut self) {
        let Some(handle) = self.reader.take() else {
            return;
        };
        let attempts = READER_JOIN_TIMEOUT.as_millis() / STOP_POLL_INTERVAL.as_millis();
        for _ in 0..attempts {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        log::warn!(
            "[supervisor] reader for '{}' still draining, detaching",
            self.profile_name
        );
    }
}

fn read_child_output(
    pipe: std::io::PipeReader,
    profile_name: &str,
    running: &AtomicBool,
    logs: &Mutex<VecDeque<LogEntry>>,
    on_log: LogCallback,
) {
    let mut reader = BufReader::new(pipe);
    let candidates = candidate_encodings();
    let mut sticky: Option<&'static Encoding> = None;
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let (decoded, adopted) = decode_chunk(&buffer, sticky, &candidates);
                if adopted != sticky
                    && let Some(encoding) = adopted
                {
                    log::debug!(
                        "[supervisor] '{profile_name}' output decodes as {}",
                        encoding.name()
                    );
                }
                sticky = adopted;
                let line = decoded.trim_end().to_string();
                push_entry(logs, line.clone());
                on_log(&line);
            }
            Err(error) => {
                let message = format!("log read error: {error}");
                log::warn!("[supervisor] '{profile_name}': {message}");
                push_entry(logs, message.clone());
                on_log(&message);
                break;
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
    }
    log::debug!("[supervisor] reader for '{profile_name}' finished");
}

fn push_entry(logs: &Mutex<VecDeque<LogEntry>>, line: String) {
    let Ok(mut logs) = logs.lock() else {
        return;
    };
    logs.push_back(LogEntry {
        timestamp: Local::now().format("%H:%M:%S").to_string(),
        line,
    });
    while logs.len() > LOG_MAX_ENTRIES {
        logs.pop_front();
    }
}

#[cfg(unix)]
fn send_terminate_signal(child: &Child) {
    let pid = child.id().to_string();
    if run_silent("kill", &["-TERM", &pid]) {
        log::info!("[terminate] sent SIGTERM to pid={pid}");
    } else {
        log::warn!("[terminate] SIGTERM failed for pid={pid}");
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(child: &Child) {
    let pid = child.id().to_string();
    if run_silent("taskkill", &["/PID", &pid]) {
        log::info!("[terminate] asked pid={pid} to close");
    } else {
        log::warn!("[terminate] taskkill failed for pid={pid}");
    }
}

fn run_silent(program: &str, arguments: &[&str]) -> bool {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    match Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => output.status.success(),
        Err(error) => {
            log::debug!("[cmd] spawn error for {program}: {error}");
            false
        }
    }
}

pub struct ProcessSupervisor {
    processes: HashMap<String, TunnelProcess>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
        }
    }

    pub fn start(
        &mut self,
        profile_id: &str,
        profile_name: &str,
        server: &str,
        key: &str,
        client_path: &Path,
        on_log: LogCallback,
    ) -> (bool, String) {
        if let Some(process) = self.processes.get_mut(profile_id)
            && process.is_running()
        {
            return (
                false,
                format!("Tunnel '{}' is already running", process.profile_name),
            );
        }

        // A restarted profile keeps the log history of its previous run.
        let logs = self
            .processes
            .remove(profile_id)
            .map(|previous| previous.logs)
            .unwrap_or_default();

        match TunnelProcess::launch(profile_name, server, key, client_path, logs, on_log) {
            Ok(process) => {
                self.processes.insert(profile_id.to_string(), process);
                (true, "Tunnel started".to_string())
            }
            Err(message) => (false, message),
        }
    }

    pub fn stop(&mut self, profile_id: &str) -> (bool, String) {
        match self.processes.get_mut(profile_id) {
            Some(process) => process.stop(),
            None => (false, "Tunnel is not running".to_string()),
        }
    }

    pub fn is_running(&mut self, profile_id: &str) -> bool {
        match self.processes.get_mut(profile_id) {
            Some(process) => process.is_running(),
            None => false,
        }
    }

    pub fn get_logs(&self, profile_id: &str) -> Vec<LogEntry> {
        let Some(process) = self.processes.get(profile_id) else {
            return Vec::new();
        };
        match process.logs.lock() {
            Ok(logs) => logs.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear_logs(&mut self, profile_id: &str) {
        if let Some(process) = self.processes.get(profile_id)
            && let Ok(mut logs) = process.logs.lock()
        {
            logs.clear();
        }
    }

    /// Append an annotation line (not produced by the child) to a profile's
    /// log history.
    pub fn push_log(&mut self, profile_id: &str, profile_name: &str, line: &str) {
        let process = self
            .processes
            .entry(profile_id.to_string())
            .or_insert_with(|| TunnelProcess::idle(profile_name));
        push_entry(&process.logs, line.to_string());
    }

    pub fn running_ids(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.processes.keys().cloned().collect();
        ids.into_iter()
            .filter(|id| self.is_running(id))
            .collect()
    }

    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for id in self.running_ids() {
            let (ok, message) = self.stop(&id);
            if ok {
                stopped += 1;
            } else {
                log::warn!("[supervisor] failed to stop '{id}': {message}");
            }
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn drain_callback() -> (LogCallback, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel();
        let callback: LogCallback = Box::new(move |line: &str| {
            let _ = sender.send(line.to_string());
        });
        (callback, receiver)
    }

    #[cfg(unix)]
    fn fake_client(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sunny.exe");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn missing_executable_is_rejected_with_remediation_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = ProcessSupervisor::new();
        let (callback, _receiver) = drain_callback();

        let (ok, message) = supervisor.start(
            "id-1",
            "test",
            "s:1",
            "k",
            &dir.path().join("sunny.exe"),
            callback,
        );

        assert!(!ok);
        assert!(message.contains(DOWNLOAD_PAGE_URL));
        assert!(message.contains(CLIENT_EXECUTABLE_NAME));
        assert!(!supervisor.is_running("id-1"));
    }

    #[test]
    fn ring_buffer_never_exceeds_capacity_and_keeps_order() {
        let mut supervisor = ProcessSupervisor::new();
        for index in 0..(LOG_MAX_ENTRIES + 100) {
            supervisor.push_log("id-1", "test", &format!("line {index}"));
        }

        let logs = supervisor.get_logs("id-1");
        assert_eq!(logs.len(), LOG_MAX_ENTRIES);
        assert_eq!(logs[0].line, "line 100");
        assert_eq!(logs[LOG_MAX_ENTRIES - 1].line, format!("line {}", LOG_MAX_ENTRIES + 99));
    }

    #[test]
    fn clear_logs_empties_the_buffer() {
        let mut supervisor = ProcessSupervisor::new();
        supervisor.push_log("id-1", "test", "something");
        supervisor.clear_logs("id-1");
        assert!(supervisor.get_logs("id-1").is_empty());
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let mut supervisor = ProcessSupervisor::new();
        let (ok, _message) = supervisor.stop("missing");
        assert!(!ok);
    }

    #[cfg(unix)]
    #[test]
    fn start_on_running_profile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_client(dir.path(), "sleep 30");
        let mut supervisor = ProcessSupervisor::new();

        let (callback, _receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);

        let (callback, _receiver) = drain_callback();
        let (ok, message) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(!ok);
        assert!(message.contains("already running"));

        let (ok, _) = supervisor.stop("id-1");
        assert!(ok);
    }

    #[cfg(unix)]
    #[test]
    fn output_lines_are_captured_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_client(dir.path(), "echo first\necho second");
        let mut supervisor = ProcessSupervisor::new();

        let (callback, receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);

        let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");

        let logs = supervisor.get_logs("id-1");
        assert_eq!(logs[0].line, "first");
        assert_eq!(logs[1].line, "second");
    }

    #[cfg(unix)]
    #[test]
    fn gbk_output_is_decoded_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        // "中文" as GBK bytes, twice, via octal escapes.
        let client = fake_client(
            dir.path(),
            "printf '\\326\\320\\316\\304\\n'\nprintf '\\326\\320\\316\\304\\n'",
        );
        let mut supervisor = ProcessSupervisor::new();

        let (callback, receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);

        let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, "中文");
        assert_eq!(second, "中文");
    }

    #[cfg(unix)]
    #[test]
    fn self_exit_is_observed_by_polling() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_client(dir.path(), "exit 0");
        let mut supervisor = ProcessSupervisor::new();

        let (callback, _receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while supervisor.is_running("id-1") {
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[cfg(unix)]
    #[test]
    fn stop_escalates_to_force_kill_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_client(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let mut supervisor = ProcessSupervisor::new();

        let (callback, _receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);
        // Give the shell a moment to install the trap.
        std::thread::sleep(Duration::from_millis(300));

        let (ok, message) = supervisor.stop("id-1");
        assert!(ok);
        assert!(message.contains("force"), "expected forced stop, got: {message}");
        assert!(!supervisor.is_running("id-1"));
    }

    #[cfg(unix)]
    #[test]
    fn stop_reports_graceful_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_client(dir.path(), "while true; do sleep 1; done");
        let mut supervisor = ProcessSupervisor::new();

        let (callback, _receiver) = drain_callback();
        let (ok, _) = supervisor.start("id-1", "test", "s:1", "k", &client, callback);
        assert!(ok);
        std::thread::sleep(Duration::from_millis(200));

        let (ok, message) = supervisor.stop("id-1");
        assert!(ok);
        assert_eq!(message, "Tunnel stopped");
        assert!(!supervisor.is_running("id-1"));
    }
}
