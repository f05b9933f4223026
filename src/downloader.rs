use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::paths::CLIENT_EXECUTABLE_NAME;

pub const CLIENT_ARCHIVE_URL: &str = "https://www.ngrok.cc/sunny/windows_amd64.zip";
pub const DOWNLOAD_PAGE_URL: &str = "https://www.ngrok.cc/download.html";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const REFERER: &str = "https://www.ngrok.cc/";

const STREAM_CHUNK_SIZE: usize = 256 * 1024;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Installed(String),
    Failed(String),
    Canceled,
}

enum DownloadError {
    Canceled,
    Failed(String),
}

/// Cancellation handle shared with the caller. Cancelling flips the flag and
/// asks any live helper subprocess to terminate; the strategies observe the
/// flag at sub-second granularity.
#[derive(Default)]
pub struct DownloadController {
    canceled: AtomicBool,
    process: Mutex<Option<Child>>,
}

impl DownloadController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.process.lock()
            && let Some(child) = guard.as_mut()
            && let Err(error) = child.kill()
        {
            log::debug!("[downloader] failed to terminate helper process: {error}");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn attach(&self, child: Child) {
        if let Ok(mut guard) = self.process.lock() {
            *guard = Some(child);
        }
    }

    fn detach(&self) -> Option<Child> {
        self.process.lock().ok().and_then(|mut guard| guard.take())
    }

    fn try_wait_attached(&self) -> Result<Option<std::process::ExitStatus>, String> {
        let Ok(mut guard) = self.process.lock() else {
            return Err("helper process handle poisoned".to_string());
        };
        match guard.as_mut() {
            Some(child) => child.try_wait().map_err(|error| error.to_string()),
            None => Err("helper process handle was taken".to_string()),
        }
    }
}

pub fn acquire(
    install_dir: &Path,
    controller: &Arc<DownloadController>,
    on_progress: ProgressCallback,
) -> AcquireOutcome {
    if let Err(error) = fs::create_dir_all(install_dir) {
        return AcquireOutcome::Failed(format!(
            "Failed to create {}: {error}",
            install_dir.display()
        ));
    }

    // The staging file lives inside the install directory and is removed on
    // drop, so a canceled or failed download leaves nothing behind.
    let staging = match tempfile::Builder::new()
        .prefix("download-")
        .suffix(".zip")
        .tempfile_in(install_dir)
    {
        Ok(staging) => staging,
        Err(error) => {
            return AcquireOutcome::Failed(format!("Failed to create staging file: {error}"));
        }
    };
    let staging_path = staging.path().to_path_buf();

    log::info!(
        "[downloader] downloading {CLIENT_ARCHIVE_URL} -> {}",
        staging_path.display()
    );

    match download_file(CLIENT_ARCHIVE_URL, &staging_path, controller, &on_progress) {
        Ok(()) => {}
        Err(DownloadError::Canceled) => {
            log::info!("[downloader] download canceled");
            return AcquireOutcome::Canceled;
        }
        Err(DownloadError::Failed(message)) => return AcquireOutcome::Failed(message),
    }

    if controller.is_canceled() {
        log::info!("[downloader] download canceled after transfer");
        return AcquireOutcome::Canceled;
    }

    if let Err(message) = extract_archive_safe(&staging_path, install_dir) {
        return AcquireOutcome::Failed(message);
    }
    // Remove the archive before the directory sweep below.
    drop(staging);

    match finalize_install(install_dir) {
        Ok(client_path) => {
            log::info!("[downloader] installed {}", client_path.display());
            AcquireOutcome::Installed(format!("Client installed at {}", client_path.display()))
        }
        Err(message) => AcquireOutcome::Failed(message),
    }
}

fn download_file(
    url: &str,
    destination: &Path,
    controller: &Arc<DownloadController>,
    on_progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    let strategies: [(&str, StrategyFn); 3] = [
        ("curl", download_with_curl),
        ("http", download_with_http),
        ("script", download_with_script),
    ];

    let mut failures = Vec::new();
    for (name, strategy) in strategies {
        if controller.is_canceled() {
            return Err(DownloadError::Canceled);
        }
        match strategy(url, destination, controller, on_progress) {
            Ok(()) => {
                log::info!("[downloader] strategy '{name}' succeeded");
                return Ok(());
            }
            Err(DownloadError::Canceled) => return Err(DownloadError::Canceled),
            Err(DownloadError::Failed(reason)) => {
                log::warn!("[downloader] strategy '{name}' failed: {reason}");
                failures.push(format!("{name}: {reason}"));
            }
        }
    }

    Err(DownloadError::Failed(format!(
        "All download strategies failed: {}",
        failures.join("; ")
    )))
}

type StrategyFn = fn(&str, &Path, &Arc<DownloadController>, &ProgressCallback) -> Result<(), DownloadError>;

fn download_with_curl(
    url: &str,
    destination: &Path,
    controller: &Arc<DownloadController>,
    _on_progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    let mut last_error = String::from("curl not available");

    for program in ["curl", "curl.exe"] {
        if controller.is_canceled() {
            return Err(DownloadError::Canceled);
        }

        let mut command = Command::new(program);
        command
            .args(["-L", "--fail", "-sS", "-o"])
            .arg(destination)
            .args(["-A", USER_AGENT, "-e", REFERER, url])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(0x08000000);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                last_error = format!("failed to run {program}: {error}");
                continue;
            }
        };

        match supervise_helper(child, controller) {
            Ok(()) => return Ok(()),
            Err(DownloadError::Canceled) => return Err(DownloadError::Canceled),
            Err(DownloadError::Failed(reason)) => last_error = reason,
        }
    }

    Err(DownloadError::Failed(last_error))
}

fn download_with_http(
    url: &str,
    destination: &Path,
    controller: &Arc<DownloadController>,
    on_progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    if controller.is_canceled() {
        return Err(DownloadError::Canceled);
    }

    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()
        .map_err(|error| DownloadError::Failed(format!("failed to build HTTP client: {error}")))?;

    let mut response = client
        .get(url)
        .header(reqwest::header::REFERER, REFERER)
        .send()
        .map_err(|error| DownloadError::Failed(format!("request failed: {error}")))?;

    if !response.status().is_success() {
        return Err(DownloadError::Failed(format!(
            "bad status {}",
            response.status().as_u16()
        )));
    }

    let total = response.content_length();
    let mut file = fs::File::create(destination)
        .map_err(|error| DownloadError::Failed(format!("failed to create file: {error}")))?;

    let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        if controller.is_canceled() {
            return Err(DownloadError::Canceled);
        }
        let bytes_read = response
            .read(&mut buffer)
            .map_err(|error| DownloadError::Failed(format!("failed to read body: {error}")))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .map_err(|error| DownloadError::Failed(format!("failed to write file: {error}")))?;
        received += bytes_read as u64;
        on_progress(received, total);
    }

    file.flush()
        .map_err(|error| DownloadError::Failed(format!("failed to flush file: {error}")))?;
    Ok(())
}

#[cfg(windows)]
fn download_with_script(
    url: &str,
    destination: &Path,
    controller: &Arc<DownloadController>,
    _on_progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    if controller.is_canceled() {
        return Err(DownloadError::Canceled);
    }

    let safe_url = url.replace('\'', "''");
    let safe_destination = destination.to_string_lossy().replace('\'', "''");
    let script = format!(
        "$ProgressPreference='SilentlyContinue';\
         $headers=@{{ 'User-Agent'='{USER_AGENT}'; 'Referer'='{REFERER}' }};\
         Invoke-WebRequest -Uri '{safe_url}' -OutFile '{safe_destination}' -Headers $headers"
    );

    let mut command = Command::new("powershell");
    command
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(0x08000000);
    }

    let child = command
        .spawn()
        .map_err(|error| DownloadError::Failed(format!("failed to run powershell: {error}")))?;
    supervise_helper(child, controller)
}

#[cfg(not(windows))]
fn download_with_script(
    url: &str,
    destination: &Path,
    controller: &Arc<DownloadController>,
    _on_progress: &ProgressCallback,
) -> Result<(), DownloadError> {
    if controller.is_canceled() {
        return Err(DownloadError::Canceled);
    }

    let mut command = Command::new("wget");
    command
        .args(["--quiet", &format!("--user-agent={USER_AGENT}"), &format!("--referer={REFERER}"), "-O"])
        .arg(destination)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let child = command
        .spawn()
        .map_err(|error| DownloadError::Failed(format!("failed to run wget: {error}")))?;
    supervise_helper(child, controller)
}

// Parks the helper subprocess in the controller so cancel() can reach it,
// then polls it to completion.
fn supervise_helper(
    mut child: Child,
    controller: &Arc<DownloadController>,
) -> Result<(), DownloadError> {
    let mut stderr_pipe = child.stderr.take();
    controller.attach(child);

    let outcome = loop {
        if controller.is_canceled() {
            break Err(DownloadError::Canceled);
        }
        match controller.try_wait_attached() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => std::thread::sleep(CANCEL_POLL_INTERVAL),
            Err(reason) => break Err(DownloadError::Failed(reason)),
        }
    };

    if let Some(mut child) = controller.detach() {
        if outcome.is_err() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }

    let status = outcome?;
    if status.success() {
        return Ok(());
    }

    let mut stderr_text = String::new();
    if let Some(ref mut pipe) = stderr_pipe {
        let _ = pipe.read_to_string(&mut stderr_text);
    }
    Err(DownloadError::Failed(format!(
        "exit {}: {}",
        status.code().unwrap_or(-1),
        stderr_text.trim()
    )))
}

/// Verify every entry resolves inside the destination before anything is
/// written, then extract. A single escaping entry aborts the whole archive.
pub fn extract_archive_safe(archive_path: &Path, destination: &Path) -> Result<(), String> {
    let file = fs::File::open(archive_path)
        .map_err(|error| format!("Failed to open {}: {error}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| format!("Failed to read archive: {error}"))?;

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|error| format!("Failed to read archive entry {index}: {error}"))?;
        if entry.enclosed_name().is_none() {
            return Err(format!(
                "Archive entry '{}' escapes the destination directory",
                entry.name()
            ));
        }
    }

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| format!("Failed to read archive entry {index}: {error}"))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|error| format!("Failed to create {}: {error}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| format!("Failed to create {}: {error}", parent.display()))?;
        }
        let mut output = fs::File::create(&target)
            .map_err(|error| format!("Failed to create {}: {error}", target.display()))?;
        std::io::copy(&mut entry, &mut output)
            .map_err(|error| format!("Failed to extract {}: {error}", target.display()))?;
    }

    Ok(())
}

/// Locate the client executable anywhere under the install directory, move it
/// to the canonical path, and sweep everything else so exactly one file
/// remains.
pub fn finalize_install(install_dir: &Path) -> Result<PathBuf, String> {
    let canonical = install_dir.join(CLIENT_EXECUTABLE_NAME);

    if !canonical.exists() {
        match find_executable_recursive(install_dir) {
            Some(found) => {
                if found != canonical {
                    fs::rename(&found, &canonical).map_err(|error| {
                        format!(
                            "Found client at {} but failed to move it: {error}",
                            found.display()
                        )
                    })?;
                }
            }
            None => {
                return Err(format!(
                    "Download finished but {CLIENT_EXECUTABLE_NAME} was not found in the archive. Fetch it manually from {DOWNLOAD_PAGE_URL}"
                ));
            }
        }
    }

    cleanup_install_directory(install_dir, &canonical);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(error) =
            fs::set_permissions(&canonical, fs::Permissions::from_mode(0o755))
        {
            log::warn!("[downloader] failed to set executable permission: {error}");
        }
    }

    Ok(canonical)
}

fn find_executable_recursive(directory: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(directory).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file()
            && let Some(name) = path.file_name().and_then(|name| name.to_str())
            && name.eq_ignore_ascii_case(CLIENT_EXECUTABLE_NAME)
        {
            return Some(path);
        } else if path.is_dir()
            && let Some(found) = find_executable_recursive(&path)
        {
            return Some(found);
        }
    }
    None
}

fn cleanup_install_directory(install_dir: &Path, keep: &Path) {
    let Ok(entries) = fs::read_dir(install_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(error) = removed {
            log::warn!("[downloader] failed to remove {}: {error}", path.display());
        }
    }
}
