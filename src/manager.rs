use std::sync::{Arc, mpsc};

use crate::{
    downloader::{self, AcquireOutcome, DownloadController},
    instance::{self, InstanceLock},
    paths::AppDirs,
    profiles::{Profile, ProfileStore},
    settings::{CloseBehavior, SettingsStore},
    supervisor::{LogCallback, LogEntry, ProcessSupervisor},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Log { profile_id: String, line: String },
    DownloadProgress { received: u64, total: Option<u64> },
    DownloadFinished { outcome: AcquireOutcome },
    Activate,
}

/// Facade consumed by the presentation layer. All state mutation happens on
/// the caller's thread; background work (child readers, downloads, the
/// activation accept loop) reports back through the event queue, drained by
/// `poll_events` on the caller's tick.
pub struct TunnelManager {
    dirs: AppDirs,
    profiles: ProfileStore,
    settings: SettingsStore,
    supervisor: ProcessSupervisor,
    event_sender: mpsc::Sender<ManagerEvent>,
    event_receiver: mpsc::Receiver<ManagerEvent>,
    instance_lock: Option<InstanceLock>,
    download: Option<Arc<DownloadController>>,
}

impl TunnelManager {
    pub fn open() -> Self {
        Self::with_dirs(AppDirs::detect())
    }

    pub fn with_dirs(dirs: AppDirs) -> Self {
        dirs.ensure();
        let profiles = ProfileStore::open(dirs.tunnels_file());
        let settings = SettingsStore::open(dirs.settings_file(), dirs.last_selection_file());
        let (event_sender, event_receiver) = mpsc::channel();

        Self {
            dirs,
            profiles,
            settings,
            supervisor: ProcessSupervisor::new(),
            event_sender,
            event_receiver,
            instance_lock: None,
            download: None,
        }
    }

    pub fn dirs(&self) -> &AppDirs {
        &self.dirs
    }

    /// True when this process is now the sole instance. False means a running
    /// instance was notified instead and the caller should exit.
    pub fn ensure_single_instance(&mut self) -> bool {
        let sender = self.event_sender.clone();
        match instance::ensure_single_instance(Box::new(move || {
            let _ = sender.send(ManagerEvent::Activate);
        })) {
            Some(lock) => {
                self.instance_lock = Some(lock);
                true
            }
            None => false,
        }
    }

    pub fn list_profiles(&self) -> &[Profile] {
        self.profiles.get_all()
    }

    pub fn get_profile(&self, index: usize) -> Option<&Profile> {
        self.profiles.get(index)
    }

    pub fn add_profile(&mut self, name: &str, server: &str, key: &str, auto_start: bool) -> bool {
        self.profiles.add(name, server, key, auto_start)
    }

    pub fn update_profile(
        &mut self,
        index: usize,
        name: &str,
        server: &str,
        key: &str,
        auto_start: bool,
    ) -> bool {
        self.profiles.update(index, name, server, key, auto_start)
    }

    pub fn delete_profile(&mut self, index: usize) -> bool {
        self.profiles.delete(index)
    }

    pub fn start(&mut self, profile_id: &str) -> (bool, String) {
        // The downloader owns the install directory while it runs; starting
        // from it mid-sweep is never allowed.
        if self.download.is_some() {
            return (
                false,
                "Client download in progress, try again once it finishes".to_string(),
            );
        }
        let Some(profile) = self.profiles.get_by_id(profile_id).cloned() else {
            return (false, format!("No profile with id {profile_id}"));
        };

        let (client_path, _found) = self.dirs.locate_client();
        self.supervisor.start(
            &profile.id,
            &profile.name,
            &profile.server,
            &profile.key,
            &client_path,
            self.log_callback(&profile.id),
        )
    }

    pub fn stop(&mut self, profile_id: &str) -> (bool, String) {
        self.supervisor.stop(profile_id)
    }

    pub fn is_running(&mut self, profile_id: &str) -> bool {
        self.supervisor.is_running(profile_id)
    }

    pub fn get_logs(&self, profile_id: &str) -> Vec<LogEntry> {
        self.supervisor.get_logs(profile_id)
    }

    pub fn clear_logs(&mut self, profile_id: &str) {
        self.supervisor.clear_logs(profile_id)
    }

    pub fn stop_all(&mut self) -> usize {
        self.supervisor.stop_all()
    }

    /// Start every profile flagged auto-start, in collection order. Returns
    /// one (profile_id, ok, message) triple per attempt.
    pub fn start_auto_start_profiles(&mut self) -> Vec<(String, bool, String)> {
        let mut results = Vec::new();
        for profile in self.profiles.auto_start_profiles() {
            self.supervisor.push_log(
                &profile.id,
                &profile.name,
                &format!("Auto-starting tunnel: {}", profile.name),
            );
            let (ok, message) = self.start(&profile.id);
            if !ok {
                log::warn!(
                    "[manager] auto-start failed for '{}': {message}",
                    profile.name
                );
            }
            results.push((profile.id, ok, message));
        }
        results
    }

    /// Launch the client download on a background thread. Returns the
    /// cancellation handle; completion and progress arrive as events. Refused
    /// while another acquisition is in flight.
    pub fn acquire(&mut self) -> Arc<DownloadController> {
        if let Some(controller) = &self.download {
            log::warn!("[manager] acquisition already in flight");
            return controller.clone();
        }

        let controller = DownloadController::new();
        self.download = Some(controller.clone());

        let install_dir = self.dirs.core_directory();
        let worker_controller = controller.clone();
        let progress_sender = self.event_sender.clone();
        let finished_sender = self.event_sender.clone();

        std::thread::spawn(move || {
            let outcome = downloader::acquire(
                &install_dir,
                &worker_controller,
                Box::new(move |received, total| {
                    let _ = progress_sender.send(ManagerEvent::DownloadProgress { received, total });
                }),
            );
            let _ = finished_sender.send(ManagerEvent::DownloadFinished { outcome });
        });

        controller
    }

    pub fn cancel_acquire(&self) {
        if let Some(controller) = &self.download {
            controller.cancel();
        }
    }

    pub fn acquisition_in_flight(&self) -> bool {
        self.download.is_some()
    }

    /// Drain up to `max` queued events. Bounding the batch keeps one busy
    /// child from starving the caller's tick.
    pub fn poll_events(&mut self, max: usize) -> Vec<ManagerEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.event_receiver.try_recv() {
                Ok(event) => {
                    if matches!(event, ManagerEvent::DownloadFinished { .. }) {
                        self.download = None;
                    }
                    events.push(event);
                }
                Err(_) => break,
            }
        }
        events
    }

    pub fn close_behavior(&self) -> CloseBehavior {
        self.settings.close_behavior()
    }

    pub fn set_close_behavior(&mut self, behavior: CloseBehavior) -> bool {
        self.settings.set_close_behavior(behavior)
    }

    pub fn last_selection(&self) -> Option<String> {
        self.settings.load_last_selection()
    }

    pub fn set_last_selection(&self, profile_id: &str) -> bool {
        self.settings.save_last_selection(profile_id)
    }

    fn log_callback(&self, profile_id: &str) -> LogCallback {
        let sender = self.event_sender.clone();
        let profile_id = profile_id.to_string();
        Box::new(move |line: &str| {
            let _ = sender.send(ManagerEvent::Log {
                profile_id: profile_id.clone(),
                line: line.to_string(),
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn manager_in(dir: &std::path::Path) -> TunnelManager {
        TunnelManager::with_dirs(AppDirs::at(dir))
    }

    #[test]
    fn profile_crud_round_trips_through_the_facade() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());

        assert!(manager.add_profile("home", "a.example.com:443", "k1", false));
        assert_eq!(manager.list_profiles().len(), 1);
        let id = manager.list_profiles()[0].id.clone();
        assert!(!id.is_empty());

        assert!(manager.update_profile(0, "work", "b.example.com:443", "k2", true));
        assert_eq!(manager.list_profiles()[0].id, id);
        assert_eq!(manager.list_profiles()[0].name, "work");

        assert!(manager.delete_profile(0));
        assert!(manager.list_profiles().is_empty());
    }

    #[test]
    fn start_with_unknown_profile_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());

        let (ok, message) = manager.start("nope");
        assert!(!ok);
        assert!(message.contains("nope"));
    }

    #[test]
    fn start_without_installed_client_names_remediation() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());
        manager.add_profile("home", "s:1", "k", false);
        let id = manager.list_profiles()[0].id.clone();

        let (ok, message) = manager.start(&id);
        assert!(!ok);
        assert!(message.contains(downloader::DOWNLOAD_PAGE_URL));
    }

    #[test]
    fn last_selection_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        assert_eq!(manager.last_selection(), None);
        assert!(manager.set_last_selection("some-id"));
        assert_eq!(manager.last_selection(), Some("some-id".to_string()));
    }

    #[test]
    fn close_behavior_defaults_to_ask_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());

        assert_eq!(manager.close_behavior(), CloseBehavior::Ask);
        assert!(manager.set_close_behavior(CloseBehavior::Exit));

        let reopened = manager_in(dir.path());
        assert_eq!(reopened.close_behavior(), CloseBehavior::Exit);
    }

    #[cfg(unix)]
    #[test]
    fn auto_start_runs_flagged_profiles_and_forwards_log_events() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());

        let client = manager.dirs().client_executable();
        std::fs::write(&client, "#!/bin/sh\necho ready\nsleep 30\n").unwrap();
        std::fs::set_permissions(&client, std::fs::Permissions::from_mode(0o755)).unwrap();

        manager.add_profile("auto", "s:1", "k", true);
        manager.add_profile("manual", "s:2", "k", false);

        let results = manager.start_auto_start_profiles();
        assert_eq!(results.len(), 1);
        assert!(results[0].1, "auto-start failed: {}", results[0].2);
        let auto_id = results[0].0.clone();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_ready = false;
        while Instant::now() < deadline && !saw_ready {
            for event in manager.poll_events(64) {
                if let ManagerEvent::Log { profile_id, line } = event
                    && profile_id == auto_id
                    && line == "ready"
                {
                    saw_ready = true;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(saw_ready, "never saw the child's log line");

        assert!(manager.is_running(&auto_id));
        let logs = manager.get_logs(&auto_id);
        assert!(logs.iter().any(|entry| entry.line.contains("Auto-starting")));

        let (ok, _) = manager.stop(&auto_id);
        assert!(ok);
    }

    #[test]
    fn start_is_refused_while_a_download_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());
        manager.add_profile("home", "s:1", "k", false);
        let id = manager.list_profiles()[0].id.clone();

        let controller = manager.acquire();
        let (ok, message) = manager.start(&id);
        assert!(!ok);
        assert!(message.contains("download"));

        // Strategy outcome depends on the environment; only the in-flight
        // bookkeeping is under test here.
        controller.cancel();
        let deadline = Instant::now() + Duration::from_secs(60);
        while manager.acquisition_in_flight() && Instant::now() < deadline {
            manager.poll_events(64);
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!manager.acquisition_in_flight());
    }

    #[test]
    fn poll_events_clears_the_inflight_download_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager_in(dir.path());

        let controller = manager.acquire();
        controller.cancel();
        assert!(manager.acquisition_in_flight());

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut finished = None;
        while Instant::now() < deadline && finished.is_none() {
            for event in manager.poll_events(64) {
                if let ManagerEvent::DownloadFinished { outcome } = event {
                    finished = Some(outcome);
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(finished.is_some(), "download never reported completion");
        assert!(!manager.acquisition_in_flight());
    }
}
