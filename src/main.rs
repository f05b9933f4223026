use std::time::Duration;

use sunny_manager::{ManagerEvent, TunnelManager};

// Headless driver: establishes exclusivity, starts the auto-start profiles,
// and streams manager events to stdout. A graphical front-end would replace
// this loop with its own tick.
fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("sunny_manager=info"),
    )
    .init();

    log::info!(
        "sunny-manager v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let mut manager = TunnelManager::open();

    if !manager.ensure_single_instance() {
        log::info!("[startup] another instance is running, forwarded the activation signal");
        return;
    }

    let (client_path, client_found) = manager.dirs().locate_client();
    log::info!(
        "[startup] client binary: {} (found={client_found})",
        client_path.display(),
    );
    log::info!(
        "[startup] configuration directory: {}",
        manager.dirs().config_directory().display()
    );

    let started = manager.start_auto_start_profiles();
    for (profile_id, ok, message) in &started {
        if *ok {
            log::info!("[startup] auto-started profile {profile_id}");
        } else {
            log::warn!("[startup] auto-start of {profile_id} failed: {message}");
        }
    }
    if started.is_empty() {
        log::info!("[startup] no auto-start profiles, waiting for activation signals");
    }

    loop {
        for event in manager.poll_events(200) {
            match event {
                ManagerEvent::Log { profile_id, line } => {
                    println!("[{profile_id}] {line}");
                }
                ManagerEvent::DownloadProgress { received, total } => match total {
                    Some(total) => log::info!("[downloader] {received}/{total} bytes"),
                    None => log::info!("[downloader] {received} bytes"),
                },
                ManagerEvent::DownloadFinished { outcome } => {
                    log::info!("[downloader] finished: {outcome:?}");
                }
                ManagerEvent::Activate => {
                    log::info!("[instance] bring-to-front requested");
                }
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
