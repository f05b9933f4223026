use std::net::{Ipv4Addr, TcpListener, TcpStream};

pub const LOCK_PORT: u16 = 59876;
pub const ACTIVATION_PORT: u16 = 59877;

pub type ActivationCallback = Box<dyn Fn() + Send + 'static>;

/// Holding the lock-port listener is what keeps other instances out; dropping
/// the guard releases it.
pub struct InstanceLock {
    _lock: TcpListener,
}

pub fn try_acquire_exclusive(on_activate: ActivationCallback) -> Option<InstanceLock> {
    try_acquire_exclusive_on(LOCK_PORT, ACTIVATION_PORT, on_activate)
}

pub fn notify_running_instance() -> bool {
    notify_running_instance_on(ACTIVATION_PORT)
}

pub fn ensure_single_instance(on_activate: ActivationCallback) -> Option<InstanceLock> {
    match try_acquire_exclusive(on_activate) {
        Some(lock) => Some(lock),
        None => {
            log::info!("[instance] another instance is running, notifying it");
            notify_running_instance();
            None
        }
    }
}

pub fn try_acquire_exclusive_on(
    lock_port: u16,
    activation_port: u16,
    on_activate: ActivationCallback,
) -> Option<InstanceLock> {
    let lock = match TcpListener::bind((Ipv4Addr::LOCALHOST, lock_port)) {
        Ok(listener) => listener,
        Err(error) => {
            log::info!("[instance] lock port {lock_port} unavailable: {error}");
            return None;
        }
    };
    log::info!("[instance] lock port {lock_port} acquired");

    match TcpListener::bind((Ipv4Addr::LOCALHOST, activation_port)) {
        Ok(listener) => {
            std::thread::spawn(move || {
                // The connection itself is the signal; nothing is read.
                for connection in listener.incoming() {
                    match connection {
                        Ok(stream) => {
                            drop(stream);
                            log::info!("[instance] activation signal received");
                            on_activate();
                        }
                        Err(error) => {
                            log::warn!("[instance] activation accept failed: {error}");
                            break;
                        }
                    }
                }
            });
        }
        Err(error) => {
            log::warn!(
                "[instance] failed to bind activation port {activation_port}: {error}"
            );
        }
    }

    Some(InstanceLock { _lock: lock })
}

pub fn notify_running_instance_on(activation_port: u16) -> bool {
    match TcpStream::connect((Ipv4Addr::LOCALHOST, activation_port)) {
        Ok(stream) => {
            drop(stream);
            true
        }
        Err(error) => {
            log::warn!("[instance] failed to reach activation port {activation_port}: {error}");
            false
        }
    }
}
