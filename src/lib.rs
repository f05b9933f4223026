pub mod downloader;
pub mod encoding;
pub mod instance;
pub mod manager;
pub mod paths;
pub mod profiles;
pub mod settings;
pub mod supervisor;

pub use downloader::{AcquireOutcome, DownloadController};
pub use manager::{ManagerEvent, TunnelManager};
pub use profiles::Profile;
pub use settings::CloseBehavior;
