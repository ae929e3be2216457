use pagemq::{Broker, ChannelOptions, PagingParams};
use tempfile::TempDir;

// ==========================================
// SETUP HELPERS
// ==========================================

pub fn setup_broker() -> (Broker, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(temp_dir.path().join("channels.db")).unwrap();
    (broker, temp_dir)
}

/// Reopens a broker over an existing database directory, as after a crash.
pub fn reopen_broker(temp_dir: &TempDir) -> Broker {
    Broker::open(temp_dir.path().join("channels.db")).unwrap()
}

pub fn small_channel_options(full: usize, page: usize, down: usize) -> ChannelOptions {
    ChannelOptions {
        params: PagingParams::new(full, page, down).unwrap(),
        recoverable: true,
        accept_reliable_messages: true,
    }
}
