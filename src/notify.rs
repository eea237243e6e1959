//! Notification delivery seam
//!
//! The session collection receives a [`Notifier`] from whoever assembles the
//! application. Desktop notification backends live outside this crate.

use tracing::info;

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "notification");
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::Notifier;

    /// Records every notification
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, body: &str) {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push((title.to_string(), body.to_string()));
            }
        }
    }
}
