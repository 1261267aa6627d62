//! Status reporting: every message goes to the `log` facade and, when one is
//! attached, to a [`StatusObserver`] such as a viewer's text panel.

use log::Level;
use std::sync::Arc;

/// Receives status messages alongside the log sink
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, level: Level, message: &str);
}

/// Cheap-to-clone handle shared by the client, downloader, extractor and catalog
#[derive(Clone, Default)]
pub struct StatusReporter {
    observer: Option<Arc<dyn StatusObserver>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Arc<dyn StatusObserver>) -> Self {
        Self {
            observer: Some(observer),
        }
    }

    pub fn attach(&mut self, observer: Arc<dyn StatusObserver>) {
        self.observer = Some(observer);
    }

    pub fn detach(&mut self) {
        self.observer = None;
    }

    pub fn report(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
        if let Some(observer) = &self.observer {
            observer.on_status(level, message);
        }
    }

    pub fn info(&self, message: &str) {
        self.report(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.report(Level::Warn, message);
    }

    pub fn debug(&self, message: &str) {
        self.report(Level::Debug, message);
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
