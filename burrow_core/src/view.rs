//! Notification sink.
//!
//! Everything the relay and the tunnels have to tell the developer goes
//! through a [`View`]; failures are reported here instead of being
//! propagated.

use std::sync::Mutex;

use log::Level;

pub trait View: Send + Sync {
    fn write(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.write(Level::Info, message)
    }

    fn error(&self, message: &str) {
        self.write(Level::Error, message)
    }
}

/// Forwards notifications to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogView;

impl View for LogView {
    fn write(&self, level: Level, message: &str) {
        log::log!(target: "burrow::view", level, "{}", message);
    }
}

/// Keeps notifications in memory, for embedding front-ends that poll.
#[derive(Debug, Default)]
pub struct MemoryView {
    entries: Mutex<Vec<(Level, String)>>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Level, String)> {
        self.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(level, _)| *level == Level::Error)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|(_, msg)| msg.clone()).collect()
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<(Level, String)> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Level, String)>> {
        match self.entries.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

impl View for MemoryView {
    fn write(&self, level: Level, message: &str) {
        log::log!(target: "burrow::view", level, "{}", message);
        self.lock().push((level, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_view_splits_errors() {
        let view = MemoryView::new();
        view.info("mapped");
        view.error("boom");

        assert_eq!(view.messages(), vec!["mapped", "boom"]);
        assert_eq!(view.errors(), vec!["boom"]);
        assert_eq!(view.take().len(), 2);
        assert!(view.entries().is_empty());
    }
}
