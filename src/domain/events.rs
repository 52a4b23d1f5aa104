use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use tokio::sync::mpsc;

/// Outbound side of the application event channel.
///
/// Status text goes out as [`AppEvent::Notify`], per-sample lines as
/// [`AppEvent::Stream`]. A closed receiver is not an error for the sender.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<AppEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { sender }
    }

    pub fn send(&self, event: AppEvent) {
        let _ = self.sender.send(event);
    }

    pub fn notify(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.send(AppEvent::Notify(StatusMessage::new(message, severity)));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(message, MessageSeverity::Info);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.notify(message, MessageSeverity::Success);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.notify(message, MessageSeverity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(message, MessageSeverity::Error);
    }

    pub fn stream(&self, line: impl Into<String>) {
        self.send(AppEvent::Stream(line.into()));
    }
}
