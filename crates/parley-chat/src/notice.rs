//! Ephemeral user-visible notices.
//!
//! One notice is shown at a time. A new notice supersedes the previous one
//! and each clears itself after the configured TTL unless superseded or
//! dismissed first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use parley_core::events::ChatEvent;
use parley_core::types::Notice;

#[derive(Debug)]
pub struct Notifier {
    current: Mutex<Option<Notice>>,
    next_id: AtomicU64,
    ttl: Duration,
    events: broadcast::Sender<ChatEvent>,
}

impl Notifier {
    pub fn new(ttl: Duration, events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            ttl,
            events,
        }
    }

    pub fn current(&self) -> Option<Notice> {
        self.current.lock().ok().and_then(|n| n.clone())
    }

    /// Show `message`, replacing any visible notice. Returns the notice id.
    pub fn raise(self: &Arc<Self>, message: impl Into<String>) -> u64 {
        let notice = Notice {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            message: message.into(),
        };
        let id = notice.id;
        debug!(notice_id = id, message = %notice.message, "Raising notice");
        if let Ok(mut current) = self.current.lock() {
            *current = Some(notice.clone());
        }
        let _ = self.events.send(ChatEvent::NoticeChanged {
            notice: Some(notice),
        });

        // Outside a runtime the notice simply stays until dismissed.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let notifier = Arc::clone(self);
            let ttl = self.ttl;
            handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                notifier.clear_if(id);
            });
        }
        id
    }

    /// Clear the visible notice, if any.
    pub fn dismiss(&self) -> bool {
        let cleared = match self.current.lock() {
            Ok(mut current) => current.take().is_some(),
            Err(_) => false,
        };
        if cleared {
            let _ = self.events.send(ChatEvent::NoticeChanged { notice: None });
        }
        cleared
    }

    fn clear_if(&self, id: u64) {
        let cleared = match self.current.lock() {
            Ok(mut current) if current.as_ref().is_some_and(|n| n.id == id) => {
                *current = None;
                true
            }
            _ => false,
        };
        if cleared {
            debug!(notice_id = id, "Notice expired");
            let _ = self.events.send(ChatEvent::NoticeChanged { notice: None });
        }
    }
}
