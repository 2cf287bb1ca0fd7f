//! Transient user-facing notices ("Course created successfully" and friends).

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_NOTICES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
    pub created_at: String,
    #[serde(skip)]
    expires: Instant,
}

pub struct Notifier {
    dismiss_after: Duration,
    next_id: u64,
    notices: VecDeque<Notice>,
}

impl Notifier {
    pub fn new(dismiss_after: Duration) -> Self {
        Self {
            dismiss_after,
            next_id: 1,
            notices: VecDeque::new(),
        }
    }

    pub fn set_dismiss_after(&mut self, dismiss_after: Duration) {
        self.dismiss_after = dismiss_after;
    }

    fn push(&mut self, kind: NoticeKind, message: impl Into<String>) -> u64 {
        self.push_at(kind, message, Instant::now())
    }

    fn push_at(&mut self, kind: NoticeKind, message: impl Into<String>, now: Instant) -> u64 {
        self.notices.retain(|n| n.expires > now);
        while self.notices.len() >= MAX_NOTICES {
            self.notices.pop_front();
        }
        let id = self.next_id;
        self.next_id += 1;
        let message = message.into();
        tracing::debug!(id, kind = ?kind, %message, "notice");
        self.notices.push_back(Notice {
            id,
            kind,
            message,
            created_at: crate::db::now_ts(),
            expires: now + self.dismiss_after,
        });
        id
    }

    pub fn success(&mut self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Success, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Error, message)
    }

    pub fn info(&mut self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Info, message)
    }

    /// Live notices, oldest first. Expired ones are dropped.
    pub fn live(&mut self) -> Vec<Notice> {
        self.live_at(Instant::now())
    }

    fn live_at(&mut self, now: Instant) -> Vec<Notice> {
        self.notices.retain(|n| n.expires > now);
        self.notices.iter().cloned().collect()
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != id);
        self.notices.len() != before
    }
}
