//! Messages delivered to an instance's driver task.
//!
//! Everything that originates outside the drain loop (host calls, timers)
//! reaches the instance as a command; nothing else mutates its state.

use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::error::{BookmarkError, EngineError};
use serde_json::Value;
use tokio::sync::oneshot;

use super::bookmark::BookmarkKey;

#[derive(Debug)]
pub(crate) enum Command {
    ResumeBookmark {
        name: String,
        scope: Option<BookmarkScope>,
        value: Value,
        reply: oneshot::Sender<Result<(), BookmarkError>>,
    },
    TimerFired {
        key: BookmarkKey,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Persist {
        unload: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    QueryBookmarks {
        reply: oneshot::Sender<Vec<BookmarkInfo>>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResumeBookmark { .. } => "resume_bookmark",
            Self::TimerFired { .. } => "timer_fired",
            Self::Cancel { .. } => "cancel",
            Self::Persist { .. } => "persist",
            Self::QueryBookmarks { .. } => "query_bookmarks",
        }
    }
}
