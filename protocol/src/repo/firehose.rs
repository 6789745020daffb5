// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Firehose
//!
//! A replayable stream of commit events, ordered by global sequence.
//!
//! ## Handoff from backlog to live
//!
//! ```text
//! 1. subscribe to the broadcast channel       (nothing can slip past)
//! 2. replay seq > cursor from storage in pages
//! 3. live: seq <= last      -> drop (already sent)
//!          seq == last + 1  -> send
//!          seq >  last + 1  -> fill the gap from storage
//!          receiver lagged  -> back to step 2
//! ```
//!
//! Writers broadcast after their transaction commits, and global sequences
//! are assigned inside that transaction. Any commit numbered below one
//! that was received is therefore already readable from storage, which is
//! what makes the gap fill complete.
//!
//! Delivery is at-least-once across reconnects: a client resuming from the
//! last `seq` it processed sees nothing twice and misses nothing.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::config::BACKLOG_PAGE_SIZE;
use crate::repo::commit::{Commit, CommitOp};
use crate::repo::repository::RepoError;
use crate::storage::{DbError, QuireDb};

/// One firehose message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseEvent {
    pub seq: u64,
    pub did: String,
    pub operation: CommitOp,
    pub uri: String,
    pub cid: String,
    /// The new record body. Absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_cid: Option<String>,
    pub time: DateTime<Utc>,
}

impl FirehoseEvent {
    fn from_commit(db: &QuireDb, commit: Commit) -> Result<Self, RepoError> {
        let record = match commit.operation {
            CommitOp::Delete => None,
            CommitOp::Create | CommitOp::Update => {
                let bytes = db.get_block(&commit.new_cid)?.ok_or_else(|| {
                    DbError::Integrity(format!("block {} missing", commit.new_cid))
                })?;
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Some(value)
            }
        };

        Ok(Self {
            seq: commit.global_seq,
            did: commit.did,
            operation: commit.operation,
            uri: commit.record_uri,
            cid: commit.new_cid.to_string(),
            record,
            prev_cid: commit.prev_cid.map(|c| c.to_string()),
            time: commit.committed_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Backlog,
    Live,
    /// Channel closed: read what storage still has, then stop.
    Draining,
    Done,
}

struct Subscription {
    db: QuireDb,
    rx: broadcast::Receiver<Commit>,
    last: u64,
    pending: VecDeque<Commit>,
    mode: Mode,
}

impl Subscription {
    /// Next event, or `None` when the stream is over.
    async fn next_event(&mut self) -> Option<Result<FirehoseEvent, RepoError>> {
        loop {
            if let Some(commit) = self.pending.pop_front() {
                self.last = commit.global_seq;
                return Some(FirehoseEvent::from_commit(&self.db, commit));
            }

            match self.mode {
                Mode::Done => return None,
                Mode::Backlog | Mode::Draining => {
                    let page = match self.db.commits_after(self.last, BACKLOG_PAGE_SIZE) {
                        Ok(page) => page,
                        Err(e) => {
                            self.mode = Mode::Done;
                            return Some(Err(e.into()));
                        }
                    };
                    if page.is_empty() {
                        self.mode = if self.mode == Mode::Draining {
                            Mode::Done
                        } else {
                            Mode::Live
                        };
                    } else {
                        debug!(from = self.last + 1, count = page.len(), "replaying backlog page");
                        self.pending.extend(page);
                    }
                }
                Mode::Live => match self.rx.recv().await {
                    Ok(commit) if commit.global_seq <= self.last => {}
                    Ok(commit) if commit.global_seq == self.last + 1 => {
                        self.pending.push_back(commit);
                    }
                    Ok(commit) => {
                        debug!(last = self.last, got = commit.global_seq, "gap in live events, filling from storage");
                        self.mode = Mode::Backlog;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, last = self.last, "firehose subscriber lagged, replaying from storage");
                        self.mode = Mode::Backlog;
                    }
                    Err(RecvError::Closed) => {
                        self.mode = Mode::Draining;
                    }
                },
            }
        }
    }
}

/// Build the event stream for one subscriber.
///
/// `rx` must be subscribed before this is called so that no commit can
/// fall between the backlog read and the first live receive.
pub fn subscribe(
    db: QuireDb,
    rx: broadcast::Receiver<Commit>,
    cursor: Option<u64>,
) -> BoxStream<'static, Result<FirehoseEvent, RepoError>> {
    let head = match db.latest_global_seq() {
        Ok(head) => head,
        Err(e) => return stream::once(async move { Err(RepoError::from(e)) }).boxed(),
    };

    let (last, mode) = match cursor {
        Some(c) if c > head => {
            return stream::once(async move {
                Err(RepoError::NotFound(format!(
                    "cursor {} is ahead of the log head {}",
                    c, head
                )))
            })
            .boxed();
        }
        Some(c) => (c, Mode::Backlog),
        None => (head, Mode::Live),
    };

    let subscription = Subscription {
        db,
        rx,
        last,
        pending: VecDeque::new(),
        mode,
    };

    stream::unfold(subscription, |mut sub| async move {
        let item = sub.next_event().await?;
        Some((item, sub))
    })
    .boxed()
}
