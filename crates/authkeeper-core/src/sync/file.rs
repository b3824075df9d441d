use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::channel::{CrossTabMessage, TabChannel};

/// File name of the shared mailbox
const MAILBOX_FILE: &str = "channel.json";

/// How often subscribers look for a new message.
/// Cross-process sync is advisory, a quarter second is plenty.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Distinguishes channels opened by the same process
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Posting {
    origin: String,
    seq: u64,
    message: CrossTabMessage,
}

impl Posting {
    fn key(&self) -> (String, u64) {
        (self.origin.clone(), self.seq)
    }
}

/// Channel between processes of the same user, backed by a mailbox file.
///
/// The file holds only the latest message. Subscribers poll it and emit each
/// posting they have not seen yet, skipping their own. Two postings landing
/// within one poll interval keep only the later one.
pub struct FileChannel {
    path: PathBuf,
    origin: String,
    next_seq: AtomicU64,
    poll_interval: Duration,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            path: path.into(),
            origin: format!("{}-{}", std::process::id(), instance),
            next_seq: AtomicU64::new(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Mailbox at the default file name inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(MAILBOX_FILE))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, posting: &Posting) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(posting)?;
        // Write then rename so readers never see a partial posting
        let tmp = self.path.with_file_name(format!(
            "{}.{}.{}.tmp",
            MAILBOX_FILE, self.origin, posting.seq
        ));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_posting(path: &Path) -> Option<Posting> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(posting) => Some(posting),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Ignoring unreadable cross-tab mailbox");
            None
        }
    }
}

impl TabChannel for FileChannel {
    fn publish(&self, message: CrossTabMessage) {
        let posting = Posting {
            origin: self.origin.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            message,
        };
        if let Err(e) = self.write(&posting) {
            warn!(error = %e, path = %self.path.display(), "Failed to publish cross-tab message");
        }
    }

    fn subscribe(&self) -> BoxStream<'static, CrossTabMessage> {
        // Whatever is in the mailbox now predates this subscription
        let seen = read_posting(&self.path).map(|p| p.key());
        let path = self.path.clone();
        let origin = self.origin.clone();
        let interval = self.poll_interval;

        stream::unfold(seen, move |mut seen| {
            let path = path.clone();
            let origin = origin.clone();
            async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(posting) = read_posting(&path) else {
                        continue;
                    };
                    let key = posting.key();
                    if seen.as_ref() == Some(&key) {
                        continue;
                    }
                    seen = Some(key);
                    if posting.origin == origin {
                        continue;
                    }
                    debug!(origin = %posting.origin, "Cross-tab message read from mailbox");
                    return Some((posting.message, seen));
                }
            }
        })
        .boxed()
    }
}
