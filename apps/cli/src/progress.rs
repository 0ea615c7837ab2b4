//! Progress bars driven by transfer events

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use pansync_types::TransferEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const TEMPLATE: &str =
    "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Manages one progress bar per remote path
pub struct TransferProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<String, ProgressBar>>>,
}

fn short_name(remote_path: &str) -> String {
    remote_path.rsplit('/').next().unwrap_or(remote_path).to_string()
}

impl TransferProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Feed events from `rx` until the channel closes or the task is aborted
    pub fn spawn(self: Arc<Self>, mut rx: broadcast::Receiver<TransferEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn start(&self, remote_path: &str, total: u64, done: u64) {
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(short_name(remote_path));
        pb.set_position(done);

        if let Some(old) = self.bars.write().await.insert(remote_path.to_string(), pb) {
            old.finish_and_clear();
        }
    }

    async fn advance(&self, remote_path: &str, bytes: u64) {
        if let Some(pb) = self.bars.read().await.get(remote_path) {
            pb.inc(bytes);
        }
    }

    async fn finish(&self, remote_path: &str, message: String) {
        match self.bars.write().await.remove(remote_path) {
            Some(pb) => pb.finish_with_message(message),
            None => {
                let _ = self.multi.println(message);
            }
        }
    }

    /// Update progress bars from an event
    pub async fn handle_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::UploadStarted {
                remote_path,
                total_bytes,
                already_uploaded,
            } => self.start(remote_path, *total_bytes, *already_uploaded).await,

            TransferEvent::DownloadStarted {
                remote_path,
                total_bytes,
                already_downloaded,
            } => self.start(remote_path, *total_bytes, *already_downloaded).await,

            TransferEvent::SliceUploaded {
                remote_path, bytes, ..
            }
            | TransferEvent::BytesDownloaded { remote_path, bytes } => {
                self.advance(remote_path, *bytes).await
            }

            TransferEvent::SessionRefreshed { remote_path, round } => {
                if let Some(pb) = self.bars.read().await.get(remote_path) {
                    pb.set_message(format!(
                        "{} {}",
                        short_name(remote_path),
                        style(format!("(retry {})", round)).yellow()
                    ));
                }
            }

            TransferEvent::RapidUpload { remote_path } => {
                self.finish(
                    remote_path,
                    format!("{} {} (rapid upload)", style("✓").green().bold(), short_name(remote_path)),
                )
                .await
            }

            TransferEvent::UploadCompleted { remote_path }
            | TransferEvent::DownloadCompleted { remote_path, .. } => {
                self.finish(
                    remote_path,
                    format!("{} {}", style("✓").green().bold(), short_name(remote_path)),
                )
                .await
            }

            TransferEvent::SegmentCompleted { .. } | TransferEvent::LinkRefreshed { .. } => {}
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            pb.abandon();
        }
    }
}
