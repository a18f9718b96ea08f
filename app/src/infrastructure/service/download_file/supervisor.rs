use std::io::SeekFrom;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use infrastructure::sync::PauseToken;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use domain::SyncError;

/// GET attempts per part before the whole download aborts.
const PART_RETRIES: u32 = 3;

pub(super) struct DownloadPartSupervisor {
    file: Mutex<File>,
    file_size: u64,
    part_size: u64,
    index_queue: ArrayQueue<u64>,
    last_index: u64,
    start_guard: Arc<Semaphore>,
    max_workers: usize,
    pause_token: PauseToken,
    cancel_workers: Mutex<CancellationToken>,
    cancel_download: CancellationToken,
    abort: CancellationToken,
    download_url: String,
    client: reqwest::Client,
    failure: Mutex<Option<anyhow::Error>>,
}

struct DownloadPartWorker {
    block_index: u64,
    _permit: OwnedSemaphorePermit,
    cancel_token: CancellationToken,
    supervisor: Weak<DownloadPartSupervisor>,
}

impl DownloadPartSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file: File,
        file_size: u64,
        part_size: u64,
        download_url: String,
        client: reqwest::Client,
        pause_token: PauseToken,
        cancel_download: CancellationToken,
        max_workers: usize,
    ) -> Self {
        let block_count = file_size.div_ceil(part_size);
        let index_queue = ArrayQueue::new(block_count as usize);
        for i in 0..block_count {
            // safe because of reserved capacity
            index_queue.push(i).unwrap();
        }

        Self {
            file: Mutex::new(file),
            file_size,
            part_size,
            index_queue,
            last_index: block_count - 1,
            start_guard: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            pause_token,
            cancel_workers: Mutex::default(),
            cancel_download,
            abort: CancellationToken::new(),
            download_url,
            client,
            failure: Mutex::default(),
        }
    }

    /// Fetch every ranged block with bounded workers.
    ///
    /// # return
    ///
    /// Whether the download was cancelled. A block that exhausts its
    /// retries surfaces as an error instead.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<bool> {
        let cancelled = loop {
            tokio::select! {
                permit = self.pause_token.attach(self.start_guard.clone().acquire_owned()) => {
                    if let Some(block_index) = self.index_queue.pop() {
                        let worker = DownloadPartWorker {
                            block_index,
                            _permit: permit.unwrap(),
                            cancel_token: self.cancel_workers.lock().await.clone(),
                            supervisor: Arc::downgrade(&self),
                        };
                        tokio::spawn(async move {
                            if let Err(e) = worker.start().await {
                                tracing::error!(%block_index, "Download part failed: {e}");
                            }
                        });
                    } else if self.start_guard.available_permits() + 1 < self.max_workers {
                        // Workers are still draining their blocks.
                        sleep(Duration::from_secs(1)).await;
                    } else {
                        break false;
                    };
                }
                _ = self.cancel_download.cancelled() => {
                    self.cancel_workers.lock().await.cancel();
                    break true;
                }
                _ = self.abort.cancelled() => {
                    self.cancel_workers.lock().await.cancel();
                    break false;
                }
            }
        };

        if let Some(error) = self.failure.lock().await.take() {
            return Err(error);
        }
        Ok(cancelled)
    }
}

impl DownloadPartWorker {
    async fn start(&self) -> anyhow::Result<()> {
        tokio::select! {
            Err(e) = self.run() => {
                let msg = e.to_string();
                self.give_up(e).await;
                return Err(anyhow::anyhow!(msg));
            }
            _ = self.cancel_token.cancelled() => {
                self.revert_block_index();
            }
            else => (),
        }

        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let supervisor = self.supervisor.upgrade().unwrap();

        let start = self.block_index * supervisor.part_size;
        let end = if self.block_index == supervisor.last_index {
            supervisor.file_size - 1
        } else {
            start + supervisor.part_size - 1
        };

        let mut attempt = 0;
        let bytes = loop {
            let got = supervisor
                .client
                .get(&supervisor.download_url)
                // The right end is inclusive.
                .header("Range", format!("bytes={start}-{end}"))
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match got {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => break bytes,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= PART_RETRIES {
                            return Err(SyncError::Transient(e.to_string()).into());
                        }
                    }
                },
                Err(e) => {
                    attempt += 1;
                    if attempt >= PART_RETRIES {
                        return Err(SyncError::Transient(e.to_string()).into());
                    }
                }
            }
            let wait = Duration::from_secs(5u64.pow(attempt - 1));
            tracing::warn!(block = self.block_index, "Ranged GET failed, retrying in {wait:?}");
            sleep(wait).await;
        };

        let mut file = supervisor.file.lock().await;
        file.seek(SeekFrom::Start(start)).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        Ok(())
    }

    async fn give_up(&self, error: anyhow::Error) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.failure.lock().await.get_or_insert(error);
            supervisor.abort.cancel();
        }
    }

    fn revert_block_index(&self) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.index_queue.push(self.block_index).unwrap();
        }
    }
}
