use std::io::SeekFrom;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use infrastructure::sync::PauseToken;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use domain::SyncError;

use super::UploadSession;

/// PUT attempts per part before the whole upload aborts.
const PART_RETRIES: u32 = 3;

pub(super) struct UploadPartSupervisor {
    pub(super) session: UploadSession,
    file: Mutex<File>,
    part_size: u64,
    index_queue: ArrayQueue<usize>,
    start_guard: Arc<Semaphore>,
    max_workers: usize,
    pause_token: PauseToken,
    cancel_workers: Mutex<CancellationToken>,
    cancel_upload: CancellationToken,
    abort: CancellationToken,
    client: reqwest::Client,
    failure: Mutex<Option<anyhow::Error>>,
}

struct UploadPartWorker {
    part_index: usize,
    _permit: OwnedSemaphorePermit,
    cancel_token: CancellationToken,
    supervisor: Weak<UploadPartSupervisor>,
}

impl UploadPartSupervisor {
    pub fn new(
        file: File,
        session: UploadSession,
        client: reqwest::Client,
        part_size: u64,
        pause_token: PauseToken,
        cancel_upload: CancellationToken,
        max_workers: usize,
    ) -> Self {
        let index_queue = ArrayQueue::new(session.parts.len().max(1));
        for i in 0..session.parts.len() {
            // safe because of reserved capacity
            index_queue.push(i).unwrap();
        }

        Self {
            session,
            file: Mutex::new(file),
            part_size,
            index_queue,
            start_guard: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            pause_token,
            cancel_workers: Mutex::default(),
            cancel_upload,
            abort: CancellationToken::new(),
            client,
            failure: Mutex::default(),
        }
    }

    /// PUT every part with bounded workers.
    ///
    /// # return
    ///
    /// Whether the upload was cancelled. A part that exhausts its retries
    /// surfaces as an error instead.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<bool> {
        let key = self.session.key.clone();

        let cancelled = loop {
            tokio::select! {
                permit = self.pause_token.attach(self.start_guard.clone().acquire_owned()) => {
                    if let Some(part_index) = self.index_queue.pop() {
                        let worker = UploadPartWorker {
                            part_index,
                            _permit: permit.unwrap(),
                            cancel_token: self.cancel_workers.lock().await.clone(),
                            supervisor: Arc::downgrade(&self),
                        };
                        let key = key.clone();
                        tokio::spawn(async move {
                            if let Err(e) = worker.start().await {
                                tracing::error!(%key, %part_index, "Upload part failed: {e}");
                            }
                        });
                    } else if self.start_guard.available_permits() + 1 < self.max_workers {
                        // Plus the just acquired one is less than the cap,
                        // means some workers are still running. Wait for a
                        // moment and then check again.
                        sleep(Duration::from_secs(1)).await;
                    } else {
                        break false;
                    };
                }
                _ = self.cancel_upload.cancelled() => {
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

impl UploadPartWorker {
    async fn start(&self) -> anyhow::Result<()> {
        tokio::select! {
            Err(e) = self.run() => {
                let msg = e.to_string();
                self.give_up(e).await;
                return Err(anyhow::anyhow!(msg));
            }
            _ = self.cancel_token.cancelled() => {
                self.revert_part_index();
            }
            else => (),
        }

        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let supervisor = self.supervisor.upgrade().unwrap();
        let part = &supervisor.session.parts[self.part_index];
        let offset = (part.number - 1) * supervisor.part_size;

        let mut buf = vec![0u8; part.length as usize];
        {
            let mut file = supervisor.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;
        }

        let mut attempt = 0;
        loop {
            let sent = supervisor
                .client
                .put(&part.url)
                .body(buf.clone())
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match sent {
                Ok(_) => {
                    part.uploaded.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= PART_RETRIES {
                        return Err(SyncError::PartUploadFailed {
                            part: part.number,
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    let wait = Duration::from_secs(5u64.pow(attempt - 1));
                    tracing::warn!(
                        part = part.number,
                        "Part PUT failed, retrying in {wait:?}: {e}"
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    /// Terminal part failure: record it and stop the whole session.
    async fn give_up(&self, error: anyhow::Error) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.failure.lock().await.get_or_insert(error);
            supervisor.abort.cancel();
        }
    }

    fn revert_part_index(&self) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.index_queue.push(self.part_index).unwrap();
        }
    }
}
