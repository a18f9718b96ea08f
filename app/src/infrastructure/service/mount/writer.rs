use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use domain::SyncError;

/// Buffered multi-part write-back for one mounted file.
///
/// `SetEndOfFile` fixes the part plan up front; incoming `WriteFile` calls
/// land in per-part temp files, and a part is PUT the moment it is full.
/// `finish` flushes whatever is left (the remainder of the last part) and
/// leaves `complete-upload` to the volume.
pub struct WriteSession {
    pub file_id: String,
    pub upload_id: String,
    pub total_size: u64,
    part_size: u64,
    parts: Vec<PartBuffer>,
}

struct PartBuffer {
    number: u64,
    url: String,
    length: u64,
    temp_path: PathBuf,
    written: u64,
    sent: bool,
}

impl WriteSession {
    pub fn new(
        file_id: String,
        upload_id: String,
        part_urls: Vec<(u64, String)>,
        total_size: u64,
        part_size: u64,
        temp_dir: &Path,
    ) -> Self {
        let parts = part_urls
            .into_iter()
            .map(|(number, url)| {
                let offset = (number - 1) * part_size;
                PartBuffer {
                    number,
                    url,
                    length: part_size.min(total_size - offset),
                    temp_path: temp_dir.join(format!("{}.{number}.part", Uuid::new_v4())),
                    written: 0,
                    sent: false,
                }
            })
            .collect();
        Self {
            file_id,
            upload_id,
            total_size,
            part_size,
            parts,
        }
    }

    /// Dispatch one write to the parts it spans; full parts go out at once.
    pub async fn write(
        &mut self,
        offset: u64,
        mut data: &[u8],
        client: &reqwest::Client,
    ) -> anyhow::Result<()> {
        let mut position = offset;
        while !data.is_empty() {
            anyhow::ensure!(
                position < self.total_size,
                "write beyond the declared end of file"
            );
            let index = (position / self.part_size) as usize;
            let within = position - (index as u64) * self.part_size;
            let room = (self.parts[index].length - within).min(data.len() as u64) as usize;

            {
                let part = &mut self.parts[index];
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&part.temp_path)
                    .await?;
                file.seek(SeekFrom::Start(within)).await?;
                file.write_all(&data[..room]).await?;
                file.flush().await?;
                part.written += room as u64;
            }

            if self.parts[index].written >= self.parts[index].length {
                self.send_part(index, client).await?;
            }

            position += room as u64;
            data = &data[room..];
        }
        Ok(())
    }

    /// Flush every part that has bytes but was not sent yet.
    pub async fn finish(&mut self, client: &reqwest::Client) -> anyhow::Result<()> {
        for index in 0..self.parts.len() {
            let part = &self.parts[index];
            if !part.sent && (part.written > 0 || part.length == 0) {
                self.send_part(index, client).await?;
            }
        }
        anyhow::ensure!(
            self.parts.iter().all(|p| p.sent),
            "mounted write closed with unwritten parts"
        );
        self.cleanup().await;
        Ok(())
    }

    pub async fn abandon(&mut self) {
        self.cleanup().await;
    }

    async fn send_part(&mut self, index: usize, client: &reqwest::Client) -> anyhow::Result<()> {
        let part = &mut self.parts[index];
        if part.sent {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(part.length as usize);
        if part.length > 0 {
            let mut file = File::open(&part.temp_path).await?;
            file.read_to_end(&mut buf).await?;
        }

        client
            .put(&part.url)
            .body(buf)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| SyncError::PartUploadFailed {
                part: part.number,
                reason: e.to_string(),
            })?;

        part.sent = true;
        let _ = tokio::fs::remove_file(&part.temp_path).await;
        tracing::trace!(part = part.number, "Mounted write part sent");
        Ok(())
    }

    async fn cleanup(&mut self) {
        for part in &self.parts {
            let _ = tokio::fs::remove_file(&part.temp_path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u64, part_size: u64) -> WriteSession {
        let parts = total.div_ceil(part_size).max(1);
        let urls = (1..=parts).map(|n| (n, format!("https://upload/{n}"))).collect();
        WriteSession::new(
            "f".into(),
            "u".into(),
            urls,
            total,
            part_size,
            &std::env::temp_dir(),
        )
    }

    #[test]
    fn part_plan_covers_the_declared_size() {
        let session = session(40, 16);
        let lengths: Vec<u64> = session.parts.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![16, 16, 8]);
        assert_eq!(lengths.iter().sum::<u64>(), 40);
    }

    #[tokio::test]
    async fn writes_buffer_until_a_part_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = WriteSession::new(
            "f".into(),
            "u".into(),
            vec![(1, "https://upload.invalid/1".into()), (2, "https://upload.invalid/2".into())],
            24,
            16,
            dir.path(),
        );
        let client = reqwest::Client::new();

        // Partial first part: nothing is sent, bytes are buffered.
        session.write(0, &[1u8; 10], &client).await.unwrap();
        assert_eq!(session.parts[0].written, 10);
        assert!(!session.parts[0].sent);
        assert!(session.parts[0].temp_path.exists());

        // A write into part 2 only: still buffered there.
        session.write(16, &[2u8; 4], &client).await.unwrap();
        assert_eq!(session.parts[1].written, 4);
        assert!(!session.parts[1].sent);

        // Filling part 1 triggers the eager PUT, which fails against the
        // unresolvable URL; the buffered state must survive for a retry.
        let outcome = session.write(10, &[3u8; 6], &client).await;
        assert!(outcome.is_err());
        assert_eq!(session.parts[0].written, 16);
        assert!(!session.parts[0].sent);

        session.abandon().await;
        assert!(!session.parts[0].temp_path.exists());
        assert!(!session.parts[1].temp_path.exists());
    }

    #[tokio::test]
    async fn write_beyond_declared_size_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = WriteSession::new(
            "f".into(),
            "u".into(),
            vec![(1, "https://upload.invalid/1".into())],
            8,
            16,
            dir.path(),
        );
        let client = reqwest::Client::new();
        assert!(session.write(8, &[0u8; 1], &client).await.is_err());
        session.abandon().await;
    }
}
