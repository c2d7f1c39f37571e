use crate::events::TransferProgress;
use crate::file::file_part::FilePartObj;
use crate::{Error, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Identity of one transfer: the remote address plus the file's declared
/// name and original path. Lookups that miss are protocol errors, not
/// silent no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TransferKey {
    pub ip: String,
    pub file_name: String,
    pub file_path: String,
}

impl TransferKey {
    pub fn new(ip: &str, file_name: &str, file_path: &str) -> Self {
        Self {
            ip: ip.to_string(),
            file_name: file_name.to_string(),
            file_path: file_path.to_string(),
        }
    }
}

/// Sender-side state of one outbound transfer: the open read stream and a
/// monotonically increasing part counter. Parts are produced strictly one
/// at a time; the next part is only read once the previous one is acked.
pub(crate) struct FileSentReq {
    file: File,
    target_ip: String,
    file_name: String,
    file_path: String,
    file_len: u64,
    buffer_size: usize,
    total_parts: u64,
    parts_sent: u64,
    last_activity: Instant,
}

impl FileSentReq {
    /// Open `file_path` for reading and size the transfer. A file that
    /// cannot be opened is [`Error::FileNotFound`]; a zero buffer size is
    /// invalid. An empty file still produces one (empty) part so the
    /// receiver materializes it.
    pub(crate) async fn open(target_ip: &str, file_path: &str, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer size must be non-zero",
            )));
        }
        let file = File::open(file_path)
            .await
            .map_err(|e| Error::FileNotFound(format!("can't access {}: {}", file_path, e)))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| Error::FileNotFound(format!("can't access {}: {}", file_path, e)))?
            .len();

        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::FileNotFound(format!("{} has no file name", file_path)))?;

        let total_parts = file_len.div_ceil(buffer_size as u64).max(1);
        Ok(Self {
            file,
            target_ip: target_ip.to_string(),
            file_name,
            file_path: file_path.to_string(),
            file_len,
            buffer_size,
            total_parts,
            parts_sent: 0,
            last_activity: Instant::now(),
        })
    }

    /// Read the next part off the stream, or `None` once every part has
    /// been produced (transfer complete).
    pub(crate) async fn next_part(&mut self) -> Result<Option<FilePartObj>> {
        if self.parts_sent >= self.total_parts {
            return Ok(None);
        }

        let offset = self.parts_sent * self.buffer_size as u64;
        let take = std::cmp::min(self.buffer_size as u64, self.file_len.saturating_sub(offset));
        let mut data = vec![0u8; take as usize];
        if !data.is_empty() {
            self.file.read_exact(&mut data).await?;
        }

        self.parts_sent += 1;
        self.last_activity = Instant::now();
        Ok(Some(FilePartObj {
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            part_num: self.parts_sent,
            total_parts: self.total_parts,
            data,
        }))
    }

    pub(crate) fn target_ip(&self) -> &str {
        &self.target_ip
    }

    pub(crate) fn total_parts(&self) -> u64 {
        self.total_parts
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.parts_sent >= self.total_parts
    }

    /// Time since the last part was produced; drives the stalled-ack
    /// timeout sweep.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub(crate) fn progress(&self) -> TransferProgress {
        TransferProgress {
            remote_ip: self.target_ip.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            part_num: self.parts_sent,
            total_parts: self.total_parts,
        }
    }
}

/// Receiver-side state of one inbound transfer: the open write stream and
/// the number of the last part written. Created on part 1, closed when the
/// part whose number equals the declared total arrives.
pub(crate) struct FileReceiveReq {
    file: File,
    source_ip: String,
    file_name: String,
    file_path: String,
    total_parts: u64,
    parts_written: u64,
}

impl FileReceiveReq {
    /// Create the receive directory if needed and open the output file,
    /// replacing any existing file of the same name. Only the final
    /// component of the declared file name is used, so a malicious name
    /// can't escape the receive directory.
    pub(crate) async fn create(
        receive_dir: &Path,
        part: &FilePartObj,
        source_ip: &str,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(receive_dir).await?;

        let safe_name = Path::new(&part.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::FileNotFound(format!("invalid file name {}", part.file_name)))?;
        let file = File::create(receive_dir.join(&safe_name)).await?;

        Ok(Self {
            file,
            source_ip: source_ip.to_string(),
            file_name: part.file_name.clone(),
            file_path: part.file_path.clone(),
            total_parts: part.total_parts,
            parts_written: 0,
        })
    }

    /// Append one part's bytes to the stream. Stop-and-wait ordering means
    /// the end of the stream is always this part's implied offset.
    pub(crate) async fn write_part(&mut self, part: &FilePartObj) -> Result<()> {
        self.file.write_all(&part.data).await?;
        self.parts_written = part.part_num;
        Ok(())
    }

    /// Flush and close the write stream (terminal state).
    pub(crate) async fn finish(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub(crate) fn progress(&self) -> TransferProgress {
        TransferProgress {
            remote_ip: self.source_ip.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            part_num: self.parts_written,
            total_parts: self.total_parts,
        }
    }
}
