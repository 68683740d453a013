//! The serializer task: sole owner of the queue's file handles and position
//! state. All queue operations arrive as channel messages and are applied in
//! arrival order, so no locking is needed anywhere on the data path.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use metrics::gauge;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{
    ControlError, ControlRequest, DiskQueueConfig, PopRequest, PushError, WriteRequest,
};

pub(crate) struct Serializer {
    config: DiskQueueConfig,

    // Persisted state.
    depth: i64,
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,

    // Position of the frame staged for the next pop; folded into the
    // persisted read position only once a consumer has taken the frame.
    next_read_file_num: u64,
    next_read_pos: u64,

    read_file: Option<BufReader<File>>,
    write_file: Option<File>,
    need_sync: bool,

    depth_tx: watch::Sender<i64>,
    write_rx: mpsc::Receiver<WriteRequest>,
    pop_rx: mpsc::Receiver<PopRequest>,
    empty_rx: mpsc::Receiver<ControlRequest>,
    close_rx: mpsc::Receiver<ControlRequest>,
}

impl Serializer {
    pub(crate) async fn recover(
        config: DiskQueueConfig,
        write_rx: mpsc::Receiver<WriteRequest>,
        pop_rx: mpsc::Receiver<PopRequest>,
        empty_rx: mpsc::Receiver<ControlRequest>,
        close_rx: mpsc::Receiver<ControlRequest>,
        depth_tx: watch::Sender<i64>,
    ) -> Self {
        if let Err(error) = fs::create_dir_all(&config.data_path).await {
            error!(path = %config.data_path.display(), %error, "failed to create data path");
        }

        let mut serializer = Self {
            config,
            depth: 0,
            read_file_num: 0,
            read_pos: 0,
            write_file_num: 0,
            write_pos: 0,
            next_read_file_num: 0,
            next_read_pos: 0,
            read_file: None,
            write_file: None,
            need_sync: false,
            depth_tx,
            write_rx,
            pop_rx,
            empty_rx,
            close_rx,
        };

        if let Err(error) = serializer.retrieve_metadata().await {
            if error.kind() != ErrorKind::NotFound {
                error!(%error, "failed to retrieve metadata, starting empty");
            }
        }
        serializer.publish_depth();
        serializer
    }

    pub(crate) async fn io_loop(mut self) {
        let mut pending: Option<Bytes> = None;
        let mut count: u64 = 0;
        let mut close_reply: Option<ControlRequest> = None;

        let mut sync_ticker = tokio::time::interval(self.config.sync_timeout);
        sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if count >= self.config.sync_every {
                self.need_sync = true;
            }
            if self.need_sync {
                if let Err(error) = self.sync().await {
                    error!(%error, "failed to sync");
                }
                count = 0;
            }

            // Stage the next frame as soon as one is available so a pop can
            // be answered immediately.
            if pending.is_none()
                && (self.read_file_num < self.write_file_num || self.read_pos < self.write_pos)
            {
                match self.read_one().await {
                    Ok(frame) => pending = Some(frame),
                    Err(error) => {
                        error!(
                            read_pos = self.read_pos,
                            filename = %self.file_name(self.read_file_num).display(),
                            %error,
                            "reading segment failed"
                        );
                        self.handle_read_error().await;
                        continue;
                    }
                }
            }

            tokio::select! {
                request = self.pop_rx.recv(), if pending.is_some() => {
                    let Some(reply) = request else { break };
                    let frame = pending.take().expect("frame staged");
                    match reply.send(frame) {
                        Ok(()) => {
                            count += 1;
                            self.move_forward().await;
                        }
                        // Requester went away before taking the frame; keep
                        // it staged so it is not lost.
                        Err(frame) => pending = Some(frame),
                    }
                }
                request = self.write_rx.recv() => {
                    let Some((data, reply)) = request else { break };
                    count += 1;
                    let result = self.write_one(&data).await;
                    let _ = reply.send(result);
                }
                request = self.empty_rx.recv() => {
                    let Some(reply) = request else { break };
                    info!("emptying queue");
                    let result = self.delete_all_files().await;
                    pending = None;
                    count = 0;
                    let _ = reply.send(result);
                }
                request = self.close_rx.recv() => {
                    close_reply = request;
                    break;
                }
                _ = sync_ticker.tick() => {
                    if count != 0 {
                        self.need_sync = true;
                    }
                }
            }
        }

        info!(name = %self.config.name, "closing serializer");
        let result = self
            .sync()
            .await
            .map_err(|source| ControlError::Io { source });
        if let Err(error) = &result {
            error!(%error, "failed to sync on close");
        }
        if let Some(reply) = close_reply {
            let _ = reply.send(result);
        }
    }

    /// Appends one framed message, rolling to a new segment when the write
    /// position crosses the configured bound.
    async fn write_one(&mut self, data: &[u8]) -> Result<(), PushError> {
        if self.write_file.is_none() {
            let path = self.file_name(self.write_file_num);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await
                .map_err(|source| PushError::Io { source })?;
            info!(filename = %path.display(), "opened segment for writing");
            if self.write_pos > 0 {
                file.seek(SeekFrom::Start(self.write_pos))
                    .await
                    .map_err(|source| PushError::Io { source })?;
            }
            self.write_file = Some(file);
        }

        let size = data.len();
        if size < self.config.min_msg_size as usize || size > self.config.max_msg_size as usize {
            return Err(PushError::InvalidMessageSize {
                size,
                min: self.config.min_msg_size,
                max: self.config.max_msg_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + size);
        buf.put_u32(size as u32);
        buf.put_slice(data);

        let file = self.write_file.as_mut().expect("write file opened above");
        let written = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        if let Err(source) = written {
            self.write_file = None;
            return Err(PushError::Io { source });
        }

        self.write_pos += (4 + size) as u64;
        self.depth += 1;
        self.publish_depth();

        if self.write_pos >= self.config.max_bytes_per_file {
            self.write_file_num += 1;
            self.write_pos = 0;

            // sync every time we start writing to a new file
            if let Err(error) = self.sync().await {
                error!(%error, "failed to sync");
            }
            self.write_file = None;
        }

        Ok(())
    }

    /// Reads the frame at the current read position, advancing only the
    /// staged (`next_*`) positions.
    async fn read_one(&mut self) -> io::Result<Bytes> {
        if self.read_file.is_none() {
            let path = self.file_name(self.read_file_num);
            let mut file = File::open(&path).await?;
            info!(filename = %path.display(), "opened segment for reading");
            if self.read_pos > 0 {
                file.seek(SeekFrom::Start(self.read_pos)).await?;
            }
            self.read_file = Some(BufReader::new(file));
        }

        let min = self.config.min_msg_size;
        let max = self.config.max_msg_size;
        let reader = self.read_file.as_mut().expect("read file opened above");
        let read = async {
            let size = reader.read_u32().await?;
            if size < min || size > max {
                // No reasonable guarantee on where the next frame begins.
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid message read size ({size})"),
                ));
            }
            let mut body = vec![0u8; size as usize];
            reader.read_exact(&mut body).await?;
            Ok(Bytes::from(body))
        }
        .await;

        let frame = match read {
            Ok(frame) => frame,
            Err(error) => {
                self.read_file = None;
                return Err(error);
            }
        };

        self.next_read_pos = self.read_pos + 4 + frame.len() as u64;
        self.next_read_file_num = self.read_file_num;

        if self.next_read_pos > self.config.max_bytes_per_file {
            self.read_file = None;
            self.next_read_file_num += 1;
            self.next_read_pos = 0;
        }

        Ok(frame)
    }

    /// Folds the staged read position into the persisted one after a consumer
    /// has taken the frame, unlinking the old segment on a file transition.
    async fn move_forward(&mut self) {
        let old_read_file_num = self.read_file_num;
        self.read_file_num = self.next_read_file_num;
        self.read_pos = self.next_read_pos;
        self.depth -= 1;
        self.publish_depth();

        if old_read_file_num != self.next_read_file_num {
            // sync every time we start reading from a new file
            self.need_sync = true;

            let path = self.file_name(old_read_file_num);
            if let Err(error) = fs::remove_file(&path).await {
                error!(filename = %path.display(), %error, "failed to remove consumed segment");
            }
        }

        self.check_tail_corruption().await;
    }

    async fn check_tail_corruption(&mut self) {
        if self.read_file_num < self.write_file_num || self.read_pos < self.write_pos {
            return;
        }

        // End of the queue reached; any residual depth means the metadata and
        // the data files disagree.
        if self.depth != 0 {
            if self.depth < 0 {
                error!(
                    depth = self.depth,
                    "negative depth at tail, metadata corruption, resetting to 0"
                );
            } else {
                error!(
                    depth = self.depth,
                    "positive depth at tail, data loss, resetting to 0"
                );
            }
            self.depth = 0;
            self.publish_depth();
            self.need_sync = true;
        }

        if self.read_file_num != self.write_file_num || self.read_pos != self.write_pos {
            if self.read_file_num > self.write_file_num {
                error!(
                    read_file_num = self.read_file_num,
                    write_file_num = self.write_file_num,
                    "read file number passed write file number, corruption, skipping ahead"
                );
            }
            if self.read_pos > self.write_pos {
                error!(
                    read_pos = self.read_pos,
                    write_pos = self.write_pos,
                    "read position passed write position, corruption, skipping ahead"
                );
            }
            if let Err(error) = self.skip_to_next_rw_file().await {
                error!(%error, "failed to skip to next segment");
            }
            self.need_sync = true;
        }
    }

    /// Quarantines the unreadable segment as `<name>.bad` and jumps to the
    /// next one.
    async fn handle_read_error(&mut self) {
        if self.read_file_num == self.write_file_num {
            // The bad segment is also the write file; it cannot be trusted
            // either, so roll the writer forward with it.
            self.write_file = None;
            self.write_file_num += 1;
            self.write_pos = 0;
        }

        let bad = self.file_name(self.read_file_num);
        let mut renamed = bad.clone().into_os_string();
        renamed.push(".bad");
        let renamed = PathBuf::from(renamed);

        warn!(filename = %renamed.display(), "jumping to next segment and quarantining bad file");
        if let Err(error) = fs::rename(&bad, &renamed).await {
            error!(
                from = %bad.display(),
                to = %renamed.display(),
                %error,
                "failed to rename bad segment"
            );
        }

        self.read_file_num += 1;
        self.read_pos = 0;
        self.next_read_file_num = self.read_file_num;
        self.next_read_pos = 0;

        // Significant state change; persist it on the next iteration.
        self.need_sync = true;
    }

    /// Fast-forwards both ends of the queue onto a fresh segment, removing
    /// everything in between.
    async fn skip_to_next_rw_file(&mut self) -> io::Result<()> {
        self.read_file = None;
        self.write_file = None;

        let mut result = Ok(());
        for num in self.read_file_num..=self.write_file_num {
            let path = self.file_name(num);
            if let Err(error) = fs::remove_file(&path).await {
                if error.kind() != ErrorKind::NotFound {
                    error!(filename = %path.display(), %error, "failed to remove data file");
                    result = Err(error);
                }
            }
        }

        self.write_file_num += 1;
        self.write_pos = 0;
        self.read_file_num = self.write_file_num;
        self.read_pos = 0;
        self.next_read_file_num = self.write_file_num;
        self.next_read_pos = 0;
        self.depth = 0;
        self.publish_depth();

        result
    }

    async fn delete_all_files(&mut self) -> Result<(), ControlError> {
        let skipped = self.skip_to_next_rw_file().await;

        if let Err(error) = fs::remove_file(self.meta_file_name()).await {
            if error.kind() != ErrorKind::NotFound {
                error!(%error, "failed to remove metadata file");
                return Err(ControlError::Io { source: error });
            }
        }

        skipped.map_err(|source| ControlError::Io { source })
    }

    /// Fsyncs the write file and persists metadata.
    async fn sync(&mut self) -> io::Result<()> {
        if let Some(file) = self.write_file.as_mut() {
            let synced = async {
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            if let Err(error) = synced {
                self.write_file = None;
                return Err(error);
            }
        }

        self.persist_metadata().await?;
        self.need_sync = false;
        Ok(())
    }

    async fn retrieve_metadata(&mut self) -> io::Result<()> {
        let contents = fs::read_to_string(self.meta_file_name()).await?;
        let mut lines = contents.lines();

        let depth = lines.next().and_then(|line| line.trim().parse::<i64>().ok());
        let read = lines.next().and_then(parse_position_line);
        let write = lines.next().and_then(parse_position_line);

        match (depth, read, write) {
            (Some(depth), Some((read_file_num, read_pos)), Some((write_file_num, write_pos))) => {
                self.depth = depth;
                self.read_file_num = read_file_num;
                self.read_pos = read_pos;
                self.write_file_num = write_file_num;
                self.write_pos = write_pos;
                self.next_read_file_num = read_file_num;
                self.next_read_pos = read_pos;
                Ok(())
            }
            _ => Err(io::Error::new(
                ErrorKind::InvalidData,
                "malformed metadata file",
            )),
        }
    }

    /// Writes metadata to a temp file, fsyncs it, and renames it over the
    /// stable path so the metadata file is never observed half-written.
    async fn persist_metadata(&mut self) -> io::Result<()> {
        let stable = self.meta_file_name();
        let mut tmp = stable.clone().into_os_string();
        tmp.push(format!(".{}.tmp", rand::random::<u64>()));
        let tmp = PathBuf::from(tmp);

        let contents = format!(
            "{}\n{},{}\n{},{}\n",
            self.depth, self.read_file_num, self.read_pos, self.write_file_num, self.write_pos
        );

        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &stable).await
    }

    fn publish_depth(&self) {
        let _ = self.depth_tx.send_replace(self.depth);
        gauge!("diskqueue_depth", "name" => self.config.name.clone()).set(self.depth as f64);
    }

    fn file_name(&self, file_num: u64) -> PathBuf {
        self.config
            .data_path
            .join(format!("{}.diskqueue.{:06}.dat", self.config.name, file_num))
    }

    fn meta_file_name(&self) -> PathBuf {
        self.config
            .data_path
            .join(format!("{}.diskqueue.meta.dat", self.config.name))
    }
}

fn parse_position_line(line: &str) -> Option<(u64, u64)> {
    let (file_num, pos) = line.trim().split_once(',')?;
    Some((file_num.parse().ok()?, pos.parse().ok()?))
}
