//! Async (Tokio) transport: the sync daemon and the sync client.
//!
//! Both sides speak length-prefixed JSON frames (see `protocol_core`).
//! One connection carries strictly sequential request/response pairs.

use crate::error::{Result, SyncError};
use crate::logger::Logger;
use crate::protocol::{err_code, msg, timeouts};
use crate::protocol_core::{
    read_command, read_response, write_command, write_response, CommandMsg, ResponseMsg,
};
use crate::snapshot::{FileEntry, Snapshot};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub mod server {
    use super::*;
    use crate::config::Config;
    use crate::fs_enum::{walk_tree, ExcludeSet};
    use filetime::{set_file_mtime, FileTime};
    use tokio::time::timeout;

    /// Everything a connection handler needs, shared read-only across tasks.
    #[derive(Clone, Debug)]
    pub struct ServerSettings {
        pub token: String,
        pub block_size: u64,
        pub exclude: Arc<ExcludeSet>,
        /// How long a fresh connection may stay silent before its TOKEN arrives.
        pub auth_timeout: Duration,
    }

    impl ServerSettings {
        pub fn from_config(cfg: &Config, logger: &dyn Logger) -> Self {
            Self {
                token: cfg.server.token.clone(),
                block_size: cfg.block_size(),
                exclude: Arc::new(cfg.exclude_set(logger)),
                auth_timeout: timeouts::AUTH_READ,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum ConnState {
        AwaitingToken,
        Serving,
        Closed,
    }

    pub async fn serve(bind: &str, settings: ServerSettings, logger: Arc<dyn Logger>) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| SyncError::transport(format!("bind {}", bind), e))?;
        serve_listener(listener, settings, logger).await
    }

    /// Accept loop over an already bound listener. Returns only on accept failure.
    pub async fn serve_listener(
        listener: TcpListener,
        settings: ServerSettings,
        logger: Arc<dyn Logger>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            log_info!(logger, "filesync daemon listening on {}", addr);
        }
        let settings = Arc::new(settings);
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| SyncError::transport("accept", e))?;
            let _ = stream.set_nodelay(true);
            log_debug!(logger, "conn from {}", peer);

            let settings = Arc::clone(&settings);
            let logger = Arc::clone(&logger);
            tokio::spawn(async move {
                let started = Instant::now();
                if let Err(e) = handle_conn(stream, &settings, &logger).await {
                    log_warn!(logger, "conn {} closed: {}", peer, e);
                }
                log_debug!(logger, "conn {} done in {:.3}s", peer, started.elapsed().as_secs_f64());
            });
        }
    }

    /// Run one connection to completion and shut the stream down once.
    pub async fn handle_conn(
        mut stream: TcpStream,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> Result<()> {
        let result = run_conn(&mut stream, settings, logger).await;
        let _ = stream.shutdown().await;
        result
    }

    async fn run_conn(
        stream: &mut TcpStream,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> Result<()> {
        let mut state = ConnState::AwaitingToken;
        loop {
            state = match state {
                ConnState::AwaitingToken => await_token(stream, settings, logger).await?,
                ConnState::Serving => serve_one(stream, settings, logger).await?,
                ConnState::Closed => return Ok(()),
            };
        }
    }

    async fn await_token(
        stream: &mut TcpStream,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> Result<ConnState> {
        let cmd = match timeout(settings.auth_timeout, read_command(stream)).await {
            Ok(Ok(cmd)) => cmd,
            Ok(Err(e)) => {
                log_warn!(logger, "read token failed: {}", e);
                return Ok(ConnState::Closed);
            }
            Err(_) => {
                log_warn!(logger, "no token within {:?}", settings.auth_timeout);
                return Ok(ConnState::Closed);
            }
        };
        if cmd.msg_type != msg::TOKEN {
            log_warn!(logger, "expected TOKEN, got {}", msg::name(cmd.msg_type));
            return Ok(ConnState::Closed);
        }
        // Mismatch closes without a reply
        if cmd.token != settings.token {
            log_warn!(logger, "token mismatch");
            return Ok(ConnState::Closed);
        }
        write_response(stream, &ResponseMsg::success(msg::TOKEN)).await?;
        Ok(ConnState::Serving)
    }

    async fn serve_one(
        stream: &mut TcpStream,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> Result<ConnState> {
        let cmd = match read_command(stream).await {
            Ok(cmd) => cmd,
            Err(SyncError::Transport { ref source, .. })
                if source.kind() == io::ErrorKind::UnexpectedEof =>
            {
                return Ok(ConnState::Closed);
            }
            Err(e) => return Err(e),
        };
        match cmd.msg_type {
            msg::MAKECACHE => {
                let resp = make_cache(&cmd, settings, logger).await;
                write_response(stream, &resp).await?;
            }
            msg::SYNC => handle_sync(stream, &cmd, settings, logger).await?,
            other => log_warn!(logger, "unknown message type {}, ignored", other),
        }
        Ok(ConnState::Serving)
    }

    async fn make_cache(
        cmd: &CommandMsg,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> ResponseMsg {
        if cmd.dst_dir.is_empty() {
            return ResponseMsg::failure(msg::MAKECACHE, err_code::NO_DST_DIR, "dst dir is empty");
        }
        let root = PathBuf::from(&cmd.dst_dir);
        let exclude = Arc::clone(&settings.exclude);
        let walk_logger = Arc::clone(logger);
        let started = Instant::now();
        let snapshot =
            tokio::task::spawn_blocking(move || walk_tree(&root, &exclude, walk_logger.as_ref()))
                .await
                .unwrap_or_else(|e| {
                    log_error!(logger, "walk task for {} failed: {}", cmd.dst_dir, e);
                    Snapshot::new()
                });
        log_info!(
            logger,
            "make cache for {}: {} entries in {:.3}s",
            cmd.dst_dir,
            snapshot.len(),
            started.elapsed().as_secs_f64()
        );
        ResponseMsg::success(msg::MAKECACHE).with_file_infos(snapshot.to_wire())
    }

    async fn handle_sync(
        stream: &mut TcpStream,
        cmd: &CommandMsg,
        settings: &ServerSettings,
        logger: &Arc<dyn Logger>,
    ) -> Result<()> {
        if cmd.dst_dir.is_empty() {
            let resp = ResponseMsg::failure(msg::SYNC, err_code::NO_DST_DIR, "dst dir is empty");
            return write_response(stream, &resp).await;
        }
        let Some(entry) = cmd.sync_info.as_ref() else {
            let resp = ResponseMsg::failure(msg::SYNC, err_code::NO_SYNC_INFO, "sync info is empty");
            return write_response(stream, &resp).await;
        };
        let dst = PathBuf::from(&cmd.dst_dir);

        if entry.is_dir {
            if let Err(e) = create_dir(&dst, entry.permissions()).await {
                log_error!(logger, "create dir {} failed: {}", dst.display(), e);
            }
        } else {
            if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    log_error!(logger, "create dir {} failed: {}", parent.display(), e);
                }
            }
            let mut file = match open_for_write(&dst, entry.permissions()).await {
                Ok(f) => f,
                Err(e) => {
                    log_error!(logger, "open {} failed: {}", dst.display(), e);
                    let resp = ResponseMsg::failure(
                        msg::SYNC,
                        err_code::OPEN_FAILED,
                        format!("open file failed: {}", e),
                    );
                    return write_response(stream, &resp).await;
                }
            };
            let total = entry.size.max(0) as u64;
            match receive_parts(stream, &mut file, &dst, total, settings.block_size).await {
                Ok(()) => log_debug!(logger, "received {} ({} bytes)", dst.display(), total),
                Err(e) if e.is_fatal_to_connection() => return Err(e),
                Err(e) => {
                    log_error!(logger, "write {} failed: {}", dst.display(), e);
                    let resp = ResponseMsg::failure(msg::SYNC, err_code::WRITE_FAILED, e.to_string());
                    return write_response(stream, &resp).await;
                }
            }
        }

        let ft = FileTime::from_unix_time(
            entry.mod_time.timestamp(),
            entry.mod_time.timestamp_subsec_nanos(),
        );
        if let Err(e) = set_file_mtime(&dst, ft) {
            log_error!(logger, "set mtime on {} failed: {}", dst.display(), e);
        }
        write_response(stream, &ResponseMsg::success(msg::SYNC)).await
    }

    /// Pull `total` bytes from the client, one FILEPART request per block.
    ///
    /// Each chunk is read off the socket in full before it is written, so a
    /// local write failure leaves the connection in step with the client.
    async fn receive_parts(
        stream: &mut TcpStream,
        file: &mut tokio::fs::File,
        dst: &Path,
        total: u64,
        block_size: u64,
    ) -> Result<()> {
        let block = block_size.max(1).min(total.max(1));
        let mut buf = vec![0u8; block as usize];
        let mut offset = 0u64;
        while offset < total {
            let part = block.min(total - offset);
            write_response(stream, &ResponseMsg::file_part(offset as i64, part as i64)).await?;
            let chunk = &mut buf[..part as usize];
            stream
                .read_exact(chunk)
                .await
                .map_err(|e| SyncError::transport("read file part", e))?;
            file.write_all(chunk).await.map_err(|e| SyncError::fs(dst, e))?;
            offset += part;
        }
        file.flush().await.map_err(|e| SyncError::fs(dst, e))?;
        Ok(())
    }

    async fn create_dir(path: &Path, perm: u32) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(perm);
        #[cfg(not(unix))]
        let _ = perm;
        builder.create(path).await
    }

    async fn open_for_write(path: &Path, perm: u32) -> io::Result<tokio::fs::File> {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(perm);
        #[cfg(not(unix))]
        let _ = perm;
        opts.open(path).await
    }
}

pub mod client {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::diff;
    use crate::oper::SyncReport;
    use indicatif::ProgressBar;
    use std::io::SeekFrom;
    use tokio::io::AsyncSeekExt;
    use tokio::sync::{mpsc, Mutex};
    use tokio::time::timeout;

    #[derive(Clone, Debug)]
    pub struct ClientSettings {
        pub addr: String,
        pub token: String,
        pub workers: usize,
        pub src_root: PathBuf,
        pub dst_root: PathBuf,
        pub src_cache: PathBuf,
    }

    impl ClientSettings {
        pub fn from_config(cfg: &Config) -> Self {
            Self {
                addr: cfg.remote_addr(),
                token: cfg.client.token.clone(),
                workers: cfg.client_threads(),
                src_root: cfg.sync.srcpath.clone(),
                dst_root: cfg.sync.dstpath.clone(),
                src_cache: cfg.sync.cachefile.clone(),
            }
        }
    }

    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = match timeout(timeouts::CONNECT, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SyncError::transport(format!("connect {}", addr), e)),
            Err(_) => {
                return Err(SyncError::transport(
                    format!("connect {}", addr),
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Dial and complete the TOKEN handshake.
    pub async fn connect_authenticated(addr: &str, token: &str) -> Result<TcpStream> {
        let mut stream = connect(addr).await?;
        write_command(&mut stream, &CommandMsg::token(token)).await?;
        // The server closes without a reply when it rejects the token
        let resp = read_response(&mut stream).await.map_err(|e| match e {
            SyncError::Transport { .. } => {
                SyncError::Auth(format!("server closed the connection during handshake ({})", e))
            }
            other => other,
        })?;
        if resp.msg_type != msg::TOKEN || !resp.is_success() {
            let _ = stream.shutdown().await;
            return Err(SyncError::Auth(format!(
                "handshake rejected: {} {}",
                msg::name(resp.msg_type),
                resp.describe_error()
            )));
        }
        Ok(stream)
    }

    fn clamp_part(offset: i64, part_size: i64, size: i64) -> (u64, usize) {
        let size = size.max(0);
        let offset = offset.clamp(0, size);
        let len = part_size.max(0).min(size - offset);
        (offset as u64, len as usize)
    }

    /// Transfer one entry over an authenticated connection.
    ///
    /// The server drives the exchange with FILEPART requests; each is answered
    /// with exactly the requested range of the source file.
    pub async fn sync_file(
        stream: &mut TcpStream,
        src_root: &Path,
        dst_root: &Path,
        rel: &str,
        entry: &FileEntry,
    ) -> Result<()> {
        if entry.is_empty_file() {
            return Ok(());
        }
        let src_path = src_root.join(rel);
        let mut src = if entry.is_dir {
            None
        } else {
            Some(
                tokio::fs::File::open(&src_path)
                    .await
                    .map_err(|e| SyncError::fs(&src_path, e))?,
            )
        };

        let dst = dst_root.join(rel);
        write_command(stream, &CommandMsg::sync(&dst.to_string_lossy(), entry.clone())).await?;

        let mut buf = Vec::new();
        loop {
            let resp = read_response(stream).await?;
            match resp.msg_type {
                msg::FILEPART => {
                    let file = src.as_mut().ok_or_else(|| {
                        SyncError::Protocol(format!("FILEPART requested for directory {}", rel))
                    })?;
                    let (offset, len) = clamp_part(resp.offset, resp.part_size, entry.size);
                    buf.resize(len, 0);
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|e| SyncError::fs(&src_path, e))?;
                    file.read_exact(&mut buf)
                        .await
                        .map_err(|e| SyncError::fs(&src_path, e))?;
                    stream
                        .write_all(&buf)
                        .await
                        .map_err(|e| SyncError::transport("write file part", e))?;
                }
                msg::SYNC if !resp.is_success() => {
                    return Err(SyncError::Remote {
                        code: resp.res_code,
                        message: resp.describe_error(),
                    });
                }
                _ => return Ok(()),
            }
        }
    }

    struct Job {
        rel: String,
        entry: FileEntry,
    }

    struct Outcome {
        job: Job,
        result: Result<()>,
    }

    async fn open_conn(id: usize, settings: &ClientSettings, logger: &Arc<dyn Logger>) -> Option<TcpStream> {
        match connect_authenticated(&settings.addr, &settings.token).await {
            Ok(s) => Some(s),
            Err(e) => {
                log_error!(logger, "worker {} connect to {} failed: {}", id, settings.addr, e);
                None
            }
        }
    }

    async fn worker(
        id: usize,
        settings: Arc<ClientSettings>,
        jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
        done: mpsc::UnboundedSender<Outcome>,
        logger: Arc<dyn Logger>,
    ) {
        let mut conn = open_conn(id, &settings, &logger).await;
        loop {
            let job = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };

            if conn.is_none() {
                conn = open_conn(id, &settings, &logger).await;
            }
            let result = match conn.as_mut() {
                Some(stream) => {
                    sync_file(stream, &settings.src_root, &settings.dst_root, &job.rel, &job.entry)
                        .await
                }
                None => Err(SyncError::transport(
                    "worker connection",
                    io::Error::new(io::ErrorKind::NotConnected, "no connection to server"),
                )),
            };
            let failed = result.is_err();
            let _ = done.send(Outcome { job, result });

            if failed {
                if let Some(mut stream) = conn.take() {
                    let _ = stream.shutdown().await;
                    conn = open_conn(id, &settings, &logger).await;
                }
            }
        }
        if let Some(mut stream) = conn {
            let _ = stream.shutdown().await;
        }
    }

    /// Network operator state: the destination snapshot fetched from the server.
    pub struct SyncClient {
        settings: ClientSettings,
        dst: Snapshot,
        logger: Arc<dyn Logger>,
    }

    impl SyncClient {
        pub fn new(settings: ClientSettings, logger: Arc<dyn Logger>) -> Self {
            Self {
                settings,
                dst: Snapshot::new(),
                logger,
            }
        }

        pub fn dst_snapshot(&self) -> &Snapshot {
            &self.dst
        }

        /// Fetch the remote tree listing for the destination root.
        pub async fn fetch_remote_snapshot(&self) -> Result<Snapshot> {
            let mut stream = connect_authenticated(&self.settings.addr, &self.settings.token).await?;
            let dst_dir = self.settings.dst_root.to_string_lossy();
            write_command(&mut stream, &CommandMsg::make_cache(&dst_dir)).await?;
            let resp = read_response(&mut stream).await?;
            let _ = stream.shutdown().await;
            if resp.msg_type != msg::MAKECACHE {
                return Err(SyncError::Protocol(format!(
                    "expected MAKECACHE response, got {}",
                    msg::name(resp.msg_type)
                )));
            }
            if !resp.is_success() {
                return Err(SyncError::Remote {
                    code: resp.res_code,
                    message: resp.describe_error(),
                });
            }
            Ok(resp.file_infos.unwrap_or_default())
        }

        pub async fn compare_diff_files(&mut self) -> Result<Snapshot> {
            let remote = self.fetch_remote_snapshot().await?;
            log_info!(self.logger, "remote {} holds {} entries", self.settings.dst_root.display(), remote.len());
            self.dst.merge_normalized(remote);
            let src = CacheStore::new(&self.settings.src_cache).load()?;
            Ok(diff::compare_logged(&src, &self.dst, self.logger.as_ref()))
        }

        /// Push every diff entry through the worker pool. Never fails as a
        /// whole: each entry lands in the report as synced or failed.
        pub async fn sync_files(&self, diff: &Snapshot, progress: Option<&ProgressBar>) -> SyncReport {
            let workers = self.settings.workers.max(1);
            let (job_tx, job_rx) = mpsc::channel::<Job>(workers);
            let job_rx = Arc::new(Mutex::new(job_rx));
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Outcome>();
            let settings = Arc::new(self.settings.clone());

            let mut handles = Vec::with_capacity(workers);
            for id in 0..workers {
                handles.push(tokio::spawn(worker(
                    id,
                    Arc::clone(&settings),
                    Arc::clone(&job_rx),
                    done_tx.clone(),
                    Arc::clone(&self.logger),
                )));
            }
            drop(done_tx);

            let jobs: Vec<Job> = diff
                .iter()
                .map(|(rel, entry)| Job {
                    rel: rel.clone(),
                    entry: entry.clone(),
                })
                .collect();
            let producer = tokio::spawn(async move {
                let mut unsent = Vec::new();
                for job in jobs {
                    if let Err(mpsc::error::SendError(job)) = job_tx.send(job).await {
                        unsent.push(job.rel);
                    }
                }
                unsent
            });

            let mut report = SyncReport::default();
            while let Some(Outcome { job, result }) = done_rx.recv().await {
                match result {
                    Ok(()) => {
                        log_debug!(self.logger, "synced {}", job.rel);
                        report.synced.insert(job.rel, job.entry);
                    }
                    Err(e) => {
                        log_error!(self.logger, "sync {} failed: {}", job.rel, e);
                        report.failed.push(job.rel);
                    }
                }
                if let Some(pb) = progress {
                    pb.inc(1);
                }
            }
            for h in handles {
                let _ = h.await;
            }
            match producer.await {
                Ok(unsent) => report.failed.extend(unsent),
                Err(e) => log_error!(self.logger, "job producer failed: {}", e),
            }
            report
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_clamp_part() {
            assert_eq!(clamp_part(0, 4, 10), (0, 4));
            assert_eq!(clamp_part(8, 4, 10), (8, 2));
            assert_eq!(clamp_part(12, 4, 10), (10, 0));
            assert_eq!(clamp_part(-3, 4, 10), (0, 4));
            assert_eq!(clamp_part(2, -1, 10), (2, 0));
        }
    }
}
