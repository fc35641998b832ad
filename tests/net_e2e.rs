use anyhow::Result;
use filesync::cache::CacheStore;
use filesync::error::SyncError;
use filesync::fs_enum::{walk_tree, ExcludeSet};
use filesync::logger::{Logger, NoopLogger};
use filesync::net::client::{connect, connect_authenticated, sync_file, ClientSettings, SyncClient};
use filesync::net::server::{serve_listener, ServerSettings};
use filesync::protocol::{err_code, msg, timeouts};
use filesync::protocol_core::{read_command, read_response, write_command, write_response, CommandMsg, ResponseMsg};
use filesync::snapshot::{to_native_path, FileEntry};
use filesync::sync;
use filetime::FileTime;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const TOKEN: &str = "e2e-token";

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    if size == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn mtime_secs(path: &Path) -> i64 {
    let md = std::fs::metadata(path).unwrap();
    FileTime::from_last_modification_time(&md).unix_seconds()
}

async fn start_server(block_size: u64) -> Result<(String, tokio::task::JoinHandle<()>)> {
    start_server_with_auth_timeout(block_size, timeouts::AUTH_READ).await
}

async fn start_server_with_auth_timeout(
    block_size: u64,
    auth_timeout: Duration,
) -> Result<(String, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let settings = ServerSettings {
        token: TOKEN.to_string(),
        block_size,
        exclude: Arc::new(ExcludeSet::new()),
        auth_timeout,
    };
    let logger: Arc<dyn Logger> = Arc::new(NoopLogger);
    let task = tokio::spawn(async move {
        let _ = serve_listener(listener, settings, logger).await;
    });
    Ok((addr, task))
}

fn client_settings(addr: &str, workers: usize, src: &Path, dst: &Path, cache: &Path) -> ClientSettings {
    ClientSettings {
        addr: addr.to_string(),
        token: TOKEN.to_string(),
        workers,
        src_root: src.to_path_buf(),
        dst_root: dst.to_path_buf(),
        src_cache: cache.to_path_buf(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn net_sync_end_to_end() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let cli_tmp = tempfile::tempdir()?;
    let src = cli_tmp.path().join("src");
    write_file(&src.join("a.txt"), 5)?;
    write_file(&src.join("dir1/b.bin"), 256 * 1024)?;
    write_file(&src.join("dir1/dir2/c.dat"), 1_100_000)?;
    write_file(&src.join("empty.txt"), 0)?;
    std::fs::create_dir_all(src.join("emptydir"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(src.join("dir1/dir2/c.dat"), std::fs::Permissions::from_mode(0o640))?;
    }

    let src_cache = cli_tmp.path().join("src.json");
    let src_snap = walk_tree(&src, &ExcludeSet::new(), &NoopLogger);
    CacheStore::new(&src_cache).save(&src_snap)?;

    let (addr, server_task) = start_server(64 * 1024).await?;
    let dest = srv_tmp.path().join("dest");
    let dst_cache = CacheStore::new(cli_tmp.path().join("dst.json"));

    let mut client = SyncClient::new(
        client_settings(&addr, 2, &src, &dest, &src_cache),
        Arc::new(NoopLogger),
    );
    let report = sync::do_sync(&mut client, &dst_cache, None, &NoopLogger).await?;
    assert!(report.is_clean(), "failed: {:?}", report.failed);
    assert_eq!(report.synced.len(), src_snap.len());

    for rel in ["a.txt", "dir1/b.bin", "dir1/dir2/c.dat"] {
        let s = src.join(rel);
        let d = dest.join(rel);
        assert_eq!(std::fs::read(&s)?, std::fs::read(&d)?, "content of {}", rel);
        assert_eq!(mtime_secs(&s), mtime_secs(&d), "mtime of {}", rel);
    }
    assert!(dest.join("emptydir").is_dir());
    // Zero-length files are reported synced without a round trip
    assert!(report.synced.contains("empty.txt"));
    assert!(!dest.join("empty.txt").exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dest.join("dir1/dir2/c.dat"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    let saved = dst_cache.load()?;
    assert!(saved.contains(&to_native_path("dir1/dir2/c.dat")));

    // A fresh comparison only sees what was never materialized remotely
    let mut again = SyncClient::new(
        client_settings(&addr, 2, &src, &dest, &src_cache),
        Arc::new(NoopLogger),
    );
    let diff = again.compare_diff_files().await?;
    let left: Vec<_> = diff.paths().cloned().collect();
    assert_eq!(left, vec!["empty.txt".to_string()]);

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_parts_follow_block_size() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let cli_tmp = tempfile::tempdir()?;
    let src = cli_tmp.path().join("big.bin");
    write_file(&src, 10_000_005)?;
    let data = std::fs::read(&src)?;
    let entry = FileEntry::from_metadata("big.bin", &std::fs::metadata(&src)?);

    let (addr, server_task) = start_server(1_000_000).await?;
    let dst = srv_tmp.path().join("out/big.bin");

    let mut stream = connect_authenticated(&addr, TOKEN).await?;
    write_command(&mut stream, &CommandMsg::sync(&dst.to_string_lossy(), entry.clone())).await?;

    let mut parts = Vec::new();
    loop {
        let resp = read_response(&mut stream).await?;
        if resp.msg_type != msg::FILEPART {
            assert_eq!(resp.msg_type, msg::SYNC);
            assert!(resp.is_success());
            break;
        }
        let (off, len) = (resp.offset as usize, resp.part_size as usize);
        parts.push((resp.offset, resp.part_size));
        stream.write_all(&data[off..off + len]).await?;
    }

    assert_eq!(parts.len(), 11);
    for (i, (off, _)) in parts.iter().enumerate() {
        assert_eq!(*off, i as i64 * 1_000_000);
    }
    assert_eq!(parts[10], (10_000_000, 5));
    assert_eq!(std::fs::read(&dst)?, data);
    assert_eq!(mtime_secs(&dst), entry.mod_time.timestamp());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_mismatch_closes_silently() -> Result<()> {
    let (addr, server_task) = start_server(1024).await?;

    let mut stream = connect(&addr).await?;
    write_command(&mut stream, &CommandMsg::token("wrong")).await?;
    let err = read_response(&mut stream).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { .. }), "got {:?}", err);

    let err = connect_authenticated(&addr, "wrong").await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)), "got {:?}", err);

    // A non-TOKEN first message is also dropped without a reply
    let mut stream = connect(&addr).await?;
    write_command(&mut stream, &CommandMsg::make_cache("/tmp")).await?;
    assert!(read_response(&mut stream).await.is_err());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_is_dropped_after_auth_deadline() -> Result<()> {
    let (addr, server_task) = start_server_with_auth_timeout(1024, Duration::from_millis(200)).await?;

    let mut stream = connect(&addr).await?;
    let started = Instant::now();
    let mut byte = [0u8; 1];
    // Nothing is sent; the server must hang up on its own
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte)).await??;
    assert_eq!(n, 0);
    assert!(started.elapsed() >= Duration::from_millis(150));

    // A client that authenticates in time is still served
    let mut stream = connect_authenticated(&addr, TOKEN).await?;
    write_command(&mut stream, &CommandMsg::make_cache("")).await?;
    let resp = read_response(&mut stream).await?;
    assert_eq!(resp.err_code.as_deref(), Some(err_code::NO_DST_DIR));

    server_task.abort();
    Ok(())
}

/// Requests the parts of one file in the given order, with a 10-byte
/// part size, and returns the bytes reassembled by offset.
async fn out_of_order_server(listener: TcpListener, total: usize, order: Vec<i64>) -> Result<Vec<u8>> {
    let (mut s, _) = listener.accept().await?;
    let cmd = read_command(&mut s).await?;
    assert_eq!(cmd.msg_type, msg::TOKEN);
    write_response(&mut s, &ResponseMsg::success(msg::TOKEN)).await?;

    let cmd = read_command(&mut s).await?;
    assert_eq!(cmd.msg_type, msg::SYNC);
    let mut out = vec![0u8; total];
    for offset in order {
        write_response(&mut s, &ResponseMsg::file_part(offset, 10)).await?;
        let start = offset as usize;
        let end = (start + 10).min(total);
        s.read_exact(&mut out[start..end]).await?;
    }
    write_response(&mut s, &ResponseMsg::success(msg::SYNC)).await?;
    Ok(out)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_answers_parts_in_any_order() -> Result<()> {
    let cli_tmp = tempfile::tempdir()?;
    let src = cli_tmp.path().join("src");
    write_file(&src.join("odd.bin"), 25)?;
    let data = std::fs::read(src.join("odd.bin"))?;
    let entry = FileEntry::from_metadata("odd.bin", &std::fs::metadata(src.join("odd.bin"))?);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    // The first request runs past the end and gets the last 5 bytes
    let server_task = tokio::spawn(out_of_order_server(listener, 25, vec![20, 0, 10]));

    let mut stream = connect_authenticated(&addr, TOKEN).await?;
    sync_file(&mut stream, &src, Path::new("remote"), "odd.bin", &entry).await?;

    let received = server_task.await??;
    assert_eq!(received, data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serving_state_answers_failures_and_keeps_going() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let (addr, server_task) = start_server(1024).await?;
    let mut stream = connect_authenticated(&addr, TOKEN).await?;

    // Unknown types get no reply; the next command is answered normally
    let unknown = CommandMsg {
        msg_type: 42,
        ..CommandMsg::make_cache("")
    };
    write_command(&mut stream, &unknown).await?;
    write_command(&mut stream, &CommandMsg::make_cache("")).await?;
    let resp = read_response(&mut stream).await?;
    assert_eq!(resp.msg_type, msg::MAKECACHE);
    assert_eq!(resp.err_code.as_deref(), Some(err_code::NO_DST_DIR));

    let mut no_info = CommandMsg::sync("x", FileEntry::from_metadata("x", &std::fs::metadata(srv_tmp.path())?));
    no_info.sync_info = None;
    write_command(&mut stream, &no_info).await?;
    let resp = read_response(&mut stream).await?;
    assert_eq!(resp.err_code.as_deref(), Some(err_code::NO_SYNC_INFO));

    // Parent is a regular file, so the open fails
    write_file(&srv_tmp.path().join("blocker"), 1)?;
    let target: PathBuf = srv_tmp.path().join("blocker/child.txt");
    let mut entry = FileEntry::from_metadata("child.txt", &std::fs::metadata(srv_tmp.path().join("blocker"))?);
    entry.size = 10;
    write_command(&mut stream, &CommandMsg::sync(&target.to_string_lossy(), entry)).await?;
    let resp = read_response(&mut stream).await?;
    assert_eq!(resp.msg_type, msg::SYNC);
    assert_eq!(resp.err_code.as_deref(), Some(err_code::OPEN_FAILED));

    write_file(&srv_tmp.path().join("listing/one.txt"), 3)?;
    let listing = srv_tmp.path().join("listing");
    write_command(&mut stream, &CommandMsg::make_cache(&listing.to_string_lossy())).await?;
    let resp = read_response(&mut stream).await?;
    assert!(resp.is_success());
    let infos = resp.file_infos.unwrap_or_default();
    assert_eq!(infos.get("one.txt").map(|e| e.size), Some(3));

    server_task.abort();
    Ok(())
}

/// Accepts any token, answers SYNC immediately, and drops the connection
/// on the first SYNC whose destination ends with `flaky`.
async fn flaky_server(listener: TcpListener, flaky: String, accepted: Arc<AtomicUsize>, dropped: Arc<AtomicBool>) {
    while let Ok((mut s, _)) = listener.accept().await {
        accepted.fetch_add(1, Ordering::SeqCst);
        let flaky = flaky.clone();
        let dropped = Arc::clone(&dropped);
        tokio::spawn(async move {
            if read_command(&mut s).await.is_err() {
                return;
            }
            if write_response(&mut s, &ResponseMsg::success(msg::TOKEN)).await.is_err() {
                return;
            }
            while let Ok(cmd) = read_command(&mut s).await {
                if cmd.dst_dir.ends_with(&flaky) && !dropped.swap(true, Ordering::SeqCst) {
                    return;
                }
                if write_response(&mut s, &ResponseMsg::success(msg::SYNC)).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_reconnects_after_connection_failure() -> Result<()> {
    let cli_tmp = tempfile::tempdir()?;
    let src = cli_tmp.path().join("src");
    let n = 12;
    for i in 0..n {
        write_file(&src.join(format!("f{:02}.txt", i)), 16)?;
    }
    let snap = walk_tree(&src, &ExcludeSet::new(), &NoopLogger);
    assert_eq!(snap.len(), n);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    let server_task = tokio::spawn(flaky_server(
        listener,
        "f05.txt".to_string(),
        Arc::clone(&accepted),
        Arc::clone(&dropped),
    ));

    let client = SyncClient::new(
        client_settings(&addr, 3, &src, Path::new("remote"), &cli_tmp.path().join("unused.json")),
        Arc::new(NoopLogger),
    );
    let report = client.sync_files(&snap, None).await;

    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(report.synced.len() + report.failed.len(), n);
    assert_eq!(report.failed, vec!["f05.txt".to_string()]);
    assert!(accepted.load(Ordering::SeqCst) >= 4);

    server_task.abort();
    Ok(())
}
