use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use svmlink::{
    Command, Endpoint, ResponseHeader, ServiceVmClient, SocketTransport, SvmLinkError,
    TransferHeader, LAYER_DISK_NAME, SANDBOX_DISK_NAME,
};
use tempfile::tempdir;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_import_writes_disk_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let layer_dir = dir.path().join("layer");
    fs::create_dir(&layer_dir).await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |header, payload| {
        assert_eq!(header.command(), Command::Import);
        assert_eq!(header.version(), 0);
        let mut disk = b"VHD:".to_vec();
        disk.extend_from_slice(&payload);
        helper::Reply::Ok {
            declared: disk.len() as u64,
            body: disk,
        }
    })?;

    let client = helper::client(&peer.socket).with_temp_dir(dir.path());
    let payload = vec![0xabu8; 1024];
    let size = client.import_layer(&layer_dir, payload.as_slice()).await?;

    let disk = fs::read(layer_dir.join(LAYER_DISK_NAME)).await?;
    assert_eq!(size, 1028);
    assert_eq!(disk.len(), 1028);
    assert_eq!(&disk[..4], b"VHD:");
    assert_eq!(&disk[4..], payload.as_slice());

    // The buffered payload is gone once the call returns.
    let mut leftovers = fs::read_dir(dir.path()).await?;
    while let Some(entry) = leftovers.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        assert!(!name.starts_with("svmlink-layer"), "leftover {}", name);
    }

    assert_eq!(peer.connections(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_uses_configured_disk_address() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |header, _| {
        assert_eq!(header.controller_index(), 2);
        assert_eq!(header.disk_index(), 5);
        helper::Reply::Ok {
            declared: 0,
            body: vec![],
        }
    })?;

    let client = helper::client(&peer.socket).with_disk(2, 5);
    let size = client.import_layer(dir.path(), &b"tar"[..]).await?;

    assert_eq!(size, 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_remote_failure() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Status(0))?;

    let client = helper::client(&peer.socket);
    let result = client.import_layer(dir.path(), &b"tar"[..]).await;

    assert!(matches!(result, Err(SvmLinkError::RemoteFailure { status: 0 })));
    assert!(!dir.path().join(LAYER_DISK_NAME).exists());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_unrecognized_status_is_failure() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Status(7))?;

    let client = helper::client(&peer.socket);
    let result = client.import_layer(dir.path(), &b"tar"[..]).await;

    assert!(matches!(result, Err(SvmLinkError::RemoteFailure { status: 7 })));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_size_mismatch() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Ok {
        declared: 500,
        body: vec![1u8; 480],
    })?;

    let client = helper::client(&peer.socket);
    let result = client.import_layer(dir.path(), &b"tar"[..]).await;

    match result {
        Err(SvmLinkError::SizeMismatch { expected, actual }) => {
            assert_eq!(expected, 500);
            assert_eq!(actual, 480);
        }
        other => panic!("expected size mismatch, got {:?}", other),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_truncated_response_header() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Raw(vec![1, 0, 0]))?;

    let client = helper::client(&peer.socket);
    let result = client.import_layer(dir.path(), &b"tar"[..]).await;

    assert!(matches!(
        result,
        Err(SvmLinkError::ShortRead { expected: 12, got: 3, .. })
    ));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_import_connect_error() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let client = helper::client(&dir.path().join("nobody.sock"));

    let result = client.import_layer(dir.path(), &b"tar"[..]).await;

    assert!(matches!(result, Err(SvmLinkError::Connect { .. })));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_export_streams_result() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let layer_dir = dir.path().join("layer");
    fs::create_dir(&layer_dir).await?;
    fs::write(layer_dir.join(LAYER_DISK_NAME), b"disk-image").await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |header, payload| {
        assert_eq!(header.command(), Command::Export);
        assert_eq!(payload, b"disk-image");
        let body = vec![9u8; 300_000];
        helper::Reply::Ok {
            declared: body.len() as u64,
            body,
        }
    })?;

    let client = helper::client(&peer.socket).with_export_buffer(1);
    let mut stream = client.export_layer(&layer_dir).await?;
    assert_eq!(stream.declared_size(), 300_000);

    let mut result = Vec::new();
    stream.read_to_end(&mut result).await?;

    assert_eq!(result.len(), 300_000);
    assert!(result.iter().all(|b| *b == 9));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_export_sandbox_disk() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(SANDBOX_DISK_NAME), b"rw-disk").await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |_, payload| {
        assert_eq!(payload, b"rw-disk");
        helper::Reply::Ok {
            declared: 3,
            body: b"tar".to_vec(),
        }
    })?;

    let client = helper::client(&peer.socket);
    let mut stream = client.export_layer(dir.path()).await?;
    let mut result = String::new();
    stream.read_to_string(&mut result).await?;

    assert_eq!(result, "tar");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_export_missing_disk_fails_before_connecting() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let layer_dir = dir.path().join("empty");
    fs::create_dir(&layer_dir).await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Status(1))?;
    let client = helper::client(&peer.socket);

    let result = client.export_layer(&layer_dir).await;

    assert!(matches!(result, Err(SvmLinkError::NotFound(path)) if path == layer_dir));
    assert_eq!(peer.connections(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_export_remote_failure() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(LAYER_DISK_NAME), b"disk").await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Status(0))?;
    let client = helper::client(&peer.socket);

    let result = client.export_layer(dir.path()).await;

    assert!(matches!(result, Err(SvmLinkError::RemoteFailure { .. })));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_export_short_result_surfaces_as_read_error() -> anyhow::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(LAYER_DISK_NAME), b"disk").await?;

    let peer = helper::MockServiceVm::spawn(dir.path(), |_, _| helper::Reply::Ok {
        declared: 100,
        body: vec![1u8; 60],
    })?;
    let client = helper::client(&peer.socket);

    // The call itself succeeds; the problem shows up while reading.
    let mut stream = client.export_layer(dir.path()).await?;
    let mut result = Vec::new();
    let error = stream
        .read_to_end(&mut result)
        .await
        .expect_err("short export must fail the read");

    assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    assert_eq!(result.len(), 60);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_independent_transfers_run_concurrently() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let peer = helper::MockServiceVm::spawn(dir.path(), |_, payload| helper::Reply::Ok {
        declared: payload.len() as u64,
        body: payload,
    })?;

    let client = Arc::new(helper::client(&peer.socket));
    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let client = Arc::clone(&client);
        let layer_dir = dir.path().join(format!("layer-{}", i));
        fs::create_dir(&layer_dir).await?;
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 1000 + i as usize];
            client.import_layer(&layer_dir, payload.as_slice()).await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await??, 1000 + i as u64);
    }

    assert_eq!(peer.connections(), 4);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

mod helper {
    use super::*;

    /// What the mock service VM sends back after reading the payload.
    pub enum Reply {
        /// A success header followed by a body that may differ from the declared size.
        Ok { declared: u64, body: Vec<u8> },

        /// A bare header with the given status.
        Status(u8),

        /// Arbitrary bytes instead of a header.
        Raw(Vec<u8>),
    }

    /// A service VM stand-in listening on a Unix socket.
    pub struct MockServiceVm {
        pub socket: PathBuf,
        connections: Arc<AtomicUsize>,
        _task: JoinHandle<()>,
    }

    impl MockServiceVm {
        pub fn spawn<F>(dir: &Path, handler: F) -> anyhow::Result<Self>
        where
            F: Fn(TransferHeader, Vec<u8>) -> Reply + Send + Sync + 'static,
        {
            let socket = dir.join("svm.sock");
            let listener = UnixListener::bind(&socket)?;
            let connections = Arc::new(AtomicUsize::new(0));
            let handler = Arc::new(handler);

            let counter = Arc::clone(&connections);
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        // Clients that give up early make the reply fail; that is fine here.
                        let _ = serve(stream, handler.as_ref()).await;
                    });
                }
            });

            Ok(Self {
                socket,
                connections,
                _task: task,
            })
        }

        pub fn connections(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }
    }

    async fn serve<F>(mut stream: UnixStream, handler: &F) -> anyhow::Result<()>
    where
        F: Fn(TransferHeader, Vec<u8>) -> Reply,
    {
        let header = TransferHeader::read_from(&mut stream).await?;

        // The payload ends where the client half-closes.
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload).await?;

        match handler(header, payload) {
            Reply::Ok { declared, body } => {
                stream.write_all(&ResponseHeader::ok(declared).encode()).await?;
                stream.write_all(&body).await?;
            }
            Reply::Status(status) => {
                stream
                    .write_all(&ResponseHeader::new(status, 0).encode())
                    .await?;
            }
            Reply::Raw(bytes) => stream.write_all(&bytes).await?,
        }

        stream.shutdown().await?;
        Ok(())
    }

    pub fn client(socket: &Path) -> ServiceVmClient {
        ServiceVmClient::new(SocketTransport::new(Endpoint::Unix(socket.to_path_buf())))
    }
}
