//! Import and export transfers with the service VM.
//!
//! Every transfer opens its own channel and walks the same stages in strict order:
//!
//! ```text
//! Idle -> Connected -> HeaderSent -> PayloadSent -> AwaitResponse -> ResultStreaming -> Done
//!   \________\______________\______________\______________\________________\-> Failed
//! ```
//!
//! Nothing is retried. A failure at any stage aborts the transfer and drops the channel.

use std::{
    fmt,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf},
    sync::mpsc,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    Channel, Command, ResponseHeader, ServiceVmConfig, SocketTransport, SvmLinkError,
    SvmLinkResult, TransferHeader, TransportProvider, DEFAULT_EXPORT_BUFFER, PROTOCOL_VERSION,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The disk image file name of a read-only layer.
pub const LAYER_DISK_NAME: &str = "layer.vhd";

/// The disk image file name of a read-write sandbox.
pub const SANDBOX_DISK_NAME: &str = "sandbox.vhdx";

/// Prefix of the temporary file an import buffers its payload into.
const IMPORT_TEMP_PREFIX: &str = "svmlink-layer";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The stages a single transfer moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Nothing has happened yet.
    Idle,

    /// A channel to the service VM is open.
    Connected,

    /// The transfer header has been written.
    HeaderSent,

    /// The payload has been written and the write side closed.
    PayloadSent,

    /// Waiting for the 12-byte response header.
    AwaitResponse,

    /// Copying the service VM's result.
    ResultStreaming,

    /// The transfer completed.
    Done,

    /// The transfer was aborted.
    Failed,
}

/// A client for the service VM's import and export commands.
#[derive(Debug, Clone)]
pub struct ServiceVmClient<T = SocketTransport> {
    transport: T,
    controller_index: u32,
    disk_index: u32,
    protocol_version: u32,
    temp_dir: Option<PathBuf>,
    export_buffer: usize,
}

pin_project! {
    /// The result of an export, streamed from the service VM while the caller reads it.
    ///
    /// A background task owns the channel and forwards its bytes here. Transport errors, and a
    /// stream that ends short of or beyond the declared size, surface as read errors.
    pub struct ExportStream {
        #[pin]
        inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
        declared_size: u64,
    }
}

/// Logs the stage transitions of one transfer.
struct StageLog {
    command: Command,
    peer: String,
    stage: TransferStage,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServiceVmClient<SocketTransport> {
    /// Creates a client from configuration, dialing the configured endpoint for every transfer.
    pub fn from_config(config: &ServiceVmConfig) -> Self {
        Self {
            transport: config.transport(),
            controller_index: *config.get_controller_index(),
            disk_index: *config.get_disk_index(),
            protocol_version: *config.get_protocol_version(),
            temp_dir: config.get_temp_dir().clone(),
            export_buffer: *config.get_export_buffer(),
        }
    }
}

impl<T> ServiceVmClient<T>
where
    T: TransportProvider,
{
    /// Creates a client using `transport`, addressing disk 0 on controller 0.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            controller_index: 0,
            disk_index: 0,
            protocol_version: PROTOCOL_VERSION,
            temp_dir: None,
            export_buffer: DEFAULT_EXPORT_BUFFER,
        }
    }

    /// Addresses a different disk attachment point.
    pub fn with_disk(mut self, controller_index: u32, disk_index: u32) -> Self {
        self.controller_index = controller_index;
        self.disk_index = disk_index;
        self
    }

    /// Buffers import payloads in `dir` instead of the system temp directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets how many result chunks an export may queue ahead of its reader.
    pub fn with_export_buffer(mut self, chunks: usize) -> Self {
        self.export_buffer = chunks.max(1);
        self
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Ships a layer stream to the service VM and writes the returned disk image to
    /// `<layer_dir>/layer.vhd`.
    ///
    /// The input is buffered to a temporary file first so the channel never interleaves reads of
    /// the caller's stream with its own duplex traffic. The temporary file is removed on every
    /// exit path.
    ///
    /// Returns the size of the disk image.
    ///
    /// ## Errors
    /// - [`SvmLinkError::Connect`] if the service VM cannot be reached
    /// - [`SvmLinkError::ShortRead`] if the channel closes inside the response header
    /// - [`SvmLinkError::RemoteFailure`] if the service VM reports failure
    /// - [`SvmLinkError::SizeMismatch`] if the disk image is not exactly the declared size. The
    ///   partial file is left in place and must be discarded by the caller.
    pub async fn import_layer<R>(&self, layer_dir: impl AsRef<Path>, reader: R) -> SvmLinkResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let layer_dir = layer_dir.as_ref();
        let mut stages = StageLog::new(Command::Import, self.transport.describe());

        let result = self.run_import(layer_dir, reader, &mut stages).await;
        stages.finish(&result);
        result
    }

    /// Ships the disk image of the layer in `layer_dir` to the service VM and returns its reply
    /// as a stream.
    ///
    /// The call returns as soon as the service VM accepts the request; the remainder of the
    /// transfer is copied by a background task while the caller reads.
    ///
    /// ## Errors
    /// - [`SvmLinkError::NotFound`] if neither `layer.vhd` nor `sandbox.vhdx` exists. No
    ///   connection is attempted in this case.
    /// - [`SvmLinkError::Connect`], [`SvmLinkError::ShortRead`], [`SvmLinkError::RemoteFailure`]
    ///   as for imports
    pub async fn export_layer(&self, layer_dir: impl AsRef<Path>) -> SvmLinkResult<ExportStream> {
        let layer_dir = layer_dir.as_ref();
        let mut stages = StageLog::new(Command::Export, self.transport.describe());

        let result = self.run_export(layer_dir, &mut stages).await;
        match &result {
            Ok(_) => stages.advance(TransferStage::ResultStreaming),
            Err(e) => stages.fail(e),
        }
        result
    }

    fn header(&self, command: Command) -> TransferHeader {
        TransferHeader::new(command, self.controller_index, self.disk_index)
            .with_version(self.protocol_version)
    }

    async fn run_import<R>(
        &self,
        layer_dir: &Path,
        mut reader: R,
        stages: &mut StageLog,
    ) -> SvmLinkResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let buffer = match &self.temp_dir {
            Some(dir) => tempfile::Builder::new()
                .prefix(IMPORT_TEMP_PREFIX)
                .tempfile_in(dir)?,
            None => tempfile::Builder::new()
                .prefix(IMPORT_TEMP_PREFIX)
                .tempfile()?,
        };

        let mut payload = File::from_std(buffer.reopen()?);
        let buffered = tokio::io::copy(&mut reader, &mut payload).await?;
        payload.flush().await?;
        payload.seek(SeekFrom::Start(0)).await?;
        tracing::debug!(
            "buffered {} payload bytes in {}",
            buffered,
            buffer.path().display()
        );

        let mut channel = self.transport.dial().await?;
        stages.advance(TransferStage::Connected);

        send_payload(&mut channel, self.header(Command::Import), &mut payload, stages).await?;

        stages.advance(TransferStage::AwaitResponse);
        let response = ResponseHeader::read_from(&mut channel).await?.into_result()?;

        stages.advance(TransferStage::ResultStreaming);
        let disk_path = layer_dir.join(LAYER_DISK_NAME);
        let written = write_disk_image(&disk_path, &mut channel).await?;
        if written != response.size() {
            return Err(SvmLinkError::SizeMismatch {
                expected: response.size(),
                actual: written,
            });
        }

        stages.advance(TransferStage::Done);
        Ok(written)
    }

    async fn run_export(
        &self,
        layer_dir: &Path,
        stages: &mut StageLog,
    ) -> SvmLinkResult<ExportStream> {
        let disk_path = locate_disk_image(layer_dir).await?;
        let mut disk = File::open(&disk_path).await?;
        tracing::debug!("exporting disk image {}", disk_path.display());

        let mut channel = self.transport.dial().await?;
        stages.advance(TransferStage::Connected);

        send_payload(&mut channel, self.header(Command::Export), &mut disk, stages).await?;
        drop(disk);

        stages.advance(TransferStage::AwaitResponse);
        let response = ResponseHeader::read_from(&mut channel).await?.into_result()?;

        let (tx, rx) = mpsc::channel(self.export_buffer.max(1));
        tokio::spawn(forward_result(channel, tx, response.size()));

        Ok(ExportStream {
            inner: StreamReader::new(ReceiverStream::new(rx)),
            declared_size: response.size(),
        })
    }
}

impl ExportStream {
    /// Returns the size the service VM declared for the result.
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }
}

impl StageLog {
    fn new(command: Command, peer: String) -> Self {
        Self {
            command,
            peer,
            stage: TransferStage::Idle,
        }
    }

    fn advance(&mut self, next: TransferStage) {
        tracing::debug!(
            "{} transfer with {}: {} -> {}",
            self.command,
            self.peer,
            self.stage,
            next
        );
        self.stage = next;
    }

    fn fail(&mut self, error: &SvmLinkError) {
        tracing::error!(
            "{} transfer with {} failed after {}: {}",
            self.command,
            self.peer,
            self.stage,
            error
        );
        self.stage = TransferStage::Failed;
    }

    fn finish<T>(&mut self, result: &SvmLinkResult<T>) {
        if let Err(e) = result {
            self.fail(e);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Finds the disk image of a layer: `layer.vhd` for read-only layers, otherwise `sandbox.vhdx`.
pub async fn locate_disk_image(layer_dir: impl AsRef<Path>) -> SvmLinkResult<PathBuf> {
    let layer_dir = layer_dir.as_ref();
    for name in [LAYER_DISK_NAME, SANDBOX_DISK_NAME] {
        let candidate = layer_dir.join(name);
        match fs::metadata(&candidate).await {
            Ok(metadata) if metadata.is_file() => return Ok(candidate),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(SvmLinkError::NotFound(layer_dir.to_path_buf()))
}

/// Writes the header, then the whole payload, then half-closes the channel.
async fn send_payload<C, R>(
    channel: &mut C,
    header: TransferHeader,
    payload: &mut R,
    stages: &mut StageLog,
) -> SvmLinkResult<u64>
where
    C: Channel,
    R: AsyncRead + Unpin + ?Sized,
{
    channel.write_all(&header.encode()).await?;
    stages.advance(TransferStage::HeaderSent);

    let sent = tokio::io::copy(payload, channel).await?;
    channel.close_write().await?;
    stages.advance(TransferStage::PayloadSent);

    tracing::debug!("sent {} payload bytes", sent);
    Ok(sent)
}

/// Copies the rest of the channel into a fresh file at `path` and returns the bytes written.
///
/// The channel may report an error instead of a clean end of stream once the service VM has sent
/// everything, so a read error only ends the copy. The caller compares the count with the
/// declared size. Local write errors are propagated.
async fn write_disk_image<R>(path: &Path, reader: &mut R) -> SvmLinkResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::create(path).await?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(
                    "channel read ended with error after {} bytes: {}",
                    written,
                    e
                );
                break;
            }
        };

        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    tracing::debug!("wrote {} bytes to {}", written, path.display());
    Ok(written)
}

/// Forwards the channel's remaining bytes to an export reader, then drops the channel.
async fn forward_result<C>(channel: C, tx: mpsc::Sender<io::Result<Bytes>>, declared_size: u64)
where
    C: Channel,
{
    let mut chunks = ReaderStream::with_capacity(channel, COPY_BUFFER_SIZE);
    let mut forwarded = 0u64;

    while let Some(chunk) = chunks.next().await {
        let failed = chunk.is_err();
        if let Ok(bytes) = &chunk {
            forwarded += bytes.len() as u64;
        }

        if tx.send(chunk).await.is_err() {
            tracing::debug!("export reader dropped after {} bytes", forwarded);
            return;
        }

        if failed {
            return;
        }
    }

    if forwarded != declared_size {
        let error = SvmLinkError::SizeMismatch {
            expected: declared_size,
            actual: forwarded,
        };
        tracing::error!("export result: {}", error);
        let _ = tx
            .send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, error)))
            .await;
        return;
    }

    tracing::debug!("export result complete: {} bytes", forwarded);
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AsyncRead for ExportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl fmt::Debug for ExportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportStream")
            .field("declared_size", &self.declared_size)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Idle => "idle",
            TransferStage::Connected => "connected",
            TransferStage::HeaderSent => "header-sent",
            TransferStage::PayloadSent => "payload-sent",
            TransferStage::AwaitResponse => "await-response",
            TransferStage::ResultStreaming => "result-streaming",
            TransferStage::Done => "done",
            TransferStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
