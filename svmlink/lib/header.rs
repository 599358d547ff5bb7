//! Wire encoding of the headers exchanged with the service VM.
//!
//! All multi-byte fields are big-endian.
//!
//! ```text
//! TransferHeader (16 bytes, host -> VM)
//! +------------+------------+------------------+------------+
//! | command:i32| version:u32| controller:u32   | disk:u32   |
//! +------------+------------+------------------+------------+
//!
//! ResponseHeader (12 bytes, VM -> host)
//! +--------+-----------+----------------------+
//! | status | reserved  | size:u64             |
//! |   u8   |  3 bytes  |                      |
//! +--------+-----------+----------------------+
//! ```

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{SvmLinkError, SvmLinkResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The encoded size of a [`TransferHeader`].
pub const TRANSFER_HEADER_SIZE: usize = 16;

/// The encoded size of a [`ResponseHeader`].
pub const RESPONSE_HEADER_SIZE: usize = 12;

/// The protocol version written into every transfer header.
pub const PROTOCOL_VERSION: u32 = 0;

/// The only status byte the service VM uses to report success.
pub const STATUS_OK: u8 = 1;

/// The status byte conventionally used to report failure.
pub const STATUS_FAILED: u8 = 0;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The operation requested from the service VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Turn a layer stream into a virtual disk image.
    Import,

    /// Turn a virtual disk image back into a layer stream.
    Export,
}

/// The header sent once at the start of every transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    command: Command,
    version: u32,
    controller_index: u32,
    disk_index: u32,
}

/// The header the service VM sends back once it has consumed the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    status: u8,
    size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Command {
    /// Returns the wire id of the command.
    pub fn id(&self) -> i32 {
        match self {
            Command::Import => 1,
            Command::Export => 2,
        }
    }

    /// Looks up a command by its wire id.
    pub fn from_id(id: i32) -> SvmLinkResult<Self> {
        match id {
            1 => Ok(Command::Import),
            2 => Ok(Command::Export),
            other => Err(SvmLinkError::UnknownCommand(other)),
        }
    }
}

impl TransferHeader {
    /// Creates a header for the given command addressing the given disk attachment point.
    pub fn new(command: Command, controller_index: u32, disk_index: u32) -> Self {
        Self {
            command,
            version: PROTOCOL_VERSION,
            controller_index,
            disk_index,
        }
    }

    /// Overrides the protocol version. The version is carried on the wire but not interpreted.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Returns the command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Returns the protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the controller index of the disk attachment point.
    pub fn controller_index(&self) -> u32 {
        self.controller_index
    }

    /// Returns the disk index of the disk attachment point.
    pub fn disk_index(&self) -> u32 {
        self.disk_index
    }

    /// Encodes the header into its fixed wire representation.
    pub fn encode(&self) -> [u8; TRANSFER_HEADER_SIZE] {
        let mut buf = [0u8; TRANSFER_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.command.id().to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.controller_index.to_be_bytes());
        buf[12..16].copy_from_slice(&self.disk_index.to_be_bytes());
        buf
    }

    /// Decodes a header from the first [`TRANSFER_HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> SvmLinkResult<Self> {
        if buf.len() < TRANSFER_HEADER_SIZE {
            return Err(SvmLinkError::ShortRead {
                what: "transfer header",
                expected: TRANSFER_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let field = |at: usize| [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];

        Ok(Self {
            command: Command::from_id(i32::from_be_bytes(field(0)))?,
            version: u32::from_be_bytes(field(4)),
            controller_index: u32::from_be_bytes(field(8)),
            disk_index: u32::from_be_bytes(field(12)),
        })
    }

    /// Reads exactly one header from `reader`.
    pub async fn read_from<R>(reader: &mut R) -> SvmLinkResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; TRANSFER_HEADER_SIZE];
        let got = read_full(reader, &mut buf).await?;
        Self::decode(&buf[..got])
    }
}

impl ResponseHeader {
    /// Creates a response header.
    pub fn new(status: u8, size: u64) -> Self {
        Self { status, size }
    }

    /// Creates a successful response declaring `size` bytes of result payload.
    pub fn ok(size: u64) -> Self {
        Self::new(STATUS_OK, size)
    }

    /// Creates a failure response.
    pub fn failed() -> Self {
        Self::new(STATUS_FAILED, 0)
    }

    /// Returns the raw status byte.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Returns the declared size of the payload that follows.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true if the service VM reported success. Any byte other than [`STATUS_OK`] is a
    /// failure.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Converts a failure status into a [`SvmLinkError::RemoteFailure`].
    pub fn into_result(self) -> SvmLinkResult<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(SvmLinkError::RemoteFailure {
                status: self.status,
            })
        }
    }

    /// Encodes the header into its fixed wire representation. Reserved bytes are zero.
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[0] = self.status;
        buf[4..12].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decodes a header from the first [`RESPONSE_HEADER_SIZE`] bytes of `buf`.
    ///
    /// Fails with [`SvmLinkError::ShortRead`] if fewer bytes are available.
    pub fn decode(buf: &[u8]) -> SvmLinkResult<Self> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(SvmLinkError::ShortRead {
                what: "response header",
                expected: RESPONSE_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[4..12]);

        Ok(Self {
            status: buf[0],
            size: u64::from_be_bytes(size),
        })
    }

    /// Blocks until all [`RESPONSE_HEADER_SIZE`] bytes arrive on `reader` and decodes them.
    pub async fn read_from<R>(reader: &mut R) -> SvmLinkResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        let got = read_full(reader, &mut buf).await?;
        Self::decode(&buf[..got])
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fills `buf` from `reader`, stopping early only at end of stream. Returns the number of bytes
/// read so callers can tell a short read apart from an I/O failure.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> SvmLinkResult<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(filled)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Import => write!(f, "import"),
            Command::Export => write!(f, "export"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_header_round_trip() -> anyhow::Result<()> {
        let header = TransferHeader::new(Command::Export, 3, 7).with_version(9);
        let decoded = TransferHeader::decode(&header.encode())?;

        assert_eq!(decoded.command(), Command::Export);
        assert_eq!(decoded.version(), 9);
        assert_eq!(decoded.controller_index(), 3);
        assert_eq!(decoded.disk_index(), 7);
        assert_eq!(decoded, header);

        Ok(())
    }

    #[test]
    fn test_transfer_header_layout() {
        let bytes = TransferHeader::new(Command::Import, 0, 0x0102_0304).encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_transfer_header_rejects_unknown_command() {
        let mut bytes = TransferHeader::new(Command::Import, 0, 0).encode();
        bytes[3] = 5;
        assert!(matches!(
            TransferHeader::decode(&bytes),
            Err(SvmLinkError::UnknownCommand(5))
        ));
    }

    #[test]
    fn test_response_header_decode() -> anyhow::Result<()> {
        let bytes = [1, 0xaa, 0xbb, 0xcc, 0, 0, 0, 0, 0, 0, 0x01, 0xf4];
        let header = ResponseHeader::decode(&bytes)?;

        assert!(header.is_ok());
        assert_eq!(header.size(), 500);
        assert_eq!(ResponseHeader::decode(&header.encode())?, header);

        Ok(())
    }

    #[test]
    fn test_response_header_short_read_never_yields_value() {
        let full = ResponseHeader::ok(42).encode();
        for len in 0..RESPONSE_HEADER_SIZE {
            match ResponseHeader::decode(&full[..len]) {
                Err(SvmLinkError::ShortRead { expected, got, .. }) => {
                    assert_eq!(expected, RESPONSE_HEADER_SIZE);
                    assert_eq!(got, len);
                }
                other => panic!("expected short read for {} bytes, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_response_header_unrecognized_status_is_failure() {
        for status in [0u8, 2, 0x7f, 0xff] {
            let header = ResponseHeader::new(status, 10);
            assert!(!header.is_ok());
            assert!(matches!(
                header.into_result(),
                Err(SvmLinkError::RemoteFailure { status: s }) if s == status
            ));
        }
    }

    #[tokio::test]
    async fn test_response_header_read_from_truncated_stream() {
        let mut reader: &[u8] = &[1, 0, 0, 0, 0, 0];
        let result = ResponseHeader::read_from(&mut reader).await;
        assert!(matches!(
            result,
            Err(SvmLinkError::ShortRead { got: 6, .. })
        ));
    }
}
