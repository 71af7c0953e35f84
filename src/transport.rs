//! Contracts for the external collaborators named in §6. Only their
//! interfaces are specified here; HTTP keep-alive, AES-CBC stream
//! decryption, and container probing/demuxing are out of scope (§1) and are
//! supplied by implementors.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::interrupt::Interrupt;

/// Options passed when opening a transport stream (§6 Transport).
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Hex-encoded 16-byte AES-128 key, present when the URL carries a
    /// `crypto+` scheme marker.
    pub key_hex: Option<String>,
    /// Hex-encoded 16-byte IV, present alongside `key_hex`.
    pub iv_hex: Option<String>,
    pub byte_range_offset: Option<u64>,
    pub byte_range_end_offset: Option<u64>,
}

/// A URL open/read/close interface: HTTP with keep-alive and redirects, a
/// `crypto+` AES-128-CBC wrapper, byte-range requests, and cooperative
/// cancellation (§6).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens `url` (which may carry a `crypto+` scheme marker) with the given
    /// options. Returns the resolved URL (after following redirects), which
    /// overwrites the stored URL per §4.2 `startDownload`.
    async fn open(&self, url: &str, options: &OpenOptions, interrupt: &Interrupt) -> Result<String>;

    /// Reads up to `max_len` bytes. An empty, non-error return means EOF.
    async fn read(&self, max_len: usize, interrupt: &Interrupt) -> Result<Bytes>;

    async fn close(&self);
}

/// A single demultiplexed packet, already rescaled to the global microsecond
/// timebase (§4.6 step 1.3).
#[derive(Debug, Clone)]
pub struct DemuxedPacket {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub data: Bytes,
    pub flags: u32,
}

/// AV_PKT_FLAG_SEGMENT_CHANGED (§6): set exactly once per session transition
/// to a new segment.
pub const AV_PKT_FLAG_SEGMENT_CHANGED: u32 = 0x8000;

/// probe-from-buffer / open-with-custom-I/O / find-stream-info / read-packet
/// / close (§6 Container demuxer). Seek is intentionally absent: this is a
/// forward, segmented stream.
#[async_trait]
pub trait ContainerDemuxer: Send + Sync {
    /// Probes `reader`'s byte stream and finds stream info, readying the
    /// demuxer to read packets. Called once when a Session is opened, and
    /// again on every segment boundary against a freshly constructed demuxer
    /// (the caller tears down the old instance via `close` first).
    async fn open(&mut self, reader: &dyn SegmentByteReader, interrupt: &Interrupt) -> Result<()>;

    /// Reads and demultiplexes the next packet from `reader`. `Ok(None)`
    /// means EOF on the current segment's byte stream (the caller advances
    /// to the next segment, tears this instance down via `close`, and opens
    /// a freshly constructed one in its place).
    async fn read_packet(
        &mut self,
        reader: &dyn SegmentByteReader,
        interrupt: &Interrupt,
    ) -> Result<Option<DemuxedPacket>>;

    /// Releases whatever resources `open` acquired. Called both on normal
    /// Session close and right before a segment-boundary demuxer swap.
    async fn close(&mut self);
}

/// The pull-based byte reader a container demuxer's I/O callback uses; backed
/// by an HLS Receiver's `read` (§4.6).
#[async_trait]
pub trait SegmentByteReader: Send + Sync {
    async fn read(&self, max_len: usize, interrupt: &Interrupt) -> Result<Bytes>;
}
