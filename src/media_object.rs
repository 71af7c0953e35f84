//! Runtime shell around one Segment/InitSection download attempt (§4.2).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::buffered_stream::BufferedStream;
use crate::error::{HlsError, Result};
use crate::interrupt::Interrupt;
use crate::key_cache::KeyCache;
use crate::model::{ByteRange, EncryptionInfo, InitSection, KeyMethod, Micros};
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::transport::{OpenOptions, Transport};

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownloadState {
    NotStarted = 0,
    Started = 1,
    InProgress = 2,
    RequestAbort = 3,
    Aborted = 4,
    Completed = 5,
}

impl DownloadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DownloadState::NotStarted,
            1 => DownloadState::Started,
            2 => DownloadState::InProgress,
            3 => DownloadState::RequestAbort,
            4 => DownloadState::Aborted,
            _ => DownloadState::Completed,
        }
    }
}

/// The error recorded at the end of a download attempt; `Eof` is the
/// well-behaved terminal case, anything else is a genuine failure.
#[derive(Debug, Clone)]
pub enum LastError {
    None,
    Eof,
    Transport(String),
}

pub struct MediaObject {
    url: String,
    sequence_number: u64,
    byte_range: ByteRange,
    encryption: EncryptionInfo,
    /// The segment's start PTS, when known (§3: only set for finished
    /// playlists); absent for InitSection shells.
    start_pts: Option<Micros>,
    /// The segment's current InitSection, exposed per §2 ("init-section
    /// identity"); `None` for an InitSection's own MediaObject shell.
    init_section: Option<Arc<InitSection>>,
    stream: Arc<BufferedStream>,
    state: AtomicU8,
    bytes_downloaded: AtomicU64,
    bandwidth_bps: AtomicU64,
    last_error: std::sync::Mutex<LastError>,
    interrupt: Interrupt,
    abort: Arc<Interrupt>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    transport: Arc<dyn Transport>,
    key_cache: Arc<KeyCache>,
    retry_policy: RetryPolicy,
}

impl MediaObject {
    /// `create` (§4.2): materialise the URL, install key/IV/range options,
    /// allocate the BufferedStream. State = NotStarted.
    pub fn create(
        url: String,
        sequence_number: u64,
        byte_range: ByteRange,
        encryption: EncryptionInfo,
        parent_interrupt: &Interrupt,
        transport: Arc<dyn Transport>,
        key_cache: Arc<KeyCache>,
    ) -> Arc<Self> {
        Self::create_with_metadata(
            url,
            sequence_number,
            byte_range,
            encryption,
            None,
            None,
            parent_interrupt,
            transport,
            key_cache,
            RetryPolicy::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_with_metadata(
        url: String,
        sequence_number: u64,
        byte_range: ByteRange,
        encryption: EncryptionInfo,
        start_pts: Option<Micros>,
        init_section: Option<Arc<InitSection>>,
        parent_interrupt: &Interrupt,
        transport: Arc<dyn Transport>,
        key_cache: Arc<KeyCache>,
        retry_policy: RetryPolicy,
    ) -> Arc<Self> {
        let abort = Arc::new(Interrupt::new());
        let interrupt = parent_interrupt.child();
        Arc::new(Self {
            url,
            sequence_number,
            byte_range,
            encryption,
            start_pts,
            init_section,
            stream: Arc::new(BufferedStream::new()),
            state: AtomicU8::new(DownloadState::NotStarted as u8),
            bytes_downloaded: AtomicU64::new(0),
            bandwidth_bps: AtomicU64::new(0),
            last_error: std::sync::Mutex::new(LastError::None),
            interrupt,
            abort,
            worker: std::sync::Mutex::new(None),
            transport,
            key_cache,
            retry_policy,
        })
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: DownloadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps.load(Ordering::Acquire)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Acquire)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn start_pts(&self) -> Option<Micros> {
        self.start_pts
    }

    pub fn init_section(&self) -> Option<Arc<InitSection>> {
        self.init_section.clone()
    }

    /// `startDownload` (§4.2): resolve key material, open the transport,
    /// spawn the worker. State -> Started.
    pub fn start_download(self: &Arc<Self>) {
        self.set_state(DownloadState::Started);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_worker().await });
        *self.worker.lock().unwrap() = Some(handle);
    }

    async fn resolve_key(&self) -> Result<(String, String)> {
        let KeyMethod::Aes128 = self.encryption.method else {
            return Ok((String::new(), String::new()));
        };
        let key_url = self
            .encryption
            .key_url
            .clone()
            .ok_or_else(|| HlsError::internal("AES128 segment missing key URL"))?;

        let key_bytes = if let Some(cached) = self.key_cache.get(&key_url).await {
            cached
        } else {
            let raw = self.fetch_key(&key_url).await?;
            self.key_cache.insert(key_url.clone(), raw).await;
            raw
        };

        Ok((hex::encode(key_bytes), hex::encode(self.encryption.iv)))
    }

    async fn fetch_key(&self, key_url: &str) -> Result<[u8; 16]> {
        let resolved = self
            .transport
            .open(key_url, &OpenOptions::default(), &self.interrupt)
            .await?;
        let _ = resolved;
        let mut buf = Vec::with_capacity(16);
        loop {
            let chunk = self.transport.read(16 - buf.len().min(16), &self.interrupt).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
            if buf.len() >= 16 {
                break;
            }
        }
        self.transport.close().await;
        if buf.len() != 16 {
            return Err(HlsError::InvalidKeyLength { got: buf.len() });
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&buf[..16]);
        Ok(out)
    }

    async fn run_worker(self: Arc<Self>) {
        let start = Instant::now();
        let result = self.download_body().await;

        let elapsed = start.elapsed();
        let downloaded = self.bytes_downloaded.load(Ordering::Acquire);
        if elapsed.as_micros() > 0 {
            let bw = (8 * downloaded as u128 * 1_000_000) / elapsed.as_micros();
            self.bandwidth_bps.store(bw as u64, Ordering::Release);
        }

        *self.last_error.lock().unwrap() = match &result {
            Ok(()) => LastError::Eof,
            Err(e) => LastError::Transport(e.to_string()),
        };

        self.stream.set_eos(true).await;
        if self.abort.is_cancelled() {
            self.set_state(DownloadState::Aborted);
        } else {
            self.set_state(DownloadState::Completed);
        }
    }

    async fn download_body(&self) -> Result<()> {
        let (key_hex, iv_hex) = self.resolve_key().await?;
        let options = OpenOptions {
            key_hex: if key_hex.is_empty() { None } else { Some(key_hex) },
            iv_hex: if iv_hex.is_empty() { None } else { Some(iv_hex) },
            byte_range_offset: self.byte_range.offset,
            byte_range_end_offset: self
                .byte_range
                .length
                .zip(self.byte_range.offset)
                .map(|(len, off)| off + len),
        };

        let scheme_url = match self.encryption.method {
            KeyMethod::Aes128 => format!("crypto+{}", self.url),
            KeyMethod::None => self.url.clone(),
        };

        self.transport.open(&scheme_url, &options, &self.interrupt).await?;
        self.set_state(DownloadState::InProgress);

        loop {
            if self.abort.is_cancelled() || self.interrupt.is_cancelled() {
                return Err(HlsError::Cancelled);
            }
            let chunk = retry_with_backoff(&self.retry_policy, &self.interrupt, |_attempt| {
                let transport = &self.transport;
                let interrupt = &self.interrupt;
                async move {
                    match transport.read(DOWNLOAD_CHUNK_SIZE, interrupt).await {
                        Ok(bytes) => RetryAction::Success(bytes),
                        Err(e) if e.is_retryable() => RetryAction::Retry(e),
                        Err(e) => RetryAction::Fail(e),
                    }
                }
            })
            .await?;
            if chunk.is_empty() {
                break;
            }
            self.bytes_downloaded.fetch_add(chunk.len() as u64, Ordering::AcqRel);
            self.stream.write(chunk.to_vec()).await;
        }
        self.transport.close().await;
        Ok(())
    }

    /// `stopDownload` (§4.2): set abort, latch EOS, transition to
    /// RequestAbort, join, flush, close.
    pub async fn stop_download(&self) {
        self.abort.cancel();
        self.stream.set_eos(true).await;
        if matches!(self.state(), DownloadState::Started | DownloadState::InProgress) {
            self.set_state(DownloadState::RequestAbort);
        }
        self.wait_for_end().await;
        self.stream.flush().await;
        self.transport.close().await;
    }

    /// `waitForEnd` (§4.2): blocks the caller until the worker terminates.
    pub async fn wait_for_end(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn read(&self, len: usize, interrupt: &Interrupt) -> Result<Vec<u8>> {
        let out = self.stream.read(len, interrupt).await?;
        if out.is_empty() {
            return Err(self.surface_last_error());
        }
        Ok(out)
    }

    pub async fn peek(&self, len: usize, offset: usize, interrupt: &Interrupt) -> Result<Vec<u8>> {
        self.stream.peek(len, offset, interrupt).await
    }

    fn surface_last_error(&self) -> HlsError {
        match &*self.last_error.lock().unwrap() {
            LastError::Eof | LastError::None => HlsError::Eos,
            LastError::Transport(msg) => HlsError::Transport(msg.clone()),
        }
    }
}
