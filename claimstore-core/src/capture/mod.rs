//! Producer side of the claim store.
//!
//! Decides, while a message body is being streamed, whether its payload is
//! claimed, and if so writes it to the check-in directory under a data file
//! name the collector agent understands.

mod tracking_stream;

pub use tracking_stream::{CaptureDescriptor, CaptureMode, CaptureSink, TrackingStream};

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::data_file::TrackingMode;
use crate::error::{ClaimStoreError, Result};
use crate::servant::tokens::ClaimTokenRepository;
use crate::settings::CaptureSettings;

/// Suffix of payloads still being written.
pub const PARTIAL_FILE_EXTENSION: &str = "partial";

static CLAIM_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{8}/[0-9A-Fa-f]{32}$").unwrap());

/// What the activity tracking requested for a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityTrackingMode {
    /// Keep a copy of the payload for tracking purposes (`trk`).
    Body,
    /// Replace the payload by a claim token (`chk`).
    Claim,
}

impl From<ActivityTrackingMode> for TrackingMode {
    fn from(mode: ActivityTrackingMode) -> Self {
        match mode {
            ActivityTrackingMode::Body => TrackingMode::Tracked,
            ActivityTrackingMode::Claim => TrackingMode::Claimed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimStore {
    settings: CaptureSettings,
    tokens: Arc<dyn ClaimTokenRepository>,
}

impl ClaimStore {
    pub fn new(settings: CaptureSettings, tokens: Arc<dyn ClaimTokenRepository>) -> Self {
        Self { settings, tokens }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Whether payloads transit through a check-in directory before being
    /// collected into the check-out directory.
    pub fn requires_check_in_and_out(&self) -> bool {
        normalize(&self.settings.check_in_directory) != normalize(&self.settings.check_out_directory)
    }

    /// Sets up the capture of `stream`'s payload.
    ///
    /// Payloads shorter than the claim threshold are not claimed and are
    /// described inline. Larger ones are replicated, while `stream` is read,
    /// to a new data file that only takes its final name once the whole
    /// payload has been written.
    pub fn setup_message_body_capture<R: Read>(
        &self,
        stream: &mut TrackingStream<R>,
        mode: ActivityTrackingMode,
    ) -> Result<CaptureDescriptor> {
        let probed = stream.probe(self.settings.claim_threshold)?;
        if probed.is_empty() || probed.len() < self.settings.claim_threshold {
            let descriptor = CaptureDescriptor::unclaimed(String::from_utf8_lossy(probed));
            stream.setup_capture(descriptor.clone())?;
            debug!(length = descriptor.data.len(), "Message body is not claimed");
            return Ok(descriptor);
        }

        let capture_date = Utc::now().format("%Y%m%d").to_string();
        let id = Uuid::new_v4().simple().to_string();
        let target = self.capture_path(&capture_date, &id, mode.into());
        let sink = ClaimFileSink::create(target)?;

        let descriptor = CaptureDescriptor::claimed(format!("{capture_date}/{id}"));
        stream.setup_capture_with(descriptor.clone(), Box::new(sink))?;
        debug!(url = %descriptor.data, ?mode, "Message body is claimed");
        Ok(descriptor)
    }

    /// Claims the payload of `stream`: registers its claim token, then saves
    /// the payload to the claim store. The data file only takes its final
    /// name once its token is registered, so the collector agent can always
    /// release it.
    ///
    /// Hands the stream back along with the claim token, which is `None` when
    /// the payload is too small to be claimed or has been redeemed from the
    /// claim store in the first place.
    pub async fn claim<R>(
        &self,
        stream: TrackingStream<R>,
    ) -> Result<(TrackingStream<R>, Option<String>)>
    where
        R: Read + Send + 'static,
    {
        if stream.is_redeemed() {
            return Ok((stream, None));
        }

        let store = self.clone();
        let (mut stream, setup) = run_blocking(move || {
            let mut stream = stream;
            let setup = store.setup_message_body_capture(&mut stream, ActivityTrackingMode::Claim);
            (stream, setup)
        })
        .await?;
        let descriptor = setup?;
        if descriptor.mode == CaptureMode::Unclaimed {
            return Ok((stream, None));
        }

        let checked_in = self.requires_check_in_and_out();
        if checked_in {
            if let Err(err) = self.tokens.check_in(&descriptor.data).await {
                stream.abandon_capture();
                return Err(err);
            }
        }

        let (mut stream, captured) = run_blocking(move || {
            let mut stream = stream;
            let captured = stream.capture();
            (stream, captured)
        })
        .await?;
        if let Err(err) = captured {
            stream.abandon_capture();
            if checked_in {
                self.withdraw(&descriptor.data).await;
            }
            return Err(err);
        }

        info!(url = %descriptor.data, "Message body claimed");
        Ok((stream, Some(descriptor.data)))
    }

    /// Reopens the payload behind a claim token from the central store.
    pub fn redeem(&self, url: &str) -> Result<TrackingStream<File>> {
        if !CLAIM_TOKEN.is_match(url) {
            return Err(ClaimStoreError::Capture(format!(
                "'{url}' is not a claim store token"
            )));
        }
        let path = url
            .split('/')
            .fold(self.settings.check_out_directory.clone(), |path, segment| {
                path.join(segment)
            });
        let file = File::open(&path)?;
        debug!(url, path = %path.display(), "Redeeming claimed message body");
        TrackingStream::redeemed(file, CaptureDescriptor::claimed(url))
    }

    async fn withdraw(&self, url: &str) {
        let released = match self.tokens.begin_release(url).await {
            Ok(pending) => pending.commit().await,
            Err(err) => Err(err),
        };
        if let Err(err) = released {
            error!(url, error = %err, "Failed to withdraw the claim token of an uncaptured payload");
        }
    }

    fn capture_path(&self, capture_date: &str, id: &str, mode: TrackingMode) -> PathBuf {
        if self.requires_check_in_and_out() {
            self.settings
                .check_in_directory
                .join(format!("{capture_date}{id}.{}", mode.token()))
        } else {
            self.settings
                .check_out_directory
                .join(capture_date)
                .join(id)
        }
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ClaimStoreError::Capture(format!("capture task failed: {err}")))
}

fn normalize(directory: &Path) -> String {
    directory
        .to_string_lossy()
        .trim_end_matches(['/', '\\'])
        .to_lowercase()
}

/// Writes a payload under a `.partial` name and moves it to its final name
/// once complete, so that the collector never sees a half-written data file.
/// The partial file is removed if the sink is dropped before completion.
struct ClaimFileSink {
    writer: Option<BufWriter<File>>,
    partial_path: PathBuf,
    target: PathBuf,
    published: bool,
}

impl ClaimFileSink {
    fn create(target: PathBuf) -> io::Result<Self> {
        if let Some(directory) = target.parent() {
            fs::create_dir_all(directory)?;
        }
        let mut partial_name = target.file_name().unwrap_or_default().to_os_string();
        partial_name.push(".");
        partial_name.push(PARTIAL_FILE_EXTENSION);
        let partial_path = target.with_file_name(partial_name);
        let writer = BufWriter::new(File::create(&partial_path)?);
        Ok(Self {
            writer: Some(writer),
            partial_path,
            target,
            published: false,
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("claimed payload has already been written"))
    }
}

impl Write for ClaimFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl CaptureSink for ClaimFileSink {
    fn complete(&mut self) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(self.writer.take());
        fs::rename(&self.partial_path, &self.target)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for ClaimFileSink {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        if let Some(writer) = self.writer.take() {
            drop(writer.into_parts());
        }
        match fs::remove_file(&self.partial_path) {
            Ok(()) => debug!(path = %self.partial_path.display(), "Discarded partially captured payload"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.partial_path.display(),
                error = %err,
                "Failed to discard partially captured payload"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use super::*;
    use crate::data_file::tokenizer::is_valid_data_file_path;
    use crate::servant::InMemoryClaimTokenRepository;

    fn store(check_in: &Path, check_out: &Path, tokens: &InMemoryClaimTokenRepository) -> ClaimStore {
        ClaimStore::new(
            CaptureSettings::new(check_in, check_out).with_claim_threshold(16),
            Arc::new(tokens.clone()),
        )
    }

    fn file_names(directory: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(directory)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn requires_check_in_and_out_ignores_case_and_trailing_separator() {
        let tokens = InMemoryClaimTokenRepository::new();
        assert!(!store(Path::new("/Data/Claims"), Path::new("/data/claims/"), &tokens)
            .requires_check_in_and_out());
        assert!(!store(Path::new("C:\\Claims\\"), Path::new("c:\\claims"), &tokens)
            .requires_check_in_and_out());
        assert!(store(Path::new("/data/in"), Path::new("/data/out"), &tokens)
            .requires_check_in_and_out());
    }

    #[test]
    fn small_and_empty_payloads_are_unclaimed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir.path().join("in"), &dir.path().join("out"), &Default::default());

        for payload in [&b""[..], &b"tiny"[..]] {
            let mut stream = TrackingStream::new(Cursor::new(payload.to_vec()));
            let descriptor = store
                .setup_message_body_capture(&mut stream, ActivityTrackingMode::Body)
                .unwrap();
            assert_eq!(descriptor.mode, CaptureMode::Unclaimed);
            assert_eq!(descriptor.data.as_bytes(), payload);
        }
        assert!(!dir.path().join("in").exists());
    }

    #[test]
    fn tracked_payload_lands_as_trk_data_file_once_read() {
        let dir = TempDir::new().unwrap();
        let check_in = dir.path().join("in");
        let store = store(&check_in, &dir.path().join("out"), &Default::default());
        let payload = b"a payload well above the claim threshold".to_vec();

        let mut stream = TrackingStream::new(Cursor::new(payload.clone()));
        let descriptor = store
            .setup_message_body_capture(&mut stream, ActivityTrackingMode::Body)
            .unwrap();
        assert_eq!(descriptor.mode, CaptureMode::Claimed);
        let (date, id) = descriptor.data.split_once('/').unwrap();
        assert_eq!(date, Utc::now().format("%Y%m%d").to_string());
        assert_eq!(id.len(), 32);

        // nothing the collector could pick up while the payload is in flight
        let mut head = [0u8; 8];
        stream.read_exact(&mut head).unwrap();
        let names = file_names(&check_in);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".trk.partial"));
        assert!(!is_valid_data_file_path(&check_in.join(&names[0])));

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        let data_file = check_in.join(format!("{date}{id}.trk"));
        assert!(is_valid_data_file_path(&data_file));
        assert_eq!(fs::read(&data_file).unwrap(), payload);
        assert_eq!(file_names(&check_in).len(), 1);
    }

    #[tokio::test]
    async fn claim_writes_chk_data_file_and_checks_in_token() {
        let dir = TempDir::new().unwrap();
        let check_in = dir.path().join("in");
        let tokens = InMemoryClaimTokenRepository::new();
        let store = store(&check_in, &dir.path().join("out"), &tokens);

        let stream = TrackingStream::new(Cursor::new(vec![7u8; 100]));
        let (stream, token) = store.claim(stream).await.unwrap();
        let token = token.unwrap();
        assert_eq!(stream.descriptor().unwrap().data, token);

        assert!(tokens.contains(&token));
        let data_file = check_in.join(format!("{}.chk", token.replace('/', "")));
        assert_eq!(fs::read(data_file).unwrap(), vec![7u8; 100]);
    }

    #[tokio::test]
    async fn claim_of_small_payload_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let tokens = InMemoryClaimTokenRepository::new();
        let store = store(&dir.path().join("in"), &dir.path().join("out"), &tokens);

        let stream = TrackingStream::new(Cursor::new(b"small".to_vec()));
        let (mut stream, token) = store.claim(stream).await.unwrap();
        assert_eq!(token, None);
        assert!(tokens.is_empty());

        let mut content = String::new();
        stream.read_to_string(&mut content).unwrap();
        assert_eq!(content, "small");
    }

    #[tokio::test]
    async fn same_directories_write_straight_to_central_layout() {
        let dir = TempDir::new().unwrap();
        let tokens = InMemoryClaimTokenRepository::new();
        let store = store(dir.path(), dir.path(), &tokens);

        let stream = TrackingStream::new(Cursor::new(vec![1u8; 64]));
        let token = store.claim(stream).await.unwrap().1.unwrap();

        let (date, id) = token.split_once('/').unwrap();
        assert_eq!(fs::read(dir.path().join(date).join(id)).unwrap(), vec![1u8; 64]);
        assert!(tokens.is_empty());
    }

    #[test]
    fn redeem_reads_back_central_payload() {
        let dir = TempDir::new().unwrap();
        let url = "20240301cca95baa39ab4e25a3c54971ea170911";
        let (date, id) = url.split_at(8);
        fs::create_dir_all(dir.path().join(date)).unwrap();
        fs::write(dir.path().join(date).join(id), b"redeemed content").unwrap();

        let store = store(&dir.path().join("in"), dir.path(), &Default::default());
        let mut stream = store.redeem(&format!("{date}/{id}")).unwrap();
        assert!(stream.is_redeemed());
        assert_eq!(stream.descriptor().unwrap().data, format!("{date}/{id}"));

        let mut content = String::new();
        stream.read_to_string(&mut content).unwrap();
        assert_eq!(content, "redeemed content");
    }

    #[test]
    fn redeem_rejects_unexpected_token() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), dir.path(), &Default::default());
        assert!(matches!(
            store.redeem("../etc/passwd"),
            Err(ClaimStoreError::Capture(_))
        ));
    }

    #[tokio::test]
    async fn redeemed_stream_is_not_claimed_again() {
        let dir = TempDir::new().unwrap();
        let tokens = InMemoryClaimTokenRepository::new();
        let store = store(&dir.path().join("in"), dir.path(), &tokens);
        let stream = TrackingStream::redeemed(
            Cursor::new(vec![0u8; 128]),
            CaptureDescriptor::claimed("20240301/cca95baa39ab4e25a3c54971ea170911"),
        )
        .unwrap();
        let (stream, token) = store.claim(stream).await.unwrap();
        assert_eq!(token, None);
        assert!(stream.is_redeemed());
        assert!(tokens.is_empty());
    }

    #[derive(Debug)]
    struct UnavailableRegistry;

    #[async_trait::async_trait]
    impl ClaimTokenRepository for UnavailableRegistry {
        async fn check_in(&self, _token: &str) -> Result<()> {
            Err(ClaimStoreError::TokenStore("registry unavailable".into()))
        }

        async fn begin_release(
            &self,
            _token: &str,
        ) -> Result<Box<dyn crate::servant::tokens::PendingTokenRelease>> {
            Err(ClaimStoreError::TokenStore("registry unavailable".into()))
        }
    }

    #[tokio::test]
    async fn failed_check_in_leaves_no_data_file_behind() {
        let dir = TempDir::new().unwrap();
        let check_in = dir.path().join("in");
        let store = ClaimStore::new(
            CaptureSettings::new(&check_in, dir.path().join("out")).with_claim_threshold(16),
            Arc::new(UnavailableRegistry),
        );

        let stream = TrackingStream::new(Cursor::new(vec![3u8; 256]));
        assert!(matches!(
            store.claim(stream).await,
            Err(ClaimStoreError::TokenStore(_))
        ));
        assert!(file_names(&check_in).is_empty());
    }

    #[test]
    fn dropping_stream_before_end_discards_partial_payload() {
        let dir = TempDir::new().unwrap();
        let check_in = dir.path().join("in");
        let store = store(&check_in, &dir.path().join("out"), &Default::default());

        let mut stream = TrackingStream::new(Cursor::new(vec![5u8; 256]));
        store
            .setup_message_body_capture(&mut stream, ActivityTrackingMode::Claim)
            .unwrap();
        let mut head = [0u8; 32];
        stream.read_exact(&mut head).unwrap();
        assert_eq!(file_names(&check_in).len(), 1);

        drop(stream);
        assert!(file_names(&check_in).is_empty());
    }
}
