use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claimstore_core::{
    AgentSettings, CaptureSettings, ClaimStore, DataFile, DataFileServant, DataFileState,
    FileSystemServant, InMemoryClaimTokenRepository, MessageBody, MessageBodyCollector, Result,
    TrackingStream, collect_message_bodies, enumerate_message_bodies,
};
use tempfile::TempDir;

const ID: &str = "8F341A2D6FD7416B87073A0132DD51AE";

/// Delegates to the real servant, failing the operations it is told to.
#[derive(Debug)]
struct FaultyServant {
    inner: FileSystemServant,
    fail_copy: bool,
    fail_release: bool,
}

impl FaultyServant {
    fn new(tokens: &InMemoryClaimTokenRepository) -> Self {
        Self {
            inner: FileSystemServant::new(Arc::new(tokens.clone())),
            fail_copy: false,
            fail_release: false,
        }
    }
}

#[async_trait]
impl DataFileServant for FaultyServant {
    async fn try_create_directory(&self, file_path: &Path) -> Result<bool> {
        self.inner.try_create_directory(file_path).await
    }

    async fn try_copy_file(&self, source: &Path, target: &Path) -> Result<bool> {
        if self.fail_copy {
            return Ok(false);
        }
        self.inner.try_copy_file(source, target).await
    }

    async fn try_move_file(&self, source: &Path, target: &Path) -> Result<bool> {
        self.inner.try_move_file(source, target).await
    }

    async fn try_delete_file(&self, path: &Path) -> Result<bool> {
        self.inner.try_delete_file(path).await
    }

    async fn try_release_token(&self, token: &str) -> Result<bool> {
        self.inner.try_release_token(token).await
    }

    async fn try_release_token_and_move_file(
        &self,
        token: &str,
        source: &Path,
        target: &Path,
    ) -> Result<bool> {
        if self.fail_release {
            return Ok(false);
        }
        self.inner
            .try_release_token_and_move_file(token, source, target)
            .await
    }

    async fn list_files(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_files(directory).await
    }

    async fn creation_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.inner.creation_time(path).await
    }
}

struct Stores {
    _root: TempDir,
    check_in: PathBuf,
    check_out: PathBuf,
}

fn stores() -> Stores {
    let root = TempDir::new().expect("temp dir");
    let check_in = root.path().join("in");
    let check_out = root.path().join("out");
    fs::create_dir_all(&check_in).expect("check-in dir");
    fs::create_dir_all(&check_out).expect("check-out dir");
    Stores {
        _root: root,
        check_in,
        check_out,
    }
}

fn write_data_file(directory: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = directory.join(name);
    fs::write(&path, content).expect("write data file");
    path
}

fn file_names(directory: &Path) -> Vec<String> {
    fs::read_dir(directory)
        .expect("read dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[tokio::test]
async fn claimed_body_is_released_and_moved_to_central_store() {
    let stores = stores();
    let tokens = InMemoryClaimTokenRepository::with_tokens([format!("20130615/{ID}")]);
    let servant = FaultyServant::new(&tokens);
    let path = write_data_file(&stores.check_in, &format!("20130615{ID}.chk"), b"claimed");

    let mut body = MessageBody::create(DataFile::open(path).expect("data file"));
    body.collect(&stores.check_out, &servant).await.expect("collect");

    assert!(matches!(body.data_file().state(), DataFileState::Released { .. }));
    assert!(file_names(&stores.check_in).is_empty());
    assert_eq!(
        fs::read(stores.check_out.join("20130615").join(ID)).expect("central copy"),
        b"claimed"
    );
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn failed_copy_leaves_locked_file_for_next_pass() {
    let stores = stores();
    let tokens = InMemoryClaimTokenRepository::with_tokens([format!("20130615/{ID}")]);
    let mut servant = FaultyServant::new(&tokens);
    servant.fail_copy = true;
    let path = write_data_file(&stores.check_in, &format!("20130615{ID}.chk"), b"claimed");

    let mut body = MessageBody::create(DataFile::open(path).expect("data file"));
    body.collect(&stores.check_out, &servant).await.expect("collect");

    assert!(body.data_file().is_awaiting_retry());
    let names = file_names(&stores.check_in);
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".locked"), "unexpected name {}", names[0]);
    assert!(!stores.check_out.join("20130615").join(ID).exists());
    assert_eq!(tokens.len(), 1);
}

#[tokio::test]
async fn tracked_body_is_collected_without_token() {
    let stores = stores();
    let tokens = InMemoryClaimTokenRepository::new();
    let mut servant = FaultyServant::new(&tokens);
    // any release attempt would leave the body awaiting retry
    servant.fail_release = true;
    let path = write_data_file(&stores.check_in, &format!("20130615{ID}.trk"), b"tracked");

    let mut body = MessageBody::create(DataFile::open(path).expect("data file"));
    body.collect(&stores.check_out, &servant).await.expect("collect");

    assert!(!body.data_file().is_awaiting_retry());
    assert!(file_names(&stores.check_in).is_empty());
    assert!(stores.check_out.join("20130615").join(ID).exists());
}

#[tokio::test]
async fn failed_release_is_resumed_by_next_pass() {
    let stores = stores();
    let tokens = InMemoryClaimTokenRepository::with_tokens([format!("20130615/{ID}")]);
    let mut servant = FaultyServant::new(&tokens);
    servant.fail_release = true;
    write_data_file(&stores.check_in, &format!("20130615{ID}.chk"), b"claimed");
    let directories = vec![stores.check_in.clone()];

    let report = collect_message_bodies(
        enumerate_message_bodies(&servant, &directories, Duration::from_secs(1800), Utc::now()),
        &stores.check_out,
        &servant,
    )
    .await
    .expect("first pass");
    assert_eq!(report.awaiting_retry, 1);
    let names = file_names(&stores.check_in);
    assert!(names[0].ends_with(".gathered"), "unexpected name {}", names[0]);

    // the lock is still fresh: a pass right away must leave it alone
    servant.fail_release = false;
    let report = collect_message_bodies(
        enumerate_message_bodies(&servant, &directories, Duration::from_secs(1800), Utc::now()),
        &stores.check_out,
        &servant,
    )
    .await
    .expect("second pass");
    assert_eq!(report.total(), 0);

    // once the lock has expired the file is picked up where it was left
    let later = Utc::now() + chrono::Duration::hours(1);
    let report = collect_message_bodies(
        enumerate_message_bodies(&servant, &directories, Duration::from_secs(1800), later),
        &stores.check_out,
        &servant,
    )
    .await
    .expect("third pass");
    assert_eq!(report.collected, 1);
    assert!(file_names(&stores.check_in).is_empty());
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn collector_pass_collects_every_check_in_directory() {
    let stores = stores();
    let second_check_in = stores.check_in.with_file_name("in2");
    fs::create_dir_all(&second_check_in).expect("second check-in dir");
    let tokens = InMemoryClaimTokenRepository::with_tokens([format!("20130615/{ID}")]);

    write_data_file(&stores.check_in, &format!("20130615{ID}.chk"), b"one");
    write_data_file(
        &second_check_in,
        "20130616A1B2C3D4E5F60718293A4B5C6D7E8F90.trk",
        b"two",
    );
    write_data_file(&second_check_in, "notes.txt", b"ignored");

    let settings = AgentSettings::new(
        vec![stores.check_in.clone(), second_check_in.clone()],
        &stores.check_out,
    );
    let collector = MessageBodyCollector::new(
        Arc::new(settings),
        Arc::new(FileSystemServant::new(Arc::new(tokens.clone()))),
    );

    let report = collector.collect_once().await.expect("collection pass");
    assert_eq!(report.collected, 2);
    assert!(
        stores
            .check_out
            .join("20130616")
            .join("A1B2C3D4E5F60718293A4B5C6D7E8F90")
            .exists()
    );
    assert_eq!(file_names(&second_check_in), vec!["notes.txt".to_string()]);
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn captured_payload_is_collected_and_redeemable() {
    let stores = stores();
    let tokens = InMemoryClaimTokenRepository::new();
    let claim_store = ClaimStore::new(
        CaptureSettings::new(&stores.check_in, &stores.check_out).with_claim_threshold(32),
        Arc::new(tokens.clone()),
    );
    let payload = vec![b'x'; 4096];

    let stream = TrackingStream::new(Cursor::new(payload.clone()));
    let (_, token) = claim_store.claim(stream).await.expect("claim");
    let token = token.expect("payload above threshold is claimed");
    assert!(tokens.contains(&token));

    let collector = MessageBodyCollector::new(
        Arc::new(AgentSettings::new(
            vec![stores.check_in.clone()],
            &stores.check_out,
        )),
        Arc::new(FileSystemServant::new(Arc::new(tokens.clone()))),
    );
    let report = collector.collect_once().await.expect("collection pass");
    assert_eq!(report.collected, 1);
    assert!(tokens.is_empty());

    let mut redeemed = claim_store.redeem(&token).expect("redeem");
    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut redeemed, &mut content).expect("read redeemed");
    assert_eq!(content, payload);
}
