use super::*;
use crate::config::{ProxyConfig, SubscriptionConfig};
use crate::proxy::ConvertedEndpoint;
use crate::test_helpers::{FakePlatform, file_url, raw_post};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

fn create_test_executor(platform: Arc<FakePlatform>) -> (DownloadExecutor, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let proxies = Arc::new(ProxyPool::new(&ProxyConfig::default()));
    let executor = DownloadExecutor::new(
        platform,
        proxies,
        Arc::new(DefaultLayout),
        temp_dir.path().join("downloads"),
    );
    (executor, temp_dir)
}

fn artist() -> Artist {
    Artist::new("fanbox", "1", "Artist", "https://fake.test/fanbox/user/1")
}

fn built_file(executor: &DownloadExecutor, post_id: &str, name: &str) -> PostFile {
    let raw = raw_post(post_id, "2024-01-01T00:00:00", &[name]);
    executor.build_post(&artist(), raw).files.remove(0)
}

#[tokio::test]
async fn test_post_list_follows_pages() {
    let platform = Arc::new(FakePlatform::with_page_size(2));
    for i in 0..5 {
        platform.add_post("fanbox", "1", raw_post(&i.to_string(), "2024-01-01", &[]), 0);
    }
    let (executor, _dir) = create_test_executor(platform.clone());

    let posts = executor
        .fetch_post_list(&artist(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(posts.len(), 5);
    assert_eq!(
        platform.requests(),
        vec!["posts fanbox_1 0", "posts fanbox_1 2", "posts fanbox_1 4"]
    );
}

#[tokio::test]
async fn test_build_post_assigns_paths_and_urls() {
    let platform = Arc::new(FakePlatform::new());
    let (executor, _dir) = create_test_executor(platform);

    let post = executor.build_post(
        &artist(),
        raw_post("9", "2024-05-06T07:08:09", &["a.png", "b.zip"]),
    );
    assert_eq!(post.title, "Post 9");
    assert_eq!(post.files.len(), 2);
    assert_eq!(post.files[1].url, file_url("9", "b.zip"));
    assert_eq!(
        post.files[0].path,
        PathBuf::from("fanbox/Artist/[2024-05-06] Post 9/00_a.png")
    );
    assert!(!post.detail_fetched);
}

#[tokio::test]
async fn test_transfer_writes_file_and_reports_length() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 100);
    let (executor, _dir) = create_test_executor(platform);
    let file = built_file(&executor, "1", "a.bin");

    let outcome = executor
        .fetch_file(&file, executor.download_dir(), &CancellationToken::new())
        .await;
    assert_eq!(outcome, FileOutcome::Transferred { bytes: 100 });
    assert_eq!(outcome.content_length(), Some(100));

    let target = executor.download_dir().join(&file.path);
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 100);
    assert!(!part_path(&target).exists());
}

#[tokio::test]
async fn test_cached_length_skips_without_request() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 40);
    let (executor, _dir) = create_test_executor(platform.clone());
    let mut file = built_file(&executor, "1", "a.bin");

    let target = executor.download_dir().join(&file.path);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, vec![0u8; 40]).unwrap();
    file.content_length = Some(40);

    let outcome = executor
        .fetch_file(&file, executor.download_dir(), &CancellationToken::new())
        .await;
    assert_eq!(
        outcome,
        FileOutcome::SkippedExists {
            content_length: Some(40)
        }
    );
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_header_length_skips_existing_file() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 40);
    let (executor, _dir) = create_test_executor(platform.clone());
    let file = built_file(&executor, "1", "a.bin");

    let target = executor.download_dir().join(&file.path);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, vec![0u8; 40]).unwrap();

    let outcome = executor
        .fetch_file(&file, executor.download_dir(), &CancellationToken::new())
        .await;
    assert!(matches!(outcome, FileOutcome::SkippedExists { .. }));
    assert_eq!(platform.file_requests(&file.url), 1);
    // Local content untouched
    assert_eq!(std::fs::read(&target).unwrap(), vec![0u8; 40]);
}

#[tokio::test]
async fn test_size_mismatch_is_transient_and_cleans_up() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 64);
    let (executor, _dir) = create_test_executor(platform.clone());
    let file = built_file(&executor, "1", "a.bin");
    platform.truncate(&file.url, 20);

    let outcome = executor
        .fetch_file(&file, executor.download_dir(), &CancellationToken::new())
        .await;
    match outcome {
        FileOutcome::Failed(reason) => {
            assert_eq!(reason.kind, FailureKind::Transient);
            assert_eq!(reason.content_length, Some(64));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let target = executor.download_dir().join(&file.path);
    assert!(!target.exists());
    assert!(!part_path(&target).exists());
}

#[tokio::test]
async fn test_not_found_is_permanent() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 8);
    let (executor, _dir) = create_test_executor(platform.clone());
    let file = built_file(&executor, "1", "a.bin");
    platform.fail_always(&file.url);

    let outcome = executor
        .fetch_file(&file, executor.download_dir(), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome,
        FileOutcome::Failed(FailureReason {
            kind: FailureKind::Permanent,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_mid_transfer_removes_part_file() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("1", "2024-01-01", &["a.bin"]), 64);
    let (executor, _dir) = create_test_executor(platform.clone());
    let executor = Arc::new(executor);
    let file = built_file(&executor, "1", "a.bin");
    platform.stall(&file.url);

    let token = CancellationToken::new();
    let task = {
        let executor = Arc::clone(&executor);
        let file = file.clone();
        let token = token.clone();
        tokio::spawn(async move {
            executor
                .fetch_file(&file, executor.download_dir(), &token)
                .await
        })
    };

    let target = executor.download_dir().join(&file.path);
    let part = part_path(&target);
    for _ in 0..100 {
        if part.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(part.exists(), "transfer should be in progress");

    token.cancel();
    let outcome = task.await.unwrap();
    assert!(matches!(
        outcome,
        FileOutcome::Failed(FailureReason {
            kind: FailureKind::Cancelled,
            ..
        })
    ));
    assert!(!part.exists());
    assert!(!target.exists());
}

#[tokio::test]
async fn test_exhausted_pool_fails_permanently() {
    let platform = Arc::new(FakePlatform::new());
    let temp_dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        subscription: crate::config::SubscriptionConfig::Static {
            endpoints: Vec::new(),
        },
        ..ProxyConfig::default()
    };
    let executor = DownloadExecutor::new(
        platform,
        Arc::new(ProxyPool::new(&config)),
        Arc::new(DefaultLayout),
        temp_dir.path(),
    );

    let err = executor
        .fetch_post_list(&artist(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Proxy(_)));
}

#[tokio::test]
async fn test_new_pool_generation_prunes_client_proxies() {
    let platform = Arc::new(FakePlatform::new());
    let temp_dir = tempfile::tempdir().unwrap();
    let proxies = Arc::new(ProxyPool::new(&ProxyConfig {
        subscription: SubscriptionConfig::Static { endpoints: vec![] },
        ..ProxyConfig::default()
    }));
    let endpoint = |address: &str| ConvertedEndpoint {
        name: address.to_string(),
        address: address.to_string(),
    };
    proxies.replace(vec![endpoint("http://127.0.0.1:1"), endpoint("http://127.0.0.1:2")]);
    let executor = DownloadExecutor::new(
        platform.clone(),
        Arc::clone(&proxies),
        Arc::new(DefaultLayout),
        temp_dir.path().join("downloads"),
    );

    let token = CancellationToken::new();
    executor.fetch_post_list(&artist(), &token).await.unwrap();
    executor.fetch_post_list(&artist(), &token).await.unwrap();
    assert_eq!(platform.retained().len(), 1, "one prune per generation");

    proxies.replace(vec![endpoint("http://127.0.0.1:3")]);
    executor.fetch_post_list(&artist(), &token).await.unwrap();
    let retained = platform.retained();
    assert_eq!(retained.len(), 2);
    assert_eq!(
        retained[1],
        HashSet::from(["http://127.0.0.1:3".to_string()])
    );
}
