use super::*;
use crate::backend::Backend;
use crate::commands::{Command, execute};
use crate::config::{Config, ProxyConfig, SubscriptionConfig};
use crate::executor::{DefaultLayout, part_path};
use crate::proxy::EndpointHealth;
use std::collections::HashMap;
use crate::test_helpers::{FakePlatform, create_test_backend, file_url, raw_post, test_config};
use std::future::Future;

fn artist() -> ArtistId {
    ArtistId::from("fanbox_1")
}

async fn add_artist(backend: &Backend) {
    execute(
        &backend.command_context(),
        Command::parse("add:service=fanbox,user_id=1").unwrap(),
    )
    .await
    .unwrap();
}

/// Backend over `platform` with a tweaked configuration
async fn backend_with(
    platform: Arc<FakePlatform>,
    tweak: impl FnOnce(&mut Config),
) -> (Backend, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let backend = Backend::with_components(config, platform, Arc::new(DefaultLayout), None)
        .await
        .unwrap();
    (backend, dir)
}

async fn run(backend: &Backend, job: Job) -> TaskInfo {
    let handle = backend.scheduler().submit(&artist(), job, "test").await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), backend.scheduler().wait_for(handle.id))
        .await
        .unwrap()
        .unwrap()
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn target_of(backend: &Backend, file: &crate::cache::PostFile) -> PathBuf {
    backend.config().storage.download_dir.join(&file.path)
}

#[tokio::test]
async fn test_check_downloads_everything_and_marks_posts_done() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png"]), 20);
    platform.add_post("fanbox", "1", raw_post("p2", "2024-02-01T00:00:00", &["c.png"]), 20);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Succeeded);

    let cached = backend.cache().load(&artist()).await.unwrap();
    assert!(cached.posts.iter().all(|p| p.done));
    for post in &cached.posts {
        for file in &post.files {
            assert!(file.downloaded);
            assert_eq!(file.content_length, Some(20));
            let target = target_of(&backend, file);
            assert_eq!(std::fs::metadata(&target).unwrap().len(), 20);
            assert!(!part_path(&target).exists());
        }
    }
    assert_eq!(
        cached.last_date,
        Some(
            chrono::NaiveDate::from_ymd_opt(2024, 2, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        )
    );

    // The whole tree is visible in history
    let status = backend.scheduler().status();
    assert_eq!(status.tasks.len(), 1 + 2 + 3);
    assert_eq!(status.finished, status.tasks.len());
}

#[tokio::test]
async fn test_second_check_makes_no_file_requests() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 20);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    run(&backend, Job::Check).await;
    platform.clear_requests();

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Succeeded);
    assert!(
        platform.requests().iter().all(|r| !r.starts_with("file ")),
        "unexpected requests: {:?}",
        platform.requests()
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 20);
    platform.fail_times(&file_url("p1", "a.png"), 2);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;
    let mut events = backend.subscribe();

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Succeeded);
    assert_eq!(platform.file_requests(&file_url("p1", "a.png")), 3);

    let file_task = backend
        .scheduler()
        .status()
        .tasks
        .into_iter()
        .find(|t| t.kind == TaskKind::DownloadFile)
        .unwrap();
    assert_eq!(file_task.retry_count, 2);
    assert_eq!(file_task.state, TaskState::Succeeded);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::TaskRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_permanent_failure_rolls_up_and_records_failed_files() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png"]), 20);
    platform.fail_always(&file_url("p1", "b.png"));
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Failed);
    assert!(root.failure.unwrap().contains("children failed"));
    // Not retried
    assert_eq!(platform.file_requests(&file_url("p1", "b.png")), 1);

    let status = backend.scheduler().status();
    let post_task = status
        .tasks
        .iter()
        .find(|t| t.kind == TaskKind::DownloadPost)
        .unwrap();
    assert_eq!(post_task.state, TaskState::Failed);

    let cached = backend.cache().load(&artist()).await.unwrap();
    let post = cached.post("p1").unwrap();
    assert!(!post.done);
    assert!(post.files[0].downloaded);
    assert!(!post.files[1].downloaded);
    assert_eq!(post.failed_files, vec!["b.png".to_string()]);
}

#[tokio::test]
async fn test_check_resumes_with_only_missing_files() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post(
        "fanbox",
        "1",
        raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png", "c.png"]),
        20,
    );
    let c = file_url("p1", "c.png");
    platform.fail_times(&c, 100);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let first = run(&backend, Job::Check).await;
    assert_eq!(first.state, TaskState::Failed);
    let cached = backend.cache().load(&artist()).await.unwrap();
    let downloaded: Vec<bool> = cached.post("p1").unwrap().files.iter().map(|f| f.downloaded).collect();
    assert_eq!(downloaded, vec![true, true, false]);

    platform.fail_times(&c, 0);
    let c_requests = platform.file_requests(&c);

    let second = run(&backend, Job::Check).await;
    assert_eq!(second.state, TaskState::Succeeded);
    assert_eq!(platform.file_requests(&file_url("p1", "a.png")), 1);
    assert_eq!(platform.file_requests(&file_url("p1", "b.png")), 1);
    assert_eq!(platform.file_requests(&c), c_requests + 1);

    let post = backend.cache().load(&artist()).await.unwrap().post("p1").cloned().unwrap();
    assert!(post.done);
    assert!(post.failed_files.is_empty());
}

#[tokio::test]
async fn test_cancel_leaves_no_partial_file_and_resumes() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png"]), 64);
    let b = file_url("p1", "b.png");
    platform.stall(&b);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let handle = backend
        .scheduler()
        .submit(&artist(), Job::Check, "check")
        .await
        .unwrap();

    let cache = Arc::clone(backend.cache());
    eventually(|| {
        let cache = Arc::clone(&cache);
        let platform = Arc::clone(&platform);
        let b = b.clone();
        async move {
            let a_done = cache
                .load(&artist())
                .await
                .map(|a| a.post("p1").is_some_and(|p| p.files[0].downloaded))
                .unwrap_or(false);
            a_done && platform.file_requests(&b) > 0
        }
    })
    .await;

    let cancelled = backend.scheduler().cancel(handle.id).await.unwrap();
    assert!(cancelled.contains(&handle.id));
    let root = backend.scheduler().wait_for(handle.id).await.unwrap();
    assert_eq!(root.state, TaskState::Cancelled);

    let cached = backend.cache().load(&artist()).await.unwrap();
    let post = cached.post("p1").unwrap();
    assert!(!post.done);
    assert!(!post.files[1].downloaded);
    let target = target_of(&backend, &post.files[1]);
    assert!(!target.exists());
    assert!(!part_path(&target).exists());

    // Cancelling again reports the terminal state
    let err = backend.scheduler().cancel(handle.id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Task(TaskError::AlreadyTerminal { .. })
    ));

    platform.unstall(&b);
    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Succeeded);
    assert_eq!(platform.file_requests(&file_url("p1", "a.png")), 1);
    assert_eq!(platform.file_requests(&b), 2);
}

#[tokio::test]
async fn test_remove_cancels_live_tree_and_stays_removed() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png"]), 64);
    let b = file_url("p1", "b.png");
    platform.stall(&b);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let handle = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();
    eventually(|| {
        let platform = Arc::clone(&platform);
        let b = b.clone();
        async move { platform.file_requests(&b) > 0 }
    })
    .await;

    let response = execute(
        &backend.command_context(),
        Command::parse("remove:artist=fanbox_1").unwrap(),
    )
    .await
    .unwrap();
    let crate::commands::CommandResponse::Removed { cancelled, .. } = response else {
        panic!("expected removed");
    };
    assert!(cancelled.contains(&handle.id));

    let root = backend.scheduler().wait_for(handle.id).await.unwrap();
    assert!(root.state.is_terminal());
    assert_ne!(root.state, TaskState::Succeeded);

    // Workers finishing after the removal must not write the artifact back
    let data_dir = backend.config().storage.data_dir.clone();
    assert!(!data_dir.join("artists/fanbox_1.json").exists());
    let reopened = ArtistCache::open(&data_dir).await.unwrap();
    assert!(reopened.artist_ids().is_empty());
}

#[tokio::test]
async fn test_tasks_fail_over_to_the_working_proxy() {
    const GOOD: &str = "http://127.0.0.1:7001";
    const BAD: &str = "http://127.0.0.1:7002";

    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png", "b.png"]), 32);
    platform.add_post("fanbox", "1", raw_post("p2", "2024-02-01T00:00:00", &["c.png", "d.png"]), 32);
    platform.break_proxy(BAD);
    let (backend, _dir) = backend_with(Arc::clone(&platform), |config| {
        config.proxy = ProxyConfig {
            subscription: SubscriptionConfig::Static {
                endpoints: vec![format!("good {}", GOOD), format!("bad {}", BAD)],
            },
            degrade_after: 2,
            dead_after: 2,
            ..ProxyConfig::default()
        };
    })
    .await;
    add_artist(&backend).await;

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Succeeded);
    let status = backend.scheduler().status();
    assert!(
        status.tasks.iter().all(|t| t.state == TaskState::Succeeded),
        "{:?}",
        status.tasks
    );

    let cached = backend.cache().load(&artist()).await.unwrap();
    assert!(cached.posts.iter().all(|p| p.done));

    let health: HashMap<String, EndpointHealth> = backend
        .proxies()
        .snapshot()
        .into_iter()
        .map(|e| (e.address, e.health))
        .collect();
    assert_eq!(health[BAD], EndpointHealth::Dead);
    assert_eq!(health[GOOD], EndpointHealth::Healthy);
}

#[tokio::test]
async fn test_trees_for_the_same_artist_are_serialized() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 64);
    let a = file_url("p1", "a.png");
    platform.stall(&a);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let first = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();
    let second = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();

    eventually(|| {
        let platform = Arc::clone(&platform);
        let a = a.clone();
        async move { platform.file_requests(&a) > 0 }
    })
    .await;

    // The second root holds no lease while the first tree is live
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        backend.scheduler().task(second.id).unwrap().state,
        TaskState::Queued
    );

    platform.unstall(&a);
    backend.scheduler().cancel(first.id).await.unwrap();
    assert_eq!(
        backend.scheduler().wait_for(first.id).await.unwrap().state,
        TaskState::Cancelled
    );

    let second = tokio::time::timeout(Duration::from_secs(10), backend.scheduler().wait_for(second.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.state, TaskState::Succeeded);
    assert_eq!(platform.file_requests(&a), 2);
}

#[tokio::test]
async fn test_range_job_redownloads_inside_window_only() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2023-06-01T00:00:00", &["a.png"]), 20);
    platform.add_post("fanbox", "1", raw_post("p2", "2024-03-01T00:00:00", &["b.png"]), 20);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;
    run(&backend, Job::Check).await;

    // Both local copies disappear, but only p2 is inside the window
    let cached = backend.cache().load(&artist()).await.unwrap();
    for post in &cached.posts {
        std::fs::remove_file(target_of(&backend, &post.files[0])).unwrap();
    }

    let from = crate::commands::parse_date("2024-01-01", false).unwrap();
    let root = run(&backend, Job::Range { from: Some(from), until: None }).await;
    assert_eq!(root.state, TaskState::Succeeded);

    assert_eq!(platform.file_requests(&file_url("p1", "a.png")), 1);
    assert_eq!(platform.file_requests(&file_url("p2", "b.png")), 2);
    let cached = backend.cache().load(&artist()).await.unwrap();
    assert!(target_of(&backend, &cached.post("p2").unwrap().files[0]).exists());
    assert!(!target_of(&backend, &cached.post("p1").unwrap().files[0]).exists());
}

#[tokio::test]
async fn test_update_cache_full_fetches_details_without_downloading() {
    let platform = Arc::new(FakePlatform::new());
    platform.set_profile("fanbox", "1", "Someone", 1);
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 20);
    let mut detail = raw_post("p1", "2024-01-01T00:00:00", &["a.png", "extra.png"]);
    detail.content = Some("<p>hello</p>".to_string());
    platform.set_detail(detail, 20);
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let basic = run(&backend, Job::UpdateCache { full: false }).await;
    assert_eq!(basic.state, TaskState::Succeeded);
    let cached = backend.cache().load(&artist()).await.unwrap();
    assert_eq!(cached.profile.as_ref().unwrap().name, "Someone");
    assert!(!cached.post("p1").unwrap().detail_fetched);

    let full = run(&backend, Job::UpdateCache { full: true }).await;
    assert_eq!(full.state, TaskState::Succeeded);

    let post = backend.cache().load(&artist()).await.unwrap().post("p1").cloned().unwrap();
    assert!(post.detail_fetched);
    assert_eq!(post.content.as_deref(), Some("<p>hello</p>"));
    assert_eq!(post.files.len(), 2);
    assert!(!post.done);
    assert!(platform.requests().iter().all(|r| !r.starts_with("file ")));
    assert!(platform.requests().contains(&"post p1".to_string()));
}

#[tokio::test]
async fn test_history_evicts_oldest_trees() {
    let platform = Arc::new(FakePlatform::new());
    platform.set_profile("fanbox", "1", "Someone", 0);
    let (backend, _dir) = backend_with(Arc::clone(&platform), |config| {
        config.scheduler.max_task_history = 2;
    })
    .await;
    add_artist(&backend).await;

    let mut roots = Vec::new();
    for _ in 0..3 {
        roots.push(run(&backend, Job::UpdateCache { full: false }).await.id);
    }

    assert!(backend.scheduler().task(roots[0]).is_none());
    assert!(backend.scheduler().task(roots[1]).is_some());
    assert!(backend.scheduler().task(roots[2]).is_some());
    assert_eq!(backend.scheduler().status().tasks.len(), 2);
}

#[tokio::test]
async fn test_checkpoint_policy_on_cancelled_tree() {
    for (policy, expected) in [
        (CheckpointPolicy::PerPost, Some("2023-06-01")),
        (CheckpointPolicy::PerArtist, None),
    ] {
        let platform = Arc::new(FakePlatform::new());
        platform.add_post("fanbox", "1", raw_post("p1", "2023-06-01T00:00:00", &["a.png"]), 20);
        platform.add_post("fanbox", "1", raw_post("p2", "2024-03-01T00:00:00", &["b.png"]), 64);
        platform.stall(&file_url("p2", "b.png"));
        let (backend, _dir) = backend_with(Arc::clone(&platform), |config| {
            config.scheduler.checkpoint = policy;
        })
        .await;
        add_artist(&backend).await;

        let handle = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();
        let cache = Arc::clone(backend.cache());
        eventually(|| {
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .load(&artist())
                    .await
                    .map(|a| a.post("p1").is_some_and(|p| p.done))
                    .unwrap_or(false)
            }
        })
        .await;
        // Give the post-level hook time to land before cancelling
        tokio::time::sleep(Duration::from_millis(100)).await;

        backend.scheduler().cancel(handle.id).await.unwrap();
        let root = backend.scheduler().wait_for(handle.id).await.unwrap();
        assert_eq!(root.state, TaskState::Cancelled);

        let last_date = backend.cache().load(&artist()).await.unwrap().last_date;
        let expected = expected.map(|d| crate::commands::parse_date(d, false).unwrap());
        assert_eq!(last_date, expected, "policy {:?}", policy);
    }
}

#[tokio::test]
async fn test_timeout_is_retried_then_fails() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 64);
    let a = file_url("p1", "a.png");
    platform.stall(&a);
    let (backend, _dir) = backend_with(Arc::clone(&platform), |config| {
        config.scheduler.task_timeout = Duration::from_millis(200);
        config.retry.max_attempts = 1;
    })
    .await;
    add_artist(&backend).await;

    let root = run(&backend, Job::Check).await;
    assert_eq!(root.state, TaskState::Failed);
    assert_eq!(platform.file_requests(&a), 2);

    let file_task = backend
        .scheduler()
        .status()
        .tasks
        .into_iter()
        .find(|t| t.kind == TaskKind::DownloadFile)
        .unwrap();
    assert_eq!(file_task.retry_count, 1);
    assert!(file_task.failure.unwrap().contains("timed out"));

    let cached = backend.cache().load(&artist()).await.unwrap();
    let target = target_of(&backend, &cached.post("p1").unwrap().files[0]);
    assert!(!part_path(&target).exists());
}

#[tokio::test]
async fn test_submit_unknown_artist_fails() {
    let (backend, _dir) = create_test_backend(Arc::new(FakePlatform::new())).await;
    let err = backend
        .scheduler()
        .submit(&ArtistId::from("fanbox_404"), Job::Check, "check")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cache(crate::error::CacheError::ArtistNotFound { .. })));
}

#[tokio::test]
async fn test_cancel_all_cancels_every_live_tree() {
    let platform = Arc::new(FakePlatform::new());
    platform.add_post("fanbox", "1", raw_post("p1", "2024-01-01T00:00:00", &["a.png"]), 64);
    platform.stall(&file_url("p1", "a.png"));
    let (backend, _dir) = create_test_backend(Arc::clone(&platform)).await;
    add_artist(&backend).await;

    let first = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();
    let second = backend.scheduler().submit(&artist(), Job::Check, "check").await.unwrap();

    let affected = backend.scheduler().cancel_all().await;
    assert!(affected.contains(&first.id));
    assert!(affected.contains(&second.id));

    for id in [first.id, second.id] {
        let root = tokio::time::timeout(Duration::from_secs(5), backend.scheduler().wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.state, TaskState::Cancelled);
    }
}
