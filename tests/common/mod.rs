//! Common test utilities for creator-dl integration tests
//!
//! A [`MockServer`] plays the platform: listing, detail, profile and file
//! endpoints are mounted the way a kemono-style API serves them.

#![allow(dead_code)]

use creator_dl::{Backend, CommandResponse, Config, SessionId, TaskInfo, TaskState};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Size of every mocked file body
pub const FILE_SIZE: usize = 48;

/// One post of the mocked listing
pub struct MockPost {
    pub id: &'static str,
    pub published: &'static str,
    pub files: &'static [&'static str],
}

/// Configuration rooted in `dir`, talking to `server`, with fast retries
pub fn test_config(dir: &Path, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.join("data");
    config.storage.download_dir = dir.join("downloads");
    config.platform.base_url = server.uri();
    config.scheduler.max_workers = 4;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

/// URL path of a mocked file
pub fn file_path(post_id: &str, name: &str) -> String {
    format!("/data/{}/{}", post_id, name)
}

/// Mount the listing of `fanbox/{user_id}` plus a body for every file
pub async fn mount_artist(server: &MockServer, user_id: &str, posts: &[MockPost]) {
    let listing: Vec<serde_json::Value> = posts
        .iter()
        .map(|post| {
            let mut refs = post.files.iter().map(|name| {
                json!({ "name": name, "path": file_path(post.id, name) })
            });
            json!({
                "id": post.id,
                "title": format!("Post {}", post.id),
                "published": post.published,
                "file": refs.next(),
                "attachments": refs.collect::<Vec<_>>(),
            })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/fanbox/user/{}/posts", user_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/fanbox/user/{}/profile", user_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": user_id,
            "name": format!("Artist {}", user_id),
            "service": "fanbox",
            "post_count": posts.len(),
        })))
        .mount(server)
        .await;

    for post in posts {
        for name in post.files {
            Mock::given(method("GET"))
                .and(path(file_path(post.id, name)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'z'; FILE_SIZE]))
                .mount(server)
                .await;
        }
    }
}

/// Answer `status` for the next `times` requests of a file, ahead of its normal body
pub async fn fail_file(server: &MockServer, post_id: &str, name: &str, status: u16, times: u64) {
    Mock::given(method("GET"))
        .and(path(file_path(post_id, name)))
        .respond_with(ResponseTemplate::new(status))
        .up_to_n_times(times)
        .with_priority(1)
        .mount(server)
        .await;
}

/// Number of requests the platform received for a path
pub async fn requests_to(server: &MockServer, url_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == url_path)
        .count()
}

/// Dispatch a command line and fail the test on error
pub async fn run_line(backend: &Backend, session: SessionId, line: &str) -> CommandResponse {
    backend
        .broker()
        .dispatch(session, line)
        .await
        .unwrap_or_else(|e| panic!("command '{}' failed: {}", line, e))
}

/// Wait for the tree queued by a `queued` response
pub async fn wait_queued(backend: &Backend, response: &CommandResponse) -> TaskInfo {
    let CommandResponse::Queued { task } = response else {
        panic!("expected a queued response, got {:?}", response);
    };
    tokio::time::timeout(Duration::from_secs(10), backend.scheduler().wait_for(task.id))
        .await
        .expect("task tree did not finish in time")
        .expect("task tree vanished from history")
}

/// Run `check` for an artist and wait for the tree
pub async fn check(backend: &Backend, session: SessionId, artist: &str) -> TaskState {
    let response = run_line(backend, session, &format!("check:artist={}", artist)).await;
    wait_queued(backend, &response).await.state
}
