//! Pure state transitions on an [`Artist`] record.
//!
//! Everything here mutates an in-memory artist only. [`ArtistCache`](super::ArtistCache)
//! runs these under the artist's writer lock and persists the result.

use super::models::{Artist, DedupReport, Post};
use chrono::NaiveDateTime;
use std::collections::HashSet;

/// Merge a freshly fetched post list into the artist
///
/// Incoming records are deduplicated by id (first occurrence wins). Posts the
/// cache already knows keep their state; a known post that never had a file
/// list adopts the incoming one. New posts published on or before `last_date`
/// are inserted as done with their files presumed downloaded.
pub fn merge_posts(artist: &mut Artist, incoming: Vec<Post>) -> DedupReport {
    let mut report = DedupReport::default();
    let mut batch_ids = HashSet::new();

    for mut post in incoming {
        if !batch_ids.insert(post.id.clone()) {
            report.discarded.push(post.id);
            continue;
        }

        if let Some(existing) = artist.post_mut(&post.id) {
            report.known_posts += 1;
            if existing.files.is_empty() && !existing.detail_fetched && !post.files.is_empty() {
                existing.files = post.files;
            }
            continue;
        }

        if artist.last_date.is_some_and(|d| post.published <= d) {
            post.done = true;
            for file in &mut post.files {
                file.downloaded = true;
            }
            report.presumed_done += 1;
        }
        report.new_posts += 1;
        artist.posts.push(post);
    }

    report
}

/// Drop duplicate posts, keeping the first occurrence. Returns removed ids.
pub fn dedupe_posts(artist: &mut Artist) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut removed = Vec::new();

    artist.posts.retain(|post| {
        if seen.insert(post.id.clone()) {
            true
        } else {
            removed.push(post.id.clone());
            false
        }
    });

    removed
}

/// Clear `done` on posts published on or after `cutoff` (all posts when `None`)
///
/// Files of the affected posts lose their `downloaded` flag but keep their
/// cached length, so the next pass re-verifies them without re-transferring
/// anything that is still intact on disk. Returns the number of posts that
/// were done before the reset.
pub fn reset_posts(artist: &mut Artist, cutoff: Option<NaiveDateTime>) -> usize {
    let mut reset = 0;

    for post in artist
        .posts
        .iter_mut()
        .filter(|p| cutoff.is_none_or(|c| p.published >= c))
    {
        if post.done {
            reset += 1;
        }
        post.done = false;
        post.failed_files.clear();
        for file in &mut post.files {
            file.downloaded = false;
        }
    }

    reset
}

/// Compute the checkpoint after the current one
///
/// Walks posts in publication order past the current `last_date` and stops at
/// the first post that is not done. Returns the new date only when it moves
/// forward.
pub fn next_checkpoint(artist: &Artist) -> Option<NaiveDateTime> {
    let mut posts: Vec<&Post> = artist.posts.iter().collect();
    posts.sort_by_key(|p| p.published);

    let start = artist.last_date;
    let mut candidate = start;

    for post in posts
        .into_iter()
        .filter(|p| start.is_none_or(|s| p.published > s))
    {
        if !post.done {
            break;
        }
        candidate = Some(post.published);
    }

    match (candidate, start) {
        (Some(new), Some(old)) if new > old => Some(new),
        (Some(new), None) => Some(new),
        _ => None,
    }
}

/// Posts that still need work, oldest first
pub fn incomplete_posts(artist: &Artist) -> Vec<&Post> {
    let mut posts: Vec<&Post> = artist
        .posts
        .iter()
        .filter(|p| !p.done || !p.failed_files.is_empty())
        .collect();
    posts.sort_by_key(|p| p.published);
    posts
}

/// Posts inside a publication window, oldest first
///
/// `from` is exclusive and `until` inclusive.
pub fn posts_in_range(
    artist: &Artist,
    from: Option<NaiveDateTime>,
    until: Option<NaiveDateTime>,
) -> Vec<&Post> {
    let mut posts: Vec<&Post> = artist
        .posts
        .iter()
        .filter(|p| from.is_none_or(|f| p.published > f))
        .filter(|p| until.is_none_or(|u| p.published <= u))
        .collect();
    posts.sort_by_key(|p| p.published);
    posts
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::models::PostFile;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn post(id: &str, published: NaiveDateTime, files: usize) -> Post {
        Post {
            id: id.to_string(),
            title: format!("post {}", id),
            published,
            done: false,
            content: None,
            detail_fetched: false,
            failed_files: Vec::new(),
            files: (0..files)
                .map(|i| PostFile {
                    name: format!("{}_{}.png", id, i),
                    path: format!("{}/{}.png", id, i).into(),
                    url: format!("https://cdn.example/{}/{}", id, i),
                    content_length: None,
                    downloaded: false,
                })
                .collect(),
        }
    }

    fn artist() -> Artist {
        Artist::new("fanbox", "1", "someone", "https://kemono.cr/fanbox/user/1")
    }

    #[test]
    fn test_merge_is_idempotent_with_duplicates() {
        let incoming = vec![
            post("a", date(2024, 1, 1), 1),
            post("b", date(2024, 1, 2), 2),
            post("a", date(2024, 1, 3), 5),
        ];

        let mut once = artist();
        let report = merge_posts(&mut once, incoming.clone());
        assert_eq!(report.new_posts, 2);
        assert_eq!(report.discarded, vec!["a".to_string()]);
        assert_eq!(once.post("a").unwrap().files.len(), 1, "first occurrence wins");

        let mut twice = once.clone();
        let report = merge_posts(&mut twice, incoming);
        assert_eq!(report.new_posts, 0);
        assert_eq!(report.known_posts, 2);
        assert_eq!(once, twice, "second merge must not change the cache");
    }

    #[test]
    fn test_merge_keeps_existing_state() {
        let mut a = artist();
        merge_posts(&mut a, vec![post("a", date(2024, 1, 1), 2)]);
        a.posts[0].files[0].downloaded = true;
        a.posts[0].files[0].content_length = Some(10);

        merge_posts(&mut a, vec![post("a", date(2024, 1, 1), 2)]);
        assert!(a.posts[0].files[0].downloaded);
        assert_eq!(a.posts[0].files[0].content_length, Some(10));
    }

    #[test]
    fn test_merge_applies_checkpoint_to_new_posts() {
        let mut a = artist();
        a.last_date = Some(date(2024, 1, 2));

        let report = merge_posts(
            &mut a,
            vec![
                post("old", date(2024, 1, 1), 1),
                post("edge", date(2024, 1, 2), 1),
                post("new", date(2024, 1, 3), 1),
            ],
        );

        assert_eq!(report.presumed_done, 2);
        assert!(a.post("old").unwrap().done);
        assert!(a.post("edge").unwrap().done, "on the checkpoint counts as before");
        assert!(a.post("old").unwrap().files[0].downloaded);
        assert!(!a.post("new").unwrap().done);
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let mut a = artist();
        let mut first = post("a", date(2024, 1, 1), 1);
        first.done = true;
        first.files[0].downloaded = true;
        a.posts = vec![first, post("b", date(2024, 1, 2), 1), post("a", date(2024, 1, 1), 1)];

        let removed = dedupe_posts(&mut a);
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(a.posts.len(), 2);
        assert!(a.post("a").unwrap().done);
        assert!(dedupe_posts(&mut a).is_empty());
    }

    #[test]
    fn test_reset_with_cutoff() {
        let mut a = artist();
        for (id, d) in [("p1", date(2023, 12, 31)), ("p2", date(2024, 1, 1)), ("p3", date(2024, 2, 1))] {
            let mut p = post(id, d, 1);
            p.done = true;
            p.files[0].downloaded = true;
            p.files[0].content_length = Some(42);
            a.posts.push(p);
        }

        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let count = reset_posts(&mut a, Some(cutoff));

        assert_eq!(count, 2);
        assert!(a.post("p1").unwrap().done, "earlier posts untouched");
        assert!(a.post("p1").unwrap().files[0].downloaded);
        assert!(!a.post("p2").unwrap().done);
        assert!(!a.post("p3").unwrap().done);
        assert!(!a.post("p3").unwrap().files[0].downloaded);
        assert_eq!(
            a.post("p3").unwrap().files[0].content_length,
            Some(42),
            "cached length survives a reset"
        );
    }

    #[test]
    fn test_reset_all() {
        let mut a = artist();
        for (id, d) in [("p1", date(2020, 1, 1)), ("p2", date(2024, 1, 1))] {
            let mut p = post(id, d, 0);
            p.done = true;
            a.posts.push(p);
        }
        assert_eq!(reset_posts(&mut a, None), 2);
        assert!(a.posts.iter().all(|p| !p.done));
    }

    #[test]
    fn test_checkpoint_stops_at_first_undone() {
        let mut a = artist();
        let mut p1 = post("p1", date(2024, 1, 1), 0);
        p1.done = true;
        let mut p2 = post("p2", date(2024, 1, 2), 0);
        p2.done = true;
        let p3 = post("p3", date(2024, 1, 3), 0);
        let mut p4 = post("p4", date(2024, 1, 4), 0);
        p4.done = true;
        // Stored newest first, the way the platform lists them
        a.posts = vec![p4, p3, p2, p1];

        assert_eq!(next_checkpoint(&a), Some(date(2024, 1, 2)));
    }

    #[test]
    fn test_checkpoint_never_moves_backward() {
        let mut a = artist();
        a.last_date = Some(date(2024, 6, 1));
        let mut older = post("old", date(2024, 1, 1), 0);
        older.done = true;
        a.posts = vec![older, post("new", date(2024, 7, 1), 0)];
        assert_eq!(next_checkpoint(&a), None);

        // After a reset nothing past the checkpoint is done, still no movement
        reset_posts(&mut a, None);
        assert_eq!(next_checkpoint(&a), None);

        a.post_mut("new").unwrap().done = true;
        assert_eq!(next_checkpoint(&a), Some(date(2024, 7, 1)));
    }

    #[test]
    fn test_range_bounds() {
        let mut a = artist();
        a.posts = vec![
            post("p1", date(2024, 1, 1), 0),
            post("p2", date(2024, 1, 2), 0),
            post("p3", date(2024, 1, 3), 0),
        ];
        let ids: Vec<_> = posts_in_range(&a, Some(date(2024, 1, 1)), Some(date(2024, 1, 3)))
            .into_iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p2", "p3"], "from is exclusive, until inclusive");
    }
}
