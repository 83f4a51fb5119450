//! Typed handlers for every [`Command`].

use super::{Command, CommandKind, NewArtist, OverridesUpdate, ResetCutoff, SortBy};
use crate::cache::{Artist, ArtistCache, ArtistOverrides, ArtistSummary, Post, QuarantinedArtist};
use crate::error::Result;
use crate::scheduler::{Job, SchedulerStatus, TaskScheduler};
use crate::types::{ArtistId, ArtistStatus, Event, TaskHandle, TaskId};
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Artists whose caches are read concurrently by bulk reports
const ARTIST_LOAD_CONCURRENCY: usize = 8;

/// Everything a command handler may touch
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Artist cache
    pub cache: Arc<ArtistCache>,
    /// The one scheduler instance
    pub scheduler: TaskScheduler,
    /// Event channel shared with every session
    pub event_tx: broadcast::Sender<Event>,
    /// Cancelled by `exit`
    pub exit: CancellationToken,
}

impl CommandContext {
    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

/// Result of one entry of a bulk command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ArtistOutcome {
    /// The artist
    pub artist_id: ArtistId,
    /// Whether the operation went through for this artist
    pub ok: bool,
    /// Root task, when a task tree was queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// What happened
    pub detail: String,
}

/// A post that still needs work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IncompletePost {
    /// Post id
    pub id: String,
    /// Title
    pub title: String,
    /// Publication timestamp
    pub published: NaiveDateTime,
    /// Files not yet downloaded
    pub pending_files: usize,
    /// Files that failed permanently in the last attempt
    pub failed_files: Vec<String>,
}

impl From<&Post> for IncompletePost {
    fn from(post: &Post) -> Self {
        Self {
            id: post.id.clone(),
            title: post.title.clone(),
            published: post.published,
            pending_files: post.pending_files().count(),
            failed_files: post.failed_files.clone(),
        }
    }
}

/// Incomplete posts of one artist
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IncompleteReport {
    /// The artist
    pub artist_id: ArtistId,
    /// Posts oldest first
    pub posts: Vec<IncompletePost>,
}

/// One line of `help`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CommandHelp {
    /// Command name
    pub name: CommandKind,
    /// Accepted parameters
    pub params: Vec<String>,
    /// What it does
    pub summary: String,
}

/// Immediate result of a command
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResponse {
    /// Artist created or its status changed
    Artist {
        /// Current summary
        artist: ArtistSummary,
    },
    /// Artist forgotten
    Removed {
        /// The artist
        artist_id: ArtistId,
        /// Live tasks of the artist that were cancelled first
        cancelled: Vec<TaskId>,
    },
    /// `config`
    Overrides {
        /// The artist
        artist_id: ArtistId,
        /// Overrides now in effect
        overrides: ArtistOverrides,
    },
    /// `list`
    Artists {
        /// Matching artists in the requested order
        artists: Vec<ArtistSummary>,
        /// Artists whose artifact could not be read
        quarantined: Vec<QuarantinedArtist>,
    },
    /// Task tree queued
    Queued {
        /// Root task handle
        task: TaskHandle,
    },
    /// Nothing queued for the artist
    Skipped {
        /// The artist
        artist_id: ArtistId,
        /// Why
        reason: String,
    },
    /// Per-artist outcomes of a bulk command
    Bulk {
        /// One entry per artist considered
        outcomes: Vec<ArtistOutcome>,
    },
    /// `tasks`
    Tasks {
        /// Scheduler snapshot
        status: SchedulerStatus,
    },
    /// Tasks that were still live when cancelled
    Cancelled {
        /// Affected task ids
        task_ids: Vec<TaskId>,
    },
    /// `reset`
    Reset {
        /// The artist
        artist_id: ArtistId,
        /// Posts whose `done` flag was cleared
        posts_reset: usize,
    },
    /// `dedupe`
    Deduped {
        /// The artist
        artist_id: ArtistId,
        /// Duplicate records removed
        removed: usize,
    },
    /// `list-incomplete` and `list-incomplete-all`
    Incomplete {
        /// One report per artist
        reports: Vec<IncompleteReport>,
        /// Artists skipped because their artifact could not be read
        quarantined: Vec<QuarantinedArtist>,
    },
    /// `help`
    Help {
        /// Every command
        commands: Vec<CommandHelp>,
    },
    /// `exit` accepted
    Exiting,
}

/// Run a command against the shared backend state
///
/// This is the only place commands are interpreted; local and relayed
/// sessions both end up here.
pub async fn execute(ctx: &CommandContext, command: Command) -> Result<CommandResponse> {
    let kind = command.kind();
    let origin = kind.name();
    tracing::debug!(command = origin, "Executing command");

    match command {
        Command::Add(new) => add(ctx, new).await,
        Command::Remove(artist_id) => {
            // Live trees would otherwise keep writing to the forgotten artist
            let cancelled = ctx.scheduler.cancel_artist(&artist_id).await;
            ctx.cache.remove(&artist_id).await?;
            ctx.emit(Event::ArtistRemoved {
                artist_id: artist_id.clone(),
            });
            Ok(CommandResponse::Removed {
                artist_id,
                cancelled,
            })
        }
        Command::List {
            sort_by,
            all,
            service,
        } => Ok(list(ctx, sort_by, all, service.as_deref()).await),
        Command::Ignore(id) => set_status(ctx, &id, ArtistStatus::Ignored).await,
        Command::Unignore(id) | Command::Uncomplete(id) => {
            set_status(ctx, &id, ArtistStatus::Active).await
        }
        Command::Complete(id) => set_status(ctx, &id, ArtistStatus::Completed).await,
        Command::Config { artist, update } => configure(ctx, artist, update).await,
        Command::Check(id) => check(ctx, &id, Job::Check, origin).await,
        Command::CheckFrom(id, from) => {
            let job = Job::Range {
                from: Some(from),
                until: None,
            };
            check(ctx, &id, job, origin).await
        }
        Command::CheckUntil(id, until) => {
            let job = Job::Range {
                from: None,
                until: Some(until),
            };
            check(ctx, &id, job, origin).await
        }
        Command::CheckRange(id, from, until) => {
            let job = Job::Range {
                from: Some(from),
                until: Some(until),
            };
            check(ctx, &id, job, origin).await
        }
        Command::CheckAll => Ok(submit_all(ctx, Job::Check, origin).await),
        Command::Tasks => Ok(CommandResponse::Tasks {
            status: ctx.scheduler.status(),
        }),
        Command::Cancel(id) => {
            let task_ids = ctx.scheduler.cancel(id).await?;
            Ok(CommandResponse::Cancelled { task_ids })
        }
        Command::CancelAll => Ok(CommandResponse::Cancelled {
            task_ids: ctx.scheduler.cancel_all().await,
        }),
        Command::UpdateCache { artist, full } => {
            let task = ctx
                .scheduler
                .submit(&artist, Job::UpdateCache { full }, origin)
                .await?;
            Ok(CommandResponse::Queued { task })
        }
        Command::UpdateAll { full } => {
            Ok(submit_all(ctx, Job::UpdateCache { full }, origin).await)
        }
        Command::Reset(id, cutoff) => {
            let artist = ctx.cache.load(&id).await?;
            let posts_reset = reset(ctx, &artist, cutoff).await?;
            Ok(CommandResponse::Reset {
                artist_id: id,
                posts_reset,
            })
        }
        Command::ResetAll => Ok(reset_all(ctx).await),
        Command::ListIncomplete(id) => {
            let posts = ctx.cache.incomplete(&id).await?;
            Ok(CommandResponse::Incomplete {
                reports: vec![IncompleteReport {
                    artist_id: id,
                    posts: posts.iter().map(IncompletePost::from).collect(),
                }],
                quarantined: Vec::new(),
            })
        }
        Command::ListIncompleteAll => Ok(list_incomplete_all(ctx).await),
        Command::Dedupe(id) => {
            let removed = dedupe(ctx, &id).await?;
            Ok(CommandResponse::Deduped {
                artist_id: id,
                removed,
            })
        }
        Command::DedupeAll => Ok(dedupe_all(ctx).await),
        Command::Help => Ok(CommandResponse::Help {
            commands: CommandKind::ALL
                .iter()
                .map(|kind| CommandHelp {
                    name: *kind,
                    params: kind.params().iter().map(|p| p.to_string()).collect(),
                    summary: kind.summary().to_string(),
                })
                .collect(),
        }),
        Command::Exit => {
            tracing::info!("Exit requested");
            ctx.exit.cancel();
            Ok(CommandResponse::Exiting)
        }
    }
}

async fn add(ctx: &CommandContext, new: NewArtist) -> Result<CommandResponse> {
    let name = new.name.as_deref().unwrap_or(&new.user_id);
    let mut artist = Artist::new(&new.service, &new.user_id, name, &new.url);
    artist.alias = new.alias;
    artist.last_date = new.last_date;

    let summary = ctx.cache.create(artist).await?;
    ctx.emit(Event::ArtistAdded {
        artist_id: summary.id.clone(),
    });
    Ok(CommandResponse::Artist { artist: summary })
}

async fn configure(
    ctx: &CommandContext,
    artist_id: ArtistId,
    update: OverridesUpdate,
) -> Result<CommandResponse> {
    // Unknown and quarantined artists get no overrides
    ctx.cache.load(&artist_id).await?;

    let mut overrides = ctx.cache.overrides(&artist_id).await;
    if !update.is_empty() {
        update.apply(&mut overrides);
        ctx.cache.set_overrides(&artist_id, overrides.clone()).await?;
        tracing::info!(artist_id = %artist_id, ?overrides, "Artist overrides updated");
    }
    Ok(CommandResponse::Overrides {
        artist_id,
        overrides,
    })
}

async fn list(
    ctx: &CommandContext,
    sort_by: SortBy,
    all: bool,
    service: Option<&str>,
) -> CommandResponse {
    let mut artists: Vec<ArtistSummary> = ctx
        .cache
        .list()
        .await
        .into_iter()
        .filter(|a| all || a.status == ArtistStatus::Active)
        .filter(|a| service.is_none_or(|s| a.service == s))
        .collect();

    let name_key = |a: &ArtistSummary| a.alias.as_deref().unwrap_or(&a.name).to_lowercase();
    match sort_by {
        SortBy::Name => artists.sort_by_key(name_key),
        SortBy::Status => artists.sort_by_key(|a| (a.status.rank(), name_key(a))),
        SortBy::Posts => {
            artists.sort_by(|a, b| b.posts_total.cmp(&a.posts_total).then(a.id.cmp(&b.id)))
        }
        // Most recent first, never-checked artists last
        SortBy::Recent => {
            artists.sort_by(|a, b| b.last_date.cmp(&a.last_date).then(a.id.cmp(&b.id)))
        }
    }

    CommandResponse::Artists {
        artists,
        quarantined: ctx.cache.quarantined(),
    }
}

async fn set_status(
    ctx: &CommandContext,
    id: &ArtistId,
    status: ArtistStatus,
) -> Result<CommandResponse> {
    let artist = ctx.cache.set_status(id, status).await?;
    ctx.emit(Event::ArtistStatusChanged {
        artist_id: id.clone(),
        status,
    });
    Ok(CommandResponse::Artist { artist })
}

async fn check(ctx: &CommandContext, id: &ArtistId, job: Job, origin: &str) -> Result<CommandResponse> {
    let artist = ctx.cache.load(id).await?;
    if artist.status != ArtistStatus::Active {
        return Ok(CommandResponse::Skipped {
            artist_id: id.clone(),
            reason: format!("artist is {}", status_name(artist.status)),
        });
    }
    let task = ctx.scheduler.submit(id, job, origin).await?;
    Ok(CommandResponse::Queued { task })
}

/// Submit `job` for every active artist; quarantined artists are reported
async fn submit_all(ctx: &CommandContext, job: Job, origin: &str) -> CommandResponse {
    let mut active: Vec<ArtistId> = ctx
        .cache
        .list()
        .await
        .into_iter()
        .filter(|a| a.status == ArtistStatus::Active)
        .map(|a| a.id)
        .collect();
    active.sort();

    let mut outcomes = Vec::with_capacity(active.len());
    for artist_id in active {
        let outcome = match ctx.scheduler.submit(&artist_id, job.clone(), origin).await {
            Ok(task) => ArtistOutcome {
                artist_id,
                ok: true,
                task_id: Some(task.id),
                detail: "queued".to_string(),
            },
            Err(e) => ArtistOutcome {
                artist_id,
                ok: false,
                task_id: None,
                detail: e.to_string(),
            },
        };
        outcomes.push(outcome);
    }
    outcomes.extend(quarantined_outcomes(ctx));

    tracing::info!(command = origin, artists = outcomes.len(), "Bulk submission done");
    CommandResponse::Bulk { outcomes }
}

async fn reset(ctx: &CommandContext, artist: &Artist, cutoff: ResetCutoff) -> Result<usize> {
    let cutoff = match cutoff {
        ResetCutoff::Checkpoint => artist.last_date,
        ResetCutoff::All => None,
        ResetCutoff::Date(date) => Some(date),
    };
    let posts_reset = ctx.cache.reset(&artist.id, cutoff).await?;
    ctx.emit(Event::CacheReset {
        artist_id: artist.id.clone(),
        posts_reset,
    });
    Ok(posts_reset)
}

async fn reset_all(ctx: &CommandContext) -> CommandResponse {
    let mut outcomes = Vec::new();
    for artist_id in ctx.cache.artist_ids() {
        let result = match ctx.cache.load(&artist_id).await {
            Ok(artist) => reset(ctx, &artist, ResetCutoff::Checkpoint).await,
            Err(e) => Err(e),
        };
        outcomes.push(match result {
            Ok(count) => ArtistOutcome {
                artist_id,
                ok: true,
                task_id: None,
                detail: format!("{} posts reset", count),
            },
            Err(e) => failed_outcome(artist_id, &e),
        });
    }
    outcomes.extend(quarantined_outcomes(ctx));
    CommandResponse::Bulk { outcomes }
}

async fn dedupe(ctx: &CommandContext, id: &ArtistId) -> Result<usize> {
    let removed = ctx.cache.dedupe(id).await?;
    ctx.emit(Event::CacheDeduped {
        artist_id: id.clone(),
        removed,
    });
    Ok(removed)
}

async fn dedupe_all(ctx: &CommandContext) -> CommandResponse {
    let mut outcomes = Vec::new();
    for artist_id in ctx.cache.artist_ids() {
        outcomes.push(match dedupe(ctx, &artist_id).await {
            Ok(removed) => ArtistOutcome {
                artist_id,
                ok: true,
                task_id: None,
                detail: format!("{} duplicates removed", removed),
            },
            Err(e) => failed_outcome(artist_id, &e),
        });
    }
    outcomes.extend(quarantined_outcomes(ctx));
    CommandResponse::Bulk { outcomes }
}

async fn list_incomplete_all(ctx: &CommandContext) -> CommandResponse {
    let reports: Vec<IncompleteReport> = stream::iter(ctx.cache.artist_ids())
        .map(|artist_id| async move {
            // An artist quarantined since the id snapshot shows up in `quarantined`
            let posts = ctx.cache.incomplete(&artist_id).await.ok()?;
            (!posts.is_empty()).then(|| IncompleteReport {
                artist_id,
                posts: posts.iter().map(IncompletePost::from).collect(),
            })
        })
        .buffered(ARTIST_LOAD_CONCURRENCY)
        .filter_map(std::future::ready)
        .collect()
        .await;

    CommandResponse::Incomplete {
        reports,
        quarantined: ctx.cache.quarantined(),
    }
}

fn failed_outcome(artist_id: ArtistId, error: &crate::Error) -> ArtistOutcome {
    tracing::warn!(artist_id = %artist_id, error = %error, "Bulk operation failed for artist");
    ArtistOutcome {
        artist_id,
        ok: false,
        task_id: None,
        detail: error.to_string(),
    }
}

fn quarantined_outcomes(ctx: &CommandContext) -> Vec<ArtistOutcome> {
    ctx.cache
        .quarantined()
        .into_iter()
        .map(|q| ArtistOutcome {
            artist_id: q.id,
            ok: false,
            task_id: None,
            detail: format!("quarantined: {}", q.reason),
        })
        .collect()
}

fn status_name(status: ArtistStatus) -> &'static str {
    match status {
        ArtistStatus::Active => "active",
        ArtistStatus::Ignored => "ignored",
        ArtistStatus::Completed => "completed",
    }
}
