//! Command registry shared by every dispatch path.
//!
//! Commands are written as `name[:key=value[,key=value...]]`, for example
//! `list:sort_by=status` or `check:artist=fanbox_123`. [`CommandKind`] is the
//! closed set of command names; [`Command::parse`] turns a line into a typed
//! [`Command`] and [`execute`] runs it. Local sessions and relayed sessions go
//! through exactly these two functions.

mod handlers;

pub use handlers::{
    ArtistOutcome, CommandContext, CommandHelp, CommandResponse, IncompletePost,
    IncompleteReport, execute,
};

use crate::cache::ArtistOverrides;
use crate::config::CheckpointPolicy;
use crate::error::{CommandError, Result};
use crate::timer::CheckTimer;
use crate::types::{ArtistId, TaskId, is_safe_id_part};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use utoipa::ToSchema;

/// Every command the backend understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// Register an artist
    Add,
    /// Forget an artist
    Remove,
    /// List artists
    List,
    /// Exclude an artist from bulk operations
    Ignore,
    /// Undo `ignore`
    Unignore,
    /// Mark an artist finished
    Complete,
    /// Undo `complete`
    Uncomplete,
    /// Show or edit an artist's overrides
    Config,
    /// Download new posts of one artist
    Check,
    /// `check` every active artist
    CheckAll,
    /// Download posts published after a date
    CheckFrom,
    /// Download posts published up to a date
    CheckUntil,
    /// Download posts published inside a window
    CheckRange,
    /// Show tasks
    Tasks,
    /// Cancel a task tree or subtree
    Cancel,
    /// Cancel everything
    CancelAll,
    /// Refresh one artist's post list
    UpdateCacheBasic,
    /// Refresh one artist's post list and post details
    UpdateCacheFull,
    /// `update-cache-basic` for every active artist
    UpdateAllBasic,
    /// `update-cache-full` for every active artist
    UpdateAllFull,
    /// Clear `done` from a date on
    Reset,
    /// `reset` every artist at its own checkpoint
    ResetAll,
    /// Posts of one artist that still need work
    ListIncomplete,
    /// Posts of every artist that still need work
    ListIncompleteAll,
    /// Remove duplicate posts of one artist
    Dedupe,
    /// Remove duplicate posts of every artist
    DedupeAll,
    /// Describe the commands
    Help,
    /// Shut the backend down
    Exit,
}

impl CommandKind {
    /// All command kinds, in help order
    pub const ALL: [CommandKind; 28] = [
        CommandKind::Add,
        CommandKind::Remove,
        CommandKind::List,
        CommandKind::Ignore,
        CommandKind::Unignore,
        CommandKind::Complete,
        CommandKind::Uncomplete,
        CommandKind::Config,
        CommandKind::Check,
        CommandKind::CheckAll,
        CommandKind::CheckFrom,
        CommandKind::CheckUntil,
        CommandKind::CheckRange,
        CommandKind::Tasks,
        CommandKind::Cancel,
        CommandKind::CancelAll,
        CommandKind::UpdateCacheBasic,
        CommandKind::UpdateCacheFull,
        CommandKind::UpdateAllBasic,
        CommandKind::UpdateAllFull,
        CommandKind::Reset,
        CommandKind::ResetAll,
        CommandKind::ListIncomplete,
        CommandKind::ListIncompleteAll,
        CommandKind::Dedupe,
        CommandKind::DedupeAll,
        CommandKind::Help,
        CommandKind::Exit,
    ];

    /// Name used on the command line
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Add => "add",
            CommandKind::Remove => "remove",
            CommandKind::List => "list",
            CommandKind::Ignore => "ignore",
            CommandKind::Unignore => "unignore",
            CommandKind::Complete => "complete",
            CommandKind::Uncomplete => "uncomplete",
            CommandKind::Config => "config",
            CommandKind::Check => "check",
            CommandKind::CheckAll => "check-all",
            CommandKind::CheckFrom => "check-from",
            CommandKind::CheckUntil => "check-until",
            CommandKind::CheckRange => "check-range",
            CommandKind::Tasks => "tasks",
            CommandKind::Cancel => "cancel",
            CommandKind::CancelAll => "cancel-all",
            CommandKind::UpdateCacheBasic => "update-cache-basic",
            CommandKind::UpdateCacheFull => "update-cache-full",
            CommandKind::UpdateAllBasic => "update-all-basic",
            CommandKind::UpdateAllFull => "update-all-full",
            CommandKind::Reset => "reset",
            CommandKind::ResetAll => "reset-all",
            CommandKind::ListIncomplete => "list-incomplete",
            CommandKind::ListIncompleteAll => "list-incomplete-all",
            CommandKind::Dedupe => "dedupe",
            CommandKind::DedupeAll => "dedupe-all",
            CommandKind::Help => "help",
            CommandKind::Exit => "exit",
        }
    }

    /// Look a kind up by its command-line name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Accepted parameter keys
    pub fn params(&self) -> &'static [&'static str] {
        match self {
            CommandKind::Add => &["url", "service", "user_id", "name", "alias", "last_date"],
            CommandKind::List => &["sort_by", "all", "service"],
            CommandKind::CheckFrom => &["artist", "from"],
            CommandKind::CheckUntil => &["artist", "until"],
            CommandKind::CheckRange => &["artist", "from", "until"],
            CommandKind::Cancel => &["id"],
            CommandKind::Reset => &["artist", "last_date"],
            CommandKind::Config => &["artist", "timer", "checkpoint", "max_files", "download_dir"],
            CommandKind::Remove
            | CommandKind::Ignore
            | CommandKind::Unignore
            | CommandKind::Complete
            | CommandKind::Uncomplete
            | CommandKind::Check
            | CommandKind::UpdateCacheBasic
            | CommandKind::UpdateCacheFull
            | CommandKind::ListIncomplete
            | CommandKind::Dedupe => &["artist"],
            CommandKind::CheckAll
            | CommandKind::Tasks
            | CommandKind::CancelAll
            | CommandKind::UpdateAllBasic
            | CommandKind::UpdateAllFull
            | CommandKind::ResetAll
            | CommandKind::ListIncompleteAll
            | CommandKind::DedupeAll
            | CommandKind::Help
            | CommandKind::Exit => &[],
        }
    }

    /// One-line description for `help`
    pub fn summary(&self) -> &'static str {
        match self {
            CommandKind::Add => "register an artist by url, or by service and user_id",
            CommandKind::Remove => "forget an artist; downloaded files stay on disk",
            CommandKind::List => "list active artists (all=true includes ignored and completed)",
            CommandKind::Ignore => "skip the artist in bulk operations",
            CommandKind::Unignore => "include the artist in bulk operations again",
            CommandKind::Complete => "mark the artist as finished",
            CommandKind::Uncomplete => "mark the artist as active again",
            CommandKind::Config => {
                "show or edit the artist's timer, checkpoint, max_files and download_dir (none clears)"
            }
            CommandKind::Check => "download posts that are not done",
            CommandKind::CheckAll => "check every active artist",
            CommandKind::CheckFrom => "download posts published after a date",
            CommandKind::CheckUntil => "download posts published on or before a date",
            CommandKind::CheckRange => "download posts published inside a date window",
            CommandKind::Tasks => "show queued, running and finished tasks",
            CommandKind::Cancel => "cancel a task and its descendants",
            CommandKind::CancelAll => "cancel every live task",
            CommandKind::UpdateCacheBasic => "refresh the post list without downloading",
            CommandKind::UpdateCacheFull => "refresh the post list and fetch missing post details",
            CommandKind::UpdateAllBasic => "update-cache-basic for every active artist",
            CommandKind::UpdateAllFull => "update-cache-full for every active artist",
            CommandKind::Reset => "mark posts from a date on as not done (none = all posts)",
            CommandKind::ResetAll => "reset every artist at its own checkpoint",
            CommandKind::ListIncomplete => "posts that still need work",
            CommandKind::ListIncompleteAll => "posts that still need work, for every artist",
            CommandKind::Dedupe => "remove duplicate cached posts",
            CommandKind::DedupeAll => "remove duplicate cached posts of every artist",
            CommandKind::Help => "describe the commands",
            CommandKind::Exit => "shut the backend down",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sort order for `list`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Display name, case-insensitive
    #[default]
    Name,
    /// Active, ignored, completed; then name
    Status,
    /// Most cached posts first
    Posts,
    /// Most recent checkpoint first
    Recent,
}

/// How `add` identifies the artist
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewArtist {
    /// Platform service
    pub service: String,
    /// Platform user id
    pub user_id: String,
    /// Artist page URL
    pub url: String,
    /// Display name (defaults to the user id)
    pub name: Option<String>,
    /// Alias
    pub alias: Option<String>,
    /// Initial checkpoint
    pub last_date: Option<NaiveDateTime>,
}

/// Cutoff for `reset`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetCutoff {
    /// The artist's own `last_date` (all posts when unset)
    Checkpoint,
    /// Every post
    All,
    /// Posts published on or after this date
    Date(NaiveDateTime),
}

/// Changes requested by `config`
///
/// Each field is `None` when left alone and `Some(None)` when cleared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverridesUpdate {
    /// Timed checks
    pub timer: Option<Option<CheckTimer>>,
    /// Checkpoint granularity
    pub checkpoint: Option<Option<CheckpointPolicy>>,
    /// Cap on concurrent file downloads
    pub max_files: Option<Option<usize>>,
    /// Download root
    pub download_dir: Option<Option<PathBuf>>,
}

impl OverridesUpdate {
    /// Whether nothing would change
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write the requested changes into `overrides`
    pub fn apply(self, overrides: &mut ArtistOverrides) {
        if let Some(timer) = self.timer {
            overrides.timer = timer;
        }
        if let Some(checkpoint) = self.checkpoint {
            overrides.checkpoint = checkpoint;
        }
        if let Some(max_files) = self.max_files {
            overrides.max_concurrent_files = max_files;
        }
        if let Some(download_dir) = self.download_dir {
            overrides.download_dir = download_dir;
        }
    }
}

/// A parsed command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `add`
    Add(NewArtist),
    /// `remove`
    Remove(ArtistId),
    /// `list`
    List {
        /// Sort order
        sort_by: SortBy,
        /// Include ignored and completed artists
        all: bool,
        /// Only this service
        service: Option<String>,
    },
    /// `ignore`
    Ignore(ArtistId),
    /// `unignore`
    Unignore(ArtistId),
    /// `complete`
    Complete(ArtistId),
    /// `uncomplete`
    Uncomplete(ArtistId),
    /// `config`
    Config {
        /// Artist
        artist: ArtistId,
        /// Fields to change; empty shows the current overrides
        update: OverridesUpdate,
    },
    /// `check`
    Check(ArtistId),
    /// `check-all`
    CheckAll,
    /// `check-from`
    CheckFrom(ArtistId, NaiveDateTime),
    /// `check-until`
    CheckUntil(ArtistId, NaiveDateTime),
    /// `check-range`
    CheckRange(ArtistId, NaiveDateTime, NaiveDateTime),
    /// `tasks`
    Tasks,
    /// `cancel`
    Cancel(TaskId),
    /// `cancel-all`
    CancelAll,
    /// `update-cache-basic` / `update-cache-full`
    UpdateCache {
        /// Artist
        artist: ArtistId,
        /// Fetch post details too
        full: bool,
    },
    /// `update-all-basic` / `update-all-full`
    UpdateAll {
        /// Fetch post details too
        full: bool,
    },
    /// `reset`
    Reset(ArtistId, ResetCutoff),
    /// `reset-all`
    ResetAll,
    /// `list-incomplete`
    ListIncomplete(ArtistId),
    /// `list-incomplete-all`
    ListIncompleteAll,
    /// `dedupe`
    Dedupe(ArtistId),
    /// `dedupe-all`
    DedupeAll,
    /// `help`
    Help,
    /// `exit`
    Exit,
}

/// Key/value parameters of one command line
struct Params {
    kind: CommandKind,
    values: HashMap<String, String>,
}

impl Params {
    fn optional(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.optional(key).ok_or_else(|| {
            CommandError::MissingParam {
                command: self.kind.name().to_string(),
                param: key.to_string(),
            }
            .into()
        })
    }

    fn invalid(&self, key: &str, value: &str, reason: impl Into<String>) -> crate::Error {
        CommandError::InvalidParam {
            command: self.kind.name().to_string(),
            param: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
        .into()
    }

    fn artist(&self) -> Result<ArtistId> {
        Ok(ArtistId::from(self.required("artist")?))
    }

    fn date(&self, key: &str, end_of_day: bool) -> Result<Option<NaiveDateTime>> {
        self.optional(key)
            .map(|value| {
                parse_date(value, end_of_day).ok_or_else(|| {
                    self.invalid(key, value, "expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS")
                })
            })
            .transpose()
    }

    fn required_date(&self, key: &str, end_of_day: bool) -> Result<NaiveDateTime> {
        self.required(key)?;
        self.date(key, end_of_day)?.ok_or_else(|| {
            CommandError::MissingParam {
                command: self.kind.name().to_string(),
                param: key.to_string(),
            }
            .into()
        })
    }

    /// `none` clears the field, anything else goes through `parse`
    fn clearable<T>(
        &self,
        key: &str,
        expected: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<Option<T>>> {
        match self.optional(key) {
            None => Ok(None),
            Some(value) if value.eq_ignore_ascii_case("none") => Ok(Some(None)),
            Some(value) => parse(value)
                .map(|parsed| Some(Some(parsed)))
                .ok_or_else(|| self.invalid(key, value, expected)),
        }
    }

    fn flag(&self, key: &str) -> Result<bool> {
        match self.optional(key) {
            None => Ok(false),
            Some("true" | "1" | "yes") => Ok(true),
            Some("false" | "0" | "no") => Ok(false),
            Some(other) => Err(self.invalid(key, other, "expected true or false")),
        }
    }
}

impl Command {
    /// Parse `name[:key=value[,key=value...]]`
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (name, rest) = match line.split_once(':') {
            Some((name, rest)) => (name.trim(), rest),
            None => (line, ""),
        };
        let kind = CommandKind::from_name(name).ok_or_else(|| CommandError::Unknown {
            name: name.to_string(),
        })?;

        let mut values = HashMap::new();
        for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim();
            if !kind.params().contains(&key) {
                return Err(CommandError::InvalidParam {
                    command: kind.name().to_string(),
                    param: key.to_string(),
                    value: value.to_string(),
                    reason: format!("unknown parameter, accepted: {}", kind.params().join(", ")),
                }
                .into());
            }
            values.insert(key.to_string(), value.trim().to_string());
        }

        Self::from_params(Params { kind, values })
    }

    fn from_params(params: Params) -> Result<Self> {
        Ok(match params.kind {
            CommandKind::Add => Command::Add(parse_new_artist(&params)?),
            CommandKind::Remove => Command::Remove(params.artist()?),
            CommandKind::List => {
                let sort_by = match params.optional("sort_by") {
                    None | Some("name") => SortBy::Name,
                    Some("status") => SortBy::Status,
                    Some("posts") => SortBy::Posts,
                    Some("recent") => SortBy::Recent,
                    Some(other) => {
                        return Err(params.invalid(
                            "sort_by",
                            other,
                            "expected name, status, posts or recent",
                        ));
                    }
                };
                Command::List {
                    sort_by,
                    all: params.flag("all")?,
                    service: params.optional("service").map(str::to_string),
                }
            }
            CommandKind::Ignore => Command::Ignore(params.artist()?),
            CommandKind::Unignore => Command::Unignore(params.artist()?),
            CommandKind::Complete => Command::Complete(params.artist()?),
            CommandKind::Uncomplete => Command::Uncomplete(params.artist()?),
            CommandKind::Config => Command::Config {
                artist: params.artist()?,
                update: parse_overrides_update(&params)?,
            },
            CommandKind::Check => Command::Check(params.artist()?),
            CommandKind::CheckAll => Command::CheckAll,
            CommandKind::CheckFrom => {
                Command::CheckFrom(params.artist()?, params.required_date("from", false)?)
            }
            CommandKind::CheckUntil => {
                Command::CheckUntil(params.artist()?, params.required_date("until", true)?)
            }
            CommandKind::CheckRange => {
                let from = params.required_date("from", false)?;
                let until = params.required_date("until", true)?;
                if until < from {
                    return Err(params.invalid(
                        "until",
                        params.optional("until").unwrap_or_default(),
                        "must not be before from",
                    ));
                }
                Command::CheckRange(params.artist()?, from, until)
            }
            CommandKind::Tasks => Command::Tasks,
            CommandKind::Cancel => {
                let raw = params.required("id")?;
                let id = raw
                    .parse::<TaskId>()
                    .map_err(|_| params.invalid("id", raw, "expected a task id"))?;
                Command::Cancel(id)
            }
            CommandKind::CancelAll => Command::CancelAll,
            CommandKind::UpdateCacheBasic => Command::UpdateCache {
                artist: params.artist()?,
                full: false,
            },
            CommandKind::UpdateCacheFull => Command::UpdateCache {
                artist: params.artist()?,
                full: true,
            },
            CommandKind::UpdateAllBasic => Command::UpdateAll { full: false },
            CommandKind::UpdateAllFull => Command::UpdateAll { full: true },
            CommandKind::Reset => {
                let cutoff = match params.optional("last_date") {
                    None | Some("") => ResetCutoff::Checkpoint,
                    Some(value) if value.eq_ignore_ascii_case("none") => ResetCutoff::All,
                    Some(_) => match params.date("last_date", false)? {
                        Some(date) => ResetCutoff::Date(date),
                        None => ResetCutoff::Checkpoint,
                    },
                };
                Command::Reset(params.artist()?, cutoff)
            }
            CommandKind::ResetAll => Command::ResetAll,
            CommandKind::ListIncomplete => Command::ListIncomplete(params.artist()?),
            CommandKind::ListIncompleteAll => Command::ListIncompleteAll,
            CommandKind::Dedupe => Command::Dedupe(params.artist()?),
            CommandKind::DedupeAll => Command::DedupeAll,
            CommandKind::Help => Command::Help,
            CommandKind::Exit => Command::Exit,
        })
    }

    /// Kind of this command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Add(_) => CommandKind::Add,
            Command::Remove(_) => CommandKind::Remove,
            Command::List { .. } => CommandKind::List,
            Command::Ignore(_) => CommandKind::Ignore,
            Command::Unignore(_) => CommandKind::Unignore,
            Command::Complete(_) => CommandKind::Complete,
            Command::Uncomplete(_) => CommandKind::Uncomplete,
            Command::Config { .. } => CommandKind::Config,
            Command::Check(_) => CommandKind::Check,
            Command::CheckAll => CommandKind::CheckAll,
            Command::CheckFrom(..) => CommandKind::CheckFrom,
            Command::CheckUntil(..) => CommandKind::CheckUntil,
            Command::CheckRange(..) => CommandKind::CheckRange,
            Command::Tasks => CommandKind::Tasks,
            Command::Cancel(_) => CommandKind::Cancel,
            Command::CancelAll => CommandKind::CancelAll,
            Command::UpdateCache { full: false, .. } => CommandKind::UpdateCacheBasic,
            Command::UpdateCache { full: true, .. } => CommandKind::UpdateCacheFull,
            Command::UpdateAll { full: false } => CommandKind::UpdateAllBasic,
            Command::UpdateAll { full: true } => CommandKind::UpdateAllFull,
            Command::Reset(..) => CommandKind::Reset,
            Command::ResetAll => CommandKind::ResetAll,
            Command::ListIncomplete(_) => CommandKind::ListIncomplete,
            Command::ListIncompleteAll => CommandKind::ListIncompleteAll,
            Command::Dedupe(_) => CommandKind::Dedupe,
            Command::DedupeAll => CommandKind::DedupeAll,
            Command::Help => CommandKind::Help,
            Command::Exit => CommandKind::Exit,
        }
    }
}

fn parse_new_artist(params: &Params) -> Result<NewArtist> {
    let (service, user_id, url) = match params.optional("url") {
        Some(raw) => {
            let (service, user_id) = parse_artist_url(raw)
                .ok_or_else(|| params.invalid("url", raw, "expected .../{service}/user/{id}"))?;
            (service, user_id, raw.to_string())
        }
        None => {
            let service = params.required("service")?.to_string();
            let user_id = params.required("user_id")?.to_string();
            let url = format!("/{}/user/{}", service, user_id);
            (service, user_id, url)
        }
    };

    const ID_CHARS: &str = "expected letters, digits, '.', '_' or '-', not starting with '.'";
    if !is_safe_id_part(&service) {
        return Err(params.invalid("service", &service, ID_CHARS));
    }
    if !is_safe_id_part(&user_id) {
        return Err(params.invalid("user_id", &user_id, ID_CHARS));
    }

    Ok(NewArtist {
        service,
        user_id,
        url,
        name: params.optional("name").filter(|n| !n.is_empty()).map(str::to_string),
        alias: params.optional("alias").filter(|a| !a.is_empty()).map(str::to_string),
        last_date: params.date("last_date", false)?,
    })
}

fn parse_overrides_update(params: &Params) -> Result<OverridesUpdate> {
    let timer = match params.optional("timer") {
        None => None,
        Some(value) if value.eq_ignore_ascii_case("none") => Some(None),
        Some(value) => Some(Some(
            value
                .parse::<CheckTimer>()
                .map_err(|reason| params.invalid("timer", value, reason))?,
        )),
    };
    Ok(OverridesUpdate {
        timer,
        checkpoint: params.clearable("checkpoint", "expected per_post, per_artist or none", |v| {
            match v {
                "per_post" => Some(CheckpointPolicy::PerPost),
                "per_artist" => Some(CheckpointPolicy::PerArtist),
                _ => None,
            }
        })?,
        max_files: params.clearable("max_files", "expected a positive number or none", |v| {
            v.parse::<usize>().ok().filter(|n| *n > 0)
        })?,
        download_dir: params.clearable("download_dir", "expected a path or none", |v| {
            (!v.is_empty()).then(|| PathBuf::from(v))
        })?,
    })
}

/// Extract `(service, user_id)` from an artist page URL
pub fn parse_artist_url(raw: &str) -> Option<(String, String)> {
    let url = url::Url::parse(raw).ok()?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let position = segments.iter().position(|s| *s == "user")?;
    let service = segments.get(position.checked_sub(1)?)?;
    let user_id = segments.get(position + 1)?;
    Some((service.to_string(), user_id.to_string()))
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`
///
/// A bare date means the start of the day, or its last second when
/// `end_of_day` is set.
pub fn parse_date(value: &str, end_of_day: bool) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(datetime);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
}
