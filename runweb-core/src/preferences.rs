use crate::error::Result;
use crate::graph::{AggregateOptions, GameFilter, for_each_row};
use crate::model::{Run, User};
use crate::output::{EntityWriter, format_row};
use crate::resolver::SpeedrunApi;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

pub const USER_RUNS_HEADER: &[&str] = &["user", "num_runs"];

/// User id -> ids of the games they have records in.
pub type UserPreferences = BTreeMap<String, BTreeSet<String>>;

/// Profiles keyed by user id. `None` marks a user the API no longer knows.
pub type UserProfiles = HashMap<String, Option<User>>;

/// Build each user's set of games from the raw related-games files.
/// Games the filter rejects are left out.
pub fn user_preferences(dir: &Path, opts: &AggregateOptions, filter: Option<&GameFilter>) -> Result<UserPreferences> {
    let mut prefs = UserPreferences::new();

    let stats = for_each_row(dir, opts, |fields| {
        let user = &fields[opts.user_column];
        let game = &fields[opts.counterpart_column];
        if filter.is_some_and(|f| !f.allows(game)) {
            return;
        }
        prefs.entry(user.clone()).or_default().insert(game.clone());
    })?;

    info!(
        files = stats.files_scanned,
        users = prefs.len(),
        skipped = stats.skipped_rows,
        "user preferences built"
    );
    Ok(prefs)
}

/// Look up the profile of every user in `prefs`.
///
/// A user whose lookup fails upstream is recorded as unresolved; only
/// local failures end the job.
pub async fn fetch_profiles<A: SpeedrunApi>(api: &A, prefs: &UserPreferences) -> Result<UserProfiles> {
    let mut profiles = UserProfiles::with_capacity(prefs.len());
    for user in prefs.keys() {
        let profile = match api.get_user(user).await {
            Ok(profile) => profile,
            Err(e) if e.is_remote() => {
                warn!(user = %user, error = %e, "user profile lookup failed");
                None
            }
            Err(e) => return Err(e),
        };
        if profile.is_none() {
            debug!(user = %user, "user profile unavailable");
        }
        profiles.insert(user.clone(), profile);
    }
    Ok(profiles)
}

/// Write `user,signup_date,location,num_games,games`, the game list joined
/// into one quoted field.
///
/// Without `profiles` the signup and location columns are left empty. With
/// them, a user the API could not resolve is written as `Null`.
pub fn write_user_preferences(path: &Path, prefs: &UserPreferences, profiles: Option<&UserProfiles>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(format_row(&["user", "signup_date", "location", "num_games", "games"]).as_bytes())?;

    for (user, games) in prefs {
        let (signup, location) = match profiles.map(|p| p.get(user)) {
            None => (String::new(), String::new()),
            Some(Some(Some(profile))) => (
                profile.signup.clone().unwrap_or_default(),
                profile.country_code().unwrap_or_default().to_string(),
            ),
            Some(_) => ("Null".to_string(), "Null".to_string()),
        };
        let count = games.len().to_string();
        let joined = games.iter().map(String::as_str).collect::<Vec<_>>().join(",");

        out.write_all(
            format_row(&[
                user.as_str(),
                signup.as_str(),
                location.as_str(),
                count.as_str(),
                joined.as_str(),
            ])
            .as_bytes(),
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Every distinct user found in the raw related-games files, sorted.
pub fn corpus_users(dir: &Path, opts: &AggregateOptions) -> Result<Vec<String>> {
    let mut users = BTreeSet::new();
    let stats = for_each_row(dir, opts, |fields| {
        users.insert(fields[opts.user_column].clone());
    })?;
    debug!(files = stats.files_scanned, users = users.len(), "corpus users collected");
    Ok(users.into_iter().collect())
}

/// Runs dated before `cutoff`. Undated runs are not counted.
pub fn runs_before(runs: &[Run], cutoff: NaiveDate) -> usize {
    runs.iter()
        .filter_map(|run| run.date.as_deref())
        .filter_map(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .filter(|date| *date < cutoff)
        .count()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRunsReport {
    pub total: usize,
    pub written: usize,
    pub unresolved: usize,
    /// Index of the user whose lookup failed; pass it back as the start
    /// index to carry on.
    pub halted_at: Option<usize>,
}

/// Append `user,num_runs` for `users[start_index..]`, counting each
/// user's verified runs dated before `cutoff`.
///
/// Starting at index 0 replaces the file; any other start appends to it.
/// Users the API does not know are written as `Null`. A remote failure
/// stops the walk at that user and is reported in `halted_at`.
pub async fn write_user_run_counts<A: SpeedrunApi>(
    api: &A,
    path: &Path,
    users: &[String],
    start_index: usize,
    cutoff: NaiveDate,
) -> Result<UserRunsReport> {
    if start_index == 0 && path.exists() {
        fs::remove_file(path)?;
    }
    let mut writer = EntityWriter::open(path, USER_RUNS_HEADER)?;
    let mut report = UserRunsReport {
        total: users.len(),
        ..Default::default()
    };

    for (index, user) in users.iter().enumerate().skip(start_index) {
        debug!(index, total = users.len(), user = %user, "counting runs");
        match api.user_runs(user).await {
            Ok(Some(runs)) => {
                let count = runs_before(&runs, cutoff).to_string();
                writer.append_row(&[user.as_str(), count.as_str()])?;
            }
            Ok(None) => {
                writer.append_row(&[user.as_str(), "Null"])?;
                report.unresolved += 1;
            }
            Err(e) if e.is_remote() => {
                warn!(index, user = %user, error = %e, "run listing failed, stopping");
                report.halted_at = Some(index);
                break;
            }
            Err(e) => return Err(e),
        }
        report.written += 1;
    }

    info!(
        written = report.written,
        unresolved = report.unresolved,
        path = %path.display(),
        "user run counts written"
    );
    Ok(report)
}
