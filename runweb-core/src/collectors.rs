use crate::crawl::{Checkpoint, CollectOutcome, EntityCollector};
use crate::error::{CoreError, Result};
use crate::model::{CategoryKind, Game};
use crate::output::{EntityWriter, format_row};
use crate::resolver::{GameListing, LeaderboardRef, SpeedrunApi};
use chrono::{Days, NaiveDate};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

pub const RELATED_GAMES_HEADER: &[&str] = &["game", "user", "related_game", "category", "level", "place"];

pub const RECORD_HISTORY_HEADER: &[&str] = &[
    "game_name",
    "game_id",
    "category_name",
    "category_id",
    "date",
    "user_id",
    "run_id",
    "time",
];

pub const GAMES_METADATA_HEADER: &[&str] = &["id", "name", "abbreviation", "release_date", "created"];

/// Remote failures become an abort at `checkpoint`, local ones propagate.
fn abort_or_fail(err: CoreError, checkpoint: Checkpoint) -> Result<CollectOutcome> {
    if err.is_remote() {
        Ok(CollectOutcome::Aborted {
            checkpoint,
            reason: err.to_string(),
        })
    } else {
        Err(err)
    }
}

/// For every player of a game, the games they hold personal bests in.
///
/// The sub-list is the game's players in first-seen order; each row links
/// the game to one personal best of one player.
#[derive(Debug, Clone, Default)]
pub struct RelatedGamesCollector;

impl EntityCollector for RelatedGamesCollector {
    fn name(&self) -> &'static str {
        "related-games"
    }

    fn header(&self) -> &'static [&'static str] {
        RELATED_GAMES_HEADER
    }

    async fn collect<A: SpeedrunApi>(
        &self,
        api: &A,
        checkpoint: Checkpoint,
        game: &Game,
        writer: &mut EntityWriter,
    ) -> Result<CollectOutcome> {
        let players = match api.game_players(&game.id).await {
            Ok(Some(players)) => players,
            Ok(None) => {
                return Ok(CollectOutcome::Skipped {
                    reason: "game unavailable".to_string(),
                });
            }
            Err(e) => return abort_or_fail(e, checkpoint),
        };
        debug!(game = %game.id, players = players.len(), "players resolved");

        for (sub_index, user) in players.iter().enumerate().skip(checkpoint.sub_index) {
            let at = checkpoint.at_sub(sub_index);
            let bests = match api.user_personal_bests(user).await {
                Ok(Some(bests)) => bests,
                Ok(None) => {
                    warn!(user = %user, sub = sub_index, "personal bests unavailable, skipping player");
                    continue;
                }
                Err(e) => return abort_or_fail(e, at),
            };

            for best in &bests {
                let place = best.place.to_string();
                writer.append_row(&[
                    game.id.as_str(),
                    user.as_str(),
                    best.run.game.as_str(),
                    best.run.category.as_deref().unwrap_or_default(),
                    best.run.level.as_deref().unwrap_or_default(),
                    place.as_str(),
                ])?;
            }
        }

        Ok(CollectOutcome::Complete {
            rows: writer.rows_written(),
        })
    }
}

/// Weekly history of the record holder of each full-game category, from a
/// week after release up to (excluding) `end_date`.
#[derive(Debug, Clone)]
pub struct RecordHistoryCollector {
    pub end_date: NaiveDate,
}

impl RecordHistoryCollector {
    pub fn new(end_date: NaiveDate) -> Self {
        Self { end_date }
    }
}

impl EntityCollector for RecordHistoryCollector {
    fn name(&self) -> &'static str {
        "record-history"
    }

    fn header(&self) -> &'static [&'static str] {
        RECORD_HISTORY_HEADER
    }

    async fn collect<A: SpeedrunApi>(
        &self,
        api: &A,
        checkpoint: Checkpoint,
        game: &Game,
        writer: &mut EntityWriter,
    ) -> Result<CollectOutcome> {
        // Bulk listings carry no release date
        let release = match game.release_day() {
            Some(day) => Some(day),
            None => match api.get_game(&game.id).await {
                Ok(detail) => detail.and_then(|g| g.release_day()),
                Err(e) => return abort_or_fail(e, checkpoint),
            },
        };
        let Some(release) = release else {
            return Ok(CollectOutcome::Skipped {
                reason: "no release date".to_string(),
            });
        };

        let categories = match api.game_categories(&game.id).await {
            Ok(Some(categories)) => categories,
            Ok(None) => {
                return Ok(CollectOutcome::Skipped {
                    reason: "game unavailable".to_string(),
                });
            }
            Err(e) => return abort_or_fail(e, checkpoint),
        };
        let per_game: Vec<_> = categories
            .into_iter()
            .filter(|c| c.kind == CategoryKind::PerGame)
            .collect();

        for (sub_index, category) in per_game.iter().enumerate().skip(checkpoint.sub_index) {
            let at = checkpoint.at_sub(sub_index);
            let board = LeaderboardRef::Category(category.id.clone());

            let mut date = release + Days::new(7);
            while date < self.end_date {
                let leaderboard = match api.get_leaderboard_top(&game.id, &board, date).await {
                    Ok(Some(leaderboard)) => leaderboard,
                    Ok(None) => {
                        warn!(category = %category.id, %date, "leaderboard unavailable, skipping category");
                        break;
                    }
                    Err(e) => return abort_or_fail(e, at),
                };

                // No record yet on this date
                if let Some(top) = leaderboard.top() {
                    let day = date.format("%Y-%m-%d").to_string();
                    let time = top.run.times.primary_t.to_string();
                    for player in &top.run.players {
                        writer.append_row(&[
                            game.name(),
                            game.id.as_str(),
                            category.name.as_str(),
                            category.id.as_str(),
                            day.as_str(),
                            player.key(),
                            top.run.id.as_str(),
                            time.as_str(),
                        ])?;
                    }
                }

                date = date + Days::new(7);
            }
        }

        Ok(CollectOutcome::Complete {
            rows: writer.rows_written(),
        })
    }
}

/// Write one metadata row per game. The file is replaced, not appended.
pub async fn collect_games_metadata<A: SpeedrunApi>(api: &A, path: &Path) -> Result<usize> {
    let games = api.list_games(GameListing::Detailed).await?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(format_row(GAMES_METADATA_HEADER).as_bytes())?;

    for game in &games {
        out.write_all(
            format_row(&[
                game.id.as_str(),
                game.name(),
                game.abbreviation.as_deref().unwrap_or_default(),
                game.release_date.as_deref().unwrap_or_default(),
                game.created.as_deref().unwrap_or_default(),
            ])
            .as_bytes(),
        )?;
    }
    out.flush()?;

    info!(games = games.len(), path = %path.display(), "games metadata written");
    Ok(games.len())
}
