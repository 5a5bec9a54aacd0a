use crate::error::Result;
use crate::model::Game;
use crate::output::{EntityWriter, entity_file_name};
use crate::resolver::{GameListing, SpeedrunApi};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Position in a crawl: the top-level entity and the item within its
/// sub-list (player, category) to start from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity_index: usize,
    pub sub_index: usize,
}

impl Checkpoint {
    pub fn new(entity_index: usize, sub_index: usize) -> Self {
        Self {
            entity_index,
            sub_index,
        }
    }

    pub fn at_sub(self, sub_index: usize) -> Self {
        Self { sub_index, ..self }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity {} / sub {}", self.entity_index, self.sub_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Pending(usize),
    InProgress { entity_index: usize, sub_index: usize },
    Done(usize),
    Finished,
}

/// Iterator over `(checkpoint, entity)` starting at a checkpoint.
pub struct ResumableEntities<'a> {
    entities: &'a [Game],
    next: usize,
    first_sub: Option<usize>,
}

impl<'a> Iterator for ResumableEntities<'a> {
    type Item = (Checkpoint, &'a Game);

    fn next(&mut self) -> Option<Self::Item> {
        let game = self.entities.get(self.next)?;
        let sub_index = self.first_sub.take().unwrap_or(0);
        let checkpoint = Checkpoint::new(self.next, sub_index);
        self.next += 1;
        Some((checkpoint, game))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entities.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// Walk `entities` from `from`. Only the first yielded entity carries the
/// checkpoint's sub index; every later one starts at 0.
pub fn resume(entities: &[Game], from: Checkpoint) -> ResumableEntities<'_> {
    ResumableEntities {
        entities,
        next: from.entity_index,
        first_sub: Some(from.sub_index),
    }
}

/// Result of collecting one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    Complete { rows: usize },
    /// The entity itself is absent or unusable; nothing to collect.
    Skipped { reason: String },
    /// A sub-item failed. Rows written before `checkpoint` are kept.
    Aborted { checkpoint: Checkpoint, reason: String },
}

/// What the driver does after an entity aborts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AbortPolicy {
    /// Stop and report the failing checkpoint.
    #[default]
    Halt,
    /// Log the failure and carry on with the next entity.
    SkipEntity,
}

/// Produces association records for one top-level entity.
pub trait EntityCollector {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    fn header(&self) -> &'static [&'static str];

    /// Collect `game` starting at `checkpoint.sub_index`, appending rows
    /// to `writer`. Remote failures on a sub-item end in
    /// [`CollectOutcome::Aborted`]; local failures are returned as errors.
    fn collect<A: SpeedrunApi>(
        &self,
        api: &A,
        checkpoint: Checkpoint,
        game: &Game,
        writer: &mut EntityWriter,
    ) -> impl Future<Output = Result<CollectOutcome>>;
}

/// Callback invoked when an entity starts
pub type CrawlProgressCallback = Arc<dyn Fn(Checkpoint, &Game) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct AbortedEntity {
    pub game_id: String,
    pub checkpoint: Checkpoint,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlReport {
    pub total: usize,
    pub processed: usize,
    pub rows_written: usize,
    pub skipped: Vec<String>,
    pub aborted: Vec<AbortedEntity>,
    pub halted_at: Option<Checkpoint>,
    pub state: CrawlState,
}

impl CrawlReport {
    fn new(total: usize, start: Checkpoint) -> Self {
        Self {
            total,
            processed: 0,
            rows_written: 0,
            skipped: Vec::new(),
            aborted: Vec::new(),
            halted_at: None,
            state: CrawlState::Pending(start.entity_index),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == CrawlState::Finished
    }

    /// Where a later run should pick up: the failing checkpoint after a
    /// halt, otherwise past the last entity.
    pub fn resume_checkpoint(&self) -> Checkpoint {
        self.halted_at
            .unwrap_or_else(|| Checkpoint::new(self.total, 0))
    }

    fn record(&mut self, checkpoint: Checkpoint, game: &Game, outcome: CollectOutcome, rows: usize) {
        self.rows_written += rows;
        match outcome {
            CollectOutcome::Complete { rows } => {
                self.processed += 1;
                self.state = CrawlState::Done(checkpoint.entity_index);
                info!(
                    index = checkpoint.entity_index,
                    game = %game.id,
                    rows,
                    "entity complete"
                );
            }
            CollectOutcome::Skipped { reason } => {
                warn!(index = checkpoint.entity_index, game = %game.id, "skipped: {}", reason);
                self.skipped.push(game.id.clone());
            }
            CollectOutcome::Aborted { checkpoint, reason } => {
                warn!(
                    index = checkpoint.entity_index,
                    sub = checkpoint.sub_index,
                    game = %game.id,
                    "aborted: {}",
                    reason
                );
                self.aborted.push(AbortedEntity {
                    game_id: game.id.clone(),
                    checkpoint,
                    reason,
                });
            }
        }
    }
}

/// Walks the ordered entity list from a checkpoint, handing each entity to
/// a collector that writes its own output file.
pub struct CrawlDriver {
    output_dir: PathBuf,
    start: Checkpoint,
    abort_policy: AbortPolicy,
    listing: GameListing,
    progress_callback: Option<CrawlProgressCallback>,
}

impl CrawlDriver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            start: Checkpoint::default(),
            abort_policy: AbortPolicy::default(),
            listing: GameListing::Bulk,
            progress_callback: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.start = checkpoint;
        self
    }

    pub fn with_abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    pub fn with_listing(mut self, listing: GameListing) -> Self {
        self.listing = listing;
        self
    }

    pub fn with_progress_callback(mut self, callback: CrawlProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn start(&self) -> Checkpoint {
        self.start
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Every game in release order, the top-level entity list.
    pub async fn load_entities<A: SpeedrunApi>(&self, api: &A) -> Result<Vec<Game>> {
        let games = api.list_games(self.listing).await?;
        info!(count = games.len(), "entity list loaded");
        Ok(games)
    }

    pub async fn run<A, C>(&self, api: &A, collector: &C) -> Result<CrawlReport>
    where
        A: SpeedrunApi,
        C: EntityCollector,
    {
        let entities = self.load_entities(api).await?;
        self.run_entities(api, collector, &entities).await
    }

    pub async fn run_concurrent<A, C>(&self, api: &A, collector: &C, workers: usize) -> Result<CrawlReport>
    where
        A: SpeedrunApi,
        C: EntityCollector,
    {
        let entities = self.load_entities(api).await?;
        self.run_entities_concurrent(api, collector, &entities, workers)
            .await
    }

    pub async fn run_entities<A, C>(&self, api: &A, collector: &C, entities: &[Game]) -> Result<CrawlReport>
    where
        A: SpeedrunApi,
        C: EntityCollector,
    {
        let mut report = CrawlReport::new(entities.len(), self.start);
        info!(
            collector = collector.name(),
            total = entities.len(),
            start = %self.start,
            "crawl starting"
        );

        for (checkpoint, game) in resume(entities, self.start) {
            report.state = CrawlState::InProgress {
                entity_index: checkpoint.entity_index,
                sub_index: checkpoint.sub_index,
            };
            self.notify(checkpoint, game);

            let (outcome, rows) = self.collect_one(api, collector, checkpoint, game).await?;
            let halted = match &outcome {
                CollectOutcome::Aborted { checkpoint, .. } if self.abort_policy == AbortPolicy::Halt => {
                    Some(*checkpoint)
                }
                _ => None,
            };
            report.record(checkpoint, game, outcome, rows);

            if let Some(at) = halted {
                report.halted_at = Some(at);
                report.state = CrawlState::InProgress {
                    entity_index: at.entity_index,
                    sub_index: at.sub_index,
                };
                warn!(resume = %at, "crawl halted");
                return Ok(report);
            }
        }

        report.state = CrawlState::Finished;
        info!(
            processed = report.processed,
            rows = report.rows_written,
            skipped = report.skipped.len(),
            aborted = report.aborted.len(),
            "crawl finished"
        );
        Ok(report)
    }

    /// Collect up to `workers` distinct entities at a time.
    ///
    /// Under [`AbortPolicy::Halt`] an abort stops new entities from being
    /// started; those already in flight finish. The report then resumes at
    /// the lowest aborted checkpoint. Under [`AbortPolicy::SkipEntity`]
    /// aborts are only recorded.
    pub async fn run_entities_concurrent<A, C>(
        &self,
        api: &A,
        collector: &C,
        entities: &[Game],
        workers: usize,
    ) -> Result<CrawlReport>
    where
        A: SpeedrunApi,
        C: EntityCollector,
    {
        let mut report = CrawlReport::new(entities.len(), self.start);
        info!(
            collector = collector.name(),
            total = entities.len(),
            workers,
            start = %self.start,
            "concurrent crawl starting"
        );

        let halting = AtomicBool::new(false);
        let halting = &halting;
        let mut results: Vec<_> = stream::iter(resume(entities, self.start))
            .map(|(checkpoint, game)| async move {
                if halting.load(Ordering::SeqCst) {
                    debug!(index = checkpoint.entity_index, game = %game.id, "not started after halt");
                    return (checkpoint, game, None);
                }
                self.notify(checkpoint, game);
                let result = self.collect_one(api, collector, checkpoint, game).await;
                if self.abort_policy == AbortPolicy::Halt
                    && matches!(result, Ok((CollectOutcome::Aborted { .. }, _)))
                {
                    halting.store(true, Ordering::SeqCst);
                }
                (checkpoint, game, Some(result))
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;
        results.sort_by_key(|(checkpoint, _, _)| checkpoint.entity_index);

        for (checkpoint, game, result) in results {
            let Some(result) = result else {
                continue;
            };
            let (outcome, rows) = result?;
            report.record(checkpoint, game, outcome, rows);
        }

        if self.abort_policy == AbortPolicy::Halt
            && let Some(at) = report
                .aborted
                .iter()
                .map(|aborted| aborted.checkpoint)
                .min_by_key(|checkpoint| (checkpoint.entity_index, checkpoint.sub_index))
        {
            report.halted_at = Some(at);
            report.state = CrawlState::InProgress {
                entity_index: at.entity_index,
                sub_index: at.sub_index,
            };
            warn!(resume = %at, "concurrent crawl halted");
            return Ok(report);
        }

        report.state = CrawlState::Finished;
        info!(
            processed = report.processed,
            rows = report.rows_written,
            skipped = report.skipped.len(),
            aborted = report.aborted.len(),
            "crawl finished"
        );
        Ok(report)
    }

    fn notify(&self, checkpoint: Checkpoint, game: &Game) {
        debug!(
            index = checkpoint.entity_index,
            sub = checkpoint.sub_index,
            game = %game.id,
            "entity in progress"
        );
        if let Some(callback) = &self.progress_callback {
            callback(checkpoint, game);
        }
    }

    async fn collect_one<A, C>(
        &self,
        api: &A,
        collector: &C,
        checkpoint: Checkpoint,
        game: &Game,
    ) -> Result<(CollectOutcome, usize)>
    where
        A: SpeedrunApi,
        C: EntityCollector,
    {
        let path = self
            .output_dir
            .join(entity_file_name(checkpoint.entity_index, game.name()));
        let mut writer = EntityWriter::open(&path, collector.header())?;
        let outcome = collector.collect(api, checkpoint, game, &mut writer).await?;
        Ok((outcome, writer.rows_written()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn games(ids: &[&str]) -> Vec<Game> {
        ids.iter()
            .map(|id| serde_json::from_value(serde_json::json!({"id": id})).unwrap())
            .collect()
    }

    #[test]
    fn test_resume_first_entity_keeps_sub_index() {
        let entities = games(&["a", "b", "c", "d"]);
        let items: Vec<_> = resume(&entities, Checkpoint::new(2, 7))
            .map(|(cp, game)| (cp, game.id.clone()))
            .collect();

        assert_eq!(
            items,
            vec![
                (Checkpoint::new(2, 7), "c".to_string()),
                (Checkpoint::new(3, 0), "d".to_string()),
            ]
        );
    }

    #[test]
    fn test_resume_past_end_is_empty() {
        let entities = games(&["a", "b"]);
        assert_eq!(resume(&entities, Checkpoint::new(5, 0)).count(), 0);
        assert_eq!(resume(&entities, Checkpoint::new(2, 3)).count(), 0);
    }

    #[test]
    fn test_resume_from_start() {
        let entities = games(&["a", "b"]);
        let checkpoints: Vec<_> = resume(&entities, Checkpoint::default()).map(|(cp, _)| cp).collect();
        assert_eq!(checkpoints, vec![Checkpoint::new(0, 0), Checkpoint::new(1, 0)]);
    }

    #[test]
    fn test_report_resume_checkpoint() {
        let mut report = CrawlReport::new(10, Checkpoint::default());
        assert_eq!(report.resume_checkpoint(), Checkpoint::new(10, 0));
        report.halted_at = Some(Checkpoint::new(4, 2));
        assert_eq!(report.resume_checkpoint(), Checkpoint::new(4, 2));
    }
}
