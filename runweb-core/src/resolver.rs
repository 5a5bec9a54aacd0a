use crate::config::DenyList;
use crate::error::Result;
use crate::model::{Category, Game, Leaderboard, Level, PersonalBest, Run, User};
use chrono::NaiveDate;
use runweb_api::{ApiClient, ApiError, fetch_all};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Page size used when walking run listings.
pub const RUNS_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameListing {
    /// Ids and names only, 1000 per page.
    Bulk,
    /// Full game records including release and creation dates.
    Detailed,
}

impl GameListing {
    fn uri(self) -> &'static str {
        match self {
            GameListing::Bulk => "games?_bulk=yes&max=1000&orderby=released&direction=asc",
            GameListing::Detailed => "games?max=200&orderby=released&direction=asc",
        }
    }
}

/// Which board of a game to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderboardRef {
    Category(String),
    Level { level: String, category: String },
}

impl LeaderboardRef {
    fn path(&self, game: &str) -> String {
        match self {
            LeaderboardRef::Category(category) => {
                format!("leaderboards/{}/category/{}", game, category)
            }
            LeaderboardRef::Level { level, category } => {
                format!("leaderboards/{}/level/{}/{}", game, level, category)
            }
        }
    }
}

fn leaderboard_uri(game: &str, board: &LeaderboardRef, date: Option<NaiveDate>, top: bool) -> String {
    let mut query = Vec::new();
    if let Some(date) = date {
        query.push(format!("date={}", date.format("%Y-%m-%d")));
    }
    if top {
        query.push("top=1".to_string());
    }

    let path = board.path(game);
    if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}

/// Data access for every resource kind the collectors need.
///
/// Lookups return `Ok(None)` when the resource does not exist (or is
/// deny-listed); any other failure is an error.
pub trait SpeedrunApi {
    fn list_games(&self, listing: GameListing) -> impl Future<Output = Result<Vec<Game>>>;

    fn get_game(&self, id: &str) -> impl Future<Output = Result<Option<Game>>>;

    fn get_category(&self, id: &str) -> impl Future<Output = Result<Option<Category>>>;

    fn get_level(&self, id: &str) -> impl Future<Output = Result<Option<Level>>>;

    fn get_user(&self, id: &str) -> impl Future<Output = Result<Option<User>>>;

    fn game_categories(&self, game: &str) -> impl Future<Output = Result<Option<Vec<Category>>>>;

    fn game_levels(&self, game: &str) -> impl Future<Output = Result<Option<Vec<Level>>>>;

    fn get_leaderboard(
        &self,
        game: &str,
        board: &LeaderboardRef,
        date: Option<NaiveDate>,
    ) -> impl Future<Output = Result<Option<Leaderboard>>>;

    /// Only the first place of the board as it stood on `date`.
    fn get_leaderboard_top(
        &self,
        game: &str,
        board: &LeaderboardRef,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<Leaderboard>>>;

    /// Registered users with a verified run of the game, in first-seen order.
    fn game_players(&self, game: &str) -> impl Future<Output = Result<Option<Vec<String>>>>;

    fn user_personal_bests(&self, user: &str) -> impl Future<Output = Result<Option<Vec<PersonalBest>>>>;

    /// Every verified run submitted by `user`.
    fn user_runs(&self, user: &str) -> impl Future<Output = Result<Option<Vec<Run>>>>;
}

/// Write-once id -> value table. Absent results are remembered too.
pub struct MemoTable<T> {
    entries: Mutex<HashMap<String, Option<T>>>,
}

impl<T> Default for MemoTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MemoTable<T> {
    pub fn get(&self, id: &str) -> Option<Option<T>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Keeps the first value stored for `id` and returns it.
    pub fn insert(&self, id: &str, value: Option<T>) -> Option<T> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert(value)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local memo of resolved entities.
#[derive(Default)]
pub struct EntityMemo {
    pub games: MemoTable<Game>,
    pub categories: MemoTable<Category>,
    pub levels: MemoTable<Level>,
    pub users: MemoTable<User>,
    pub game_categories: MemoTable<Vec<Category>>,
    pub game_levels: MemoTable<Vec<Level>>,
}

/// [`SpeedrunApi`] over the HTTP client.
pub struct Resolver {
    client: ApiClient,
    memo: EntityMemo,
    deny: DenyList,
}

impl Resolver {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            memo: EntityMemo::default(),
            deny: DenyList::default(),
        }
    }

    pub fn with_deny_list(mut self, deny: DenyList) -> Self {
        self.deny = deny;
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn memo(&self) -> &EntityMemo {
        &self.memo
    }

    fn denied(&self, game: &str) -> bool {
        if self.deny.contains(game) {
            debug!(game, "deny-listed game treated as absent");
            true
        } else {
            false
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, uri: &str) -> Result<Option<T>> {
        match self.client.request(uri).await {
            Ok(mut body) => {
                let data = body.get_mut("data").map(Value::take).unwrap_or(Value::Null);
                let item = serde_json::from_value(data)
                    .map_err(|e| ApiError::ParseError(format!("{}: {}", uri, e)))?;
                Ok(Some(item))
            }
            Err(e) if e.is_not_found() => {
                debug!(uri, "resource absent");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_all<T: DeserializeOwned>(&self, uri: &str) -> Result<Option<Vec<T>>> {
        match fetch_all(&self.client, uri).await {
            Ok(items) => Ok(Some(items)),
            Err(e) if e.is_not_found() => {
                debug!(uri, "listing absent");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn memoized<T>(&self, table: &MemoTable<T>, id: &str, uri: String) -> Result<Option<T>>
    where
        T: DeserializeOwned + Clone,
    {
        if let Some(hit) = table.get(id) {
            return Ok(hit);
        }
        let value = self.lookup(&uri).await?;
        Ok(table.insert(id, value))
    }

    async fn memoized_list<T>(
        &self,
        table: &MemoTable<Vec<T>>,
        id: &str,
        uri: String,
    ) -> Result<Option<Vec<T>>>
    where
        T: DeserializeOwned + Clone,
    {
        if let Some(hit) = table.get(id) {
            return Ok(hit);
        }
        let value = self.lookup_all(&uri).await?;
        Ok(table.insert(id, value))
    }
}

impl SpeedrunApi for Resolver {
    async fn list_games(&self, listing: GameListing) -> Result<Vec<Game>> {
        let games: Vec<Game> = fetch_all(&self.client, listing.uri()).await?;
        debug!(count = games.len(), ?listing, "listed games");
        Ok(games)
    }

    async fn get_game(&self, id: &str) -> Result<Option<Game>> {
        if self.denied(id) {
            return Ok(None);
        }
        self.memoized(&self.memo.games, id, format!("games/{}", id)).await
    }

    async fn get_category(&self, id: &str) -> Result<Option<Category>> {
        self.memoized(&self.memo.categories, id, format!("categories/{}", id))
            .await
    }

    async fn get_level(&self, id: &str) -> Result<Option<Level>> {
        self.memoized(&self.memo.levels, id, format!("levels/{}", id)).await
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.memoized(&self.memo.users, id, format!("users/{}", id)).await
    }

    async fn game_categories(&self, game: &str) -> Result<Option<Vec<Category>>> {
        if self.denied(game) {
            return Ok(None);
        }
        self.memoized_list(
            &self.memo.game_categories,
            game,
            format!("games/{}/categories", game),
        )
        .await
    }

    async fn game_levels(&self, game: &str) -> Result<Option<Vec<Level>>> {
        if self.denied(game) {
            return Ok(None);
        }
        self.memoized_list(&self.memo.game_levels, game, format!("games/{}/levels", game))
            .await
    }

    async fn get_leaderboard(
        &self,
        game: &str,
        board: &LeaderboardRef,
        date: Option<NaiveDate>,
    ) -> Result<Option<Leaderboard>> {
        if self.denied(game) {
            return Ok(None);
        }
        self.lookup(&leaderboard_uri(game, board, date, false)).await
    }

    async fn get_leaderboard_top(
        &self,
        game: &str,
        board: &LeaderboardRef,
        date: NaiveDate,
    ) -> Result<Option<Leaderboard>> {
        if self.denied(game) {
            return Ok(None);
        }
        self.lookup(&leaderboard_uri(game, board, Some(date), true)).await
    }

    async fn game_players(&self, game: &str) -> Result<Option<Vec<String>>> {
        let Some(categories) = self.game_categories(game).await? else {
            return Ok(None);
        };

        let mut seen = HashSet::new();
        let mut players = Vec::new();
        for category in &categories {
            let uri = format!(
                "runs?game={}&category={}&status=verified&orderby=date&direction=asc&max={}",
                game, category.id, RUNS_PAGE_SIZE
            );
            let Some(runs) = self.lookup_all::<Run>(&uri).await? else {
                warn!(game, category = %category.id, "runs listing unavailable, skipping category");
                continue;
            };

            for run in &runs {
                for user in run.players.iter().filter_map(|p| p.user_id()) {
                    if seen.insert(user.to_string()) {
                        players.push(user.to_string());
                    }
                }
            }
        }

        debug!(game, players = players.len(), "resolved players");
        Ok(Some(players))
    }

    async fn user_personal_bests(&self, user: &str) -> Result<Option<Vec<PersonalBest>>> {
        self.lookup_all(&format!("users/{}/personal-bests", user)).await
    }

    async fn user_runs(&self, user: &str) -> Result<Option<Vec<Run>>> {
        self.lookup_all(&format!(
            "runs?user={}&status=verified&max={}",
            user, RUNS_PAGE_SIZE
        ))
        .await
    }
}
