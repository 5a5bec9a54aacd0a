use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Names {
    #[serde(default)]
    pub international: String,
    #[serde(default)]
    pub japanese: Option<String>,
}

/// A game as returned by `games` and `games/{id}`.
///
/// Bulk listings only carry the id, names and abbreviation, so every date
/// field is optional.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Game {
    pub id: String,
    #[serde(default)]
    pub names: Names,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub released: Option<i32>,
    #[serde(default, rename = "release-date")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

impl Game {
    pub fn name(&self) -> &str {
        if self.names.international.is_empty() {
            &self.id
        } else {
            &self.names.international
        }
    }

    pub fn release_day(&self) -> Option<NaiveDate> {
        self.release_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryKind {
    #[default]
    PerGame,
    PerLevel,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: CategoryKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Level {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Country {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Location {
    pub country: Country,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub names: Names,
    #[serde(default)]
    pub signup: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl User {
    pub fn country_code(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.country.code.as_str())
    }
}

/// Participant of a run. Guests have no account and are known only by name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "rel", rename_all = "lowercase")]
pub enum PlayerRef {
    User { id: String },
    Guest { name: String },
}

impl PlayerRef {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            PlayerRef::User { id } => Some(id),
            PlayerRef::Guest { .. } => None,
        }
    }

    /// The user id, or the guest name when there is no account.
    pub fn key(&self) -> &str {
        match self {
            PlayerRef::User { id } => id,
            PlayerRef::Guest { name } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Times {
    #[serde(default)]
    pub primary_t: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub game: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub players: Vec<PlayerRef>,
    #[serde(default)]
    pub times: Times,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Placement {
    pub place: u32,
    pub run: Run,
}

/// Personal bests share the placement shape.
pub type PersonalBest = Placement;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Leaderboard {
    pub game: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub runs: Vec<Placement>,
}

impl Leaderboard {
    pub fn top(&self) -> Option<&Placement> {
        self.runs.first()
    }
}
