pub mod collectors;
pub mod config;
pub mod crawl;
pub mod error;
pub mod graph;
pub mod model;
pub mod output;
pub mod preferences;
pub mod resolver;

pub use config::{DenyList, Settings};
pub use crawl::{AbortPolicy, Checkpoint, CollectOutcome, CrawlDriver, CrawlReport, CrawlState};
pub use error::CoreError;
pub use resolver::{LeaderboardRef, Resolver, SpeedrunApi};
