use crate::config::DenyList;
use crate::error::{CoreError, Result};
use crate::output::{RecordReader, format_row};
use chrono::{DateTime, NaiveDate};
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Unordered pair of entity ids. `EdgeKey::new(a, b) == EdgeKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    low: String,
    high: String,
}

impl EdgeKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn endpoints(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn is_self_loop(&self) -> bool {
        self.low == self.high
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub weight: u64,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.source, &self.target)
    }
}

/// Weighted edges in the order their pair was first observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeList {
    edges: Vec<Edge>,
}

impl EdgeList {
    pub fn new(edges: Vec<Edge>) -> Self {
        Self { edges }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn weights(&self) -> HashMap<EdgeKey, u64> {
        self.edges.iter().map(|e| (e.key(), e.weight)).collect()
    }

    pub fn total_weight(&self) -> u64 {
        self.edges.iter().map(|e| e.weight).sum()
    }

    /// Keep only edges whose endpoints are both allowed.
    pub fn filtered(&self, filter: &GameFilter) -> Self {
        Self {
            edges: self
                .edges
                .iter()
                .filter(|e| filter.allows(&e.source) && filter.allows(&e.target))
                .cloned()
                .collect(),
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(format_row(&["source", "target", "weight"]).as_bytes())?;
        for edge in &self.edges {
            let weight = edge.weight.to_string();
            out.write_all(format_row(&[edge.source.as_str(), edge.target.as_str(), weight.as_str()]).as_bytes())?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read a `source,target,weight` file, optionally dropping edges that
    /// touch a game the filter rejects.
    pub fn read_csv(path: &Path, filter: Option<&GameFilter>) -> Result<Self> {
        let mut edges = Vec::new();
        for (line, record) in RecordReader::open(path)?.enumerate().skip(1) {
            let fields = record?;
            let [source, target, weight] = fields.as_slice() else {
                return Err(CoreError::Other(format!(
                    "{}:{}: expected 3 fields, found {}",
                    path.display(),
                    line + 1,
                    fields.len()
                )));
            };
            let weight = weight.trim().parse::<u64>().map_err(|e| {
                CoreError::Other(format!("{}:{}: invalid weight: {}", path.display(), line + 1, e))
            })?;

            if let Some(filter) = filter
                && !(filter.allows(source) && filter.allows(target))
            {
                continue;
            }
            edges.push(Edge {
                source: source.clone(),
                target: target.clone(),
                weight,
            });
        }
        Ok(Self { edges })
    }

    /// Undirected weighted graph for downstream analysis.
    pub fn to_graph(&self) -> UnGraph<String, u64> {
        let mut graph = UnGraph::new_undirected();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for edge in &self.edges {
            let source = *nodes
                .entry(edge.source.as_str())
                .or_insert_with(|| graph.add_node(edge.source.clone()));
            let target = *nodes
                .entry(edge.target.as_str())
                .or_insert_with(|| graph.add_node(edge.target.clone()));
            graph.add_edge(source, target, edge.weight);
        }
        graph
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub suffix: String,
    /// Leading share of the (name-sorted) files to read, in `(0, 1]`.
    pub fraction: f64,
    pub subject_column: usize,
    pub user_column: usize,
    pub counterpart_column: usize,
    pub min_columns: usize,
    pub skip_header: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            suffix: ".csv".to_string(),
            fraction: 1.0,
            subject_column: 0,
            user_column: 1,
            counterpart_column: 2,
            min_columns: 3,
            skip_header: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub files_scanned: usize,
    pub rows_read: usize,
    pub skipped_rows: usize,
    pub self_loops: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub edges: EdgeList,
    pub stats: AggregateStats,
}

/// Files in `dir` ending with the configured suffix, sorted by name and cut
/// to the leading fraction.
pub fn corpus_files(dir: &Path, opts: &AggregateOptions) -> Result<Vec<PathBuf>> {
    if !(opts.fraction > 0.0 && opts.fraction <= 1.0) {
        return Err(CoreError::Other(format!(
            "fraction must be in (0, 1], got {}",
            opts.fraction
        )));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_string_lossy().ends_with(&opts.suffix) {
            files.push(entry.path());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let keep = (files.len() as f64 * opts.fraction).ceil() as usize;
    files.truncate(keep.min(files.len()));
    Ok(files)
}

/// Visit every data row of the corpus. Short rows are counted in
/// `stats.skipped_rows` and not passed on.
pub(crate) fn for_each_row<F>(dir: &Path, opts: &AggregateOptions, mut visit: F) -> Result<AggregateStats>
where
    F: FnMut(&[String]),
{
    let files = corpus_files(dir, opts)?;
    let mut stats = AggregateStats::default();
    let min_columns = opts
        .min_columns
        .max(opts.subject_column + 1)
        .max(opts.user_column + 1)
        .max(opts.counterpart_column + 1);

    for path in &files {
        let records = RecordReader::open(path)?.skip(usize::from(opts.skip_header));
        for record in records {
            let fields = record?;
            stats.rows_read += 1;
            if fields.len() < min_columns {
                debug!(path = %path.display(), fields = fields.len(), "skipping short row");
                stats.skipped_rows += 1;
                continue;
            }
            visit(&fields);
        }
        stats.files_scanned += 1;
    }
    Ok(stats)
}

/// Count co-occurrences across every per-entity file in `dir`.
///
/// Each row contributes one unit of weight to the unordered pair of its
/// subject and counterpart columns. Pairs are emitted in the order they were
/// first seen and rows linking an entity to itself are dropped.
pub fn aggregate_dir(dir: &Path, opts: &AggregateOptions) -> Result<Aggregation> {
    let mut index: HashMap<EdgeKey, usize> = HashMap::new();
    let mut edges: Vec<Edge> = Vec::new();
    let mut self_loops = 0;

    let mut stats = for_each_row(dir, opts, |fields| {
        let subject = &fields[opts.subject_column];
        let counterpart = &fields[opts.counterpart_column];
        let key = EdgeKey::new(subject, counterpart);
        if key.is_self_loop() {
            self_loops += 1;
            return;
        }
        match index.get(&key) {
            Some(&i) => edges[i].weight += 1,
            None => {
                index.insert(key, edges.len());
                edges.push(Edge {
                    source: subject.clone(),
                    target: counterpart.clone(),
                    weight: 1,
                });
            }
        }
    })?;
    stats.self_loops = self_loops;

    info!(
        files = stats.files_scanned,
        rows = stats.rows_read,
        edges = edges.len(),
        skipped = stats.skipped_rows,
        "aggregation complete"
    );
    Ok(Aggregation {
        edges: EdgeList::new(edges),
        stats,
    })
}

/// Set of games admitted into the network.
#[derive(Debug, Clone, Default)]
pub struct GameFilter {
    allowed: HashSet<String>,
}

fn created_before(created: &str, cutoff: NaiveDate) -> bool {
    let created = created.trim();
    if created.is_empty() || created == "None" {
        return true;
    }
    DateTime::parse_from_rfc3339(created)
        .map(|c| c.date_naive() < cutoff)
        .unwrap_or(false)
}

impl GameFilter {
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: ids.into_iter().collect(),
        }
    }

    /// Read a games metadata file (`id,name,abbreviation,release_date,created`)
    /// and admit each game released and created before `cutoff` that is not
    /// deny-listed. Games without a usable release date are rejected; a
    /// missing creation date is not held against a game.
    pub fn from_metadata(path: &Path, cutoff: NaiveDate, deny: &DenyList) -> Result<Self> {
        let mut allowed = HashSet::new();
        for record in RecordReader::open(path)?.skip(1) {
            let fields = record?;
            if fields.len() < 5 {
                continue;
            }
            let id = &fields[0];
            let released = NaiveDate::parse_from_str(fields[3].trim(), "%Y-%m-%d")
                .map(|d| d < cutoff)
                .unwrap_or(false);

            if released && created_before(&fields[4], cutoff) && !deny.contains(id) {
                allowed.insert(id.clone());
            }
        }
        debug!(path = %path.display(), allowed = allowed.len(), "game filter loaded");
        Ok(Self { allowed })
    }

    pub fn allows(&self, id: &str) -> bool {
        self.allowed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_key_is_unordered() {
        assert_eq!(EdgeKey::new("b", "a"), EdgeKey::new("a", "b"));
        assert_eq!(EdgeKey::new("b", "a").endpoints(), ("a", "b"));
        assert!(EdgeKey::new("x", "x").is_self_loop());
    }

    #[test]
    fn test_created_before() {
        let cutoff = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert!(created_before("", cutoff));
        assert!(created_before("None", cutoff));
        assert!(created_before("2017-10-22T05:21:29Z", cutoff));
        assert!(!created_before("2023-05-01T00:00:00Z", cutoff));
        assert!(!created_before("garbage", cutoff));
    }

    #[test]
    fn test_to_graph_shares_nodes() {
        let edges = EdgeList::new(vec![
            Edge {
                source: "g1".into(),
                target: "g2".into(),
                weight: 2,
            },
            Edge {
                source: "g2".into(),
                target: "g3".into(),
                weight: 1,
            },
        ]);
        let graph = edges.to_graph();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
    }
}
