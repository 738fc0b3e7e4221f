//! Rendering of received config dumps.

use std::ffi::OsString;
use std::fmt::{self, Write as _};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::message::{ConfigDumpEntry, ConfigStatus, Identity, NodeDump};
use crate::resource::ResourceRef;

/// One node of a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// The node's config dump.
    pub dump: NodeDump,
    /// The dependency graph of the dump, if visualization is enabled.
    pub graph: Option<DependencyGraph>,
}

/// Everything delivered for one response.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Sequence number of the cycle, starting at 1.
    pub sequence: u64,
    /// The nodes that passed the filter, in response order.
    pub nodes: Vec<NodeSnapshot>,
}

impl Snapshot {
    /// Assemble a snapshot, building a graph per node when `visualization`
    /// is set.
    pub fn new(sequence: u64, dumps: Vec<NodeDump>, visualization: bool) -> Self {
        let nodes = dumps
            .into_iter()
            .map(|dump| {
                let graph = visualization.then(|| DependencyGraph::build(&dump.entries));
                NodeSnapshot { dump, graph }
            })
            .collect();
        Self { sequence, nodes }
    }

    /// The DOT renderings of all graphs, one digraph per node.
    pub fn to_dot(&self) -> Option<String> {
        let mut dots = self
            .nodes
            .iter()
            .filter_map(|node| node.graph.as_ref())
            .map(DependencyGraph::to_dot)
            .peekable();
        dots.peek()?;
        Some(dots.collect())
    }
}

/// A destination for snapshots.
///
/// `deliver` is called once per cycle, in cycle order; `flush` once when the
/// session ends.
pub trait OutputSink: Send + 'static {
    /// Render one snapshot.
    fn deliver(&mut self, snapshot: &Snapshot) -> impl Future<Output = Result<()>> + Send;

    /// Flush buffered output.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Serialize)]
struct SnapshotRecord<'a> {
    sequence: u64,
    nodes: Vec<NodeRecord<'a>>,
}

#[derive(Serialize)]
struct NodeRecord<'a> {
    node: &'a Identity,
    entries: Vec<EntryRecord<'a>>,
}

#[derive(Serialize)]
struct EntryRecord<'a> {
    type_url: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated_ms: Option<u64>,
    status: ConfigStatus,
    references: &'a [ResourceRef],
    body: String,
}

impl<'a> EntryRecord<'a> {
    fn new(entry: &'a ConfigDumpEntry) -> Self {
        let last_updated_ms = entry
            .last_updated
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| u64::try_from(d.as_millis()).ok());
        Self {
            type_url: &entry.type_url,
            name: &entry.name,
            version: entry.version.as_deref(),
            last_updated_ms,
            status: entry.status,
            references: &entry.references,
            body: BASE64.encode(&entry.body),
        }
    }
}

fn to_json_line(snapshot: &Snapshot) -> Result<String> {
    let record = SnapshotRecord {
        sequence: snapshot.sequence,
        nodes: snapshot
            .nodes
            .iter()
            .map(|node| NodeRecord {
                node: &node.dump.node,
                entries: node.dump.entries.iter().map(EntryRecord::new).collect(),
            })
            .collect(),
    };
    let mut line = serde_json::to_string(&record).map_err(std::io::Error::other)?;
    line.push('\n');
    Ok(line)
}

/// Writes snapshots to a file as JSON lines.
///
/// The file is truncated when the sink is created and one line is appended
/// per snapshot. When graphs are present, `<path>.dot` is overwritten with
/// the latest ones.
#[derive(Debug)]
pub struct FileSink {
    file: tokio::fs::File,
    dot_path: PathBuf,
}

impl FileSink {
    /// Create (or truncate) the output file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::create(path).await?;
        let mut dot_path = OsString::from(path.as_os_str());
        dot_path.push(".dot");
        tracing::debug!(path = %path.display(), "opened output file");
        Ok(Self {
            file,
            dot_path: dot_path.into(),
        })
    }

    /// Path the DOT rendering is written to.
    pub fn dot_path(&self) -> &Path {
        &self.dot_path
    }
}

impl OutputSink for FileSink {
    async fn deliver(&mut self, snapshot: &Snapshot) -> Result<()> {
        let line = to_json_line(snapshot)?;
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;

        if let Some(dot) = snapshot.to_dot() {
            tokio::fs::write(&self.dot_path, dot).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Prints a status table per node, followed by the DOT graph if present.
#[derive(Debug)]
pub struct StdoutSink<W = tokio::io::Stdout> {
    writer: W,
}

impl StdoutSink {
    /// A sink writing to the process's stdout.
    pub fn new() -> Self {
        Self {
            writer: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> StdoutSink<W> {
    /// A sink writing to an arbitrary writer.
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    /// Consume the sink, returning the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn render_table(snapshot: &Snapshot, out: &mut String) -> fmt::Result {
    const HEADER: [&str; 4] = ["Client ID", "xDS type", "Name", "Status"];

    let rows: Vec<[&str; 4]> = snapshot
        .nodes
        .iter()
        .flat_map(|node| {
            node.dump.entries.iter().map(move |entry| {
                [
                    node.dump.node.id.as_str(),
                    entry.type_url.rsplit('/').next().unwrap_or(&entry.type_url),
                    entry.name.as_str(),
                    entry.status.as_str(),
                ]
            })
        })
        .collect();

    if rows.is_empty() {
        writeln!(out, "No config dump received for the matched nodes")?;
    } else {
        let mut widths = HEADER.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }
        for row in std::iter::once(&HEADER).chain(&rows) {
            let [id, kind, name, status] = row;
            writeln!(
                out,
                "{id:<w0$}  {kind:<w1$}  {name:<w2$}  {status}",
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
            )?;
        }
    }

    if let Some(dot) = snapshot.to_dot() {
        writeln!(out)?;
        out.push_str(&dot);
    }
    Ok(())
}

impl<W: AsyncWrite + Unpin + Send + 'static> OutputSink for StdoutSink<W> {
    async fn deliver(&mut self, snapshot: &Snapshot) -> Result<()> {
        let mut text = String::new();
        render_table(snapshot, &mut text).map_err(std::io::Error::other)?;
        self.writer.write_all(text.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
