//! Drift report between installed and generated configuration
//!
//! For each selected node the installed configuration is downloaded next to
//! the generated one and both are compared structurally as JSON. The result
//! is a markdown document with one table per node.

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{local_config_path, INSTALLED_CONFIG_PATH};
use crate::topology::{ClusterTopology, Role};
use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// File name of the downloaded installed configuration
pub const REMOTE_CONFIG_FILE_NAME: &str = "config.ign.remote";

/// File name of the rendered report under the output directory
pub const REPORT_FILE_NAME: &str = "analysis.md";

/// Kind of a single difference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present only in the generated configuration
    Create,
    /// Present in both with different values
    Update,
    /// Present only in the installed configuration
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        })
    }
}

/// One leaf level difference
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    /// What happened
    pub kind: ChangeKind,
    /// Dot separated path, array indices as segments
    pub path: String,
    /// Installed value
    pub from: Option<Value>,
    /// Generated value
    pub to: Option<Value>,
}

/// Structural difference from `remote` to `local`
pub fn diff(remote: &Value, local: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_at(&mut Vec::new(), remote, local, &mut changes);
    changes
}

fn diff_at(path: &mut Vec<String>, remote: &Value, local: &Value, out: &mut Vec<Change>) {
    match (remote, local) {
        (Value::Object(from), Value::Object(to)) => {
            let mut keys: Vec<&String> = from.keys().chain(to.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                match (from.get(key), to.get(key)) {
                    (Some(a), Some(b)) => diff_at(path, a, b, out),
                    (Some(a), None) => leaves(path, a, ChangeKind::Delete, out),
                    (None, Some(b)) => leaves(path, b, ChangeKind::Create, out),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        (Value::Array(from), Value::Array(to)) => {
            for index in 0..from.len().max(to.len()) {
                path.push(index.to_string());
                match (from.get(index), to.get(index)) {
                    (Some(a), Some(b)) => diff_at(path, a, b, out),
                    (Some(a), None) => leaves(path, a, ChangeKind::Delete, out),
                    (None, Some(b)) => leaves(path, b, ChangeKind::Create, out),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(Change {
            kind: ChangeKind::Update,
            path: path.join("."),
            from: Some(a.clone()),
            to: Some(b.clone()),
        }),
    }
}

/// Emit every leaf under `value` as a create or delete
fn leaves(path: &mut Vec<String>, value: &Value, kind: ChangeKind, out: &mut Vec<Change>) {
    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) if !map.is_empty() => {
            let mut children: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v)).collect();
            children.sort_by(|a, b| a.0.cmp(&b.0));
            children
        }
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        leaf => {
            let (from, to) = match kind {
                ChangeKind::Delete => (Some(leaf.clone()), None),
                _ => (None, Some(leaf.clone())),
            };
            out.push(Change {
                kind,
                path: path.join("."),
                from,
                to,
            });
            return;
        }
    };
    for (segment, child) in children {
        path.push(segment);
        leaves(path, child, kind, out);
        path.pop();
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.replace('|', "\\|").replace('\n', "\\n"),
        Some(v) => v.to_string().replace('|', "\\|"),
        None => String::new(),
    }
}

/// Markdown table for one node's changes
pub fn render_table(changes: &[Change]) -> String {
    let mut table = String::from("| Type | Path | Change |\n| :---: | :--- | :--- |\n");
    for change in changes {
        let _ = match change.kind {
            ChangeKind::Create => writeln!(
                table,
                "| {} | {} | {} |",
                change.kind,
                change.path,
                render_value(change.to.as_ref())
            ),
            ChangeKind::Delete => writeln!(
                table,
                "| {} | {} | {} |",
                change.kind,
                change.path,
                render_value(change.from.as_ref())
            ),
            ChangeKind::Update => writeln!(
                table,
                "| {} | {} | {} |\n| | | {} |",
                change.kind,
                change.path,
                render_value(change.from.as_ref()),
                render_value(change.to.as_ref())
            ),
        };
    }
    table
}

/// Changes of one node
#[derive(Clone, Debug)]
pub struct NodeDrift {
    /// Node role
    pub role: Role,
    /// Node hostname
    pub hostname: String,
    /// Differences from installed to generated
    pub changes: Vec<Change>,
}

/// Full markdown report for a cluster
pub fn render_report(cluster: &str, drift: &[NodeDrift]) -> String {
    let mut report = format!("## {cluster}\n");
    for node in drift {
        let _ = write!(
            report,
            "### {} - {}\n{}\n",
            node.role,
            node.hostname,
            render_table(&node.changes)
        );
    }
    report
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::serialization(format!("{} is not valid JSON: {e}", path.display())))
}

/// Downloads installed configuration and reports drift
pub struct DriftAnalyzer {
    transport: Arc<dyn RemoteTransport>,
    output_dir: PathBuf,
}

impl DriftAnalyzer {
    /// Create an analyzer working in `output_dir`
    pub fn new(transport: Arc<dyn RemoteTransport>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            output_dir: output_dir.into(),
        }
    }

    /// Changes for a single host
    ///
    /// A host whose installed configuration cannot be downloaded is compared
    /// against an empty document.
    pub async fn analyze_node(&self, hostname: &str) -> Result<Vec<Change>> {
        let local = read_json(&local_config_path(&self.output_dir, hostname))?;
        let remote_path = self.output_dir.join(hostname).join(REMOTE_CONFIG_FILE_NAME);

        let remote = match self
            .transport
            .download_file(hostname, INSTALLED_CONFIG_PATH, &remote_path)
            .await
        {
            Ok(()) => read_json(&remote_path)?,
            Err(e) => {
                warn!(node = %hostname, error = %e, "could not download installed configuration");
                Value::Object(Map::new())
            }
        };
        Ok(diff(&remote, &local))
    }

    /// Analyze every node of `topology` and write the report
    ///
    /// Returns the path of the written report.
    pub async fn analyze(&self, cluster: &str, topology: &ClusterTopology) -> Result<PathBuf> {
        let mut drift = Vec::new();
        for node in topology.iter() {
            let changes = self.analyze_node(&node.hostname).await?;
            info!(node = %node.hostname, changes = changes.len(), "analyzed node");
            drift.push(NodeDrift {
                role: node.role,
                hostname: node.hostname.clone(),
                changes,
            });
        }

        let path = self.output_dir.join(REPORT_FILE_NAME);
        std::fs::write(&path, render_report(cluster, &drift)).map_err(|e| Error::io(&path, e))?;
        info!(path = %path.display(), "wrote drift report");
        Ok(path)
    }
}
