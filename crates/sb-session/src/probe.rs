//! Agent detection by walking the shell's process subtree.
//!
//! The walk is best effort throughout: a table that fails, times out or
//! lacks a helper tool yields "no children" for that node, and a probe that
//! finds nothing reports an inactive status. Nothing in here returns an
//! error to the multiplexer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use sb_core::config::ProbeConfig;
use sb_core::types::{AgentKind, AgentStatus};
use tracing::{debug, warn};

/// Upper bound on processes tracked by one walk.
const MAX_TRACKED: usize = 4096;

// ---------------------------------------------------------------------------
// Process tables
// ---------------------------------------------------------------------------

/// A process as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable name (`comm`).
    pub name: String,
    /// Full command line, arguments separated by spaces.
    pub command_line: String,
}

/// Source of process-tree facts.
pub trait ProcessTable {
    /// Direct children of `pid`.
    fn children(&self, pid: u32) -> io::Result<Vec<u32>>;

    /// Name and command line for each pid that still exists. Order is
    /// unspecified and vanished pids are omitted.
    fn describe(&self, pids: &[u32]) -> io::Result<Vec<ProcessEntry>>;
}

/// Reads `/proc` directly (Linux).
#[derive(Debug, Clone)]
pub struct ProcFsTable {
    root: PathBuf,
}

impl ProcFsTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use a different procfs mount point.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn children_from_tasks(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut out = Vec::new();
        for task in std::fs::read_dir(self.root.join(pid.to_string()).join("task"))? {
            let text = std::fs::read_to_string(task?.path().join("children"))?;
            out.extend(text.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
        }
        Ok(out)
    }

    /// Slow path for kernels without `task/*/children`: scan every
    /// `/proc/<pid>/stat` for a matching parent id.
    fn children_from_stat_scan(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(candidate) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if parent_from_stat(&stat) == Some(pid) {
                out.push(candidate);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

impl Default for ProcFsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFsTable {
    fn children(&self, pid: u32) -> io::Result<Vec<u32>> {
        match self.children_from_tasks(pid) {
            Ok(children) => Ok(children),
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.root.join(pid.to_string()).exists() => {
                self.children_from_stat_scan(pid)
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self, pids: &[u32]) -> io::Result<Vec<ProcessEntry>> {
        let mut out = Vec::with_capacity(pids.len());
        for &pid in pids {
            let dir = self.root.join(pid.to_string());
            let Ok(name) = std::fs::read_to_string(dir.join("comm")) else {
                continue;
            };
            let command_line = std::fs::read(dir.join("cmdline"))
                .map(|raw| cmdline_to_string(&raw))
                .unwrap_or_default();
            out.push(ProcessEntry {
                pid,
                name: name.trim_end().to_string(),
                command_line,
            });
        }
        Ok(out)
    }
}

/// Parent pid from a `/proc/<pid>/stat` line. The command name may itself
/// contain spaces and parentheses, so fields are counted from the last `)`.
fn parent_from_stat(stat: &str) -> Option<u32> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(1)?.parse().ok()
}

fn cmdline_to_string(raw: &[u8]) -> String {
    raw.split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shells out to `pgrep` and `ps`, for platforms without procfs.
#[derive(Debug, Clone)]
pub struct PsCommandTable {
    timeout: Duration,
}

impl PsCommandTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn ps_column(&self, list: &str, column: &str) -> io::Result<Vec<(u32, String)>> {
        let mut cmd = Command::new("ps");
        cmd.arg("-o").arg(format!("pid=,{column}")).arg("-p").arg(list);
        // ps exits non-zero when some pids are gone; the rest is still valid.
        let (_, stdout) = run_with_timeout(cmd, self.timeout)?;
        Ok(stdout.lines().filter_map(parse_ps_line).collect())
    }
}

impl ProcessTable for PsCommandTable {
    fn children(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut cmd = Command::new("pgrep");
        cmd.arg("-P").arg(pid.to_string());
        let (status, stdout) = run_with_timeout(cmd, self.timeout)?;
        // pgrep exits 1 when nothing matched.
        if !status.success() && status.code() != Some(1) {
            return Err(io::Error::other(format!("pgrep exited with {status}")));
        }
        Ok(stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    fn describe(&self, pids: &[u32]) -> io::Result<Vec<ProcessEntry>> {
        if pids.is_empty() {
            return Ok(Vec::new());
        }
        let list = pids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        // One column per query: both `comm` and `args` may contain spaces,
        // and a trailing column is the only one that can be split safely.
        let names = self.ps_column(&list, "comm=")?;
        let mut args: HashMap<u32, String> =
            self.ps_column(&list, "args=")?.into_iter().collect();
        Ok(names
            .into_iter()
            .map(|(pid, name)| ProcessEntry {
                pid,
                name,
                command_line: args.remove(&pid).unwrap_or_default(),
            })
            .collect())
    }
}

/// Split a `ps -o pid=,<column>` line into the pid and the whole column.
fn parse_ps_line(line: &str) -> Option<(u32, String)> {
    let line = line.trim();
    let (pid, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Some((pid.parse().ok()?, rest.trim_start().to_string()))
}

/// Run a helper, killing it if it outlives `timeout`.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<(ExitStatus, String)> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other(format!("{program}: stdout not captured")))?;
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).map(|_| buf)
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{program} timed out after {}ms", timeout.as_millis()),
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let raw = reader
        .join()
        .map_err(|_| io::Error::other(format!("{program}: reader thread panicked")))??;
    Ok((status, String::from_utf8_lossy(&raw).into_owned()))
}

/// Pick the best table for this platform.
pub fn default_table(command_timeout: Duration) -> Box<dyn ProcessTable + Send> {
    if Path::new("/proc/self/stat").exists() {
        Box::new(ProcFsTable::new())
    } else {
        Box::new(PsCommandTable::new(command_timeout))
    }
}

// ---------------------------------------------------------------------------
// ProcessTreeProbe
// ---------------------------------------------------------------------------

/// Which agent, if any, a single process is.
pub fn classify(entry: &ProcessEntry) -> Option<AgentKind> {
    let name = entry.name.to_lowercase();
    let command_line = entry.command_line.to_lowercase();
    AgentKind::ALL
        .into_iter()
        .find(|kind| name.contains(kind.marker()) || command_line.contains(kind.marker()))
}

pub struct ProcessTreeProbe {
    table: Box<dyn ProcessTable + Send>,
    max_depth: usize,
    batch_size: usize,
}

impl ProcessTreeProbe {
    pub fn new(table: Box<dyn ProcessTable + Send>, max_depth: usize, batch_size: usize) -> Self {
        Self {
            table,
            max_depth,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            default_table(config.command_timeout()),
            config.max_depth,
            config.batch_size,
        )
    }

    /// Breadth-first list of descendants of `root`, at most `max_depth`
    /// levels down. Each pid appears once, even if the table reports a cycle.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0usize)]);
        let mut found = Vec::new();

        while let Some((pid, depth)) = queue.pop_front() {
            if depth >= self.max_depth {
                continue;
            }
            let children = match self.table.children(pid) {
                Ok(children) => children,
                Err(e) => {
                    debug!(pid, error = %e, "child listing failed, treating as leaf");
                    continue;
                }
            };
            for child in children {
                if visited.len() >= MAX_TRACKED {
                    warn!(root, limit = MAX_TRACKED, "process walk truncated");
                    return found;
                }
                if visited.insert(child) {
                    found.push(child);
                    queue.push_back((child, depth + 1));
                }
            }
        }
        found
    }

    /// Classify agent activity under `root`. The first matching process wins.
    pub fn probe(&self, root: u32) -> AgentStatus {
        let descendants = self.descendants(root);
        for batch in descendants.chunks(self.batch_size) {
            let entries = match self.table.describe(batch) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(root, batch = batch.len(), error = %e, "describe failed, skipping batch");
                    continue;
                }
            };
            if let Some(kind) = entries.iter().find_map(classify) {
                return AgentStatus::detected(kind);
            }
        }
        AgentStatus::inactive()
    }

    /// Name of the shell's foreground program: the newest direct child, or
    /// the shell itself when idle. `None` when the table cannot tell.
    pub fn foreground_name(&self, root: u32) -> Option<String> {
        let target = match self.table.children(root) {
            Ok(children) => children.into_iter().max().unwrap_or(root),
            Err(e) => {
                debug!(root, error = %e, "foreground lookup failed");
                return None;
            }
        };
        let entries = self.table.describe(&[target]).ok()?;
        let entry = entries.into_iter().find(|e| e.pid == target)?;
        Some(display_name(&entry.name))
    }
}

impl std::fmt::Debug for ProcessTreeProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTreeProbe")
            .field("max_depth", &self.max_depth)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Basename without the login-shell dash.
fn display_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    base.trim_start_matches('-').to_string()
}
