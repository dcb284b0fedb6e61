use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sb_core::types::{AgentKind, AgentStatus};
use sb_session::probe::{
    ProcFsTable, ProcessEntry, ProcessTable, ProcessTreeProbe, PsCommandTable,
};

/// In-memory process table.
#[derive(Default)]
struct FakeTable {
    children: HashMap<u32, Vec<u32>>,
    names: HashMap<u32, (String, String)>,
    failing_children: HashSet<u32>,
    fail_describe: bool,
    describe_calls: Arc<Mutex<Vec<usize>>>,
}

impl FakeTable {
    fn child(mut self, parent: u32, pid: u32, name: &str, command_line: &str) -> Self {
        self.children.entry(parent).or_default().push(pid);
        self.names
            .insert(pid, (name.to_string(), command_line.to_string()));
        self
    }

    fn process(mut self, pid: u32, name: &str) -> Self {
        self.names.insert(pid, (name.to_string(), name.to_string()));
        self
    }
}

impl ProcessTable for FakeTable {
    fn children(&self, pid: u32) -> io::Result<Vec<u32>> {
        if self.failing_children.contains(&pid) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "pgrep timed out"));
        }
        Ok(self.children.get(&pid).cloned().unwrap_or_default())
    }

    fn describe(&self, pids: &[u32]) -> io::Result<Vec<ProcessEntry>> {
        self.describe_calls.lock().unwrap().push(pids.len());
        if self.fail_describe {
            return Err(io::Error::other("ps not found"));
        }
        Ok(pids
            .iter()
            .filter_map(|pid| {
                self.names.get(pid).map(|(name, cmd)| ProcessEntry {
                    pid: *pid,
                    name: name.clone(),
                    command_line: cmd.clone(),
                })
            })
            .collect())
    }
}

fn probe_with(table: FakeTable) -> ProcessTreeProbe {
    ProcessTreeProbe::new(Box::new(table), 5, 50)
}

#[test]
fn depth_three_claude_is_detected() {
    let table = FakeTable::default()
        .child(1, 10, "zsh", "-zsh")
        .child(10, 20, "node", "node /usr/lib/wrapper.js")
        .child(20, 30, "node", "/usr/bin/claude --resume");
    assert_eq!(
        probe_with(table).probe(1),
        AgentStatus::detected(AgentKind::Claude)
    );
}

#[test]
fn no_agent_means_inactive() {
    let table = FakeTable::default()
        .child(1, 10, "vim", "vim notes.md")
        .child(1, 11, "top", "top");
    assert_eq!(probe_with(table).probe(1), AgentStatus::inactive());
}

#[test]
fn idle_shell_is_inactive() {
    assert_eq!(
        probe_with(FakeTable::default()).probe(1),
        AgentStatus::inactive()
    );
}

#[test]
fn gemini_is_detected_by_executable_name() {
    let table = FakeTable::default().child(1, 10, "gemini", "");
    assert_eq!(
        probe_with(table).probe(1),
        AgentStatus::detected(AgentKind::Gemini)
    );
}

#[test]
fn failing_listing_degrades_to_leaf() {
    let mut table = FakeTable::default()
        .child(1, 10, "bash", "bash")
        .child(10, 20, "claude", "claude")
        .child(1, 11, "sh", "sh")
        .child(11, 21, "gemini", "gemini chat");
    table.failing_children.insert(10);
    assert_eq!(
        probe_with(table).probe(1),
        AgentStatus::detected(AgentKind::Gemini)
    );
}

#[test]
fn failing_root_listing_is_inactive() {
    let mut table = FakeTable::default().child(1, 10, "claude", "claude");
    table.failing_children.insert(1);
    assert_eq!(probe_with(table).probe(1), AgentStatus::inactive());
}

#[test]
fn failing_describe_is_inactive() {
    let mut table = FakeTable::default().child(1, 10, "claude", "claude");
    table.fail_describe = true;
    assert_eq!(probe_with(table).probe(1), AgentStatus::inactive());
}

#[test]
fn cycles_are_visited_once() {
    let table = FakeTable::default()
        .child(1, 2, "a", "a")
        .child(2, 1, "root", "root")
        .child(2, 3, "b", "b")
        .child(3, 2, "a", "a");
    let probe = probe_with(table);
    assert_eq!(probe.descendants(1), vec![2, 3]);
    assert_eq!(probe.probe(1), AgentStatus::inactive());
}

#[test]
fn walk_stops_at_max_depth() {
    let mut table = FakeTable::default();
    for pid in 1..7 {
        table = table.child(pid, pid + 1, "sh", "sh");
    }
    table = table.process(7, "claude");
    let probe = probe_with(table);
    assert_eq!(probe.descendants(1), vec![2, 3, 4, 5, 6]);
    assert_eq!(probe.probe(1), AgentStatus::inactive());
}

#[test]
fn descendants_are_described_in_batches() {
    let mut table = FakeTable::default();
    for pid in 100..220 {
        table = table.child(1, pid, "sleep", "sleep 60");
    }
    let calls = Arc::clone(&table.describe_calls);
    let probe = probe_with(table);
    assert_eq!(probe.probe(1), AgentStatus::inactive());
    assert_eq!(*calls.lock().unwrap(), vec![50, 50, 20]);
}

#[test]
fn detection_stops_at_first_matching_batch() {
    let mut table = FakeTable::default().child(1, 2, "claude", "claude");
    for pid in 100..200 {
        table = table.child(1, pid, "sleep", "sleep 60");
    }
    let calls = Arc::clone(&table.describe_calls);
    let probe = probe_with(table);
    assert!(probe.probe(1).active);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn foreground_is_newest_child() {
    let table = FakeTable::default()
        .process(1, "-zsh")
        .child(1, 40, "sleep", "sleep 5")
        .child(1, 55, "/usr/bin/vim", "vim x");
    assert_eq!(probe_with(table).foreground_name(1).as_deref(), Some("vim"));
}

#[test]
fn foreground_falls_back_to_shell() {
    let table = FakeTable::default().process(1, "-zsh");
    assert_eq!(probe_with(table).foreground_name(1).as_deref(), Some("zsh"));
}

#[test]
fn foreground_unknown_when_listing_fails() {
    let mut table = FakeTable::default().process(1, "zsh");
    table.failing_children.insert(1);
    assert_eq!(probe_with(table).foreground_name(1), None);
}

// ---------------------------------------------------------------------------
// ProcFsTable against a scratch directory
// ---------------------------------------------------------------------------

fn write(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn procfs_children_from_task_files() {
    let root = tempfile::tempdir().unwrap();
    write(&root.path().join("100/task/100/children"), b"200 300 ");
    write(&root.path().join("100/task/101/children"), b"");
    write(&root.path().join("200/comm"), b"claude\n");
    write(&root.path().join("200/cmdline"), b"claude\0--resume\0");

    let table = ProcFsTable::with_root(root.path());
    assert_eq!(table.children(100).unwrap(), vec![200, 300]);

    let entries = table.describe(&[200, 999]).unwrap();
    assert_eq!(
        entries,
        vec![ProcessEntry {
            pid: 200,
            name: "claude".into(),
            command_line: "claude --resume".into(),
        }]
    );
}

#[test]
fn procfs_falls_back_to_stat_scan() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("400/task/400")).unwrap();
    write(&root.path().join("401/stat"), b"401 (sleep 1) S 400 401 401 0");
    write(&root.path().join("402/stat"), b"402 (bash) S 1 402 402 0");
    write(&root.path().join("self/stat"), b"not a process dir");

    let table = ProcFsTable::with_root(root.path());
    assert_eq!(table.children(400).unwrap(), vec![401]);
}

#[test]
fn procfs_missing_process_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let table = ProcFsTable::with_root(root.path());
    assert!(table.children(12345).is_err());
}

/// Describe `pid` until both its name and its arguments show the exec'd
/// program. `comm` is updated before `cmdline` becomes readable.
fn describe_after_exec(table: &dyn ProcessTable, pid: u32) -> ProcessEntry {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let entry = table
            .describe(&[pid])
            .unwrap()
            .into_iter()
            .next()
            .unwrap_or(ProcessEntry {
                pid,
                name: String::new(),
                command_line: String::new(),
            });
        let ready = entry.name == "sleep" && entry.command_line.ends_with("sleep 5");
        if ready || std::time::Instant::now() >= deadline {
            return entry;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

#[test]
fn live_procfs_sees_spawned_child() {
    if !Path::new("/proc/self/task").exists() {
        return;
    }
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("5")
        .spawn()
        .unwrap();
    let table = ProcFsTable::new();
    let me = std::process::id();
    let children = table.children(me).unwrap();
    assert!(children.contains(&child.id()), "{children:?}");

    let entry = describe_after_exec(&table, child.id());
    assert_eq!(entry.name, "sleep");
    assert_eq!(entry.command_line, "/bin/sleep 5");

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn ps_table_reports_name_and_arguments() {
    let has_ps = std::process::Command::new("ps")
        .arg("-p")
        .arg(std::process::id().to_string())
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !has_ps {
        return;
    }
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("5")
        .spawn()
        .unwrap();
    let table = PsCommandTable::new(std::time::Duration::from_secs(2));

    let entry = describe_after_exec(&table, child.id());
    assert_eq!(entry.pid, child.id());
    assert_eq!(entry.name, "sleep");
    assert_eq!(entry.command_line, "/bin/sleep 5");
    assert!(table.describe(&[]).unwrap().is_empty());

    child.kill().unwrap();
    child.wait().unwrap();
}
