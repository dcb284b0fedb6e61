use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

use sb_core::types::TerminalSize;
use sb_session::pty::{PtyChannel, PtyError, ShellLaunch, TerminateOutcome};

fn launch(candidates: &[&str], args: &[&str], cwd: &Path) -> ShellLaunch {
    ShellLaunch {
        candidates: candidates.iter().map(|s| s.to_string()).collect(),
        args: args.iter().map(|s| s.to_string()).collect(),
        working_dir: cwd.to_path_buf(),
        term: "xterm-256color".into(),
        env: vec![("SB_TEST_VAR".into(), "bridged".into())],
    }
}

/// Read from a non-blocking master until `needle` shows up or `timeout`.
fn read_until(pty: &mut PtyChannel, needle: &str, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while Instant::now() < deadline {
        match pty.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                seen.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&seen).into_owned()
}

fn size(rows: u16, cols: u16) -> TerminalSize {
    TerminalSize::new(rows, cols).unwrap()
}

#[test]
fn open_applies_geometry() {
    let pty = PtyChannel::open(size(30, 100)).unwrap();
    assert!(pty.is_open());
    assert!(pty.master_fd().is_some());
    assert_eq!(pty.size(), size(30, 100));
    assert_eq!(pty.process_group(), None);
}

#[test]
fn echo_round_trip_through_cat() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let mut shell = pty
        .spawn_shell(&launch(&["/bin/cat"], &[], dir.path()))
        .unwrap();
    assert_eq!(pty.process_group(), Some(shell.pid() as i32));
    pty.set_nonblocking().unwrap();

    pty.send_line("hello-pty").unwrap();
    let seen = read_until(&mut pty, "hello-pty", Duration::from_secs(5));
    assert!(seen.contains("hello-pty"), "{seen:?}");

    assert_eq!(shell.terminate_group(Duration::from_secs(2)), TerminateOutcome::Terminated);
    assert!(!shell.is_running());
}

#[test]
fn fallback_candidate_is_used_when_first_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let mut shell = pty
        .spawn_shell(&launch(
            &["/nonexistent/shellbridge-shell", "/bin/sh"],
            &["-c", "exit 3"],
            dir.path(),
        ))
        .unwrap();
    assert_eq!(shell.program(), "/bin/sh");

    let deadline = Instant::now() + Duration::from_secs(5);
    while shell.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(shell.try_wait(), Some(3));
}

#[test]
fn all_candidates_missing_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let err = pty
        .spawn_shell(&launch(&["/nonexistent/a", "/nonexistent/b"], &[], dir.path()))
        .unwrap_err();
    assert!(matches!(err, PtyError::SpawnFailed(ref msg) if msg.contains("/nonexistent/b")));
}

#[test]
fn shell_sees_terminal_environment_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(size(40, 120)).unwrap();
    let _shell = pty
        .spawn_shell(&launch(
            &["/bin/sh"],
            &["-c", "echo \"env:$TERM:$COLUMNS:$LINES:$SB_TEST_VAR\"; pwd; sleep 1"],
            dir.path(),
        ))
        .unwrap();
    pty.set_nonblocking().unwrap();

    let canonical = dir.path().canonicalize().unwrap();
    let needle = canonical.to_string_lossy().into_owned();
    let seen = read_until(&mut pty, &needle, Duration::from_secs(5));
    assert!(seen.contains("env:xterm-256color:120:40:bridged"), "{seen:?}");
    assert!(seen.contains(&needle), "{seen:?}");
}

#[test]
fn resize_reaches_the_shell() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let _shell = pty
        .spawn_shell(&launch(&["/bin/sh"], &[], dir.path()))
        .unwrap();
    pty.set_nonblocking().unwrap();

    assert!(pty.resize(size(50, 132)));
    assert_eq!(pty.size(), size(50, 132));
    pty.send_line("stty size; exit").unwrap();
    let seen = read_until(&mut pty, "50 132", Duration::from_secs(5));
    assert!(seen.contains("50 132"), "{seen:?}");
}

#[test]
fn close_is_idempotent() {
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    assert!(pty.close());
    assert!(!pty.close());
    assert!(!pty.is_open());
    assert!(pty.master_fd().is_none());
    assert!(!pty.resize(size(10, 10)));

    let mut buf = [0u8; 8];
    assert_eq!(pty.read(&mut buf).unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(pty.write_all(b"x").unwrap_err().kind(), ErrorKind::NotConnected);
}

#[test]
fn stubborn_group_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let mut shell = pty
        .spawn_shell(&launch(
            &["/bin/sh"],
            &["-c", "trap '' TERM; echo armed; sleep 30"],
            dir.path(),
        ))
        .unwrap();
    pty.set_nonblocking().unwrap();
    let seen = read_until(&mut pty, "armed", Duration::from_secs(5));
    assert!(seen.contains("armed"), "{seen:?}");

    let started = Instant::now();
    assert_eq!(
        shell.terminate_group(Duration::from_millis(300)),
        TerminateOutcome::Killed
    );
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!shell.is_running());
}

#[test]
fn terminate_after_exit_reports_already_exited() {
    let dir = tempfile::tempdir().unwrap();
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let mut shell = pty
        .spawn_shell(&launch(&["/bin/sh"], &["-c", "exit 0"], dir.path()))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while shell.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        shell.terminate_group(Duration::from_secs(1)),
        TerminateOutcome::AlreadyExited
    );
}
