use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sb_core::types::TerminalSize;
use sb_session::io::NonBlockingGuard;
use sb_session::lifecycle::{
    install_signal_handlers, CleanupOutcome, LifecycleController, LiveShell, ShutdownSignal,
};
use sb_session::pty::{PtyChannel, ShellLaunch, TerminateOutcome};

fn spawn_live(program: &str, args: &[&str], cwd: &Path) -> LiveShell {
    let mut pty = PtyChannel::open(TerminalSize::default()).unwrap();
    let shell = pty
        .spawn_shell(&ShellLaunch {
            candidates: vec![program.to_string()],
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: cwd.to_path_buf(),
            term: "xterm-256color".into(),
            env: Vec::new(),
        })
        .unwrap();
    LiveShell::new(shell, pty)
}

fn is_running(live: &LiveShell) -> bool {
    live.shell.lock().unwrap().is_running()
}

#[test]
fn cleanup_twice_terminates_once() {
    let dir = tempfile::tempdir().unwrap();
    let live = spawn_live("/bin/sleep", &["30"], dir.path());
    let controller = LifecycleController::new(Duration::from_secs(2));
    controller.register(live.clone()).unwrap();

    let first = controller.cleanup();
    assert_eq!(
        first,
        CleanupOutcome::Performed(Some(TerminateOutcome::Terminated))
    );
    assert_eq!(controller.cleanup(), CleanupOutcome::AlreadyDone);

    assert!(!is_running(&live));
    assert!(!live.pty.lock().unwrap().is_open());
}

#[test]
fn concurrent_cleanups_run_teardown_once() {
    let dir = tempfile::tempdir().unwrap();
    let live = spawn_live("/bin/sleep", &["30"], dir.path());
    let controller = Arc::new(LifecycleController::new(Duration::from_secs(2)));
    controller.register(live.clone()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let controller = Arc::clone(&controller);
            std::thread::spawn(move || controller.cleanup())
        })
        .collect();
    let outcomes: Vec<CleanupOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let performed = outcomes
        .iter()
        .filter(|o| matches!(o, CleanupOutcome::Performed(_)))
        .count();
    assert_eq!(performed, 1, "{outcomes:?}");
    assert!(controller.is_cleaned());
    assert!(!is_running(&live));
}

#[test]
fn register_is_refused_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let controller = LifecycleController::new(Duration::from_millis(500));
    controller.request_stop();

    let live = spawn_live("/bin/sleep", &["30"], dir.path());
    let refused = controller.register(live).unwrap_err();
    assert_eq!(
        refused.terminate(Duration::from_secs(2)),
        TerminateOutcome::Terminated
    );
    assert_eq!(controller.cleanup(), CleanupOutcome::Performed(None));
}

#[test]
fn released_shell_is_not_torn_down() {
    let dir = tempfile::tempdir().unwrap();
    let live = spawn_live("/bin/sleep", &["30"], dir.path());
    let controller = LifecycleController::new(Duration::from_millis(500));
    controller.register(live.clone()).unwrap();

    assert!(controller.release().is_some());
    assert_eq!(controller.cleanup(), CleanupOutcome::Performed(None));
    assert!(is_running(&live));
    live.terminate(Duration::from_secs(2));
}

#[test]
fn cleanup_restores_input_flags() {
    let (reader, _writer) = std::io::pipe().unwrap();
    let fd = reader.as_raw_fd();
    let controller = LifecycleController::new(Duration::from_millis(100));
    controller.attach_input_guard(NonBlockingGuard::set(reader.as_fd()).unwrap());
    assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK, 0);

    controller.cleanup();
    assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK, 0);
}

#[tokio::test]
async fn hangup_triggers_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let live = spawn_live("/bin/sleep", &["30"], dir.path());
    let controller = Arc::new(LifecycleController::new(Duration::from_secs(2)));
    controller.register(live.clone()).unwrap();

    let shutdown = install_signal_handlers(Arc::clone(&controller)).unwrap();
    unsafe {
        libc::kill(libc::getpid(), libc::SIGHUP);
    }

    let signal = tokio::time::timeout(Duration::from_secs(10), shutdown)
        .await
        .expect("signal future should resolve");
    assert_eq!(signal, ShutdownSignal::Hangup);
    assert!(controller.stop_requested());
    assert!(controller.is_cleaned());
    assert!(!is_running(&live));
}
