use privileged::{Config, Error, Invocation, Runner};
use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

struct Fixture {
    _dir: tempfile::TempDir,
    actions_dir: PathBuf,
    sudo: PathBuf,
}

fn write_script(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// All scripts are written before any test spawns a process; executing
/// a file that another forked child still holds open fails with ETXTBSY.
fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();

    FIXTURE.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let actions_dir = dir.path().join("actions");
        fs::create_dir(&actions_dir).unwrap();

        write_script(&actions_dir.join("echo"), "#!/bin/sh\nprintf '%s\\n' \"$*\"\n");
        write_script(&actions_dir.join("cat"), "#!/bin/sh\nexec cat\n");
        write_script(
            &actions_dir.join("fail"),
            "#!/bin/sh\necho partial\necho 'something went wrong' >&2\nexit 3\n",
        );
        write_script(&actions_dir.join("sleep"), "#!/bin/sh\nexec sleep 30\n");
        write_script(
            &actions_dir.join("graceful"),
            "#!/bin/sh\ntrap 'kill $!; touch \"$1\"; exit 143' TERM\nsleep 30 &\nwait\n",
        );
        write_script(
            &actions_dir.join("later"),
            "#!/bin/sh\nsleep 1\ntouch \"$1\"\n",
        );
        fs::create_dir(actions_dir.join("subdir")).unwrap();

        write_script(&dir.path().join("outside"), "#!/bin/sh\necho escaped\n");
        symlink(dir.path().join("outside"), actions_dir.join("link")).unwrap();

        let sudo = dir.path().join("sudo");
        write_script(
            &sudo,
            "#!/bin/sh\necho 'sudo: a password is required' >&2\nexit 1\n",
        );

        Fixture {
            _dir: dir,
            actions_dir,
            sudo,
        }
    })
}

fn runner(timeout: Option<u64>) -> Runner {
    let fixture = fixture();
    let config = Config {
        actions_dir: fixture.actions_dir.clone(),
        sudo: fixture.sudo.clone(),
        timeout,
        ..Default::default()
    };
    Runner::new(&config).unwrap()
}

fn invalid_action(err: Error) -> String {
    assert!(err.is_validation(), "{:?}", err);
    match err {
        Error::InvalidAction(message) => message,
        err => panic!("unexpected error: {:?}", err),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run() {
    let runner = runner(None);
    let output = runner
        .run(Invocation::new("echo").arg("hello").arg("world"))
        .await
        .unwrap();
    assert_eq!(output, "hello world\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shell_metacharacters() {
    let runner = runner(None);
    for option in [
        "$(id)",
        "; ls /",
        "`reboot`",
        "a && b | c > /tmp/x",
        "'\"*",
        "; & | ` $ ( ) { } [ ] < > * ? ~ # !",
    ] {
        let output = runner
            .run(Invocation::new("echo").arg(option))
            .await
            .unwrap();
        assert_eq!(output, format!("{}\n", option));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breakout() {
    let runner = runner(None);
    let dir = runner.actions_dir().display().to_string();

    for action in ["../outside", "/bin/sh", "subdir/../echo", "./echo"] {
        let err = runner.run(Invocation::new(action)).await.unwrap_err();
        assert_eq!(invalid_action(err), "Action cannot contain: /");
    }

    let err = runner.run(Invocation::new("..")).await.unwrap_err();
    assert_eq!(
        invalid_action(err),
        format!("Action has to be in directory {}", dir)
    );

    let err = runner.run(Invocation::new("link")).await.unwrap_err();
    assert_eq!(
        invalid_action(err),
        format!("Action has to be in directory {}", dir)
    );

    for action in ["does-not-exist", "", ".", "subdir"] {
        let err = runner.run(Invocation::new(action)).await.unwrap_err();
        assert_eq!(invalid_action(err), "Action must exist in action directory.");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input() {
    let runner = runner(None);
    let output = runner
        .run(Invocation::new("cat").stdin("{\"args\": [], \"kwargs\": {}}"))
        .await
        .unwrap();
    assert_eq!(output, "{\"args\": [], \"kwargs\": {}}");

    // Input that is never read must not fail the run.
    let output = runner
        .run(Invocation::new("echo").arg("x").stdin(vec![b'x'; 1 << 20]))
        .await
        .unwrap();
    assert_eq!(output, "x\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_action_error() {
    let runner = runner(None);
    match runner.run(Invocation::new("fail").quiet()).await {
        Err(Error::Action(err)) => {
            assert_eq!(err.action, "fail");
            assert_eq!(err.code, Some(3));
            assert_eq!(err.stdout, "partial\n");
            assert_eq!(err.message(), "something went wrong");
        }
        result => panic!("unexpected result: {:?}", result),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_elevation_refused() {
    let runner = runner(None);
    match runner.run(Invocation::new("echo").as_root()).await {
        Err(Error::Elevation(err)) => {
            assert_eq!(err.code, Some(1));
            assert_eq!(err.message(), "sudo: a password is required");
        }
        result => panic!("unexpected result: {:?}", result),
    }

    let err = runner
        .run_as_user("echo", "no-such-user-for-actions", ["x"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UserNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout() {
    let runner = runner(Some(1));
    match runner.run(Invocation::new("sleep")).await {
        Err(Error::Timeout { action, seconds }) => {
            assert_eq!(action, "sleep");
            assert_eq!(seconds, 1);
        }
        result => panic!("unexpected result: {:?}", result),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_sends_sigterm() {
    let runner = runner(Some(1));
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("terminated");

    let err = runner
        .run(Invocation::new("graceful").arg(marker.display().to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { seconds: 1, .. }), "{:?}", err);

    // The action ran its TERM handler before the call returned.
    assert!(marker.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_outlives_handle() {
    let runner = runner(None);
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");

    let process = runner
        .spawn(Invocation::new("later").arg(marker.display().to_string()))
        .await
        .unwrap();
    drop(process);

    for _ in 0..50 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(marker.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_and_terminate() {
    let runner = runner(None);
    let mut process = runner
        .spawn(Invocation::new("sleep").quiet())
        .await
        .unwrap();

    assert_eq!(process.action(), "sleep");
    assert!(process.pid().as_raw() > 0);
    assert!(process.try_status().unwrap().is_none());

    process.terminate().unwrap();
    match process.join().await {
        Err(Error::Action(err)) => assert_eq!(err.code, None),
        result => panic!("unexpected result: {:?}", result),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_and_join() {
    let runner = runner(None);
    let process = runner
        .spawn(Invocation::new("cat").stdin("streamed"))
        .await
        .unwrap();

    let captured = process.join().await.unwrap();
    assert_eq!(captured.stdout, "streamed");
    assert!(captured.stderr.is_empty());
}
