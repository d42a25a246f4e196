//! Running actions from the actions directory.
//!
//! An action is an executable inside the configured actions directory.
//! It is started directly from an argument vector, never through a
//! shell, so shell metacharacters in options are passed through
//! verbatim.  Actions that need root are run through `sudo -n`, which
//! fails instead of prompting for a password.
//!
//! A blocking run owns its child: when it times out, the action is sent
//! `SIGTERM` first, which `sudo` relays to the command it started, and
//! is killed only if it is still alive after [`TERMINATE_GRACE`].  A
//! spawned [`Process`] is not tied to its handle; dropping the handle
//! leaves the action running.

use crate::{
    config::Config,
    error::{ActionError, Error},
    types::REDACTED,
};
use derive_more::{Deref, DerefMut};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{Pid, User},
};
use privileged_log::{error, info, warn};
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf, MAIN_SEPARATOR},
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    time,
};

/// Time a timed-out action gets to exit after `SIGTERM`.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// The user an action runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// Run without elevation.
    CurrentUser,
    /// Run as root through `sudo -n`.
    Root,
    /// Run as another user through `sudo -n -u`.
    User(String),
}

impl Default for Privilege {
    fn default() -> Self {
        Self::CurrentUser
    }
}

/// A single action run.
#[derive(Clone, Default)]
pub struct Invocation {
    action: String,
    arguments: Vec<String>,
    secrets: BTreeSet<usize>,
    input: Option<Vec<u8>>,
    privilege: Privilege,
    quiet: bool,
}

impl Invocation {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an argument that is never logged.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secrets.insert(self.arguments.len());
        self.arguments.push(arg.into());
        self
    }

    /// Data written to the standard input of the action.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn as_root(self) -> Self {
        self.with_privilege(Privilege::Root)
    }

    pub fn as_user(self, user: impl Into<String>) -> Self {
        self.with_privilege(Privilege::User(user.into()))
    }

    /// Do not log failures; the caller reports them.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn input(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }

    pub fn privilege(&self) -> &Privilege {
        &self.privilege
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Arguments with secrets replaced.
    pub fn redacted_arguments(&self) -> Vec<String> {
        self.arguments
            .iter()
            .enumerate()
            .map(|(index, arg)| {
                if self.secrets.contains(&index) {
                    REDACTED.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("action", &self.action)
            .field("arguments", &self.redacted_arguments())
            .field("input", &self.input.as_ref().map(Vec::len))
            .field("privilege", &self.privilege)
            .field("quiet", &self.quiet)
            .finish()
    }
}

/// Output of an action that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Starts actions from the actions directory.
#[derive(Debug, Clone)]
pub struct Runner {
    actions_dir: PathBuf,
    sudo: PathBuf,
    timeout: Option<Duration>,
}

impl Runner {
    /// Create a runner; the actions directory must exist.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            actions_dir: config.actions_dir.canonicalize()?,
            sudo: config.sudo.clone(),
            timeout: config.timeout(),
        })
    }

    pub fn actions_dir(&self) -> &Path {
        &self.actions_dir
    }

    /// Find the executable of an action inside the actions directory.
    pub fn resolve(&self, action: &str) -> Result<PathBuf, Error> {
        if action.contains('/') || action.contains(MAIN_SEPARATOR) {
            return Err(Error::invalid_action(format!(
                "Action cannot contain: {}",
                MAIN_SEPARATOR
            )));
        }

        let not_found = || Error::invalid_action("Action must exist in action directory.");

        let path = self
            .actions_dir
            .join(action)
            .canonicalize()
            .map_err(|_| not_found())?;
        if !path.starts_with(&self.actions_dir) {
            return Err(Error::invalid_action(format!(
                "Action has to be in directory {}",
                self.actions_dir.display()
            )));
        }
        if !path.is_file() {
            return Err(not_found());
        }

        Ok(path)
    }

    /// The full argument vector, program first.
    pub fn argv(&self, invocation: &Invocation) -> Result<Vec<OsString>, Error> {
        let path = self.resolve(&invocation.action)?;

        let mut argv: Vec<OsString> = vec![];
        match &invocation.privilege {
            Privilege::CurrentUser => {}
            Privilege::Root => {
                argv.push(self.sudo.clone().into());
                argv.push("-n".into());
            }
            Privilege::User(user) => {
                if User::from_name(user)?.is_none() {
                    return Err(Error::UserNotFound(user.clone()));
                }
                argv.push(self.sudo.clone().into());
                argv.push("-n".into());
                argv.push("-u".into());
                argv.push(user.into());
            }
        }
        argv.push(path.into());
        argv.extend(invocation.arguments.iter().map(Into::into));

        Ok(argv)
    }

    fn command(&self, invocation: &Invocation) -> Result<Command, Error> {
        let argv = self.argv(invocation)?;
        let (program, args) = argv.split_first().ok_or(Error::InvalidProcess)?;

        let prefix = argv.len() - invocation.arguments.len();
        let redacted = argv[..prefix]
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .chain(invocation.redacted_arguments())
            .collect::<Vec<_>>();
        info!("Executing command - {:?}", redacted);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Ok(command)
    }

    /// Run an action to completion and capture its output.
    pub async fn output(&self, invocation: Invocation) -> Result<Captured, Error> {
        // The child must not outlive a cancelled call.
        let mut child = self.command(&invocation)?.kill_on_drop(true).spawn()?;
        let pid = child_pid(&child)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = invocation.input.clone().unwrap_or_default();

        let exchange = async {
            let (_, stdout, stderr, status) = tokio::try_join!(
                write_input(stdin, input),
                read_output(stdout),
                read_output(stderr),
                child.wait()
            )?;
            Ok::<_, io::Error>(Output {
                status,
                stdout,
                stderr,
            })
        };

        let output = match self.timeout {
            Some(limit) => {
                let result = time::timeout(limit, exchange).await;
                match result {
                    Ok(output) => output?,
                    Err(_) => {
                        warn!(
                            "Action {} timed out after {}s, terminating",
                            invocation.action,
                            limit.as_secs()
                        );
                        stop(&mut child, pid).await?;
                        return Err(Error::Timeout {
                            action: invocation.action.clone(),
                            seconds: limit.as_secs(),
                        });
                    }
                }
            }
            None => exchange.await?,
        };

        check_output(&invocation.action, &invocation.privilege, invocation.quiet, output)
    }

    /// Run an action and return its standard output.
    pub async fn run(&self, invocation: Invocation) -> Result<String, Error> {
        self.output(invocation).await.map(|captured| captured.stdout)
    }

    /// Run an action as root.
    pub async fn superuser_run<I>(&self, action: &str, args: I) -> Result<String, Error>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.run(Invocation::new(action).args(args).as_root()).await
    }

    /// Run an action as another user.
    pub async fn run_as_user<I>(&self, action: &str, user: &str, args: I) -> Result<String, Error>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.run(Invocation::new(action).args(args).as_user(user))
            .await
    }

    /// Start an action without waiting for it.
    ///
    /// The action keeps running if the returned handle is dropped.
    pub async fn spawn(&self, invocation: Invocation) -> Result<Process, Error> {
        let mut child = self.command(&invocation)?.spawn()?;
        let pid = child_pid(&child)?;

        let stdin = child.stdin.take();
        if let Some(input) = invocation.input {
            let action = invocation.action.clone();
            tokio::spawn(async move {
                if let Err(err) = write_input(stdin, input).await {
                    warn!("Failed to write input of action {} - {}", action, err);
                }
            });
        }

        Ok(Process {
            action: invocation.action,
            pid,
            child,
            privilege: invocation.privilege,
            quiet: invocation.quiet,
        })
    }
}

/// A running action.
#[derive(Debug, Deref, DerefMut)]
pub struct Process {
    action: String,
    pid: Pid,
    #[deref]
    #[deref_mut]
    child: Child,
    privilege: Privilege,
    quiet: bool,
}

impl Process {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ask the action to stop.
    pub fn terminate(&self) -> Result<(), Error> {
        kill(self.pid, Signal::SIGTERM).map_err(Into::into)
    }

    /// Exit status, if the action has exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, Error> {
        self.child.try_wait().map_err(Into::into)
    }

    /// Wait for the action and capture its output.
    pub async fn join(self) -> Result<Captured, Error> {
        let output = self.child.wait_with_output().await?;
        check_output(&self.action, &self.privilege, self.quiet, output)
    }
}

fn child_pid(child: &Child) -> Result<Pid, Error> {
    child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .map(Pid::from_raw)
        .ok_or(Error::InvalidProcess)
}

/// Terminate a child, then kill it if it ignores `SIGTERM`.
async fn stop(child: &mut Child, pid: Pid) -> Result<(), Error> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    kill(pid, Signal::SIGTERM)?;
    if time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        warn!("Action with pid {} ignored SIGTERM, killing it", pid);
        child.kill().await?;
    }

    Ok(())
}

async fn read_output<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn write_input(stdin: Option<ChildStdin>, input: Vec<u8>) -> io::Result<()> {
    if let Some(mut stdin) = stdin {
        match stdin.write_all(&input).await {
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
            result => result?,
        }
    }
    Ok(())
}

fn check_output(
    action: &str,
    privilege: &Privilege,
    quiet: bool,
    output: Output,
) -> Result<Captured, Error> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        return Ok(Captured { stdout, stderr });
    }

    let err = ActionError {
        action: action.to_string(),
        stdout,
        stderr,
        code: output.status.code(),
    };
    if !quiet {
        error!(
            "Error executing action {}, code {:?} - {}",
            action,
            err.code,
            err.message()
        );
    }

    if *privilege != Privilege::CurrentUser && err.is_elevation_failure() {
        Err(Error::Elevation(err))
    } else {
        Err(Error::Action(err))
    }
}

#[cfg(test)]
mod tests {
    use super::{Invocation, Privilege, Runner};
    use crate::{config::Config, Error};
    use std::{ffi::OsString, fs};

    fn runner() -> (tempfile::TempDir, Runner) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("echo"), "#!/bin/sh\n").unwrap();

        let config = Config {
            actions_dir: dir.path().to_path_buf(),
            sudo: "/usr/bin/sudo".into(),
            ..Default::default()
        };
        let runner = Runner::new(&config).unwrap();
        (dir, runner)
    }

    fn strings(argv: Vec<OsString>) -> Vec<String> {
        argv.into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_argv() {
        let (_dir, runner) = runner();
        let path = runner.actions_dir().join("echo").display().to_string();

        let invocation = Invocation::new("echo").arg("a;b").arg("$(id)");
        assert_eq!(
            strings(runner.argv(&invocation).unwrap()),
            vec![path.clone(), "a;b".to_string(), "$(id)".to_string()]
        );

        let invocation = Invocation::new("echo").arg("x").as_root();
        assert_eq!(
            strings(runner.argv(&invocation).unwrap()),
            vec!["/usr/bin/sudo", "-n", path.as_str(), "x"]
        );

        let invocation = Invocation::new("echo").as_user("root");
        assert_eq!(
            strings(runner.argv(&invocation).unwrap()),
            vec!["/usr/bin/sudo", "-n", "-u", "root", path.as_str()]
        );
    }

    #[test]
    fn test_unknown_user() {
        let (_dir, runner) = runner();
        let invocation = Invocation::new("echo").as_user("no-such-user-for-actions");
        assert!(matches!(
            runner.argv(&invocation),
            Err(Error::UserNotFound(user)) if user == "no-such-user-for-actions"
        ));
    }

    #[test]
    fn test_redacted_arguments() {
        let invocation = Invocation::new("users")
            .arg("set-password")
            .secret_arg("hunter2")
            .arg("admin")
            .stdin("hunter2");

        assert_eq!(
            invocation.redacted_arguments(),
            vec!["set-password", "****", "admin"]
        );
        assert_eq!(invocation.arguments()[1], "hunter2");

        let debug = format!("{:?}", invocation);
        assert!(!debug.contains("hunter2"));
        assert_eq!(invocation.privilege(), &Privilege::CurrentUser);
    }
}
