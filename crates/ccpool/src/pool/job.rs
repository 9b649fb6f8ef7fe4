//! Compile jobs and their live child processes.

use std::ffi::{OsStr, OsString};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How long a harvested job may take to hit EOF on its output pipe after the
/// compiler itself exited. Only exceeded when a stray background process keeps
/// the pipe open.
const COLLECT_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Executable plus ordered arguments for one compiler invocation.
///
/// The pool never interprets the arguments; it only launches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CompileCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `compiler -o <output> -c <source> <flags...>`: compile one source into
    /// one object file.
    pub fn object(
        compiler: impl Into<PathBuf>,
        source: &Path,
        output: &Path,
        flags: &[String],
    ) -> Self {
        Self::new(compiler)
            .arg("-o")
            .arg(output)
            .arg("-c")
            .arg(source)
            .args(flags)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Short compiler name used in failure notices (`gcc`, not `/usr/bin/gcc`).
    pub fn compiler_name(&self) -> String {
        self.program.file_name().map_or_else(
            || self.program.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }

    /// The full command line, space separated, for build traces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A unit of work: one source compiled into one output by one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Identity of the job while it is live.
    pub source: PathBuf,
    pub output: PathBuf,
    pub command: CompileCommand,
}

/// Result of draining a job's combined output pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected {
    /// The pipe reached EOF and everything the child wrote is here.
    Complete(String),
    /// The compiler exited but its output could not be read to EOF, either
    /// because of a read error or because something it left behind still
    /// holds the pipe. Holds whatever was read up to that point.
    Truncated(String),
    /// The job was torn down; its output is discarded.
    Aborted,
}

/// Bytes read from a child's output pipe so far, shared with the thread
/// doing the reading.
#[derive(Debug, Default, Clone)]
struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_text(&self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut *self.lock())).into_owned()
    }
}

/// A launched job: the child process plus the thread draining its output.
pub(crate) struct RunningJob {
    job: Job,
    child: Child,
    output: OutputBuffer,
    /// Fires once the collector thread hits EOF or a read error.
    eof: oneshot::Receiver<std::io::Result<()>>,
}

impl RunningJob {
    /// Spawn the compiler with stdout and stderr sharing one pipe, so the
    /// captured text keeps the order the child produced it in.
    ///
    /// On failure the job is handed back alongside the error.
    pub(crate) fn launch(job: Job) -> Result<Self, (Job, std::io::Error)> {
        let output = OutputBuffer::default();
        match Self::spawn(&job, output.clone()) {
            Ok((child, eof)) => Ok(Self {
                job,
                child,
                output,
                eof,
            }),
            Err(e) => Err((job, e)),
        }
    }

    /// On unix the compiler leads its own process group, so teardown also
    /// reaches the helpers a compiler driver starts (`cc1`, `as`, ...).
    fn spawn(
        job: &Job,
        output: OutputBuffer,
    ) -> std::io::Result<(Child, oneshot::Receiver<std::io::Result<()>>)> {
        let (mut reader, writer) = std::io::pipe()?;
        let stderr_writer = writer.try_clone()?;

        let mut cmd = Command::new(job.command.program());
        cmd.args(job.command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn()?;
        // The command still holds the parent's write ends; the reader only
        // sees EOF once they are closed.
        drop(cmd);

        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("ccpool-output".to_string())
            .spawn(move || {
                let _ = tx.send(drain_pipe(&mut reader, &output));
            })?;

        Ok((child, rx))
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking exit check.
    pub(crate) fn try_finish(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the output pipe to be fully drained. Only call once the
    /// child has exited. Never returns [`Collected::Aborted`].
    pub(crate) async fn collect(self) -> (Job, Collected) {
        let finished = tokio::time::timeout(COLLECT_GRACE, self.eof).await;
        let text = self.output.take_text();
        let collected = match finished {
            Ok(Ok(Ok(()))) => Collected::Complete(text),
            Ok(Ok(Err(e))) => {
                warn!(source = %self.job.source.display(), error = %e, "Failed to read compiler output");
                Collected::Truncated(text)
            }
            Ok(Err(_)) => {
                debug!(source = %self.job.source.display(), "Output collector went away");
                Collected::Truncated(text)
            }
            Err(_) => {
                warn!(
                    source = %self.job.source.display(),
                    grace_secs = COLLECT_GRACE.as_secs(),
                    "Output pipe still open after compiler exit, reporting what was read"
                );
                Collected::Truncated(text)
            }
        };
        (self.job, collected)
    }

    /// Kill the child and everything in its process group without a grace
    /// period, then reap it. Any output it produced is discarded.
    pub(crate) async fn terminate(mut self) -> (Job, Collected) {
        let pid = self.child.id();
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        match self.child.kill().await {
            Ok(()) => warn!(source = %self.job.source.display(), ?pid, "Terminated compiler"),
            Err(e) => warn!(
                source = %self.job.source.display(),
                ?pid,
                error = %e,
                "Failed to terminate compiler"
            ),
        }
        (self.job, Collected::Aborted)
    }
}

/// Read `reader` to EOF, appending to `output` as bytes arrive so a caller
/// that stops waiting still sees everything read so far.
fn drain_pipe(reader: &mut impl Read, output: &OutputBuffer) -> std::io::Result<()> {
    let mut chunk = vec![0; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => output.lock().extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
        && e != Errno::ESRCH
    {
        debug!(pid, error = %e, "Failed to kill compiler process group");
    }
}

#[cfg(not(unix))]
const fn kill_process_group(_pid: u32) {}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn object_command_layout() {
        let cmd = CompileCommand::object(
            "/usr/bin/gcc",
            Path::new("src/main.c"),
            Path::new("build/main.o"),
            &["-O2".to_string(), "-Wall".to_string()],
        );
        assert_eq!(cmd.program(), Path::new("/usr/bin/gcc"));
        assert_eq!(
            cmd.command_line(),
            "/usr/bin/gcc -o build/main.o -c src/main.c -O2 -Wall"
        );
        assert_eq!(cmd.compiler_name(), "gcc");
    }

    #[test]
    fn compiler_name_without_directory() {
        assert_eq!(CompileCommand::new("clang").compiler_name(), "clang");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_interleaved_stdout_and_stderr() {
        let job = Job {
            source: "a.c".into(),
            output: "a.o".into(),
            command: CompileCommand::new("sh")
                .arg("-c")
                .arg("echo one; echo two 1>&2; echo three"),
        };
        let mut running = RunningJob::launch(job).unwrap();
        let status = loop {
            if let Some(status) = running.try_finish().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(status.success());

        let (job, collected) = running.collect().await;
        assert_eq!(job.source, Path::new("a.c"));
        assert_eq!(collected, Collected::Complete("one\ntwo\nthree\n".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_output_larger_than_a_pipe_buffer() {
        let job = Job {
            source: "big.c".into(),
            output: "big.o".into(),
            command: CompileCommand::new("sh")
                .arg("-c")
                .arg("i=0; while [ $i -lt 4000 ]; do echo 'warning: some rather long diagnostic line'; i=$((i+1)); done"),
        };
        let mut running = RunningJob::launch(job).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while running.try_finish().unwrap().is_none() {
            assert!(std::time::Instant::now() < deadline, "child blocked on a full pipe");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (_, collected) = running.collect().await;
        let Collected::Complete(text) = collected else {
            panic!("expected complete output");
        };
        assert_eq!(text.lines().count(), 4000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_holder_truncates_instead_of_aborting() {
        let job = Job {
            source: "bg.c".into(),
            output: "bg.o".into(),
            command: CompileCommand::new("sh")
                .arg("-c")
                .arg("echo built; (sleep 5 &)"),
        };
        let mut running = RunningJob::launch(job).unwrap();
        let status = loop {
            if let Some(status) = running.try_finish().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(status.success());

        let (_, collected) = running.collect().await;
        assert_eq!(collected, Collected::Truncated("built\n".to_string()));
    }

    #[tokio::test]
    async fn launch_failure_returns_the_job() {
        let job = Job {
            source: "x.c".into(),
            output: "x.o".into(),
            command: CompileCommand::new("/nonexistent/ccpool-test-compiler"),
        };
        let Err((returned, _err)) = RunningJob::launch(job.clone()) else {
            panic!("launch of a missing binary should fail");
        };
        assert_eq!(returned, job);
    }
}
