use anyhow::{anyhow, bail, Context};
use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use itertools::Itertools;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, ScopedJoinHandle};
use tracing::{debug, info, warn};

use crate::{config::RunContext, error::PipelineError, freshness::is_outdated};

/// Where a stage reads its standard input from
#[derive(Debug, Clone)]
pub enum StageInput {
    Null,
    /// stdout of the previous stage, connected by an OS pipe
    Pipe,
    File(PathBuf),
    /// gzip file, decompressed on the fly by a pump thread
    Gzip(PathBuf),
    Bytes(Vec<u8>),
}

/// Where a stage sends its standard output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutput {
    Null,
    /// stdin of the next stage
    Pipe,
    /// the step's output, verbatim
    Artifact,
    /// the step's output, gzip-compressed as it streams
    GzipArtifact,
}

static NULL_INPUT: StageInput = StageInput::Null;
static PIPE_INPUT: StageInput = StageInput::Pipe;

/// One external command with declared stdin/stdout wiring
#[derive(Debug, Clone)]
pub struct Stage {
    program: String,
    args: Vec<OsString>,
    stdin: Option<StageInput>,
    stdout: Option<StageOutput>,
}

impl Stage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            stdin: None,
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn stdin(mut self, input: StageInput) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn stdout(mut self, output: StageOutput) -> Self {
        self.stdout = Some(output);
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .join(" ")
    }
}

/// Stages piped into each other that together produce one durable artifact.
///
/// The step runs only when its output is outdated relative to its declared
/// inputs. Processes write to a staging name that is renamed onto the output
/// once every process has exited successfully.
#[derive(Debug, Clone)]
pub struct Step {
    output: PathBuf,
    inputs: Vec<PathBuf>,
    stages: Vec<Stage>,
}

/// A stage with its wiring decided
struct Wired<'a> {
    stage: &'a Stage,
    stdin: &'a StageInput,
    stdout: StageOutput,
}

impl Step {
    pub fn new<P>(output: &Path, inputs: &[P]) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            output: output.to_owned(),
            inputs: inputs.iter().map(|p| p.as_ref().to_owned()).collect(),
            stages: vec![],
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Name written while the step is running; tools that take their output
    /// path as an argument must be given this path.
    pub fn staging_path(&self) -> PathBuf {
        staging_path(&self.output)
    }

    pub fn is_outdated(&self) -> bool {
        is_outdated(&self.output, &self.inputs)
    }

    pub fn describe(&self) -> String {
        let mut s = String::new();
        for (i, w) in self.wiring().unwrap_or_default().iter().enumerate() {
            match w.stdin {
                StageInput::Pipe if i > 0 => s.push_str(" | "),
                StageInput::File(p) => s.push_str(&format!("< {} ", p.display())),
                StageInput::Gzip(p) => s.push_str(&format!("zcat {} | ", p.display())),
                StageInput::Bytes(b) => s.push_str(&format!("<{} bytes> | ", b.len())),
                _ => {}
            }
            s.push_str(&w.stage.command_line());
            match w.stdout {
                StageOutput::Artifact => {
                    s.push_str(&format!(" > {}", self.output.display()))
                }
                StageOutput::GzipArtifact => {
                    s.push_str(&format!(" | gzip > {}", self.output.display()))
                }
                _ => {}
            }
        }
        s
    }

    /// Runs the step if needed and returns its output path either way.
    pub fn run(&self, ctx: &RunContext) -> anyhow::Result<PathBuf> {
        if !self.is_outdated() {
            debug!("fresh: {}", self.output.display());
            return Ok(self.output.clone());
        }
        let wiring = self.wiring()?;
        if ctx.dry_run {
            info!("{}", self.describe());
            return Ok(self.output.clone());
        }
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        info!("{}", self.describe());
        let staging = self.staging_path();
        match self.execute(&wiring, &staging) {
            Ok(()) => {
                if !staging.exists() {
                    bail!("{} did not write {}", self.describe(), staging.display());
                }
                fs::rename(&staging, &self.output).with_context(|| {
                    format!("cannot move {} into place", staging.display())
                })?;
                Ok(self.output.clone())
            }
            Err(e) => {
                if staging.exists() {
                    if let Err(rm) = fs::remove_file(&staging) {
                        warn!("cannot remove {}: {}", staging.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    /// Resolves defaults: a stage reads the previous stage's pipe and the last
    /// stage's stdout is discarded. Every pipe must have a reader.
    fn wiring(&self) -> anyhow::Result<Vec<Wired<'_>>> {
        if self.stages.is_empty() {
            bail!("step for {} has no stages", self.output.display());
        }
        let n = self.stages.len();
        let mut wired = Vec::with_capacity(n);
        let mut piped = false;
        for (i, stage) in self.stages.iter().enumerate() {
            let stdin = match &stage.stdin {
                Some(input) => input,
                None if piped => &PIPE_INPUT,
                None => &NULL_INPUT,
            };
            let is_pipe_in = matches!(stdin, StageInput::Pipe);
            if is_pipe_in != piped {
                bail!(
                    "stage {} ({}) does not match the pipe of its predecessor",
                    i,
                    stage.program
                );
            }
            let stdout = stage.stdout.unwrap_or(if i + 1 < n {
                StageOutput::Pipe
            } else {
                StageOutput::Null
            });
            piped = stdout == StageOutput::Pipe;
            wired.push(Wired {
                stage,
                stdin,
                stdout,
            });
        }
        if piped {
            bail!("last stage of {} writes into a pipe", self.output.display());
        }
        Ok(wired)
    }

    fn execute(&self, wiring: &[Wired<'_>], staging: &Path) -> anyhow::Result<()> {
        thread::scope(|scope| -> anyhow::Result<()> {
            let mut children: Vec<(Child, &Stage)> = vec![];
            let mut pumps: Vec<ScopedJoinHandle<'_, io::Result<()>>> = vec![];
            let mut upstream: Option<ChildStdout> = None;
            for w in wiring {
                let spawned = spawn_stage(w, staging, &mut upstream);
                let mut child = match spawned {
                    Ok(c) => c,
                    Err(e) => {
                        for (mut c, _) in children {
                            let _ = c.kill();
                            let _ = c.wait();
                        }
                        return Err(e);
                    }
                };
                match w.stdin {
                    StageInput::Gzip(path) => {
                        let mut sink = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
                        pumps.push(scope.spawn(move || -> io::Result<()> {
                            let mut source = MultiGzDecoder::new(File::open(path)?);
                            io::copy(&mut source, &mut sink)?;
                            Ok(())
                        }));
                    }
                    StageInput::Bytes(bytes) => {
                        let mut sink = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
                        pumps.push(scope.spawn(move || sink.write_all(bytes)));
                    }
                    _ => {}
                }
                match w.stdout {
                    StageOutput::Pipe => upstream = child.stdout.take(),
                    StageOutput::GzipArtifact => {
                        let mut source =
                            child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
                        pumps.push(scope.spawn(move || -> io::Result<()> {
                            let file = BufWriter::new(File::create(staging)?);
                            let mut encoder = GzEncoder::new(file, Compression::default());
                            io::copy(&mut source, &mut encoder)?;
                            encoder.finish()?.flush()
                        }));
                    }
                    _ => {}
                }
                children.push((child, w.stage));
            }
            let mut failure: Option<PipelineError> = None;
            for (mut child, stage) in children {
                let status = child.wait()?;
                if !status.success() && failure.is_none() {
                    failure = Some(PipelineError::ToolFailed {
                        program: stage.program.clone(),
                        command: self.describe(),
                        status,
                    });
                }
            }
            let mut pump_error: Option<io::Error> = None;
            for pump in pumps {
                match pump.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => pump_error = pump_error.or(Some(e)),
                    Err(_) => bail!("pump thread panicked for {}", self.output.display()),
                }
            }
            if let Some(f) = failure {
                return Err(f.into());
            }
            if let Some(e) = pump_error {
                return Err(e).with_context(|| format!("streaming {}", self.describe()));
            }
            Ok(())
        })
    }
}

/// Spawns one process. The `Command` is dropped on return so the parent keeps
/// no copy of pipe ends handed to the child.
fn spawn_stage(
    w: &Wired<'_>,
    staging: &Path,
    upstream: &mut Option<ChildStdout>,
) -> anyhow::Result<Child> {
    let mut cmd = Command::new(&w.stage.program);
    cmd.args(&w.stage.args);
    match w.stdin {
        StageInput::Null => cmd.stdin(Stdio::null()),
        StageInput::Pipe => {
            let pipe = upstream
                .take()
                .ok_or_else(|| anyhow!("{} expects a pipe", w.stage.program))?;
            cmd.stdin(Stdio::from(pipe))
        }
        StageInput::File(path) => cmd.stdin(Stdio::from(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        StageInput::Gzip(_) | StageInput::Bytes(_) => cmd.stdin(Stdio::piped()),
    };
    match w.stdout {
        StageOutput::Null => cmd.stdout(Stdio::null()),
        StageOutput::Pipe | StageOutput::GzipArtifact => cmd.stdout(Stdio::piped()),
        StageOutput::Artifact => cmd.stdout(Stdio::from(File::create(staging)?)),
    };
    cmd.spawn()
        .with_context(|| format!("cannot launch {}", w.stage.program))
}

pub fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_owned();
    name.push(".part");
    output.with_file_name(name)
}
