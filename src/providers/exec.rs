//! `exec` - run a local command on create, and optionally on destroy
//!
//! The child is polled so an interrupted run can kill it instead of waiting
//! for it to finish.

use converge::{Provider, ProviderContext, ProviderError, ProviderLogger, Resource};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

/// Interval between child status checks
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stored stdout is truncated to this many bytes
const MAX_STDOUT: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    working_directory: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    destroy_command: Option<String>,
    #[serde(default)]
    destroy_args: Vec<String>,
}

#[derive(Default)]
pub struct ExecProvider {
    config: Option<ExecConfig>,
    outputs: Value,
    log: Option<ProviderLogger>,
}

/// Exit status and captured output of a finished command
struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ExecProvider {
    pub fn boxed() -> Box<dyn Provider> {
        Box::new(Self::default())
    }

    fn config(&self) -> Result<&ExecConfig, ProviderError> {
        self.config
            .as_ref()
            .ok_or_else(|| ProviderError::failed("provider used before init"))
    }

    fn command(&self, program: &str, args: &[String]) -> Result<Command, ProviderError> {
        let config = self.config()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(crate::paths::expand(dir));
        }
        Ok(cmd)
    }

    fn run(&self, program: &str, args: &[String], ctx: &ProviderContext) -> Result<Finished, ProviderError> {
        if let Some(log) = &self.log {
            log.info(format_args!("running {program} {}", args.join(" ")));
        }

        let mut child = self
            .command(program, args)?
            .spawn()
            .map_err(|e| ProviderError::failed(format!("failed to start {program}: {e}")))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait(&mut child, ctx)?;

        Ok(Finished {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

/// Read a pipe to the end on a helper thread so the child never blocks
///
/// Output that is not valid UTF-8 is decoded lossily.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                log::debug!("Could not read child output: {e}");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for the child, killing it if the run is cancelled
fn wait(child: &mut Child, ctx: &ProviderContext) -> Result<ExitStatus, ProviderError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if ctx.sleep(POLL_INTERVAL).is_err() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProviderError::Cancelled);
        }
    }
}

fn check(program: &str, finished: &Finished) -> Result<(), ProviderError> {
    if finished.status.success() {
        return Ok(());
    }
    let stderr = finished.stderr.trim();
    Err(ProviderError::failed(match finished.status.code() {
        Some(code) => format!("{program} exited with status {code}: {stderr}"),
        None => format!("{program} was terminated by a signal: {stderr}"),
    }))
}

impl Provider for ExecProvider {
    fn init(&mut self, resource: &Resource, log: ProviderLogger) -> Result<(), ProviderError> {
        let config: ExecConfig = serde_json::from_value(resource.config.clone())?;
        if config.command.trim().is_empty() {
            return Err(ProviderError::Config("command must not be empty".into()));
        }
        self.config = Some(config);
        self.outputs = resource.outputs.clone();
        self.log = Some(log);
        Ok(())
    }

    fn create(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError> {
        let config = self.config()?.clone();
        let finished = self.run(&config.command, &config.args, ctx)?;
        check(&config.command, &finished)?;

        let mut stdout = finished.stdout;
        if stdout.len() > MAX_STDOUT {
            let mut cut = MAX_STDOUT;
            while !stdout.is_char_boundary(cut) {
                cut -= 1;
            }
            stdout.truncate(cut);
        }
        self.outputs = json!({
            "exit_code": finished.status.code(),
            "stdout": stdout.trim_end(),
        });
        Ok(())
    }

    fn destroy(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError> {
        let config = self.config()?.clone();
        let Some(program) = &config.destroy_command else {
            return Ok(());
        };
        let finished = self.run(program, &config.destroy_args, ctx)?;
        check(program, &finished)
    }

    fn refresh(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        Ok(())
    }

    fn changed(&self, _ctx: &ProviderContext) -> Result<bool, ProviderError> {
        Ok(false)
    }

    fn lookup(&self, _ctx: &ProviderContext) -> Result<Vec<String>, ProviderError> {
        let config = self.config()?;
        let mut line = config.command.clone();
        for arg in &config.args {
            line.push(' ');
            line.push_str(arg);
        }
        Ok(vec![line])
    }

    fn outputs(&self) -> Value {
        self.outputs.clone()
    }
}
