use anyhow::{Context, Result, anyhow};
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use tracing::{debug, trace};

/// A builder for executing external tools with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<&'a str>,
    workdir: Option<&'a Path>,
    stdin: Option<&'a [u8]>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            stdin: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: &'a str) -> Self {
        self.args.push(arg);
        self
    }

    /// Add multiple arguments
    pub fn args(mut self, args: &[&'a str]) -> Self {
        self.args.extend_from_slice(args);
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Feed bytes to the command's stdin
    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    fn spawn_and_wait(&self) -> Result<Output> {
        let mut cmd = Command::new(self.command);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        cmd.args(&self.args);

        let Some(input) = self.stdin else {
            return cmd.output().with_context(|| {
                format!(
                    "Failed to execute command: {} {}",
                    self.command,
                    self.args.join(" ")
                )
            });
        };

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", self.command))?;
        let pipe = child.stdin.take();

        // Feed stdin while the output pipes drain, or a chatty child blocks both sides
        thread::scope(|scope| {
            let writer = scope.spawn(move || -> io::Result<()> {
                if let Some(mut pipe) = pipe {
                    pipe.write_all(input)?;
                }
                Ok(())
            });
            let output = child
                .wait_with_output()
                .with_context(|| format!("Failed to wait for command: {}", self.command))?;
            match writer.join() {
                Ok(Ok(())) => {}
                // The child exited without reading everything; its status says why
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(command = self.command, "cmd:stdin closed early");
                }
                Ok(Err(e)) => {
                    return Err(e)
                        .with_context(|| format!("Failed to write stdin of {}", self.command));
                }
                Err(_) => return Err(anyhow!("stdin writer of {} panicked", self.command)),
            }
            Ok(output)
        })
    }

    /// Execute the command and return the output.
    /// Returns an error carrying the tool's diagnostic text on a non-zero exit.
    pub fn run(self) -> Result<Output> {
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:run start");

        let output = self.spawn_and_wait()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            // docker and git disagree on which stream gets the diagnostic
            let diagnostic = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                diagnostic = %diagnostic,
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                self.command,
                self.args.join(" "),
                diagnostic
            ));
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}
