//! Entry point command building

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use runtime_core::config::SupervisorConfig;
use runtime_core::{Error, ExecutionEnvironment, Result};
use tracing::{debug, info, warn};

use crate::quote;

/// How an entry point is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointKind {
    /// Code dir is an installable package; run as `python -m <module>`
    PythonPackage,

    /// Python script; run as `python <file>`
    PythonProgram,

    /// Anything else; run through the shell as `./<file>`
    Command,
}

impl EntryPointKind {
    /// Detect the kind of `name` inside `code_dir`
    pub fn detect(code_dir: &Path, name: &str) -> Self {
        if code_dir.join("setup.py").is_file() {
            EntryPointKind::PythonPackage
        } else if name.ends_with(".py") {
            EntryPointKind::PythonProgram
        } else {
            EntryPointKind::Command
        }
    }

    /// Returns true for both python kinds
    pub fn is_python(&self) -> bool {
        !matches!(self, EntryPointKind::Command)
    }
}

/// A fully resolved command: argv, environment and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable
    pub program: String,

    /// Arguments after the executable
    pub args: Vec<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,

    /// When true `env` is the complete environment; otherwise it is
    /// applied on top of the inherited one
    pub clear_env: bool,

    /// Working directory; inherited when unset
    pub cwd: Option<PathBuf>,

    /// Label tagging every output line of the process
    pub label: String,
}

impl CommandSpec {
    /// Create a command from an argv whose first element is the executable
    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next().ok_or_else(|| Error::InvalidConfig {
            message: "empty command line".to_string(),
        })?;
        Ok(Self {
            label: program_label(&program),
            program,
            args: argv.collect(),
            env: BTreeMap::new(),
            clear_env: false,
            cwd: None,
        })
    }

    /// Set the working directory
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the output label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Executable followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted command line, for logs and failure messages
    pub fn render(&self) -> String {
        quote::join(self.argv())
    }
}

fn program_label(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// The user entry point together with how it is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCommand {
    /// Entry point kind
    pub kind: EntryPointKind,

    /// Entry point file name, relative to the code dir
    pub entry_point: String,

    /// User arguments
    pub args: Vec<String>,

    /// Interpreter argv for the python kinds
    pub interpreter: Vec<String>,

    /// Shell used for the command kind
    pub shell: String,
}

impl EntryCommand {
    /// Replace the interpreter argv (MPI wraps python with `-m mpi4py`)
    pub fn with_interpreter(mut self, interpreter: Vec<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Module name of a python package entry point
    pub fn module_name(&self) -> &str {
        self.entry_point
            .strip_suffix(".py")
            .unwrap_or(&self.entry_point)
    }

    /// Argv that runs the entry point directly
    pub fn argv(&self) -> Vec<String> {
        match self.kind {
            EntryPointKind::PythonPackage => {
                let mut argv = self.interpreter.clone();
                argv.push("-m".to_string());
                argv.push(self.module_name().to_string());
                argv.extend(self.args.iter().cloned());
                argv
            }
            EntryPointKind::PythonProgram => {
                let mut argv = self.interpreter.clone();
                argv.push(self.entry_point.clone());
                argv.extend(self.args.iter().cloned());
                argv
            }
            EntryPointKind::Command => vec![
                self.shell.clone(),
                "-c".to_string(),
                self.shell_line(),
            ],
        }
    }

    /// Argv handed to an external launcher that brings its own interpreter
    ///
    /// Python programs lose the interpreter; packages keep it since a
    /// module cannot be named by path. Commands are passed by path so the
    /// launcher receives the user arguments unsplit.
    pub fn launcher_payload(&self, include_interpreter: bool) -> Vec<String> {
        match self.kind {
            EntryPointKind::PythonProgram if !include_interpreter => {
                std::iter::once(self.entry_point.clone())
                    .chain(self.args.iter().cloned())
                    .collect()
            }
            EntryPointKind::Command => std::iter::once(format!("./{}", self.entry_point))
                .chain(self.args.iter().cloned())
                .collect(),
            _ => self.argv(),
        }
    }

    fn shell_line(&self) -> String {
        let program = format!("./{}", self.entry_point);
        if self.args.is_empty() {
            quote::quote(&program).into_owned()
        } else {
            format!("{} {}", quote::quote(&program), quote::join(&self.args))
        }
    }
}

/// Turns an execution environment into runnable commands
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Interpreter for python entry points
    python_executable: String,

    /// Shell for command entry points
    shell: String,

    /// Environment inherited from the launcher process
    inherited: BTreeMap<String, String>,
}

impl CommandBuilder {
    /// Create a builder inheriting the launcher's own environment
    pub fn new(config: &SupervisorConfig) -> Self {
        let inherited = utf8_environment(std::env::vars_os());
        Self {
            python_executable: config.python_executable.clone(),
            shell: config.shell.clone(),
            inherited,
        }
    }

    /// Replace the inherited environment
    pub fn with_inherited_env(mut self, inherited: BTreeMap<String, String>) -> Self {
        self.inherited = inherited;
        self
    }

    /// Resolve and validate the entry point of `env`
    pub fn entry_command(&self, env: &ExecutionEnvironment) -> Result<EntryCommand> {
        let kind = EntryPointKind::detect(&env.code_dir, &env.entry_point);
        check_entry_point(&env.code_dir.join(&env.entry_point), kind)?;

        Ok(EntryCommand {
            kind,
            entry_point: env.entry_point.clone(),
            args: env.args.clone(),
            interpreter: vec![self.python_executable.clone()],
            shell: self.shell.clone(),
        })
    }

    /// Inherited environment overlaid with the snapshot's variables
    pub fn environment(&self, env: &ExecutionEnvironment) -> BTreeMap<String, String> {
        let mut merged = self.inherited.clone();
        merged.extend(env.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Wrap an argv with the derived environment and the code dir
    pub fn spec(&self, env: &ExecutionEnvironment, argv: Vec<String>) -> Result<CommandSpec> {
        let mut spec = CommandSpec::from_argv(argv)?.current_dir(&env.code_dir);
        spec.env = self.environment(env);
        spec.clear_env = true;
        Ok(spec)
    }

    /// Command running the entry point once, directly
    pub fn build(&self, env: &ExecutionEnvironment) -> Result<CommandSpec> {
        let entry = self.entry_command(env)?;
        let spec = self.spec(env, entry.argv())?;
        log_invocation(&spec, env);
        Ok(spec)
    }
}

fn check_entry_point(path: &Path, kind: EntryPointKind) -> Result<()> {
    let display = path.display().to_string();
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => Error::EntryPointNotReadable {
            path: display.clone(),
        },
        _ => Error::EntryPointNotFound {
            path: display.clone(),
        },
    })?;

    match kind {
        // A package entry may name a module directory
        EntryPointKind::PythonPackage if metadata.is_dir() => Ok(()),
        EntryPointKind::PythonPackage | EntryPointKind::PythonProgram => {
            if !metadata.is_file() {
                return Err(Error::EntryPointNotFound { path: display });
            }
            std::fs::File::open(path)
                .map(|_| ())
                .map_err(|_| Error::EntryPointNotReadable { path: display })
        }
        EntryPointKind::Command => {
            if !metadata.is_file() {
                return Err(Error::EntryPointNotFound { path: display });
            }
            if !is_executable(&metadata) {
                return Err(Error::EntryPointNotExecutable { path: display });
            }
            Ok(())
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Log the command and the snapshot-derived variables of an invocation
pub fn log_invocation(spec: &CommandSpec, env: &ExecutionEnvironment) {
    info!(
        host = %env.current_host,
        label = %spec.label,
        command = %spec.render(),
        "Invoking user script"
    );
    for (key, value) in &env.env_vars {
        debug!(key = %key, value = %value, "Script environment variable");
    }
}

/// Keep the variables representable as UTF-8
///
/// Training processes get a cleared environment rebuilt from this map, so
/// anything skipped here is missing in the child and gets a warning.
fn utf8_environment(vars: impl IntoIterator<Item = (OsString, OsString)>) -> BTreeMap<String, String> {
    let mut environment = BTreeMap::new();
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                environment.insert(key, value);
            }
            (Ok(key), Err(_)) => {
                warn!(name = %key, "Not passing on environment variable with non-UTF-8 value");
            }
            (Err(key), _) => {
                warn!(
                    name = %key.to_string_lossy(),
                    "Not passing on environment variable with non-UTF-8 name"
                );
            }
        }
    }
    environment
}
