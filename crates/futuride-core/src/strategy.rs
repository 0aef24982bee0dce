//! Per-language execution strategies

use crate::config::EngineConfig;
use crate::isolation::ProcessLimits;
use crate::language::Language;
use crate::workspace::Workspace;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// A program invocation the process runner can launch
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Extra environment on top of the engine's base environment
    pub env: Vec<(String, String)>,
    pub limits: ProcessLimits,
    pub timeout: Duration,
}

impl CommandSpec {
    fn new(program: impl Into<PathBuf>, limits: ProcessLimits, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            limits,
            timeout,
        }
    }

    #[must_use]
    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What the engine has to do to produce a result
#[derive(Debug, Clone)]
pub enum Launch {
    /// Run an interpreter over the source file
    Interpret(CommandSpec),
    /// Compile into the workspace, then run the binary if compilation succeeded
    CompileThenRun {
        compile: CommandSpec,
        run: CommandSpec,
    },
    /// Evaluate in the embedded JavaScript context
    Embedded { source: PathBuf, timeout: Duration },
    /// Hand the markup back untouched; nothing runs on the host
    Render,
}

/// Closed set of strategies, one per [`Language`]
#[derive(Debug, Clone)]
pub enum Strategy {
    Python {
        interpreter: PathBuf,
        limits: ProcessLimits,
        timeout: Duration,
    },
    C {
        compiler: PathBuf,
        cflags: Vec<String>,
        compile_limits: ProcessLimits,
        compile_timeout: Duration,
        limits: ProcessLimits,
        timeout: Duration,
    },
    JavaScript {
        timeout: Duration,
    },
    Html,
}

impl Strategy {
    #[must_use]
    pub fn for_language(language: Language, config: &EngineConfig) -> Self {
        match language {
            Language::Python => Self::Python {
                interpreter: config.toolchain.python.clone(),
                limits: config.limits,
                timeout: config.timeout,
            },
            Language::C => Self::C {
                compiler: config.toolchain.cc.clone(),
                cflags: config.toolchain.cflags.clone(),
                compile_limits: config.compile_limits,
                compile_timeout: config.compile_timeout,
                limits: config.limits,
                timeout: config.timeout,
            },
            Language::JavaScript => Self::JavaScript {
                timeout: config.timeout,
            },
            Language::Html => Self::Html,
        }
    }

    /// Turn the workspace contents into a launch plan
    #[must_use]
    pub fn build_command(&self, workspace: &Workspace) -> Launch {
        match self {
            Self::Python {
                interpreter,
                limits,
                timeout,
            } => Launch::Interpret(
                // -B: no .pyc files, -u: unbuffered so output survives a kill,
                // -I: ignore PYTHON* env and user site-packages
                CommandSpec::new(interpreter, *limits, *timeout)
                    .arg("-B")
                    .arg("-u")
                    .arg("-I")
                    .arg(workspace.source_file())
                    .env("PYTHONDONTWRITEBYTECODE", "1")
                    .env("PYTHONIOENCODING", "utf-8"),
            ),
            Self::C {
                compiler,
                cflags,
                compile_limits,
                compile_timeout,
                limits,
                timeout,
            } => {
                let binary = workspace
                    .binary_file()
                    .map_or_else(|| workspace.root().join("main"), ToOwned::to_owned);

                let mut compile = CommandSpec::new(compiler, *compile_limits, *compile_timeout);
                for flag in cflags {
                    compile = compile.arg(flag);
                }
                let compile = compile
                    .arg(workspace.source_file())
                    .arg("-o")
                    .arg(&binary)
                    .arg("-lm");

                Launch::CompileThenRun {
                    compile,
                    run: CommandSpec::new(binary, *limits, *timeout),
                }
            }
            Self::JavaScript { timeout } => Launch::Embedded {
                source: workspace.source_file().to_path_buf(),
                timeout: *timeout,
            },
            Self::Html => Launch::Render,
        }
    }
}
