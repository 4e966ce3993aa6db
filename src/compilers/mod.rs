//! Toolchain registry and per-language command shaping.
//!
//! The registry is populated once at startup by probing `PATH` for the
//! expected executables and is immutable for the life of the process.
//! Command shaping is a closed per-language case set: each language
//! either has a compile step, a direct interpreter, or both, and the
//! descriptor knows how to phrase all three phases (compile, execute,
//! syntax check) for the job's sandbox directory.

pub mod executor;

use codeforge_protocol::Language;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// A detected toolchain.
#[derive(Debug, Clone)]
pub struct CompilerDescriptor {
    pub language: Language,
    /// Executable name as probed (`gcc`, `python3`, ...).
    pub name: &'static str,
    /// Resolved absolute path.
    pub path: PathBuf,
    /// First line of the version output.
    pub version: String,
    /// Arguments always passed before user compile args.
    pub default_args: &'static str,
    /// Recognised source extensions, without the dot.
    pub extensions: &'static [&'static str],
    pub supports_debug: bool,
    pub supports_optimize: bool,
    /// Detection priority; higher wins when extensions overlap.
    pub priority: u8,
}

/// Inputs to command shaping, all relative to the sandbox directory.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    /// Source file basename inside the sandbox.
    pub source: &'a str,
    /// Output executable basename for compiled languages.
    pub executable: &'a str,
    /// User-supplied compiler arguments, appended verbatim.
    pub compiler_args: &'a str,
    /// User-supplied program arguments, appended verbatim.
    pub execution_args: &'a str,
}

impl CompilerDescriptor {
    /// Shape the compile command, or `None` for languages with no
    /// compile step. All commands run with the sandbox as cwd, so paths
    /// are bare basenames.
    ///
    /// User arguments are interpolated verbatim into the shell line;
    /// callers treat them as untrusted but unshielded.
    pub fn compile_command(&self, spec: &CommandSpec<'_>) -> Option<String> {
        let path = self.path.display();
        match self.language {
            Language::C | Language::Cpp | Language::Rust => Some(format!(
                "{path} {} {} -o '{}' '{}'",
                self.default_args, spec.compiler_args, spec.executable, spec.source
            )),
            Language::Java => Some(format!(
                "{path} {} {} '{}'",
                self.default_args, spec.compiler_args, spec.source
            )),
            Language::Go => Some(format!(
                "{path} build {} -o '{}' '{}'",
                spec.compiler_args, spec.executable, spec.source
            )),
            Language::Python | Language::JavaScript => None,
        }
    }

    /// Shape the execute command, wrapped in the external `timeout`
    /// utility as a second line of defence behind host supervision.
    /// `None` for compiled languages asked to interpret directly.
    pub fn execute_command(&self, spec: &CommandSpec<'_>, timeout_secs: u64) -> Option<String> {
        let path = self.path.display();
        match self.language {
            Language::C | Language::Cpp | Language::Go | Language::Rust => Some(format!(
                "timeout {timeout_secs} './{}' {}",
                spec.executable, spec.execution_args
            )),
            Language::Java => {
                let class = spec.source.rsplit_once('.').map_or(spec.source, |(s, _)| s);
                Some(format!(
                    "timeout {timeout_secs} java {class} {}",
                    spec.execution_args
                ))
            }
            Language::Python | Language::JavaScript => Some(format!(
                "timeout {timeout_secs} {path} {} '{}' {}",
                self.default_args, spec.source, spec.execution_args
            )),
        }
    }

    /// True when the language runs through an interpreter rather than a
    /// compiled binary.
    pub fn is_interpreted(&self) -> bool {
        matches!(self.language, Language::Python | Language::JavaScript)
    }

    /// Shape the syntax-only check command.
    pub fn syntax_check_command(&self, spec: &CommandSpec<'_>) -> String {
        let path = self.path.display();
        match self.language {
            Language::C | Language::Cpp => format!(
                "{path} {} {} -fsyntax-only '{}'",
                self.default_args, spec.compiler_args, spec.source
            ),
            Language::Java => format!(
                "{path} {} {} '{}'",
                self.default_args, spec.compiler_args, spec.source
            ),
            Language::Python => format!("{path} -m py_compile '{}'", spec.source),
            Language::JavaScript => format!("{path} --check '{}'", spec.source),
            Language::Go => format!("{path} vet '{}'", spec.source),
            Language::Rust => format!(
                "{path} {} {} --emit=metadata '{}'",
                self.default_args, spec.compiler_args, spec.source
            ),
        }
    }
}

/// Immutable set of detected toolchains.
#[derive(Debug, Default)]
pub struct CompilerRegistry {
    descriptors: Vec<CompilerDescriptor>,
}

/// Static probe table: executable, version argument, and descriptor
/// template per language.
struct ProbeSpec {
    language: Language,
    executable: &'static str,
    version_arg: &'static str,
    default_args: &'static str,
    extensions: &'static [&'static str],
    supports_debug: bool,
    supports_optimize: bool,
    priority: u8,
}

const PROBES: &[ProbeSpec] = &[
    ProbeSpec {
        language: Language::C,
        executable: "gcc",
        version_arg: "--version",
        default_args: "-Wall -Wextra -std=c99",
        extensions: &["c"],
        supports_debug: true,
        supports_optimize: true,
        priority: 10,
    },
    ProbeSpec {
        language: Language::Cpp,
        executable: "g++",
        version_arg: "--version",
        default_args: "-Wall -Wextra -std=c++17",
        extensions: &["cpp", "cc", "cxx"],
        supports_debug: true,
        supports_optimize: true,
        priority: 10,
    },
    ProbeSpec {
        language: Language::Java,
        executable: "javac",
        version_arg: "-version",
        default_args: "-cp .",
        extensions: &["java"],
        supports_debug: true,
        supports_optimize: false,
        priority: 8,
    },
    ProbeSpec {
        language: Language::Python,
        executable: "python3",
        version_arg: "--version",
        default_args: "-B",
        extensions: &["py"],
        supports_debug: false,
        supports_optimize: false,
        priority: 7,
    },
    ProbeSpec {
        language: Language::JavaScript,
        executable: "node",
        version_arg: "--version",
        default_args: "",
        extensions: &["js"],
        supports_debug: false,
        supports_optimize: false,
        priority: 6,
    },
    ProbeSpec {
        language: Language::Go,
        executable: "go",
        version_arg: "version",
        default_args: "",
        extensions: &["go"],
        supports_debug: false,
        supports_optimize: true,
        priority: 5,
    },
    ProbeSpec {
        language: Language::Rust,
        executable: "rustc",
        version_arg: "--version",
        default_args: "--edition 2021",
        extensions: &["rs"],
        supports_debug: true,
        supports_optimize: true,
        priority: 4,
    },
];

impl CompilerRegistry {
    /// Probe `PATH` for every expected toolchain.
    pub fn detect() -> Self {
        let mut descriptors = Vec::new();
        for probe in PROBES {
            let Some(path) = find_in_path(probe.executable) else {
                debug!(executable = probe.executable, "toolchain not found");
                continue;
            };
            let Some(version) = version_line(&path, probe.version_arg) else {
                debug!(executable = probe.executable, "toolchain did not report a version");
                continue;
            };
            info!(language = %probe.language, path = %path.display(), version, "detected toolchain");
            descriptors.push(CompilerDescriptor {
                language: probe.language,
                name: probe.executable,
                path,
                version,
                default_args: probe.default_args,
                extensions: probe.extensions,
                supports_debug: probe.supports_debug,
                supports_optimize: probe.supports_optimize,
                priority: probe.priority,
            });
        }
        Self { descriptors }
    }

    /// Build a registry from explicit descriptors. Used by tests.
    pub fn with_descriptors(descriptors: Vec<CompilerDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn resolve(&self, language: Language) -> Option<&CompilerDescriptor> {
        self.descriptors.iter().find(|d| d.language == language)
    }

    /// Resolve by source extension (without the dot). When extensions
    /// overlap the highest-priority descriptor wins.
    pub fn resolve_by_extension(&self, ext: &str) -> Option<&CompilerDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .max_by_key(|d| d.priority)
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompilerDescriptor> {
        self.descriptors.iter()
    }
}

fn find_in_path(executable: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(executable);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn version_line(path: &Path, version_arg: &str) -> Option<String> {
    let output = Command::new(path).arg(version_arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    // Some tools (javac) print the version on stderr.
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    let line = String::from_utf8_lossy(&text)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// A fabricated descriptor for shaping tests and session-layer tests
/// that should not depend on which toolchains the host has installed.
#[doc(hidden)]
pub fn fake_descriptor(language: Language) -> CompilerDescriptor {
    let probe = PROBES
        .iter()
        .find(|p| p.language == language)
        .expect("every language has a probe entry");
    CompilerDescriptor {
        language,
        name: probe.executable,
        path: PathBuf::from(probe.executable),
        version: "test 0.0.0".to_string(),
        default_args: probe.default_args,
        extensions: probe.extensions,
        supports_debug: probe.supports_debug,
        supports_optimize: probe.supports_optimize,
        priority: probe.priority,
    }
}
