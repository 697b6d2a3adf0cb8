//! Encoder binary resolution
//!
//! Locates the ffmpeg executable used for every export. The lookup order is
//! the `FFMPEG_PATH` override, then an `@ffmpeg-installer` package installed
//! next to the sketch, then a globally installed one, and finally a bare
//! `ffmpeg` on `PATH` (which must answer `-version`).

use crate::config::ENCODER_PATH_ENV;
use crate::export::types::ExportError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Scope of the npm package that ships prebuilt ffmpeg binaries
pub const INSTALLER_SCOPE: &str = "@ffmpeg-installer";

/// Name used when nothing better is found
pub const FALLBACK_BINARY: &str = "ffmpeg";

/// A resolved encoder program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderBinary {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl EncoderBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Run the encoder through a launcher, e.g. `nice -n 10 ffmpeg`.
    ///
    /// `leading_args` are passed before every generated argument list.
    pub fn wrapped<I, S>(program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }
}

/// Searches the places an encoder may be installed
#[derive(Debug, Clone)]
pub struct EncoderLocator {
    /// Value of the environment override, if set
    pub env_override: Option<PathBuf>,
    /// Directory the local package search starts from
    pub cwd: PathBuf,
    /// Global `node_modules` roots
    pub global_roots: Vec<PathBuf>,
    /// Bare program name tried last
    pub fallback: String,
}

impl EncoderLocator {
    /// Build a locator from the process environment
    pub fn from_env(cwd: impl Into<PathBuf>) -> Self {
        let env_override = std::env::var_os(ENCODER_PATH_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            env_override,
            cwd: cwd.into(),
            global_roots: default_global_roots(),
            fallback: FALLBACK_BINARY.to_string(),
        }
    }

    /// Resolve the encoder binary
    pub async fn resolve(&self) -> Result<EncoderBinary, ExportError> {
        if let Some(path) = &self.env_override {
            tracing::debug!("Using encoder from {}: {:?}", ENCODER_PATH_ENV, path);
            return Ok(EncoderBinary::new(path.clone()));
        }

        let mut searched = Vec::new();
        let package_binary = installer_binary_path();

        for dir in self.cwd.ancestors() {
            let candidate = dir.join("node_modules").join(&package_binary);
            if candidate.is_file() {
                tracing::debug!("Using locally installed encoder: {:?}", candidate);
                return Ok(EncoderBinary::new(candidate));
            }
        }
        searched.push(format!("{}/node_modules/{}", self.cwd.display(), package_binary.display()));

        for root in &self.global_roots {
            let candidate = root.join(&package_binary);
            if candidate.is_file() {
                tracing::debug!("Using globally installed encoder: {:?}", candidate);
                return Ok(EncoderBinary::new(candidate));
            }
            searched.push(candidate.display().to_string());
        }

        tracing::warn!(
            "Could not find ffmpeg installed locally or globally, defaulting to \"{}\". \
             Set {} or run `npm install {}/ffmpeg --save` to pin a binary.",
            self.fallback,
            ENCODER_PATH_ENV,
            INSTALLER_SCOPE
        );

        if is_runnable(&self.fallback).await {
            return Ok(EncoderBinary::new(&self.fallback));
        }
        searched.push(format!("{} on PATH", self.fallback));

        Err(ExportError::EncoderNotFound { searched })
    }
}

/// Relative path of the binary inside the installer package for this platform
fn installer_binary_path() -> PathBuf {
    let platform = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        other => other,
    };
    let exe = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };

    PathBuf::from(INSTALLER_SCOPE)
        .join(format!("{platform}-{arch}"))
        .join(exe)
}

fn default_global_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Some(prefix) = std::env::var_os("NPM_CONFIG_PREFIX").filter(|v| !v.is_empty()) {
        let prefix = PathBuf::from(prefix);
        if cfg!(windows) {
            roots.push(prefix.join("node_modules"));
        } else {
            roots.push(prefix.join("lib").join("node_modules"));
        }
    }

    if cfg!(windows) {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            roots.push(PathBuf::from(appdata).join("npm").join("node_modules"));
        }
    } else {
        roots.push(PathBuf::from("/usr/local/lib/node_modules"));
        roots.push(PathBuf::from("/usr/lib/node_modules"));
        roots.push(PathBuf::from("/opt/homebrew/lib/node_modules"));
    }

    roots
}

/// Check that a program can be spawned and answers `-version`
async fn is_runnable(program: &str) -> bool {
    Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
