//! Batch conversion
//!
//! Encodes frames that are already on disk (a video file, a `%0Nd` pattern
//! or a directory of numbered images) into a GIF or MP4. All input and
//! output validation happens before the first encoder is spawned.

use crate::export::binary::EncoderBinary;
use crate::export::command::{self, InputSource};
use crate::export::options::ExportOptions;
use crate::export::process::{run_to_completion, EncoderTracker};
use crate::export::sequence::resolve_input;
use crate::export::temp::{ResourceKind, TempGuard};
use crate::export::types::{ExportError, ExportFormat};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Timestamp layout of default output names, e.g. `2018.05.21-14.03.09`
pub const DEFAULT_NAME_FORMAT: &str = "%Y.%m.%d-%H.%M.%S";

/// A batch export request
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub options: ExportOptions,
    /// Input file, pattern or frame directory
    pub input: PathBuf,
    /// Output path; a timestamped name in `cwd` when absent
    pub output: Option<PathBuf>,
    /// Directory relative paths are resolved against
    pub cwd: PathBuf,
    /// Overwrite an existing output
    pub force: bool,
}

/// Result of a finished batch export
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertOutcome {
    /// Input as passed to the encoder (directories become patterns)
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: ExportFormat,
}

/// Run a batch export to completion
pub async fn convert(
    binary: &EncoderBinary,
    request: ConvertRequest,
    tracker: &EncoderTracker,
) -> Result<ConvertOutcome, ExportError> {
    let ConvertRequest {
        options,
        input,
        output,
        cwd,
        force,
    } = request;

    let input = resolve_input(&absolute(&cwd, &input))?;
    let output = resolve_output(output.as_deref(), &cwd, options.format, force)?;

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::info!("Exporting {} from {:?} to {:?}", options.format, input, output);

    match options.format {
        ExportFormat::Mp4 => {
            let invocation =
                command::mp4(binary, &options, &InputSource::Path(input.clone()), &output);
            run_to_completion(&invocation, options.quiet, tracker).await?;
        }
        ExportFormat::Gif => {
            encode_gif(binary, &options, &input, &output, tracker).await?;
        }
    }

    tracing::info!("Export finished: {:?}", output);
    Ok(ConvertOutcome {
        input,
        output,
        format: options.format,
    })
}

/// Run a batch export, giving up with [`ExportError::Cancelled`] once `cancel` resolves.
///
/// The abandoned export is dropped, which kills its encoder and removes the palette.
pub async fn convert_until<F>(
    binary: &EncoderBinary,
    request: ConvertRequest,
    tracker: &EncoderTracker,
    cancel: F,
) -> Result<ConvertOutcome, ExportError>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        outcome = convert(binary, request, tracker) => outcome,
        _ = cancel => Err(ExportError::Cancelled),
    }
}

/// Run both GIF passes with a guarded palette file next to `output`.
///
/// The palette is removed before any error is returned, and also when the
/// future is dropped mid-encode.
pub(crate) async fn encode_gif(
    binary: &EncoderBinary,
    options: &ExportOptions,
    input: &Path,
    output: &Path,
    tracker: &EncoderTracker,
) -> Result<(), ExportError> {
    let temp = TempGuard::new();
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let palette = temp.acquire(ResourceKind::File, dir, ".palette-", ".png")?;
    let passes = command::gif(binary, options, input, &palette, output);

    let result = async {
        tracing::debug!("Generating GIF palette");
        run_to_completion(&passes.palette, options.quiet, tracker).await?;
        tracing::debug!("Encoding GIF with palette");
        run_to_completion(&passes.encode, options.quiet, tracker).await
    }
    .await;

    if let Err(e) = temp.release_all() {
        tracing::warn!("Could not remove GIF palette {:?}: {}", palette, e);
    }
    result
}

/// Decide where the export is written.
///
/// Missing extensions get the format's extension; an existing file is an
/// error unless `force` is set.
pub fn resolve_output(
    output: Option<&Path>,
    cwd: &Path,
    format: ExportFormat,
    force: bool,
) -> Result<PathBuf, ExportError> {
    let mut path = match output {
        Some(path) => absolute(cwd, path),
        None => cwd.join(default_file_name(format)),
    };

    if path.extension().is_none() {
        path.set_extension(format.extension());
    }

    if path.exists() && !force {
        return Err(ExportError::OutputExists(path));
    }

    Ok(path)
}

/// Timestamped default output name for `format`
pub fn default_file_name(format: ExportFormat) -> String {
    format!(
        "{}.{}",
        chrono::Local::now().format(DEFAULT_NAME_FORMAT),
        format.extension()
    )
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
