//! Encoder command construction
//!
//! Pure functions that turn [`ExportOptions`] plus an input/output pair into
//! the exact argument lists passed to ffmpeg. Nothing here touches the
//! filesystem or spawns processes, so identical inputs always produce
//! identical invocations.

use crate::export::binary::EncoderBinary;
use crate::export::options::ExportOptions;
use crate::export::sequence::has_sequence_pattern;
use crate::export::types::FrameEncoding;
use std::path::{Path, PathBuf};

/// How the encoder receives its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Input is read from a path; stdin is closed
    File,
    /// Images are piped through stdin
    Pipe,
}

/// Where the frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A container file, single image or `%0Nd` pattern
    Path(PathBuf),
    /// Images of the given encoding written to stdin
    Pipe(FrameEncoding),
}

impl InputSource {
    /// Image sequences and piped images carry no timing, so they need `-framerate`
    fn is_image_sequence(&self) -> bool {
        match self {
            InputSource::Path(path) => has_sequence_pattern(&path.to_string_lossy()),
            InputSource::Pipe(_) => true,
        }
    }

    fn input_args(&self) -> Vec<String> {
        match self {
            InputSource::Path(path) => vec!["-i".to_string(), path_arg(path)],
            InputSource::Pipe(encoding) => vec![
                "-f".to_string(),
                "image2pipe".to_string(),
                "-c:v".to_string(),
                encoding.codec().to_string(),
                "-i".to_string(),
                "-".to_string(),
            ],
        }
    }
}

/// A fully resolved encoder launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub input_mode: InputMode,
}

impl EncoderInvocation {
    fn new(binary: &EncoderBinary, args: Vec<String>, input_mode: InputMode) -> Self {
        let mut full = binary.leading_args().to_vec();
        full.extend(args);
        Self {
            program: binary.program().to_path_buf(),
            args: full,
            input_mode,
        }
    }

    /// Shell-like rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("\"{arg}\"")
                } else {
                    arg
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The two encoder runs of a palette GIF export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GifPasses {
    /// Builds the palette image
    pub palette: EncoderInvocation,
    /// Applies the palette and writes the GIF
    pub encode: EncoderInvocation,
}

/// Fixed H.264 settings for broad player compatibility
const MP4_QUALITY_ARGS: &[&str] = &[
    "-c:v",
    "libx264",
    "-profile:v",
    "high",
    "-crf",
    "20",
    "-pix_fmt",
    "yuv420p",
    "-movflags",
    "+faststart",
];

/// Build the single-pass MP4 invocation
pub fn mp4(
    binary: &EncoderBinary,
    options: &ExportOptions,
    input: &InputSource,
    output: &Path,
) -> EncoderInvocation {
    let mut args = vec!["-y".to_string()];
    args.extend(framerate_args(options, input));
    args.extend(input.input_args());
    args.extend(["-vf".to_string(), filter_chain(options, false)]);
    args.extend(MP4_QUALITY_ARGS.iter().map(|a| a.to_string()));
    args.extend(trim_args(options));
    args.extend(output_rate_args(options));
    args.push(path_arg(output));

    let mode = match input {
        InputSource::Path(_) => InputMode::File,
        InputSource::Pipe(_) => InputMode::Pipe,
    };
    EncoderInvocation::new(binary, args, mode)
}

/// Build both passes of a palette GIF export.
///
/// Both passes get the same trim, rate and scale arguments so they read the
/// same frames; they differ only in the palette stage.
pub fn gif(
    binary: &EncoderBinary,
    options: &ExportOptions,
    input: &Path,
    palette: &Path,
    output: &Path,
) -> GifPasses {
    let source = InputSource::Path(input.to_path_buf());
    let filter = filter_chain(options, true);

    let mut shared = vec!["-y".to_string()];
    shared.extend(trim_args(options));
    shared.extend(framerate_args(options, &source));
    shared.extend(source.input_args());

    let mut palette_args = shared.clone();
    palette_args.extend(["-vf".to_string(), format!("{filter},palettegen")]);
    palette_args.push(path_arg(palette));

    let mut encode_args = shared;
    encode_args.extend(["-i".to_string(), path_arg(palette)]);
    encode_args.extend([
        "-filter_complex".to_string(),
        format!("{filter}[x];[x][1:v]paletteuse"),
    ]);
    encode_args.extend(["-f".to_string(), "gif".to_string()]);
    encode_args.extend(output_rate_args(options));
    encode_args.push(path_arg(output));

    GifPasses {
        palette: EncoderInvocation::new(binary, palette_args, InputMode::File),
        encode: EncoderInvocation::new(binary, encode_args, InputMode::File),
    }
}

/// `fps=<rate>` followed by an optional scale filter, comma joined
pub fn filter_chain(options: &ExportOptions, high_quality_scale: bool) -> String {
    let fps = format!("fps={}", options.fps);
    let scale = options.scale.as_ref().map(|scale| {
        if high_quality_scale {
            format!("scale={scale}:flags=lanczos")
        } else {
            format!("scale={scale}")
        }
    });

    std::iter::once(fps)
        .chain(scale)
        .filter(|term| !term.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn trim_args(options: &ExportOptions) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(start) = &options.start {
        args.extend(["-ss".to_string(), start.clone()]);
    }
    if let Some(time) = &options.time {
        args.extend(["-t".to_string(), time.clone()]);
    }
    args
}

fn framerate_args(options: &ExportOptions, input: &InputSource) -> Vec<String> {
    if input.is_image_sequence() {
        vec!["-framerate".to_string(), options.decode_fps().to_string()]
    } else {
        Vec::new()
    }
}

fn output_rate_args(options: &ExportOptions) -> Vec<String> {
    options
        .output_fps
        .map(|rate| vec!["-r".to_string(), rate.to_string()])
        .unwrap_or_default()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::types::ExportFormat;
    use proptest::prelude::*;

    fn options(format: ExportFormat) -> ExportOptions {
        ExportOptions {
            format,
            fps: 24.0,
            input_fps: None,
            output_fps: None,
            scale: None,
            start: None,
            time: None,
            encoding: FrameEncoding::Png,
            quiet: false,
        }
    }

    fn ffmpeg() -> EncoderBinary {
        EncoderBinary::new("ffmpeg")
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_mp4_batch_args() {
        let opts = options(ExportFormat::Mp4);
        let inv = mp4(
            &ffmpeg(),
            &opts,
            &InputSource::Path(PathBuf::from("frames/%03d.png")),
            Path::new("out.mp4"),
        );

        assert_eq!(inv.input_mode, InputMode::File);
        assert_eq!(
            inv.args,
            vec![
                "-y", "-framerate", "24", "-i", "frames/%03d.png", "-vf", "fps=24", "-c:v",
                "libx264", "-profile:v", "high", "-crf", "20", "-pix_fmt", "yuv420p",
                "-movflags", "+faststart", "out.mp4",
            ]
        );
    }

    #[test]
    fn test_mp4_container_input_has_no_framerate() {
        let inv = mp4(
            &ffmpeg(),
            &options(ExportFormat::Mp4),
            &InputSource::Path(PathBuf::from("clip.mov")),
            Path::new("out.mp4"),
        );
        assert!(!inv.args.iter().any(|a| a == "-framerate"));
    }

    #[test]
    fn test_mp4_stream_args() {
        let mut opts = options(ExportFormat::Mp4);
        opts.encoding = FrameEncoding::Jpeg;
        opts.scale = Some("640:-1".to_string());
        let inv = mp4(
            &ffmpeg(),
            &opts,
            &InputSource::Pipe(opts.encoding),
            Path::new("out.mp4"),
        );

        assert_eq!(inv.input_mode, InputMode::Pipe);
        assert_eq!(value_after(&inv.args, "-f"), Some("image2pipe"));
        assert_eq!(value_after(&inv.args, "-i"), Some("-"));
        assert_eq!(value_after(&inv.args, "-vf"), Some("fps=24,scale=640:-1"));
        // The first -c:v tags the piped input codec
        assert_eq!(value_after(&inv.args, "-c:v"), Some("mjpeg"));
    }

    #[test]
    fn test_mp4_trim_then_output_rate_order() {
        let mut opts = options(ExportFormat::Mp4);
        opts.start = Some("1.5".to_string());
        opts.time = Some("3".to_string());
        opts.output_fps = Some(30.0);
        let inv = mp4(
            &ffmpeg(),
            &opts,
            &InputSource::Path(PathBuf::from("in/%04d.png")),
            Path::new("out.mp4"),
        );

        let tail: Vec<&str> = inv.args.iter().rev().take(7).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["-ss", "1.5", "-t", "3", "-r", "30", "out.mp4"]);
    }

    #[test]
    fn test_input_and_output_rates_stay_separate() {
        let mut opts = options(ExportFormat::Mp4);
        opts.input_fps = Some(60.0);
        opts.output_fps = Some(25.0);
        let inv = mp4(
            &ffmpeg(),
            &opts,
            &InputSource::Pipe(FrameEncoding::Png),
            Path::new("out.mp4"),
        );

        assert_eq!(value_after(&inv.args, "-framerate"), Some("60"));
        assert_eq!(value_after(&inv.args, "-r"), Some("25"));
        assert_eq!(value_after(&inv.args, "-vf"), Some("fps=24"));
    }

    #[test]
    fn test_gif_passes() {
        let mut opts = options(ExportFormat::Gif);
        opts.fps = 10.0;
        opts.scale = Some("320:-1".to_string());
        let passes = gif(
            &ffmpeg(),
            &opts,
            Path::new("frames/%03d.png"),
            Path::new("palette.png"),
            Path::new("out.gif"),
        );

        assert_eq!(
            value_after(&passes.palette.args, "-vf"),
            Some("fps=10,scale=320:-1:flags=lanczos,palettegen")
        );
        assert_eq!(passes.palette.args.last().map(String::as_str), Some("palette.png"));
        assert_eq!(
            value_after(&passes.encode.args, "-filter_complex"),
            Some("fps=10,scale=320:-1:flags=lanczos[x];[x][1:v]paletteuse")
        );
        assert_eq!(value_after(&passes.encode.args, "-f"), Some("gif"));
        assert_eq!(passes.encode.args.last().map(String::as_str), Some("out.gif"));
    }

    #[test]
    fn test_wrapped_binary_prefixes_args() {
        let binary = EncoderBinary::wrapped("nice", ["-n", "10", "ffmpeg"]);
        let inv = mp4(
            &binary,
            &options(ExportFormat::Mp4),
            &InputSource::Pipe(FrameEncoding::Png),
            Path::new("out.mp4"),
        );
        assert_eq!(inv.program, PathBuf::from("nice"));
        assert_eq!(&inv.args[..4], &["-n", "10", "ffmpeg", "-y"]);
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        let inv = mp4(
            &ffmpeg(),
            &options(ExportFormat::Mp4),
            &InputSource::Path(PathBuf::from("my clip.mov")),
            Path::new("out.mp4"),
        );
        assert!(inv.command_line().contains("\"my clip.mov\""));
    }

    fn arb_options() -> impl Strategy<Value = ExportOptions> {
        (
            prop_oneof![Just(ExportFormat::Gif), Just(ExportFormat::Mp4)],
            1u32..240,
            proptest::option::of(1u32..240),
            proptest::option::of(1u32..240),
            proptest::option::of(prop_oneof![
                Just("640:-1".to_string()),
                Just("iw/2:ih/2".to_string()),
                (1u32..4096).prop_map(|w| w.to_string()),
            ]),
            proptest::option::of((0u32..600).prop_map(|s| s.to_string())),
            proptest::option::of((1u32..600).prop_map(|s| s.to_string())),
        )
            .prop_map(|(format, fps, input_fps, output_fps, scale, start, time)| ExportOptions {
                format,
                fps: f64::from(fps),
                input_fps: input_fps.map(f64::from),
                output_fps: output_fps.map(f64::from),
                scale,
                start,
                time,
                encoding: FrameEncoding::Png,
                quiet: false,
            })
    }

    proptest! {
        #[test]
        fn prop_builder_is_deterministic(opts in arb_options()) {
            let input = Path::new("frames/%03d.png");
            let first = gif(&ffmpeg(), &opts, input, Path::new("p.png"), Path::new("o.gif"));
            let second = gif(&ffmpeg(), &opts, input, Path::new("p.png"), Path::new("o.gif"));
            prop_assert_eq!(first, second);

            let source = InputSource::Path(input.to_path_buf());
            prop_assert_eq!(
                mp4(&ffmpeg(), &opts, &source, Path::new("o.mp4")),
                mp4(&ffmpeg(), &opts, &source, Path::new("o.mp4"))
            );
        }

        #[test]
        fn prop_gif_passes_share_input_filters(opts in arb_options()) {
            let passes = gif(
                &ffmpeg(),
                &opts,
                Path::new("frames/%03d.png"),
                Path::new("p.png"),
                Path::new("o.gif"),
            );
            let filter = filter_chain(&opts, true);

            let palette_filter = value_after(&passes.palette.args, "-vf").unwrap();
            let encode_filter = value_after(&passes.encode.args, "-filter_complex").unwrap();
            prop_assert_eq!(palette_filter.strip_suffix(",palettegen"), Some(filter.as_str()));
            prop_assert_eq!(
                encode_filter.strip_suffix("[x];[x][1:v]paletteuse"),
                Some(filter.as_str())
            );

            // Everything up to and including the shared input is identical
            let input_end = passes.palette.args.iter().position(|a| a == "frames/%03d.png").unwrap();
            prop_assert_eq!(&passes.palette.args[..=input_end], &passes.encode.args[..=input_end]);
        }
    }
}
