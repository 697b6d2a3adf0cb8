//! Export option normalization
//!
//! Turns loosely typed user input (CLI flags, JSON request bodies) into a
//! validated [`ExportOptions`] record. Nothing downstream re-validates, so
//! every field is checked here before any encoder is involved.

use crate::export::types::{ExportError, ExportFormat, FrameEncoding};
use serde::{Deserialize, Serialize};

/// Raw, unvalidated export options as supplied by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExportOptions {
    pub format: Option<String>,
    pub fps: Option<f64>,
    #[serde(alias = "inputFPS")]
    pub input_fps: Option<f64>,
    #[serde(alias = "outputFPS")]
    pub output_fps: Option<f64>,
    pub scale: Option<String>,
    pub start: Option<String>,
    pub time: Option<String>,
    pub encoding: Option<String>,
    #[serde(default)]
    pub quiet: bool,
}

/// Canonical, validated per-export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    /// Output format
    pub format: ExportFormat,
    /// Frame rate of the fps filter
    pub fps: f64,
    /// Decode-side frame rate of image sequence / piped input
    pub input_fps: Option<f64>,
    /// Encode-side output frame rate
    pub output_fps: Option<f64>,
    /// Scale filter arguments, e.g. `640:-1`
    pub scale: Option<String>,
    /// Trim start offset
    pub start: Option<String>,
    /// Trim duration
    pub time: Option<String>,
    /// Encoding of streamed frames
    pub encoding: FrameEncoding,
    /// Suppress encoder output forwarding
    pub quiet: bool,
}

impl ExportOptions {
    /// Validate raw input into canonical options
    pub fn from_input(raw: RawExportOptions) -> Result<Self, ExportError> {
        let format = match raw.format.as_deref() {
            Some(value) => ExportFormat::parse(value).ok_or_else(|| {
                ExportError::config("format", format!("unrecognized format \"{value}\", expected gif or mp4"))
            })?,
            None => return Err(ExportError::config("format", "a format is required")),
        };

        let fps = match raw.fps {
            Some(fps) => positive_rate("fps", fps)?,
            None => return Err(ExportError::config("fps", "a frame rate is required")),
        };
        let input_fps = raw.input_fps.map(|v| positive_rate("inputFps", v)).transpose()?;
        let output_fps = raw.output_fps.map(|v| positive_rate("outputFps", v)).transpose()?;

        let scale = raw
            .scale
            .map(|s| validate_scale(&s).map(|_| s.trim().to_string()))
            .transpose()?;
        let start = raw.start.map(|s| validate_time("start", &s)).transpose()?;
        let time = raw.time.map(|s| validate_time("time", &s)).transpose()?;

        let encoding = match raw.encoding.as_deref() {
            Some(value) => FrameEncoding::parse(value).ok_or_else(|| {
                ExportError::config(
                    "encoding",
                    format!("unsupported frame encoding \"{value}\", expected image/png or image/jpeg"),
                )
            })?,
            None => FrameEncoding::default(),
        };

        Ok(Self {
            format,
            fps,
            input_fps,
            output_fps,
            scale,
            start,
            time,
            encoding,
            quiet: raw.quiet,
        })
    }

    /// Frame rate the encoder should assume for image sequence input
    pub fn decode_fps(&self) -> f64 {
        self.input_fps.unwrap_or(self.fps)
    }
}

fn positive_rate(field: &str, value: f64) -> Result<f64, ExportError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ExportError::config(field, format!("must be a positive number, got {value}")))
    }
}

/// Validate a scale filter spec such as `640`, `640:-1` or `iw/2:ih/2`
fn validate_scale(spec: &str) -> Result<(), ExportError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ExportError::config("scale", "must not be empty"));
    }
    if let Some(c) = spec.chars().find(|c| matches!(c, ',' | ';' | '[' | ']' | '\'' | '=')) {
        return Err(ExportError::config("scale", format!("unexpected character '{c}' in \"{spec}\"")));
    }

    let terms: Vec<&str> = spec.split(':').collect();
    if terms.len() > 2 {
        return Err(ExportError::config("scale", format!("expected W or W:H, got \"{spec}\"")));
    }

    for term in terms {
        if term.is_empty() {
            return Err(ExportError::config("scale", format!("empty dimension in \"{spec}\"")));
        }
        // Expressions like iw/2 are left to the encoder
        if let Ok(value) = term.parse::<i64>() {
            if value == 0 || value < -2 {
                return Err(ExportError::config(
                    "scale",
                    format!("dimension {value} must be positive (or -1/-2 to keep aspect ratio)"),
                ));
            }
        } else if let Ok(value) = term.parse::<f64>() {
            if !(value.is_finite() && value > 0.0) {
                return Err(ExportError::config("scale", format!("dimension {value} must be positive")));
            }
        }
    }

    Ok(())
}

/// Validate a time spec: seconds (`1.5`) or `[HH:]MM:SS[.ms]`
fn validate_time(field: &str, value: &str) -> Result<String, ExportError> {
    let value = value.trim();
    let invalid = || {
        ExportError::config(
            field,
            format!("\"{value}\" is not a non-negative duration (seconds or [HH:]MM:SS[.ms])"),
        )
    };

    if value.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return Err(invalid());
    }

    let (last, leading) = parts.split_last().ok_or_else(invalid)?;
    for part in leading {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
    }

    let seconds: f64 = last.parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 || last.starts_with('+') {
        return Err(invalid());
    }
    if !leading.is_empty() && seconds >= 60.0 {
        return Err(invalid());
    }

    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(format: &str, fps: f64) -> RawExportOptions {
        RawExportOptions {
            format: Some(format.to_string()),
            fps: Some(fps),
            ..Default::default()
        }
    }

    fn field_of(err: ExportError) -> String {
        match err {
            ExportError::Configuration { field, .. } => field,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_minimal_options() {
        let options = ExportOptions::from_input(raw("gif", 24.0)).unwrap();
        assert_eq!(options.format, ExportFormat::Gif);
        assert_eq!(options.fps, 24.0);
        assert_eq!(options.encoding, FrameEncoding::Png);
        assert_eq!(options.decode_fps(), 24.0);
    }

    #[test]
    fn test_missing_fps_names_field() {
        let mut input = raw("mp4", 1.0);
        input.fps = None;
        assert_eq!(field_of(ExportOptions::from_input(input).unwrap_err()), "fps");
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let err = ExportOptions::from_input(raw("webm", 30.0)).unwrap_err();
        assert_eq!(field_of(err), "format");

        let mut input = raw("gif", 30.0);
        input.format = None;
        assert_eq!(field_of(ExportOptions::from_input(input).unwrap_err()), "format");
    }

    #[test]
    fn test_non_positive_rates_are_rejected() {
        assert_eq!(field_of(ExportOptions::from_input(raw("gif", 0.0)).unwrap_err()), "fps");
        assert_eq!(field_of(ExportOptions::from_input(raw("gif", f64::NAN)).unwrap_err()), "fps");

        let mut input = raw("mp4", 30.0);
        input.output_fps = Some(-5.0);
        assert_eq!(field_of(ExportOptions::from_input(input).unwrap_err()), "outputFps");
    }

    #[test]
    fn test_scale_validation() {
        for ok in ["640", "640:-1", "-2:480", "iw/2:ih/2", " 512:512 "] {
            assert!(validate_scale(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "-640:480", "0:480", "640:", "640,eq", "1:2:3", "640[x]"] {
            assert!(validate_scale(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_scale_is_trimmed() {
        let mut input = raw("gif", 12.0);
        input.scale = Some(" 320:-1 ".to_string());
        let options = ExportOptions::from_input(input).unwrap();
        assert_eq!(options.scale.as_deref(), Some("320:-1"));
    }

    #[test]
    fn test_time_validation() {
        for ok in ["0", "1.5", "00:01", "01:02:03.250"] {
            assert!(validate_time("start", ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "-1", "abc", "1:75", "1::2", "1:2:3:4", "inf"] {
            assert!(validate_time("start", bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_encoding_and_fps_overrides() {
        let mut input = raw("mp4", 30.0);
        input.encoding = Some("image/jpeg".to_string());
        input.input_fps = Some(60.0);
        input.output_fps = Some(24.0);
        let options = ExportOptions::from_input(input).unwrap();
        assert_eq!(options.encoding, FrameEncoding::Jpeg);
        assert_eq!(options.decode_fps(), 60.0);
        assert_eq!(options.output_fps, Some(24.0));
    }

    #[test]
    fn test_deserializes_request_casing() {
        let input: RawExportOptions = serde_json::from_str(
            r#"{"format":"mp4","fps":30,"inputFPS":60,"outputFps":25,"encoding":"image/png"}"#,
        )
        .unwrap();
        assert_eq!(input.input_fps, Some(60.0));
        assert_eq!(input.output_fps, Some(25.0));
    }
}
