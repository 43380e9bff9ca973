use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};

use defect_model::ModelVariant;

const DEFAULT_SKIP_INTERVAL: u32 = 5;
const DEFAULT_DISPLAY_INTERVAL: u32 = 3;
const DEFAULT_WIDTH: i32 = 640;
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_OUTPUT: &str = "roadscan_output.mp4";
const DEFAULT_WEIGHTS_DIR: &str = "weights";
const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const USAGE: &str = "Usage: roadscan <video> [--model nano|small|medium] \
[--weights <path>] [--conf <0-1>] [--skip <1-30>] [--width <px>] [--output <path>] \
[--weights-dir <dir>] [--cpu] [--no-preview] [--port <n>] [--verbose]";

#[derive(Clone, Debug)]
pub(crate) struct StreamConfig {
    pub(crate) video: PathBuf,
    pub(crate) variant: ModelVariant,
    pub(crate) weights: Option<PathBuf>,
    pub(crate) weights_dir: PathBuf,
    pub(crate) confidence: f32,
    pub(crate) skip_interval: u32,
    pub(crate) display_interval: u32,
    pub(crate) width: i32,
    pub(crate) output: PathBuf,
    pub(crate) use_cpu: bool,
    pub(crate) preview: bool,
    pub(crate) port: u16,
    pub(crate) verbose: bool,
    pub(crate) inference_timeout: Duration,
}

impl StreamConfig {
    pub(crate) fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            bail!(USAGE);
        }

        let mut video: Option<PathBuf> = None;
        let mut variant: Option<ModelVariant> = None;
        let mut weights: Option<PathBuf> = None;
        let mut weights_dir: Option<PathBuf> = None;
        let mut confidence: Option<f32> = None;
        let mut skip_interval: Option<u32> = None;
        let mut width: Option<i32> = None;
        let mut output: Option<PathBuf> = None;
        let mut use_cpu = false;
        let mut preview = true;
        let mut port: Option<u16> = None;
        let mut verbose = false;
        let mut positional: Vec<String> = Vec::new();

        let mut idx = 1;
        while idx < args.len() {
            match args[idx].as_str() {
                "--model" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--model requires a value"))?;
                    variant = Some(
                        ModelVariant::parse(value)
                            .ok_or_else(|| anyhow!("--model must be nano, small or medium"))?,
                    );
                    idx += 1;
                }
                "--weights" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--weights requires a value"))?
                        .clone();
                    weights = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--weights-dir" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--weights-dir requires a value"))?
                        .clone();
                    weights_dir = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--conf" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--conf requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--conf must be a number".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--conf must be between 0 and 1");
                    }
                    confidence = Some(value);
                    idx += 1;
                }
                "--skip" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--skip requires a value"))?
                        .parse::<u32>()
                        .with_context(|| "--skip must be an integer".to_string())?;
                    if !(1..=30).contains(&value) {
                        bail!("--skip must be between 1 and 30");
                    }
                    skip_interval = Some(value);
                    idx += 1;
                }
                "--width" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--width requires a value"))?
                        .parse::<i32>()
                        .with_context(|| "--width must be an integer".to_string())?;
                    if !(64..=4096).contains(&value) {
                        bail!("--width must be between 64 and 4096");
                    }
                    width = Some(value);
                    idx += 1;
                }
                "--output" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--output requires a value"))?
                        .clone();
                    output = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--port" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--port requires a value"))?
                        .parse::<u16>()
                        .with_context(|| "--port must be a port number".to_string())?;
                    port = Some(value);
                    idx += 1;
                }
                "--cpu" => {
                    use_cpu = true;
                    idx += 1;
                }
                "--no-preview" => {
                    preview = false;
                    idx += 1;
                }
                "--verbose" => {
                    verbose = true;
                    idx += 1;
                }
                arg if arg.starts_with('-') => {
                    bail!("Unrecognised flag: {arg}");
                }
                other => {
                    positional.push(other.to_string());
                    idx += 1;
                }
            }
        }

        let mut positional = positional.into_iter();
        if video.is_none() {
            if let Some(path) = positional.next() {
                video = Some(PathBuf::from(path));
            }
        }

        let video = video
            .ok_or_else(|| anyhow!("Missing input video. Provide a path to a recording."))?;

        Ok(Self {
            video,
            variant: variant.unwrap_or_default(),
            weights,
            weights_dir: weights_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_WEIGHTS_DIR)),
            confidence: confidence.unwrap_or(defect_model::DEFAULT_CONFIDENCE),
            skip_interval: skip_interval.unwrap_or(DEFAULT_SKIP_INTERVAL),
            display_interval: DEFAULT_DISPLAY_INTERVAL,
            width: width.unwrap_or(DEFAULT_WIDTH),
            output: output.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            use_cpu,
            preview,
            port: port.unwrap_or(DEFAULT_PORT),
            verbose,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
        })
    }

    /// Resolved weights location: an explicit `--weights` path wins, otherwise
    /// the variant's file inside the weights directory.
    pub(crate) fn weights_path(&self) -> PathBuf {
        match &self.weights {
            Some(path) => path.clone(),
            None => self.weights_dir.join(self.variant.weights_file()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        std::iter::once("roadscan")
            .chain(parts.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_defaults_from_a_bare_video_path() {
        let config = StreamConfig::from_args(&args(&["drive.mp4"])).unwrap();

        assert_eq!(config.video, PathBuf::from("drive.mp4"));
        assert_eq!(config.variant, ModelVariant::Small);
        assert_eq!(config.confidence, defect_model::DEFAULT_CONFIDENCE);
        assert_eq!(config.skip_interval, 5);
        assert_eq!(config.display_interval, 3);
        assert_eq!(config.width, 640);
        assert_eq!(config.output, PathBuf::from("roadscan_output.mp4"));
        assert_eq!(config.port, 8080);
        assert!(config.preview);
        assert!(!config.use_cpu);
        assert!(!config.verbose);
    }

    #[test]
    fn test_full_flag_set_is_honoured() {
        let config = StreamConfig::from_args(&args(&[
            "dashcam.avi",
            "--model",
            "medium",
            "--conf",
            "0.6",
            "--skip",
            "10",
            "--width",
            "1280",
            "--output",
            "out.mp4",
            "--weights-dir",
            "models",
            "--cpu",
            "--no-preview",
            "--port",
            "9000",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.variant, ModelVariant::Medium);
        assert_eq!(config.confidence, 0.6);
        assert_eq!(config.skip_interval, 10);
        assert_eq!(config.width, 1280);
        assert_eq!(config.output, PathBuf::from("out.mp4"));
        assert_eq!(config.port, 9000);
        assert!(config.use_cpu);
        assert!(!config.preview);
        assert!(config.verbose);
        assert_eq!(config.weights_path(), PathBuf::from("models/bestm.pt"));
    }

    #[test]
    fn test_explicit_weights_beat_the_variant_lookup() {
        let config = StreamConfig::from_args(&args(&[
            "drive.mp4",
            "--model",
            "nano",
            "--weights",
            "custom/export.pt",
        ]))
        .unwrap();
        assert_eq!(config.weights_path(), PathBuf::from("custom/export.pt"));
    }

    #[test]
    fn test_confidence_outside_unit_range_is_rejected() {
        let err = StreamConfig::from_args(&args(&["drive.mp4", "--conf", "1.5"])).unwrap_err();
        assert!(err.to_string().contains("between 0 and 1"));
    }

    #[test]
    fn test_skip_outside_range_is_rejected() {
        assert!(StreamConfig::from_args(&args(&["drive.mp4", "--skip", "0"])).is_err());
        assert!(StreamConfig::from_args(&args(&["drive.mp4", "--skip", "31"])).is_err());
    }

    #[test]
    fn test_missing_video_fails() {
        let err = StreamConfig::from_args(&args(&["--cpu"])).unwrap_err();
        assert!(err.to_string().contains("Missing input video"));
    }

    #[test]
    fn test_unknown_flag_is_reported() {
        let err = StreamConfig::from_args(&args(&["drive.mp4", "--fast"])).unwrap_err();
        assert!(err.to_string().contains("Unrecognised flag"));
    }

    #[test]
    fn test_no_arguments_prints_usage() {
        let err = StreamConfig::from_args(&args(&[])).unwrap_err();
        assert!(err.to_string().contains("Usage:"));
    }
}
