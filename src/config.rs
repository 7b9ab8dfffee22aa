use anyhow::{Error, Result};
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::detection::DisplaySize;
use crate::pipeline::DetectorOptions;
use crate::session::{LoopSettings, TickPolicy};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CmdArgs {
    /// Directory holding the ONNX weight sets
    #[arg(short, long, value_name = "DIR", default_value = "./models")]
    pub model_dir: PathBuf,

    /// Width that detections are drawn at
    #[arg(long, default_value = "720")]
    pub display_width: u32,

    /// Height that detections are drawn at
    #[arg(long, default_value = "560")]
    pub display_height: u32,

    /// Delay (ms) between detection passes
    #[arg(long, default_value = "100")]
    pub interval_ms: u64,

    /// Start a detection every tick even if the previous one has not finished
    #[arg(long)]
    pub overlap: bool,

    /// Minimum detector confidence for a face
    #[arg(long, default_value = "0.5")]
    pub score_threshold: f32,

    /// Overlap above which the weaker of two faces is discarded
    #[arg(long, default_value = "0.3")]
    pub iou_threshold: f32,

    /// Camera index. Uses the last camera found if unset
    #[arg(long)]
    pub camera: Option<u32>,

    /// Target camera frame rate
    #[arg(long, default_value = "30")]
    pub fps: u32,

    /// TrueType font used for labels
    #[arg(
        long,
        value_name = "FILE",
        default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
    )]
    pub font: PathBuf,

    /// Inference threads per model. Defaults to half the available cores
    #[arg(short, long)]
    pub threads: Option<usize>,

    #[command(flatten)]
    pub out: Out,

    /// Process single input image, reading from input path
    #[arg(short, long, requires = "output")]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
#[group(multiple = false)]
pub struct Out {
    /// Loopback device to write to. Displays in window if unset
    #[arg(group = "dest", short, long)]
    pub device: Option<String>,

    /// Process single input image, writing to output path
    #[arg(group = "dest", short, long, requires = "input")]
    pub output: Option<PathBuf>,
}

impl CmdArgs {
    pub fn validate(&self) -> Result<()> {
        if self.display_width == 0 || self.display_height == 0 {
            return Err(Error::msg(format!(
                "display size must be non-zero, got {}x{}",
                self.display_width, self.display_height
            )));
        }
        if self.interval_ms == 0 {
            return Err(Error::msg("interval-ms must be at least 1"));
        }
        for (name, v) in [
            ("score-threshold", self.score_threshold),
            ("iou-threshold", self.iou_threshold),
        ] {
            if !(0. ..=1.).contains(&v) {
                return Err(Error::msg(format!("{name} must be within [0, 1], got {v}")));
            }
        }
        if self.fps == 0 {
            return Err(Error::msg("fps must be at least 1"));
        }
        Ok(())
    }

    pub fn display(&self) -> DisplaySize {
        DisplaySize::new(self.display_width, self.display_height)
    }

    pub fn detector(&self) -> DetectorOptions {
        DetectorOptions {
            score_threshold: self.score_threshold,
            iou_threshold: self.iou_threshold,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            period: Duration::from_millis(self.interval_ms),
            display: self.display(),
            policy: if self.overlap {
                TickPolicy::Overlap
            } else {
                TickPolicy::SkipWhileBusy
            },
            detector: self.detector(),
        }
    }

    pub fn threads(&self) -> usize {
        let total_threads = num_cpus::get();
        self.threads
            .unwrap_or(total_threads / 2)
            .min(total_threads)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CmdArgs, clap::Error> {
        CmdArgs::try_parse_from(std::iter::once("facemood").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        args.validate().unwrap();

        let settings = args.loop_settings();
        assert_eq!(settings.period, Duration::from_millis(100));
        assert_eq!(settings.display, DisplaySize::new(720, 560));
        assert_eq!(settings.policy, TickPolicy::SkipWhileBusy);
        assert_eq!(settings.detector, DetectorOptions::default());
        assert_eq!(args.model_dir, PathBuf::from("./models"));
        assert!(args.threads() >= 1);
    }

    #[test]
    fn test_overlap_flag() {
        let args = parse(&["--overlap", "--interval-ms", "50"]).unwrap();
        let settings = args.loop_settings();
        assert_eq!(settings.policy, TickPolicy::Overlap);
        assert_eq!(settings.period, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--display-width", "0"]).unwrap().validate().is_err());
        assert!(parse(&["--interval-ms", "0"]).unwrap().validate().is_err());
        assert!(parse(&["--score-threshold", "1.5"]).unwrap().validate().is_err());
    }

    #[test]
    fn test_single_image_requires_both_paths() {
        assert!(parse(&["--input", "a.png"]).is_err());
        assert!(parse(&["--output", "b.png"]).is_err());
        assert!(parse(&["--input", "a.png", "--output", "b.png"]).is_ok());
        assert!(parse(&["--device", "video9", "--output", "b.png", "--input", "a.png"]).is_err());
    }
}
