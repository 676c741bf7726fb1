//! Runs face detection or face mesh tracking on a sequence of images.
//!
//! Images are processed in order, like the frames of a video, so faces found in one image are
//! tracked into the next. Results are printed to stdout as one JSON object per image.

use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Context;
use clap::Parser;
use itertools::Itertools;
use meshtrack::{
    detection::{DetectedFace, DetectorConfig, FaceDetector},
    facemesh::{EstimateOptions, FaceMesh, FaceMeshConfig, FacePrediction, FrameInput},
    nn::{OnnxDetector, OnnxFaceMesh, OnnxIris},
    timer::Timer,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "meshtrack")]
#[command(author, version, about = "Face detection and face mesh tracking", long_about = None)]
struct Args {
    /// Input images, processed as consecutive video frames
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// BlazeFace detector model (ONNX)
    #[arg(long, default_value = "face_detection_short_range.onnx")]
    detector: PathBuf,

    /// Face mesh landmark model (ONNX); not needed with `--detect-only`
    #[arg(long, default_value = "face_landmark.onnx")]
    mesh: PathBuf,

    /// Iris landmark model (ONNX); enables iris landmarks
    #[arg(long)]
    iris: Option<PathBuf>,

    /// Only run the face detector
    #[arg(long)]
    detect_only: bool,

    /// Mirror all results horizontally
    #[arg(long)]
    flip: bool,

    /// Maximum number of faces to track
    #[arg(long, default_value_t = 10)]
    max_faces: usize,

    /// Face flag below which a tracked face is dropped
    #[arg(long, default_value_t = 0.9)]
    detection_confidence: f32,

    /// Frames without re-detection while fewer than `max-faces` faces are tracked
    #[arg(long, default_value_t = 5)]
    max_continuous_checks: u32,

    /// Overlap above which detections are suppressed
    #[arg(long, default_value_t = 0.3)]
    iou_threshold: f32,

    /// Minimum detection score
    #[arg(long, default_value_t = 0.75)]
    score_threshold: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameOutput<'a, T> {
    image: &'a str,
    width: u32,
    height: u32,
    faces: Vec<T>,
}

enum Mode {
    Detect(FaceDetector),
    Track(FaceMesh, EstimateOptions),
}

fn main() -> anyhow::Result<()> {
    meshtrack::init_logger!();
    let args = Args::parse();

    let detector_config = DetectorConfig::default()
        .max_faces(args.max_faces)
        .iou_threshold(args.iou_threshold)
        .score_threshold(args.score_threshold);
    let detector = FaceDetector::new(OnnxDetector::load(&args.detector)?, detector_config);

    let mut mode = if args.detect_only {
        Mode::Detect(detector)
    } else {
        let config = FaceMeshConfig::default()
            .max_faces(args.max_faces)
            .iou_threshold(args.iou_threshold)
            .score_threshold(args.score_threshold)
            .detection_confidence(args.detection_confidence)
            .max_continuous_checks(args.max_continuous_checks);
        let mut mesh = FaceMesh::with_detector(detector, OnnxFaceMesh::load(&args.mesh)?, config);
        if let Some(iris) = &args.iris {
            mesh = mesh.with_iris(OnnxIris::load(iris)?);
        }
        let options = EstimateOptions {
            flip_horizontal: args.flip,
            predict_irises: args.iris.is_some(),
            return_tensors: false,
        };
        Mode::Track(mesh, options)
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for path in &args.images {
        let image = image::open(path)
            .with_context(|| format!("failed to open '{}'", path.display()))?
            .to_rgb8();
        let name = path.display().to_string();
        let (width, height) = image.dimensions();

        match &mut mode {
            Mode::Detect(detector) => {
                let tensor = meshtrack::image::from_rgb_image(&image);
                let faces = detector.estimate_faces(tensor.view(), args.flip, true)?;
                log::debug!("{name}: {} faces", faces.len());
                write_frame::<DetectedFace>(&mut out, &name, width, height, faces)?;
                log::trace!("{}", format_timers(detector.timers()));
            }
            Mode::Track(mesh, options) => {
                let faces = mesh
                    .estimate_faces(FrameInput::Image(&image), options)?
                    .into_iter()
                    .filter_map(|prediction| prediction.as_values().cloned())
                    .collect::<Vec<FacePrediction>>();
                log::debug!(
                    "{name}: {} faces, {} tracked",
                    faces.len(),
                    mesh.state().regions().len()
                );
                write_frame(&mut out, &name, width, height, faces)?;
                log::trace!("{}", format_timers(mesh.timers()));
            }
        }
    }

    Ok(())
}

fn write_frame<T: Serialize>(
    out: &mut impl Write,
    image: &str,
    width: u32,
    height: u32,
    faces: Vec<T>,
) -> anyhow::Result<()> {
    let frame = FrameOutput {
        image,
        width,
        height,
        faces,
    };
    serde_json::to_writer(&mut *out, &frame)?;
    writeln!(out)?;
    Ok(())
}

fn format_timers<'a>(timers: impl Iterator<Item = &'a Timer>) -> String {
    timers.format(", ").to_string()
}
