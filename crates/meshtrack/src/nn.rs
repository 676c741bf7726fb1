//! ONNX model support via `tract`.
//!
//! [`OnnxModel`] loads and optimizes an ONNX file. The adapters [`OnnxDetector`],
//! [`OnnxFaceMesh`] and [`OnnxIris`] wrap a loaded model and implement the network traits used by
//! the tracking pipeline, taking care of tensor layout differences between model exports.

use std::{path::Path, sync::Arc};

use anyhow::{bail, ensure, Context};
use meshtrack_geom::Resolution;
use ndarray::{Array2, ArrayView4};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TVec, Tensor, TypedFact,
    TypedOp,
};

use crate::{
    detection::DetectorNetwork,
    iris::{IrisNetwork, EYE_LANDMARK_COUNT},
    landmark::{MeshEstimate, MeshNetwork},
    num::sigmoid,
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Memory layout of a model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// `[batch, height, width, channels]`, as exported from TensorFlow.
    Nhwc,
    /// `[batch, channels, height, width]`, as exported from PyTorch.
    Nchw,
}

/// A loaded and optimized ONNX model with a single RGB image input.
///
/// This is a cheaply [`Clone`]able handle.
#[derive(Clone)]
pub struct OnnxModel {
    plan: Arc<Model>,
    batch: usize,
    resolution: Resolution,
    layout: InputLayout,
}

impl OnnxModel {
    /// Loads a model from an ONNX file.
    ///
    /// The path must have a `.onnx` extension.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_impl(path.as_ref())
    }

    fn load_impl(path: &Path) -> anyhow::Result<Self> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!("model file '{}' must have `.onnx` extension", path.display()),
        }

        let data = std::fs::read(path)
            .with_context(|| format!("failed to read model '{}'", path.display()))?;
        let model = Self::from_onnx(&data)
            .with_context(|| format!("failed to load model '{}'", path.display()))?;
        log::debug!(
            "loaded {}: input {}x{} ({:?}, batch {})",
            path.display(),
            model.resolution.width(),
            model.resolution.height(),
            model.layout,
            model.batch,
        );
        Ok(model)
    }

    /// Loads a model from an in-memory ONNX file.
    pub fn from_onnx(raw: &[u8]) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*raw)?
            .into_optimized()?;
        let plan = graph.into_runnable()?;

        let model = plan.model();
        ensure!(
            model.inputs.len() == 1,
            "model has {} inputs, expected exactly 1",
            model.inputs.len()
        );
        let fact = model.input_fact(0)?;
        let shape = match fact.shape.as_concrete() {
            Some(shape) => shape.to_vec(),
            None => bail!("model input has non-constant shape {:?}", fact.shape),
        };
        let (batch, resolution, layout) = match *shape {
            [n, h, w, 3] => (n, Resolution::new(w as u32, h as u32), InputLayout::Nhwc),
            [n, 3, h, w] => (n, Resolution::new(w as u32, h as u32), InputLayout::Nchw),
            _ => bail!("model input has shape {shape:?}, expected an RGB image batch"),
        };

        Ok(Self {
            plan: Arc::new(plan),
            batch,
            resolution,
            layout,
        })
    }

    /// Returns the resolution of the image input.
    pub fn input_resolution(&self) -> Resolution {
        self.resolution
    }

    /// Returns the number of images the model processes per run.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn input_layout(&self) -> InputLayout {
        self.layout
    }

    /// Runs the model on an NHWC image batch, returning the flattened output tensors.
    ///
    /// The batch size of `input` must match [`OnnxModel::batch_size`].
    pub fn run(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<Output>> {
        let (n, h, w, c) = input.dim();
        ensure!(
            n == self.batch
                && c == 3
                && (w, h) == (self.resolution.width() as usize, self.resolution.height() as usize),
            "input of shape {:?} does not fit model input {}x{} (batch {})",
            input.shape(),
            self.resolution.width(),
            self.resolution.height(),
            self.batch,
        );

        let input = match self.layout {
            InputLayout::Nhwc => input,
            InputLayout::Nchw => input.permuted_axes([0, 3, 1, 2]),
        };
        let input = input.as_standard_layout();
        let data = input
            .as_slice()
            .context("input tensor is not contiguous")?;
        let tensor = Tensor::from_shape(input.shape(), data)?;

        let outputs: TVec<TValue> = self.plan.run(tvec![TValue::from_const(Arc::new(tensor))])?;
        outputs
            .iter()
            .map(|value| {
                Ok(Output {
                    shape: value.shape().to_vec(),
                    data: value.as_slice::<f32>()?.to_vec(),
                })
            })
            .collect()
    }
}

/// A flattened output tensor of an [`OnnxModel`].
#[derive(Debug, Clone)]
pub struct Output {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Output {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the last dimension.
    fn row_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }
}

/// A BlazeFace face detector in ONNX format.
///
/// Supports exports with a single combined output of shape `[1, anchors, 17]`, as well as exports
/// with separate regressor (`[1, anchors, 16]`) and classificator (`[1, anchors, 1]`) outputs.
pub struct OnnxDetector {
    model: OnnxModel,
}

impl OnnxDetector {
    pub fn new(model: OnnxModel) -> anyhow::Result<Self> {
        ensure!(model.batch_size() == 1, "detector must take a single image");
        Ok(Self { model })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::new(OnnxModel::load(path)?)
    }
}

impl DetectorNetwork for OnnxDetector {
    fn input_resolution(&self) -> Resolution {
        self.model.input_resolution()
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let outputs = self.model.run(input)?;
        detector_rows(outputs)
    }
}

/// Assembles detector outputs into one `[logit, regressors...]` row per anchor.
fn detector_rows(mut outputs: Vec<Output>) -> anyhow::Result<Array2<f32>> {
    match outputs.len() {
        1 => {
            let out = outputs.remove(0);
            let cols = out.row_len();
            let rows = out.data.len() / cols;
            Ok(Array2::from_shape_vec((rows, cols), out.into_data())?)
        }
        2 => {
            // The classificator has a single value per anchor.
            outputs.sort_by_key(|out| out.row_len());
            let (scores, boxes) = (&outputs[0], &outputs[1]);
            ensure!(
                scores.row_len() == 1,
                "detector outputs have unexpected shapes {:?} and {:?}",
                scores.shape(),
                boxes.shape()
            );
            let cols = boxes.row_len();
            let rows = boxes.data.len() / cols;
            ensure!(
                scores.data.len() == rows,
                "detector produced {} scores for {rows} boxes",
                scores.data.len()
            );

            Ok(Array2::from_shape_fn((rows, cols + 1), |(r, c)| match c {
                0 => scores.data[r],
                _ => boxes.data[r * cols + c - 1],
            }))
        }
        n => bail!("detector has {n} outputs, expected 1 or 2"),
    }
}

/// A face mesh landmark network in ONNX format.
///
/// The model must output the flattened landmark coordinates and a single face flag logit, in any
/// order.
pub struct OnnxFaceMesh {
    model: OnnxModel,
}

impl OnnxFaceMesh {
    pub fn new(model: OnnxModel) -> anyhow::Result<Self> {
        ensure!(model.batch_size() == 1, "face mesh network must take a single image");
        Ok(Self { model })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::new(OnnxModel::load(path)?)
    }
}

impl MeshNetwork for OnnxFaceMesh {
    fn input_resolution(&self) -> Resolution {
        self.model.input_resolution()
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<MeshEstimate> {
        let outputs = self.model.run(input)?;
        mesh_estimate(outputs)
    }
}

fn mesh_estimate(outputs: Vec<Output>) -> anyhow::Result<MeshEstimate> {
    let mut flag = None;
    let mut coords = None;
    for out in outputs {
        match out.data.len() {
            1 => flag = Some(sigmoid(out.data[0])),
            n if n % 3 == 0 => coords = Some(out.into_data()),
            n => bail!("face mesh output with {n} elements is neither flag nor landmarks"),
        }
    }

    match (flag, coords) {
        (Some(face_flag), Some(coords)) => Ok(MeshEstimate {
            face_flag,
            coords: Array2::from_shape_vec((coords.len() / 3, 3), coords)?,
        }),
        _ => bail!("face mesh network must output landmarks and a face flag"),
    }
}

/// An iris landmark network in ONNX format.
///
/// The model outputs the 71 eye contour landmarks followed by the 5 iris landmarks of each eye.
/// Models that take a batch of 1 are run once per eye.
pub struct OnnxIris {
    model: OnnxModel,
}

impl OnnxIris {
    pub fn new(model: OnnxModel) -> anyhow::Result<Self> {
        ensure!(
            matches!(model.batch_size(), 1 | 2),
            "iris network must take 1 or 2 images, not {}",
            model.batch_size()
        );
        Ok(Self { model })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::new(OnnxModel::load(path)?)
    }
}

impl IrisNetwork for OnnxIris {
    fn input_resolution(&self) -> Resolution {
        self.model.input_resolution()
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
        let eyes = input.dim().0;
        let mut flat = Vec::with_capacity(eyes * EYE_LANDMARK_COUNT * 3);
        if self.model.batch_size() == eyes {
            let outputs = self.model.run(input)?;
            flat.extend(eye_landmarks(outputs, eyes)?);
        } else {
            for i in 0..eyes {
                let eye = input.slice(ndarray::s![i..=i, .., .., ..]);
                let outputs = self.model.run(eye)?;
                flat.extend(eye_landmarks(outputs, 1)?);
            }
        }
        Ok(flat)
    }
}

/// Interleaves contour and iris outputs so that each eye's landmarks are contiguous.
fn eye_landmarks(mut outputs: Vec<Output>, batch: usize) -> anyhow::Result<Vec<f32>> {
    // Contour landmarks come first, regardless of output order.
    outputs.sort_by_key(|out| std::cmp::Reverse(out.data.len()));

    let total = outputs.iter().map(|out| out.data.len()).sum::<usize>();
    ensure!(
        total == batch * EYE_LANDMARK_COUNT * 3,
        "iris network produced {total} values for {batch} eye(s)"
    );

    let mut flat = Vec::with_capacity(total);
    for eye in 0..batch {
        for out in &outputs {
            let per_eye = out.data.len() / batch;
            flat.extend_from_slice(&out.data[eye * per_eye..(eye + 1) * per_eye]);
        }
    }
    Ok(flat)
}
