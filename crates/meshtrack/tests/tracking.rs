//! Tracks a synthetic face through several frames using stand-in networks.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use approx::assert_relative_eq;
use meshtrack::{
    detection::{
        anchors::{Anchors, BLAZEFACE_LAYERS},
        DetectedFace, DetectorConfig, DetectorNetwork, FaceDetector,
    },
    facemesh::{
        EstimateOptions, FaceMesh, FaceMeshConfig, FacePrediction, FrameInput, MissingIrisModel,
    },
    geom::Resolution,
    iris::{IrisNetwork, EYE_LANDMARK_COUNT},
    landmark::{
        MeshEstimate, MeshNetwork, LANDMARK_COUNT, LANDMARK_COUNT_WITH_IRISES,
        MIDWAY_BETWEEN_EYES, MOUTH_CENTER,
    },
    num::sigmoid,
};
use ndarray::{Array2, Array3, ArrayView4};

const DETECTOR_INPUT: Resolution = Resolution::new(128, 128);
const FRAME_SIZE: usize = 256;
const FACE_ANCHOR: usize = 600;

const NO_IRIS: EstimateOptions = EstimateOptions {
    flip_horizontal: false,
    predict_irises: false,
    return_tensors: false,
};

/// BlazeFace stand-in that finds one 40x40 face in the center of its input, or nothing.
struct CenterFaceDetector {
    output: Array2<f32>,
    calls: Arc<AtomicUsize>,
}

impl CenterFaceDetector {
    fn new(face: bool) -> Self {
        let anchors = Anchors::generate(DETECTOR_INPUT, BLAZEFACE_LAYERS);
        let mut output = Array2::from_elem((anchors.len(), 17), 0.0);
        output.column_mut(0).fill(-10.0);

        if face {
            let [ax, ay] = anchors.iter().nth(FACE_ANCHOR).unwrap().center();
            // Right eye, left eye, nose, mouth, right ear, left ear.
            let keypoints = [
                [54.0, 56.0],
                [74.0, 56.0],
                [64.0, 64.0],
                [64.0, 76.0],
                [44.0, 60.0],
                [84.0, 60.0],
            ];
            let mut row = output.row_mut(FACE_ANCHOR);
            row[0] = 5.0;
            row[1] = 64.0 - ax;
            row[2] = 64.0 - ay;
            row[3] = 40.0;
            row[4] = 40.0;
            for (i, [x, y]) in keypoints.into_iter().enumerate() {
                row[5 + 2 * i] = x - ax;
                row[6 + 2 * i] = y - ay;
            }
        }

        Self {
            output,
            calls: Arc::default(),
        }
    }
}

impl DetectorNetwork for CenterFaceDetector {
    fn input_resolution(&self) -> Resolution {
        DETECTOR_INPUT
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        assert_eq!(input.dim(), (1, 128, 128, 3));
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.output.clone())
    }
}

/// Face mesh stand-in returning an upright landmark grid with an adjustable face flag.
struct GridMesh {
    face_flag: Arc<Mutex<f32>>,
    calls: Arc<AtomicUsize>,
}

impl MeshNetwork for GridMesh {
    fn input_resolution(&self) -> Resolution {
        Resolution::new(192, 192)
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<MeshEstimate> {
        assert_eq!(input.dim(), (1, 192, 192, 3));
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut coords = Array2::from_shape_fn((LANDMARK_COUNT, 3), |(i, c)| match c {
            0 => 48.0 + (i % 22) as f32 * 4.4,
            1 => 48.0 + (i / 22) as f32 * 4.4,
            _ => 0.0,
        });
        coords.row_mut(MOUTH_CENTER).assign(&ndarray::arr1(&[96.0, 130.0, 0.0]));
        coords
            .row_mut(MIDWAY_BETWEEN_EYES)
            .assign(&ndarray::arr1(&[96.0, 60.0, 0.0]));

        Ok(MeshEstimate {
            face_flag: *self.face_flag.lock().unwrap(),
            coords,
        })
    }
}

/// Iris stand-in that puts all eye landmarks in the middle of the crop.
struct CenteredIris;

impl IrisNetwork for CenteredIris {
    fn input_resolution(&self) -> Resolution {
        Resolution::new(64, 64)
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Vec<f32>> {
        assert_eq!(input.dim().0, 2);
        Ok([32.0, 32.0, 0.0].repeat(2 * EYE_LANDMARK_COUNT))
    }
}

struct Harness {
    facemesh: FaceMesh,
    detector_calls: Arc<AtomicUsize>,
    mesh_calls: Arc<AtomicUsize>,
    face_flag: Arc<Mutex<f32>>,
}

fn harness(face: bool, config: FaceMeshConfig) -> Harness {
    let detector = CenterFaceDetector::new(face);
    let detector_calls = detector.calls.clone();
    let mesh = GridMesh {
        face_flag: Arc::new(Mutex::new(0.99)),
        calls: Arc::default(),
    };
    let mesh_calls = mesh.calls.clone();
    let face_flag = mesh.face_flag.clone();

    Harness {
        facemesh: FaceMesh::new(detector, mesh, config),
        detector_calls,
        mesh_calls,
        face_flag,
    }
}

fn frame() -> Array3<f32> {
    Array3::from_shape_fn((FRAME_SIZE, FRAME_SIZE, 3), |(y, x, c)| {
        ((x + y + c * 40) % 256) as f32
    })
}

fn values(faces: Vec<meshtrack::facemesh::AnnotatedPrediction>) -> Vec<FacePrediction> {
    faces
        .into_iter()
        .map(|face| face.as_values().unwrap().clone())
        .collect()
}

#[test]
fn tracks_without_redetecting() {
    let mut h = harness(true, FaceMeshConfig::default().max_faces(1));
    let frame = frame();

    for _ in 0..6 {
        let faces = h
            .facemesh
            .estimate_faces(FrameInput::Tensor(frame.view()), &NO_IRIS)
            .unwrap();
        let faces = values(faces);
        assert_eq!(faces.len(), 1);

        let face = &faces[0];
        assert_relative_eq!(face.face_in_view_confidence, 0.99);
        assert_eq!(face.scaled_mesh.len(), LANDMARK_COUNT);
        for &[x, y, _] in &face.scaled_mesh {
            assert!((68.0..=188.0).contains(&x), "x = {x}");
            assert!((68.0..=188.0).contains(&y), "y = {y}");
        }
        assert!(!face.annotations.contains_key("leftEyeIris"));
        assert!(face.annotations.contains_key("silhouette"));
    }

    assert_eq!(h.detector_calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.mesh_calls.load(Ordering::Relaxed), 6);
    assert_eq!(h.facemesh.state().regions().len(), 1);
}

#[test]
fn lost_face_is_detected_again() {
    let mut h = harness(true, FaceMeshConfig::default().max_faces(1));
    let frame = frame();
    let estimate = |h: &mut Harness| {
        h.facemesh
            .estimate_faces(FrameInput::Tensor(frame.view()), &NO_IRIS)
            .unwrap()
    };

    estimate(&mut h);
    estimate(&mut h);
    assert_eq!(h.detector_calls.load(Ordering::Relaxed), 1);

    *h.face_flag.lock().unwrap() = 0.1;
    let faces = estimate(&mut h);
    assert_eq!(faces.len(), 1);
    assert_relative_eq!(faces[0].face_in_view_confidence(), 0.1);
    assert!(h.facemesh.state().regions().is_empty());

    *h.face_flag.lock().unwrap() = 0.99;
    let faces = estimate(&mut h);
    assert_eq!(faces.len(), 1);
    assert_eq!(h.detector_calls.load(Ordering::Relaxed), 2);
    assert_eq!(h.facemesh.state().regions().len(), 1);
}

#[test]
fn empty_frames() {
    let mut h = harness(false, FaceMeshConfig::default());
    let frame = frame();
    for _ in 0..3 {
        let faces = h
            .facemesh
            .estimate_faces(FrameInput::Tensor(frame.view()), &NO_IRIS)
            .unwrap();
        assert!(faces.is_empty());
    }
    assert_eq!(h.detector_calls.load(Ordering::Relaxed), 3);
    assert_eq!(h.mesh_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn irises_require_iris_network() {
    let mut h = harness(true, FaceMeshConfig::default());
    let frame = frame();
    let err = h
        .facemesh
        .estimate_faces(FrameInput::Tensor(frame.view()), &EstimateOptions::default())
        .unwrap_err();
    assert!(err.downcast_ref::<MissingIrisModel>().is_some());
    assert_eq!(h.detector_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn irises_extend_mesh() {
    let mut h = harness(true, FaceMeshConfig::default().max_faces(1));
    h.facemesh = h.facemesh.with_iris(CenteredIris);
    let frame = frame();

    let faces = h
        .facemesh
        .estimate_faces(FrameInput::Tensor(frame.view()), &EstimateOptions::default())
        .unwrap();
    let faces = values(faces);
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].mesh.len(), LANDMARK_COUNT_WITH_IRISES);
    assert_eq!(faces[0].scaled_mesh.len(), LANDMARK_COUNT_WITH_IRISES);
    assert_eq!(faces[0].annotations["leftEyeIris"].len(), 5);
    assert_eq!(faces[0].annotations["rightEyeIris"].len(), 5);
}

#[test]
fn prediction_json() {
    let mut h = harness(true, FaceMeshConfig::default());
    let frame = frame();
    let faces = h
        .facemesh
        .estimate_faces(FrameInput::Tensor(frame.view()), &NO_IRIS)
        .unwrap();
    let faces = values(faces);

    let json = serde_json::to_value(&faces[0]).unwrap();
    assert!(json["faceInViewConfidence"].is_number());
    assert_eq!(json["boundingBox"]["topLeft"].as_array().unwrap().len(), 2);
    assert_eq!(json["boundingBox"]["bottomRight"].as_array().unwrap().len(), 2);
    assert_eq!(json["scaledMesh"].as_array().unwrap().len(), LANDMARK_COUNT);
    assert_eq!(json["annotations"]["noseTip"].as_array().unwrap().len(), 1);
}

fn assert_point(actual: [f32; 2], expected: [f32; 2]) {
    assert_relative_eq!(actual[0], expected[0], epsilon = 1e-3);
    assert_relative_eq!(actual[1], expected[1], epsilon = 1e-3);
}

#[test]
fn detector_only() {
    let mut detector = FaceDetector::new(CenterFaceDetector::new(true), DetectorConfig::default());
    let frame = frame();

    let faces = detector.estimate_faces(frame.view(), false, true).unwrap();
    assert_eq!(faces.len(), 1);
    let face = &faces[0];
    assert_point(face.top_left, [88.0, 88.0]);
    assert_point(face.bottom_right, [168.0, 168.0]);
    assert_relative_eq!(face.probability.unwrap(), sigmoid(5.0));
    let landmarks = face.landmarks.as_ref().unwrap();
    assert_eq!(landmarks.len(), 6);
    assert_point(landmarks[3], [128.0, 152.0]);

    let json = serde_json::to_string(face).unwrap();
    let parsed: DetectedFace = serde_json::from_str(&json).unwrap();
    assert_eq!(&parsed, face);

    let bare = detector.estimate_faces(frame.view(), true, false).unwrap();
    assert_eq!(bare[0].landmarks, None);
    assert_eq!(bare[0].probability, None);
    assert_relative_eq!(bare[0].top_left[0], 167.0, epsilon = 1e-3);
    assert_relative_eq!(bare[0].bottom_right[0], 87.0, epsilon = 1e-3);
    let json = serde_json::to_value(&bare[0]).unwrap();
    assert!(json.get("probability").is_none());
}
