//! Named groups of face mesh landmarks.
//!
//! "Left" and "right" are from the perspective of the person in the image, so the left eye
//! appears on the right side of an unflipped camera image.

pub const SILHOUETTE: &[usize] = &[
    10, 338, 297, 332, 284, 251, 389, 356, 454, 323, 361, 288, 397, 365, 379, 378, 400, 377, 152,
    148, 176, 149, 150, 136, 172, 58, 132, 93, 234, 127, 162, 21, 54, 103, 67, 109,
];

pub const LIPS_UPPER_OUTER: &[usize] = &[61, 185, 40, 39, 37, 0, 267, 269, 270, 409, 291];
pub const LIPS_LOWER_OUTER: &[usize] = &[146, 91, 181, 84, 17, 314, 405, 321, 375, 291];
pub const LIPS_UPPER_INNER: &[usize] = &[78, 191, 80, 81, 82, 13, 312, 311, 310, 415, 308];
pub const LIPS_LOWER_INNER: &[usize] = &[78, 95, 88, 178, 87, 14, 317, 402, 318, 324, 308];

pub const RIGHT_EYE_UPPER_0: &[usize] = &[246, 161, 160, 159, 158, 157, 173];
pub const RIGHT_EYE_LOWER_0: &[usize] = &[33, 7, 163, 144, 145, 153, 154, 155, 133];
pub const RIGHT_EYE_UPPER_1: &[usize] = &[247, 30, 29, 27, 28, 56, 190];
pub const RIGHT_EYE_LOWER_1: &[usize] = &[130, 25, 110, 24, 23, 22, 26, 112, 243];
pub const RIGHT_EYE_UPPER_2: &[usize] = &[113, 225, 224, 223, 222, 221, 189];
pub const RIGHT_EYE_LOWER_2: &[usize] = &[226, 31, 228, 229, 230, 231, 232, 233, 244];
pub const RIGHT_EYE_LOWER_3: &[usize] = &[143, 111, 117, 118, 119, 120, 121, 128, 245];
pub const RIGHT_EYEBROW_UPPER: &[usize] = &[156, 70, 63, 105, 66, 107, 55, 193];
pub const RIGHT_EYEBROW_LOWER: &[usize] = &[35, 124, 46, 53, 52, 65];
pub const RIGHT_EYE_IRIS: &[usize] = &[473, 474, 475, 476, 477];

pub const LEFT_EYE_UPPER_0: &[usize] = &[466, 388, 387, 386, 385, 384, 398];
pub const LEFT_EYE_LOWER_0: &[usize] = &[263, 249, 390, 373, 374, 380, 381, 382, 362];
pub const LEFT_EYE_UPPER_1: &[usize] = &[467, 260, 259, 257, 258, 286, 414];
pub const LEFT_EYE_LOWER_1: &[usize] = &[359, 255, 339, 254, 253, 252, 256, 341, 463];
pub const LEFT_EYE_UPPER_2: &[usize] = &[342, 445, 444, 443, 442, 441, 413];
pub const LEFT_EYE_LOWER_2: &[usize] = &[446, 261, 448, 449, 450, 451, 452, 453, 464];
pub const LEFT_EYE_LOWER_3: &[usize] = &[372, 340, 346, 347, 348, 349, 350, 357, 465];
pub const LEFT_EYEBROW_UPPER: &[usize] = &[383, 300, 293, 334, 296, 336, 285, 417];
pub const LEFT_EYEBROW_LOWER: &[usize] = &[265, 353, 276, 283, 282, 295];
pub const LEFT_EYE_IRIS: &[usize] = &[468, 469, 470, 471, 472];

pub const MIDWAY_BETWEEN_EYES: &[usize] = &[168];

pub const NOSE_TIP: &[usize] = &[1];
pub const NOSE_BOTTOM: &[usize] = &[2];
pub const NOSE_RIGHT_CORNER: &[usize] = &[98];
pub const NOSE_LEFT_CORNER: &[usize] = &[327];

pub const RIGHT_CHEEK: &[usize] = &[205];
pub const LEFT_CHEEK: &[usize] = &[425];

/// All landmark groups, with the names they are reported under.
pub const MESH_ANNOTATIONS: &[(&str, &[usize])] = &[
    ("silhouette", SILHOUETTE),
    ("lipsUpperOuter", LIPS_UPPER_OUTER),
    ("lipsLowerOuter", LIPS_LOWER_OUTER),
    ("lipsUpperInner", LIPS_UPPER_INNER),
    ("lipsLowerInner", LIPS_LOWER_INNER),
    ("rightEyeUpper0", RIGHT_EYE_UPPER_0),
    ("rightEyeLower0", RIGHT_EYE_LOWER_0),
    ("rightEyeUpper1", RIGHT_EYE_UPPER_1),
    ("rightEyeLower1", RIGHT_EYE_LOWER_1),
    ("rightEyeUpper2", RIGHT_EYE_UPPER_2),
    ("rightEyeLower2", RIGHT_EYE_LOWER_2),
    ("rightEyeLower3", RIGHT_EYE_LOWER_3),
    ("rightEyebrowUpper", RIGHT_EYEBROW_UPPER),
    ("rightEyebrowLower", RIGHT_EYEBROW_LOWER),
    ("rightEyeIris", RIGHT_EYE_IRIS),
    ("leftEyeUpper0", LEFT_EYE_UPPER_0),
    ("leftEyeLower0", LEFT_EYE_LOWER_0),
    ("leftEyeUpper1", LEFT_EYE_UPPER_1),
    ("leftEyeLower1", LEFT_EYE_LOWER_1),
    ("leftEyeUpper2", LEFT_EYE_UPPER_2),
    ("leftEyeLower2", LEFT_EYE_LOWER_2),
    ("leftEyeLower3", LEFT_EYE_LOWER_3),
    ("leftEyebrowUpper", LEFT_EYEBROW_UPPER),
    ("leftEyebrowLower", LEFT_EYEBROW_LOWER),
    ("leftEyeIris", LEFT_EYE_IRIS),
    ("midwayBetweenEyes", MIDWAY_BETWEEN_EYES),
    ("noseTip", NOSE_TIP),
    ("noseBottom", NOSE_BOTTOM),
    ("noseRightCorner", NOSE_RIGHT_CORNER),
    ("noseLeftCorner", NOSE_LEFT_CORNER),
    ("rightCheek", RIGHT_CHEEK),
    ("leftCheek", LEFT_CHEEK),
];

/// Looks up a landmark group by name.
pub fn annotation(name: &str) -> Option<&'static [usize]> {
    MESH_ANNOTATIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, indices)| *indices)
}

/// Returns whether the named group refers to iris landmarks, which only exist when the iris
/// network ran.
pub fn is_iris_group(name: &str) -> bool {
    name.ends_with("Iris")
}

/// Returns the landmark groups that can be resolved for a mesh of `landmark_count` points.
pub fn available(landmark_count: usize) -> impl Iterator<Item = (&'static str, &'static [usize])> {
    MESH_ANNOTATIONS
        .iter()
        .copied()
        .filter(move |(_, indices)| indices.iter().all(|&i| i < landmark_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::{LANDMARK_COUNT, LANDMARK_COUNT_WITH_IRISES};

    #[test]
    fn lookup() {
        assert_eq!(annotation("noseTip"), Some(&[1][..]));
        assert_eq!(annotation("leftEyeLower0").map(|a| a[0]), Some(263));
        assert_eq!(annotation("nope"), None);
    }

    #[test]
    fn iris_groups_need_iris_landmarks() {
        let without = available(LANDMARK_COUNT).map(|(n, _)| n).collect::<Vec<_>>();
        assert!(!without.iter().any(|n| is_iris_group(n)));
        assert_eq!(without.len(), MESH_ANNOTATIONS.len() - 2);

        let with = available(LANDMARK_COUNT_WITH_IRISES).count();
        assert_eq!(with, MESH_ANNOTATIONS.len());
    }

    #[test]
    fn unique_names() {
        for (i, (a, _)) in MESH_ANNOTATIONS.iter().enumerate() {
            for (b, _) in &MESH_ANNOTATIONS[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
