//! Watchlist gallery: reference identities and their embeddings.
//!
//! Built once at startup from a directory of reference photos. Identifiers
//! come from a `manifest.toml` next to the photos, or from filenames of the
//! form `<ID>_<label>.jpg`; they are never assigned by directory position.

use crate::detector::{DetectorError, FaceDetect};
use crate::recognizer::{FaceEmbed, RecognizerError};
use crate::types::GalleryEntry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.toml";
pub const REFERENCE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gallery manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot decode reference image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no face detected in reference image {path}")]
    NoFace { path: PathBuf },
    #[error("duplicate reference id {id:?} in {path}")]
    DuplicateId { id: String, path: PathBuf },
    #[error("face detector failed on {path}: {source}")]
    Detector {
        path: PathBuf,
        #[source]
        source: DetectorError,
    },
    #[error("face recognizer failed on {path}: {source}")]
    Recognizer {
        path: PathBuf,
        #[source]
        source: RecognizerError,
    },
}

impl GalleryError {
    /// Per-image failures that the skip policy tolerates.
    fn is_skippable(&self) -> bool {
        matches!(
            self,
            GalleryError::Decode { .. }
                | GalleryError::NoFace { .. }
                | GalleryError::DuplicateId { .. }
        )
    }
}

/// What to do with a reference image that cannot produce an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFacePolicy {
    /// Log a warning and leave the image out of the gallery.
    #[default]
    Skip,
    /// Fail the whole load.
    Abort,
}

impl FromStr for MissingFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(MissingFacePolicy::Skip),
            "abort" => Ok(MissingFacePolicy::Abort),
            other => Err(format!(
                "unknown missing-face policy {other:?} (expected \"skip\" or \"abort\")"
            )),
        }
    }
}

impl fmt::Display for MissingFacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingFacePolicy::Skip => f.write_str("skip"),
            MissingFacePolicy::Abort => f.write_str("abort"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "entry")]
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    file: String,
    id: String,
    label: Option<String>,
}

/// Identity assigned to one reference file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    id: String,
    label: String,
}

/// Immutable set of known identities, index-aligned in load order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Build a gallery from ready-made entries (fixtures, pre-computed stores).
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Scan `dir` and compute one embedding per reference image.
    ///
    /// Each supported image contributes the embedding of its first
    /// (highest-confidence) face. Images that fail to decode, contain no
    /// face, or repeat an id are handled per `policy`; detector and
    /// recognizer failures always abort.
    pub fn load(
        dir: &Path,
        detector: &mut dyn FaceDetect,
        recognizer: &mut dyn FaceEmbed,
        policy: MissingFacePolicy,
    ) -> Result<Self, GalleryError> {
        let manifest = read_manifest(dir)?;
        let files = reference_files(dir)?;

        let mut entries = Vec::with_capacity(files.len());
        let mut seen: HashSet<String> = HashSet::new();
        let mut skipped = 0usize;

        for path in files {
            let identity = identify(&path, &manifest);
            let outcome = if seen.contains(&identity.id) {
                Err(GalleryError::DuplicateId {
                    id: identity.id.clone(),
                    path: path.clone(),
                })
            } else {
                embed_reference(&path, identity, detector, recognizer)
            };

            match outcome {
                Ok(entry) => {
                    tracing::debug!(
                        id = %entry.id,
                        label = %entry.label,
                        path = %path.display(),
                        "gallery entry loaded"
                    );
                    seen.insert(entry.id.clone());
                    entries.push(entry);
                }
                Err(err) if policy == MissingFacePolicy::Skip && err.is_skippable() => {
                    tracing::warn!(error = %err, "skipping reference image");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            dir = %dir.display(),
            loaded = entries.len(),
            skipped,
            "gallery loaded"
        );
        if skipped > 0 {
            tracing::warn!(skipped, "some reference images were left out of the gallery");
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&GalleryEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }
}

fn read_manifest(dir: &Path) -> Result<HashMap<String, Identity>, GalleryError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let text = std::fs::read_to_string(&path).map_err(|source| GalleryError::Io {
        path: path.clone(),
        source,
    })?;
    let manifest: Manifest = toml::from_str(&text).map_err(|source| GalleryError::Manifest {
        path: path.clone(),
        source,
    })?;

    tracing::info!(
        path = %path.display(),
        entries = manifest.entries.len(),
        "gallery manifest read"
    );
    Ok(manifest
        .entries
        .into_iter()
        .map(|e| {
            let label = e.label.unwrap_or_else(|| file_stem(Path::new(&e.file)));
            (e.file, Identity { id: e.id, label })
        })
        .collect())
}

/// Supported images in `dir`, in lexicographic filename order.
fn reference_files(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && has_reference_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn has_reference_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| REFERENCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Manifest row for the file if there is one, otherwise parse the filename.
fn identify(path: &Path, manifest: &HashMap<String, Identity>) -> Identity {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(identity) = manifest.get(&file_name) {
        return identity.clone();
    }
    parse_stem(&file_stem(path))
}

/// `Y32510_john_doe` -> (`Y32510`, `john_doe`); anything else uses the stem for both.
fn parse_stem(stem: &str) -> Identity {
    if let Some((head, rest)) = stem.split_once('_') {
        if is_reference_id(head) && !rest.is_empty() {
            return Identity {
                id: head.to_string(),
                label: rest.to_string(),
            };
        }
    }
    Identity {
        id: stem.to_string(),
        label: stem.to_string(),
    }
}

/// One or more ASCII letters followed by one or more digits.
fn is_reference_id(token: &str) -> bool {
    let digits_at = token.find(|c: char| c.is_ascii_digit());
    match digits_at {
        Some(split) if split > 0 => {
            let (letters, digits) = token.split_at(split);
            letters.chars().all(|c| c.is_ascii_alphabetic())
                && digits.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

fn embed_reference(
    path: &Path,
    identity: Identity,
    detector: &mut dyn FaceDetect,
    recognizer: &mut dyn FaceEmbed,
) -> Result<GalleryEntry, GalleryError> {
    let image = image::open(path)
        .map_err(|source| GalleryError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let faces = detector.detect_faces(&image).map_err(|source| GalleryError::Detector {
        path: path.to_path_buf(),
        source,
    })?;
    let first = faces.into_iter().next().ok_or_else(|| GalleryError::NoFace {
        path: path.to_path_buf(),
    })?;

    let embedding = recognizer
        .embed_faces(&image, std::slice::from_ref(&first))
        .map_err(|source| GalleryError::Recognizer {
            path: path.to_path_buf(),
            source,
        })?
        .into_iter()
        .next()
        .ok_or_else(|| GalleryError::Recognizer {
            path: path.to_path_buf(),
            source: RecognizerError::InferenceFailed("no embedding returned for face".into()),
        })?;

    Ok(GalleryEntry {
        id: identity.id,
        label: identity.label,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use image::{Rgb, RgbImage};

    /// Reports one face unless the image is entirely black.
    struct BrightnessDetector;

    impl FaceDetect for BrightnessDetector {
        fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(vec![]);
            }
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox::from_corners(0.0, 0.0, w as f32, h as f32, 0.9)])
        }
    }

    /// Embedding is the normalised colour of the top-left pixel.
    struct ColourEmbedder;

    impl FaceEmbed for ColourEmbedder {
        fn embed_faces(
            &mut self,
            image: &RgbImage,
            faces: &[BoundingBox],
        ) -> Result<Vec<Embedding>, RecognizerError> {
            let p = image.get_pixel(0, 0);
            Ok(faces
                .iter()
                .map(|_| Embedding::new(p.0.iter().map(|&v| v as f32 / 255.0).collect()))
                .collect())
        }
    }

    fn write_png(dir: &Path, name: &str, colour: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(colour)).save(dir.join(name)).unwrap();
    }

    fn load(dir: &Path, policy: MissingFacePolicy) -> Result<Gallery, GalleryError> {
        Gallery::load(dir, &mut BrightnessDetector, &mut ColourEmbedder, policy)
    }

    fn identity(id: &str, label: &str) -> Identity {
        Identity {
            id: id.into(),
            label: label.into(),
        }
    }

    #[test]
    fn test_parse_stem_with_reference_id() {
        assert_eq!(parse_stem("Y32510_john_doe"), identity("Y32510", "john_doe"));
    }

    #[test]
    fn test_parse_stem_without_reference_id() {
        assert_eq!(parse_stem("john_doe"), identity("john_doe", "john_doe"));
        assert_eq!(parse_stem("Y32510"), identity("Y32510", "Y32510"));
        assert_eq!(parse_stem("Y32510_"), identity("Y32510_", "Y32510_"));
    }

    #[test]
    fn test_is_reference_id() {
        assert!(is_reference_id("Y32510"));
        assert!(is_reference_id("AB1"));
        assert!(!is_reference_id("32510"));
        assert!(!is_reference_id("john"));
        assert!(!is_reference_id("Y325a"));
    }

    #[test]
    fn test_load_n_valid_images() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "Y32511_jane_roe.png", [0, 255, 0]);
        write_png(dir.path(), "Y32510_john_doe.png", [255, 0, 0]);
        write_png(dir.path(), "mugshot.jpg", [0, 0, 255]);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let gallery = load(dir.path(), MissingFacePolicy::Skip).unwrap();
        assert_eq!(gallery.len(), 3);

        let ids: Vec<&str> = gallery.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["Y32510", "Y32511", "mugshot"]);
        let labels: Vec<&str> = gallery.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["john_doe", "jane_roe", "mugshot"]);
        assert!(gallery.iter().all(|e| e.embedding.len() == 3));
        assert_eq!(gallery.get(0).unwrap().embedding.values, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_manifest_overrides_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "suspect_a.png", [255, 0, 0]);
        write_png(dir.path(), "suspect_b.png", [0, 255, 0]);
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"
[[entry]]
file = "suspect_a.png"
id = "Y32579"
label = "john_doe"

[[entry]]
file = "suspect_b.png"
id = "Y32580"
"#,
        )
        .unwrap();

        let gallery = load(dir.path(), MissingFacePolicy::Skip).unwrap();
        let pairs: Vec<(&str, &str)> = gallery
            .iter()
            .map(|e| (e.id.as_str(), e.label.as_str()))
            .collect();
        assert_eq!(pairs, vec![("Y32579", "john_doe"), ("Y32580", "suspect_b")]);
    }

    #[test]
    fn test_bad_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "[[entry]]\nfile = 3\n").unwrap();
        assert!(matches!(
            load(dir.path(), MissingFacePolicy::Skip),
            Err(GalleryError::Manifest { .. })
        ));
    }

    #[test]
    fn test_missing_face_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "Y32510_john_doe.png", [255, 0, 0]);
        write_png(dir.path(), "Y32512_blank.png", [0, 0, 0]);

        let gallery = load(dir.path(), MissingFacePolicy::Skip).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.get(0).unwrap().id, "Y32510");
    }

    #[test]
    fn test_missing_face_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "Y32510_john_doe.png", [255, 0, 0]);
        write_png(dir.path(), "Y32512_blank.png", [0, 0, 0]);

        let err = load(dir.path(), MissingFacePolicy::Abort).unwrap_err();
        assert!(matches!(err, GalleryError::NoFace { .. }));
    }

    #[test]
    fn test_corrupt_image_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "Y32510_john_doe.png", [255, 0, 0]);
        std::fs::write(dir.path().join("Y32511_broken.jpg"), b"not really a jpeg").unwrap();

        assert_eq!(load(dir.path(), MissingFacePolicy::Skip).unwrap().len(), 1);
        assert!(matches!(
            load(dir.path(), MissingFacePolicy::Abort),
            Err(GalleryError::Decode { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "Y32510_john_doe.png", [255, 0, 0]);
        write_png(dir.path(), "Y32510_johnny.png", [0, 255, 0]);

        let gallery = load(dir.path(), MissingFacePolicy::Skip).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.get(0).unwrap().label, "john_doe");
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent"), MissingFacePolicy::Skip).unwrap_err();
        assert!(matches!(err, GalleryError::Io { .. }));
    }

    #[test]
    fn test_extension_filter_case_insensitive() {
        assert!(has_reference_extension(Path::new("a.JPG")));
        assert!(has_reference_extension(Path::new("a.jpeg")));
        assert!(!has_reference_extension(Path::new("a.gif")));
        assert!(!has_reference_extension(Path::new("manifest.toml")));
    }

    #[test]
    fn test_missing_face_policy_parse() {
        assert_eq!("ABORT".parse::<MissingFacePolicy>(), Ok(MissingFacePolicy::Abort));
        assert!("ignore".parse::<MissingFacePolicy>().is_err());
    }
}
