use std::path::PathBuf;
use std::str::FromStr;
use vigil_core::pipeline::DEFAULT_MATCH_THRESHOLD;
use vigil_core::{check_threshold, MatchPolicy, MatchSettings, MissingFacePolicy, YoloParams};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Reference images of persons of interest.
    pub gallery_dir: PathBuf,
    /// Where uploads and annotated outputs are written.
    pub upload_dir: PathBuf,
    /// Euclidean distance below which a face matches a gallery entry.
    pub match_threshold: f32,
    pub match_policy: MatchPolicy,
    /// What to do with reference images that yield no face.
    pub missing_face: MissingFacePolicy,
    /// Number of engine worker threads, each with its own model instances.
    pub workers: usize,
    /// Upper bound on a single detection request.
    pub request_timeout_secs: u64,
    pub max_upload_bytes: usize,
    /// TrueType/OpenType font for captions. Boxes only when unset.
    pub font_path: Option<PathBuf>,
    /// Object model file name, relative to `model_dir` unless absolute.
    pub object_model: PathBuf,
    /// Class labels file name, relative to `model_dir` unless absolute.
    pub object_labels: PathBuf,
    pub object_confidence: f32,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(vigil_core::default_model_dir);

        Self {
            bind: var("VIGIL_BIND").unwrap_or_else(|| "127.0.0.1:5000".to_string()),
            model_dir,
            gallery_dir: var("VIGIL_GALLERY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static/criminals")),
            upload_dir: var("VIGIL_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static/uploads")),
            match_threshold: match_threshold(&var),
            match_policy: parsed(&var, "VIGIL_MATCH_POLICY", MatchPolicy::default()),
            missing_face: parsed(
                &var,
                "VIGIL_GALLERY_MISSING_FACE",
                MissingFacePolicy::default(),
            ),
            workers: parsed(&var, "VIGIL_WORKERS", 2usize).max(1),
            request_timeout_secs: parsed(&var, "VIGIL_REQUEST_TIMEOUT_SECS", 30u64),
            max_upload_bytes: parsed(&var, "VIGIL_MAX_UPLOAD_BYTES", 10 * 1024 * 1024usize),
            font_path: var("VIGIL_FONT_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            object_model: var("VIGIL_OBJECT_MODEL")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("xray.onnx")),
            object_labels: var("VIGIL_OBJECT_LABELS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("xray.labels")),
            object_confidence: parsed(&var, "VIGIL_OBJECT_CONFIDENCE", 0.25f32),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(vigil_core::FACE_DETECTOR_MODEL)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(vigil_core::FACE_RECOGNIZER_MODEL)
    }

    /// Path to the X-ray object model.
    pub fn object_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.object_model)
    }

    /// Path to the class labels file, if it exists.
    pub fn object_labels_path(&self) -> Option<PathBuf> {
        let path = self.model_dir.join(&self.object_labels);
        path.exists().then_some(path)
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            threshold: self.match_threshold,
            policy: self.match_policy,
        }
    }

    pub fn yolo_params(&self) -> YoloParams {
        YoloParams {
            conf_threshold: self.object_confidence,
            ..YoloParams::default()
        }
    }
}

/// Parse `key` if set, falling back to `default` (with a warning when unparseable).
fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value; using default");
            default
        }),
        None => default,
    }
}

/// `VIGIL_MATCH_THRESHOLD`, or the default when it is not a finite value above zero.
fn match_threshold(var: &impl Fn(&str) -> Option<String>) -> f32 {
    let threshold = parsed(var, "VIGIL_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD);
    check_threshold(threshold).unwrap_or_else(|err| {
        tracing::warn!(%err, "invalid VIGIL_MATCH_THRESHOLD; using default");
        DEFAULT_MATCH_THRESHOLD
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("VIGIL_MODEL_DIR", "/models")]);
        assert_eq!(c.bind, "127.0.0.1:5000");
        assert_eq!(c.gallery_dir, PathBuf::from("static/criminals"));
        assert_eq!(c.upload_dir, PathBuf::from("static/uploads"));
        assert_eq!(c.match_threshold, 1.10);
        assert_eq!(c.match_policy, MatchPolicy::First);
        assert_eq!(c.missing_face, MissingFacePolicy::Skip);
        assert_eq!(c.workers, 2);
        assert_eq!(c.request_timeout_secs, 30);
        assert_eq!(c.max_upload_bytes, 10 * 1024 * 1024);
        assert!(c.font_path.is_none());
        assert_eq!(c.scrfd_model_path(), PathBuf::from("/models/det_10g.onnx"));
        assert_eq!(c.arcface_model_path(), PathBuf::from("/models/w600k_r50.onnx"));
        assert_eq!(c.object_model_path(), PathBuf::from("/models/xray.onnx"));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("VIGIL_MATCH_THRESHOLD", "0.9"),
            ("VIGIL_MATCH_POLICY", "nearest"),
            ("VIGIL_GALLERY_MISSING_FACE", "abort"),
            ("VIGIL_WORKERS", "0"),
            ("VIGIL_OBJECT_MODEL", "/abs/other.onnx"),
            ("VIGIL_OBJECT_CONFIDENCE", "0.4"),
        ]);
        assert_eq!(c.match_threshold, 0.9);
        assert_eq!(c.match_policy, MatchPolicy::Nearest);
        assert_eq!(c.missing_face, MissingFacePolicy::Abort);
        assert_eq!(c.workers, 1);
        assert_eq!(c.object_model_path(), PathBuf::from("/abs/other.onnx"));
        assert_eq!(c.yolo_params().conf_threshold, 0.4);
        assert_eq!(c.yolo_params().iou_threshold, 0.45);
    }

    #[test]
    fn test_garbage_falls_back() {
        let c = config(&[
            ("VIGIL_MATCH_THRESHOLD", "loose"),
            ("VIGIL_MATCH_POLICY", "random"),
        ]);
        assert_eq!(c.match_threshold, 1.10);
        assert_eq!(c.match_policy, MatchPolicy::First);
    }

    #[test]
    fn test_unusable_threshold_falls_back() {
        for raw in ["nan", "NaN", "inf", "0", "0.0", "-1"] {
            let c = config(&[("VIGIL_MATCH_THRESHOLD", raw)]);
            assert_eq!(c.match_threshold, 1.10, "{raw}");
            assert_eq!(c.match_settings().threshold, 1.10);
        }
    }
}
