//! Presence DLP - Liveness Analyzer
//!
//! Decides from live frames whether a physically present, enrolled person
//! is in front of the camera. Every face in view must be both known and
//! live; a single stranger or spoof rejects the whole frame.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::RgbImage;
use tracing::{debug, info, warn};

use super::frame::{downscale, face_crop, FaceEngine, FrameSource};
use super::heuristics::{assess_crop, LivenessThresholds};
use super::identity::{BoundingBox, KnownTemplates};
use crate::config::ServiceConfig;
use crate::error::DlpResult;
use crate::storage::Storage;
use crate::vault::CryptoVault;

/// Outcome of a full liveness scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    Granted,
    /// Rejected; the reason names the failing check or the unknown face
    Denied(String),
}

impl LivenessVerdict {
    pub fn is_granted(&self) -> bool {
        matches!(self, LivenessVerdict::Granted)
    }

    pub fn reason(&self) -> &str {
        match self {
            LivenessVerdict::Granted => "Access granted",
            LivenessVerdict::Denied(reason) => reason,
        }
    }
}

/// Presence decisions consumed by the monitoring loop
pub trait PresenceVerifier: Send {
    /// Full spoof + identity scan over several frames
    fn verify_liveness(&mut self) -> DlpResult<LivenessVerdict>;

    /// Cheap identity-only check on a single frame
    fn check_authorization(&mut self) -> DlpResult<bool>;

    /// Reload enrolled templates; returns how many are usable
    fn update_cache(&mut self) -> DlpResult<usize>;

    /// Close the capture device
    fn release_camera(&mut self);
}

/// Liveness scan parameters
#[derive(Debug, Clone)]
pub struct LivenessSettings {
    /// Frames examined before giving up
    pub frames: u32,
    /// Downscale factor of the search frame
    pub scaling: f32,
    /// Margin around each face crop (full-resolution pixels)
    pub padding: u32,
    /// Identity distance tolerance
    pub tolerance: f32,
    /// Pause after a frame without a decision
    pub retry_delay: Duration,
    pub thresholds: LivenessThresholds,
}

impl LivenessSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            frames: config.liveness_frames,
            scaling: config.frame_scaling,
            padding: config.crop_padding,
            tolerance: config.face_tolerance,
            retry_delay: Duration::from_millis(50),
            thresholds: LivenessThresholds::default(),
        }
    }
}

/// Classification of one face in a frame
#[derive(Debug, Clone, PartialEq, Eq)]
enum FaceStatus {
    Employee,
    Stranger,
    Spoof(String),
}

impl fmt::Display for FaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaceStatus::Employee => write!(f, "employee"),
            FaceStatus::Stranger => write!(f, "unknown face"),
            FaceStatus::Spoof(reason) => write!(f, "spoof [{}]", reason),
        }
    }
}

/// Liveness Analyzer over a camera and a face engine
pub struct LivenessAnalyzer<F: FrameSource, E: FaceEngine> {
    source: F,
    engine: E,
    templates: KnownTemplates,
    storage: Arc<dyn Storage>,
    vault: Arc<CryptoVault>,
    settings: LivenessSettings,
}

impl<F: FrameSource, E: FaceEngine> LivenessAnalyzer<F, E> {
    /// Build the analyzer and load the enrolled templates
    pub fn new(
        source: F,
        engine: E,
        storage: Arc<dyn Storage>,
        vault: Arc<CryptoVault>,
        settings: LivenessSettings,
    ) -> DlpResult<Self> {
        let mut analyzer = Self {
            source,
            engine,
            templates: KnownTemplates::new(Vec::new(), settings.tolerance),
            storage,
            vault,
            settings,
        };
        analyzer.update_cache()?;
        Ok(analyzer)
    }

    pub fn templates(&self) -> &KnownTemplates {
        &self.templates
    }

    fn classify(
        &self,
        search_frame: &RgbImage,
        face: &BoundingBox,
        crop: &RgbImage,
    ) -> DlpResult<FaceStatus> {
        let live = assess_crop(crop, &self.settings.thresholds);
        let known = match self.engine.embed(search_frame, face)? {
            Some(embedding) => self.templates.matches(&embedding),
            None => false,
        };

        Ok(match (known, live) {
            (false, _) => FaceStatus::Stranger,
            (true, Err(reason)) => FaceStatus::Spoof(reason),
            (true, Ok(())) => FaceStatus::Employee,
        })
    }

    fn pause(&self) {
        if !self.settings.retry_delay.is_zero() {
            thread::sleep(self.settings.retry_delay);
        }
    }
}

impl<F: FrameSource, E: FaceEngine> PresenceVerifier for LivenessAnalyzer<F, E> {
    fn verify_liveness(&mut self) -> DlpResult<LivenessVerdict> {
        info!("Liveness scan started");

        for _ in 0..self.settings.frames {
            let Some(frame) = self.source.grab() else {
                break;
            };

            let search = downscale(&frame, self.settings.scaling);
            let faces = self.engine.detect_faces(&search)?;
            if faces.is_empty() {
                self.pause();
                continue;
            }

            let mut employees = 0;
            for (i, face) in faces.iter().enumerate() {
                let Some(crop) =
                    face_crop(&frame, face, self.settings.scaling, self.settings.padding)
                else {
                    continue;
                };

                let status = self.classify(&search, face, &crop)?;
                debug!("Face #{}: {}", i + 1, status);

                if status == FaceStatus::Employee {
                    employees += 1;
                } else {
                    warn!("Liveness rejected: {}", status);
                    return Ok(LivenessVerdict::Denied(format!("Access denied: {}", status)));
                }
            }

            if employees > 0 {
                info!("Liveness passed ({} face(s))", employees);
                return Ok(LivenessVerdict::Granted);
            }

            self.pause();
        }

        Ok(LivenessVerdict::Denied("Access denied (no faces)".into()))
    }

    fn check_authorization(&mut self) -> DlpResult<bool> {
        if self.templates.is_empty() {
            return Ok(false);
        }
        let Some(frame) = self.source.grab() else {
            return Ok(false);
        };

        let search = downscale(&frame, self.settings.scaling);
        for face in self.engine.detect_faces(&search)? {
            if let Some(embedding) = self.engine.embed(&search, &face)? {
                if self.templates.matches(&embedding) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn update_cache(&mut self) -> DlpResult<usize> {
        self.templates =
            KnownTemplates::load(self.storage.as_ref(), &self.vault, self.settings.tolerance)?;
        Ok(self.templates.len())
    }

    fn release_camera(&mut self) {
        if self.source.is_open() {
            self.source.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::storage::SqliteStore;
    use crate::vision::heuristics::tests::{live_crop, printed_crop};
    use crate::vision::identity::FeatureVector;

    /// Camera replaying one still frame
    struct StillCamera {
        frame: Option<RgbImage>,
        grabs: usize,
        open: bool,
    }

    impl StillCamera {
        fn new(frame: Option<RgbImage>) -> Self {
            Self {
                frame,
                grabs: 0,
                open: false,
            }
        }
    }

    impl FrameSource for StillCamera {
        fn grab(&mut self) -> Option<RgbImage> {
            self.grabs += 1;
            self.open = true;
            self.frame.clone()
        }

        fn release(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Engine reporting a fixed set of faces and their embeddings
    struct ScriptedEngine {
        faces: Vec<(BoundingBox, FeatureVector)>,
    }

    impl FaceEngine for ScriptedEngine {
        fn detect_faces(&self, _image: &RgbImage) -> DlpResult<Vec<BoundingBox>> {
            Ok(self.faces.iter().map(|(b, _)| *b).collect())
        }

        fn embed(&self, _image: &RgbImage, face: &BoundingBox) -> DlpResult<Option<FeatureVector>> {
            Ok(self.faces.iter().find(|(b, _)| b == face).map(|(_, e)| e.clone()))
        }
    }

    fn alice() -> FeatureVector {
        FeatureVector::new(vec![0.2; 8])
    }

    fn stranger() -> FeatureVector {
        FeatureVector::new(vec![0.9; 8])
    }

    fn settings() -> LivenessSettings {
        LivenessSettings {
            frames: 5,
            scaling: 0.5,
            padding: 20,
            tolerance: 0.5,
            retry_delay: Duration::ZERO,
            thresholds: LivenessThresholds::default(),
        }
    }

    fn analyzer(
        frame: Option<RgbImage>,
        faces: Vec<(BoundingBox, FeatureVector)>,
    ) -> LivenessAnalyzer<StillCamera, ScriptedEngine> {
        let vault = Arc::new(CryptoVault::with_master_key(SecretKey::generate()));
        let store = SqliteStore::open_in_memory(Arc::clone(&vault)).unwrap();
        store.add_user("Alice", "Employee", &alice()).unwrap();

        LivenessAnalyzer::new(
            StillCamera::new(frame),
            ScriptedEngine { faces },
            Arc::new(store),
            vault,
            settings(),
        )
        .unwrap()
    }

    fn left_face() -> BoundingBox {
        BoundingBox::new(20, 70, 70, 20)
    }

    fn right_face() -> BoundingBox {
        BoundingBox::new(20, 190, 70, 140)
    }

    #[test]
    fn test_enrolled_live_face_granted() {
        let mut analyzer = analyzer(Some(live_crop(400, 200)), vec![(left_face(), alice())]);
        assert_eq!(analyzer.templates().len(), 1);
        assert!(analyzer.check_authorization().unwrap());
        assert_eq!(analyzer.verify_liveness().unwrap(), LivenessVerdict::Granted);
    }

    #[test]
    fn test_printed_photo_rejected_with_reason() {
        let mut analyzer = analyzer(Some(printed_crop(400, 200)), vec![(left_face(), alice())]);

        // identity alone still matches
        assert!(analyzer.check_authorization().unwrap());

        let verdict = analyzer.verify_liveness().unwrap();
        assert!(!verdict.is_granted());
        assert!(verdict.reason().contains("texture"), "{}", verdict.reason());
    }

    #[test]
    fn test_stranger_next_to_employee_rejects_frame() {
        let mut analyzer = analyzer(
            Some(live_crop(400, 200)),
            vec![(left_face(), alice()), (right_face(), stranger())],
        );

        let verdict = analyzer.verify_liveness().unwrap();
        assert!(verdict.reason().contains("unknown face"), "{}", verdict.reason());
        assert!(analyzer.check_authorization().unwrap());
    }

    #[test]
    fn test_no_faces_exhausts_frames() {
        let mut analyzer = analyzer(Some(live_crop(200, 200)), vec![]);
        let verdict = analyzer.verify_liveness().unwrap();
        assert_eq!(verdict, LivenessVerdict::Denied("Access denied (no faces)".into()));
        assert_eq!(analyzer.source.grabs, 5);
    }

    #[test]
    fn test_dead_camera_stops_scan() {
        let mut analyzer = analyzer(None, vec![(left_face(), alice())]);
        assert!(!analyzer.verify_liveness().unwrap().is_granted());
        assert_eq!(analyzer.source.grabs, 1);
        assert!(!analyzer.check_authorization().unwrap());
    }

    #[test]
    fn test_no_templates_never_authorized() {
        let vault = Arc::new(CryptoVault::with_master_key(SecretKey::generate()));
        let store = Arc::new(SqliteStore::open_in_memory(Arc::clone(&vault)).unwrap());
        let mut analyzer = LivenessAnalyzer::new(
            StillCamera::new(Some(live_crop(200, 200))),
            ScriptedEngine { faces: vec![(left_face(), alice())] },
            store,
            vault,
            settings(),
        )
        .unwrap();

        assert!(!analyzer.check_authorization().unwrap());
        assert_eq!(analyzer.source.grabs, 0);
        assert!(analyzer.verify_liveness().unwrap().reason().contains("unknown face"));
    }

    #[test]
    fn test_release_camera() {
        let mut analyzer = analyzer(Some(live_crop(200, 200)), vec![]);
        analyzer.check_authorization().unwrap();
        assert!(analyzer.source.is_open());
        analyzer.release_camera();
        assert!(!analyzer.source.is_open());
    }
}
