//! Presence DLP - Frame Acquisition
//!
//! The capture device and the face localization/embedding model are both
//! external. The monitoring loop talks to them only through [`FrameSource`]
//! and [`FaceEngine`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use image::{imageops, imageops::FilterType, RgbImage};
use tracing::{debug, warn};

use super::identity::{BoundingBox, FeatureVector};
use crate::error::DlpResult;

/// Image extensions accepted from the capture spool
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Exclusive handle on a capture device
pub trait FrameSource: Send {
    /// Next full-resolution frame; `None` when the device produced nothing
    fn grab(&mut self) -> Option<RgbImage>;

    /// Close the device
    fn release(&mut self);

    fn is_open(&self) -> bool;
}

/// Face localization and embedding capability
pub trait FaceEngine: Send {
    /// Bounding boxes of every face in `image`
    fn detect_faces(&self, image: &RgbImage) -> DlpResult<Vec<BoundingBox>>;

    /// Feature vector for one detected face
    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> DlpResult<Option<FeatureVector>>;
}

/// Engine used when no model is installed. Sees no faces, so nothing is
/// ever authorized through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFaceEngine;

impl FaceEngine for NullFaceEngine {
    fn detect_faces(&self, _image: &RgbImage) -> DlpResult<Vec<BoundingBox>> {
        Ok(Vec::new())
    }

    fn embed(&self, _image: &RgbImage, _face: &BoundingBox) -> DlpResult<Option<FeatureVector>> {
        Ok(None)
    }
}

/// Frame source reading the newest image a capture helper dropped into a
/// spool directory.
///
/// A frame is handed out at most once and only while younger than
/// `max_age`; a helper that stopped writing yields `None`, never a replay
/// of its last image. Served frames are removed from the spool.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    max_age: Duration,
    last_served: Option<(PathBuf, SystemTime)>,
    open: bool,
}

impl DirectoryFrameSource {
    pub fn new(dir: &Path, max_age: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_age,
            last_served: None,
            open: false,
        }
    }

    fn newest_frame(&self) -> Option<(PathBuf, SystemTime)> {
        let entries = fs::read_dir(&self.dir).ok()?;

        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_frame_file(p))
            .filter_map(|p| {
                let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((p, modified))
            })
            .max_by_key(|(_, modified)| *modified)
    }

    fn is_fresh(&self, modified: SystemTime) -> bool {
        // mtime in the future counts as age zero
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        age <= self.max_age
    }

    fn consume(&mut self, path: PathBuf, modified: SystemTime) {
        if let Err(e) = fs::remove_file(&path) {
            debug!("Frame {} left in spool: {}", path.display(), e);
        }
        self.last_served = Some((path, modified));
    }
}

impl FrameSource for DirectoryFrameSource {
    fn grab(&mut self) -> Option<RgbImage> {
        let (path, modified) = self.newest_frame()?;
        if self.last_served.as_ref() == Some(&(path.clone(), modified)) {
            return None;
        }
        if !self.is_fresh(modified) {
            debug!("Stale frame ignored: {}", path.display());
            return None;
        }

        let frame = image::open(&path);
        self.consume(path.clone(), modified);
        match frame {
            Ok(img) => {
                if !self.open {
                    debug!("Capture spool opened: {}", self.dir.display());
                }
                self.open = true;
                Some(img.to_rgb8())
            }
            Err(e) => {
                warn!("Unreadable frame {}: {}", path.display(), e);
                None
            }
        }
    }

    fn release(&mut self) {
        if self.open {
            debug!("Capture spool released: {}", self.dir.display());
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Resize by `factor` for face search
pub fn downscale(frame: &RgbImage, factor: f32) -> RgbImage {
    if (factor - 1.0).abs() < f32::EPSILON {
        return frame.clone();
    }
    let width = ((frame.width() as f32 * factor).round() as u32).max(1);
    let height = ((frame.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(frame, width, height, FilterType::Triangle)
}

/// Full-resolution crop of a face found on the downscaled frame.
///
/// The box is scaled back by `1 / scaling`, grown by `padding` on each side
/// and clamped to the frame. `None` when nothing is left.
pub fn face_crop(
    frame: &RgbImage,
    face: &BoundingBox,
    scaling: f32,
    padding: u32,
) -> Option<RgbImage> {
    let factor = 1.0 / scaling;
    let scale = |v: u32| (v as f32 * factor) as i64;
    let pad = padding as i64;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let y1 = (scale(face.top) - pad).clamp(0, h);
    let y2 = (scale(face.bottom) + pad).clamp(0, h);
    let x1 = (scale(face.left) - pad).clamp(0, w);
    let x2 = (scale(face.right) + pad).clamp(0, w);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(
        imageops::crop_imm(
            frame,
            x1 as u32,
            y1 as u32,
            (x2 - x1) as u32,
            (y2 - y1) as u32,
        )
        .to_image(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn test_face_crop_scales_and_pads() {
        let frame = RgbImage::new(640, 480);
        let face = BoundingBox::new(100, 150, 150, 100);

        let crop = face_crop(&frame, &face, 0.5, 20).unwrap();
        // (200-20 .. 300+20) on both axes
        assert_eq!(crop.dimensions(), (140, 140));
    }

    #[test]
    fn test_face_crop_clamps_to_frame() {
        let frame = RgbImage::new(100, 100);
        let face = BoundingBox::new(0, 60, 60, 0);
        let crop = face_crop(&frame, &face, 0.5, 20).unwrap();
        assert_eq!(crop.dimensions(), (100, 100));

        let outside = BoundingBox::new(200, 220, 220, 200);
        assert!(face_crop(&frame, &outside, 0.5, 0).is_none());
    }

    #[test]
    fn test_downscale() {
        let frame = RgbImage::new(640, 480);
        assert_eq!(downscale(&frame, 0.5).dimensions(), (320, 240));
        assert_eq!(downscale(&frame, 1.0).dimensions(), (640, 480));
    }

    #[test]
    fn test_directory_source_reads_newest() {
        let dir = tempdir().unwrap();
        let mut source = DirectoryFrameSource::new(dir.path(), Duration::from_secs(5));
        assert!(source.grab().is_none());
        assert!(!source.is_open());

        RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]))
            .save(dir.path().join("frame.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let frame = source.grab().unwrap();
        assert_eq!(frame.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert!(source.is_open());
        assert!(!dir.path().join("frame.png").exists());
        assert!(dir.path().join("notes.txt").exists());

        source.release();
        assert!(!source.is_open());
    }

    #[test]
    fn test_stale_frame_yields_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&path).unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        let mut source = DirectoryFrameSource::new(dir.path(), Duration::from_secs(1));
        assert!(source.grab().is_none());
        assert!(source.grab().is_none());
        assert!(!source.is_open());
    }

    #[test]
    fn test_frame_served_once() {
        let dir = tempdir().unwrap();
        let mut source = DirectoryFrameSource::new(dir.path(), Duration::from_secs(5));

        RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]))
            .save(dir.path().join("a.png"))
            .unwrap();
        assert!(source.grab().is_some());
        // helper stopped writing
        assert!(source.grab().is_none());

        RgbImage::from_pixel(4, 4, Rgb([7, 7, 7]))
            .save(dir.path().join("b.png"))
            .unwrap();
        assert_eq!(source.grab().unwrap().get_pixel(0, 0), &Rgb([7, 7, 7]));
    }
}
