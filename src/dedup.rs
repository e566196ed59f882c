//! Perceptual deduplication of captured frames.
//!
//! The deduplicator remembers the fingerprint of the last accepted frame per
//! monitor and rejects a new frame when it is too similar to it. Memory lives
//! only in the instance; a restart re-accepts the first frame of each monitor.

use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, Luma};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{DedupConfig, DedupMetric};
use crate::storage::MonitorId;

/// Side length of the dHash grid (bits = DHASH_SIZE²).
const DHASH_SIZE: u32 = 16;

const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

pub type DHash = [u64; 4];

#[derive(Debug, Clone)]
enum Signature {
    Luma(GrayImage),
    Hash(DHash),
}

/// What the deduplicator keeps per monitor.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    width: u32,
    height: u32,
    signature: Signature,
}

pub struct Deduplicator {
    metric: DedupMetric,
    similarity_threshold: f64,
    dhash_threshold: u32,
    compare_max_side: u32,
    last_accepted: Mutex<HashMap<MonitorId, Fingerprint>>,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            metric: config.metric,
            similarity_threshold: config.similarity_threshold,
            dhash_threshold: config.dhash_threshold,
            compare_max_side: config.compare_max_side.max(1),
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn fingerprint(&self, image: &DynamicImage) -> Fingerprint {
        let (width, height) = image.dimensions();
        let signature = match self.metric {
            DedupMetric::Mssim => {
                let luma = luma_601(image);
                let luma = if width.max(height) > self.compare_max_side {
                    // `resize` keeps aspect ratio inside the bounding box.
                    DynamicImage::ImageLuma8(luma)
                        .resize(self.compare_max_side, self.compare_max_side, FilterType::Triangle)
                        .to_luma8()
                } else {
                    luma
                };
                Signature::Luma(luma)
            }
            DedupMetric::Dhash => Signature::Hash(compute_dhash(image, DHASH_SIZE)),
        };
        Fingerprint {
            width,
            height,
            signature,
        }
    }

    /// Whether two fingerprints describe the "same" screen. Frames of
    /// different dimensions are never similar.
    pub fn is_similar(&self, a: &Fingerprint, b: &Fingerprint) -> bool {
        if a.width != b.width || a.height != b.height {
            return false;
        }
        match (&a.signature, &b.signature) {
            (Signature::Luma(x), Signature::Luma(y)) => mssim(x, y) >= self.similarity_threshold,
            (Signature::Hash(x), Signature::Hash(y)) => {
                hamming_distance(x, y) < self.dhash_threshold
            }
            _ => false,
        }
    }

    /// Accept `image` if no prior frame is remembered for `monitor` or it
    /// differs enough from the remembered one. Accepting replaces the memory.
    pub fn accept(&self, monitor: MonitorId, image: &DynamicImage) -> bool {
        let current = self.fingerprint(image);

        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = last.get(&monitor) {
            if self.is_similar(previous, &current) {
                return false;
            }
        }
        last.insert(monitor, current);
        true
    }

    /// Drop the memory for one monitor so its next frame is accepted.
    pub fn forget(&self, monitor: MonitorId) {
        self.last_accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&monitor);
    }

    pub fn reset(&self) {
        self.last_accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Grayscale with ITU-R BT.601 luma weights.
fn luma_601(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let p = rgb.get_pixel(x, y);
        let v = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Global structural similarity of two equally sized grayscale images
/// (one window spanning the whole frame). Images of different size score 0.
pub fn mssim(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 0.0;
    }
    let n = a.as_raw().len();
    if n == 0 {
        return 1.0;
    }
    let n_f = n as f64;
    let mean_a = a.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n_f;
    let mean_b = b.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n_f;

    let (mut var_a, mut var_b, mut cov) = (0.0f64, 0.0f64, 0.0f64);
    for (&pa, &pb) in a.as_raw().iter().zip(b.as_raw().iter()) {
        let da = pa as f64 - mean_a;
        let db = pb as f64 - mean_b;
        var_a += da * da;
        var_b += db * db;
        cov += da * db;
    }
    var_a /= n_f;
    var_b /= n_f;
    cov /= n_f;

    ((2.0 * mean_a * mean_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mean_a * mean_a + mean_b * mean_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
}

// ==================== dHash ====================

pub fn compute_dhash(img: &DynamicImage, hash_size: u32) -> DHash {
    let gray = img.to_luma8();
    let resized = image::imageops::resize(&gray, hash_size + 1, hash_size, FilterType::Triangle);

    let mut hash = [0u64; 4];
    let mut bit_index = 0usize;

    for row in 0..hash_size {
        for col in 0..hash_size {
            let left = resized.get_pixel(col, row)[0];
            let right = resized.get_pixel(col + 1, row)[0];
            if left > right && bit_index < 256 {
                hash[bit_index / 64] |= 1u64 << (bit_index % 64);
            }
            bit_index += 1;
        }
    }
    hash
}

pub fn hamming_distance(a: &DHash, b: &DHash) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn desktop(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, _| {
            Rgb([20, 60, 120 + (x % 16) as u8])
        }))
    }

    fn with_window(w: u32, h: u32) -> DynamicImage {
        let mut img = desktop(w, h).to_rgb8();
        for y in h / 8..h * 7 / 8 {
            for x in w / 8..w * 7 / 8 {
                let ink = if (x / 6) % 2 == 0 { 0 } else { 255 };
                img.put_pixel(x, y, Rgb([ink, ink, ink]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn dedup(metric: DedupMetric) -> Deduplicator {
        Deduplicator::new(&DedupConfig {
            metric,
            ..DedupConfig::default()
        })
    }

    #[test]
    fn test_identical_frames_rejected_until_change() {
        for metric in [DedupMetric::Mssim, DedupMetric::Dhash] {
            let d = dedup(metric);
            let monitor = MonitorId(1);
            assert!(d.accept(monitor, &desktop(160, 120)));
            assert!(!d.accept(monitor, &desktop(160, 120)));
            assert!(!d.accept(monitor, &desktop(160, 120)));
            assert!(d.accept(monitor, &with_window(160, 120)), "{:?}", metric);
            assert!(!d.accept(monitor, &with_window(160, 120)));
        }
    }

    #[test]
    fn test_small_noise_is_similar() {
        let d = dedup(DedupMetric::Mssim);
        let base = desktop(160, 120);
        let mut noisy = base.to_rgb8();
        noisy.put_pixel(3, 3, Rgb([255, 255, 255]));
        noisy.put_pixel(100, 50, Rgb([0, 0, 0]));

        assert!(d.accept(MonitorId(0), &base));
        assert!(!d.accept(MonitorId(0), &DynamicImage::ImageRgb8(noisy)));
    }

    #[test]
    fn test_monitors_are_independent() {
        let d = dedup(DedupMetric::Mssim);
        assert!(d.accept(MonitorId(1), &desktop(64, 64)));
        assert!(d.accept(MonitorId(2), &desktop(64, 64)));
        assert!(!d.accept(MonitorId(2), &desktop(64, 64)));
    }

    #[test]
    fn test_dimension_change_is_not_similar() {
        let d = dedup(DedupMetric::Mssim);
        assert!(d.accept(MonitorId(1), &desktop(64, 64)));
        assert!(d.accept(MonitorId(1), &desktop(64, 48)));
    }

    #[test]
    fn test_forget_and_reset() {
        let d = dedup(DedupMetric::Dhash);
        let img = desktop(64, 64);
        assert!(d.accept(MonitorId(1), &img));
        assert!(d.accept(MonitorId(2), &img));

        d.forget(MonitorId(1));
        assert!(d.accept(MonitorId(1), &img));
        assert!(!d.accept(MonitorId(2), &img));

        d.reset();
        assert!(d.accept(MonitorId(2), &img));
    }

    #[test]
    fn test_large_frames_are_downscaled_for_comparison() {
        let d = Deduplicator::new(&DedupConfig {
            compare_max_side: 64,
            ..DedupConfig::default()
        });
        let fp = d.fingerprint(&desktop(640, 320));
        match fp.signature {
            Signature::Luma(ref luma) => assert_eq!(luma.dimensions(), (64, 32)),
            Signature::Hash(_) => panic!("expected luma signature"),
        }
        assert_eq!((fp.width, fp.height), (640, 320));
    }

    #[test]
    fn test_mssim_and_hamming_basics() {
        let a = luma_601(&desktop(32, 32));
        assert!((mssim(&a, &a) - 1.0).abs() < 1e-9);
        let b = luma_601(&with_window(32, 32));
        assert!(mssim(&a, &b) < 0.9);

        let h = compute_dhash(&desktop(32, 32), DHASH_SIZE);
        assert_eq!(hamming_distance(&h, &h), 0);
        assert_eq!(hamming_distance(&[0; 4], &[u64::MAX, 0, 0, 1]), 65);
    }
}
