// Gaussian Splats data structure and GPU packing

use bevy::prelude::*;
use glam::{Vec3, Vec4};
use half::f16;

#[cfg(feature = "native")]
use rayon::prelude::*;

/// SH coefficients stored per splat on the GPU (degree 3).
pub const SH_COEFFS_PER_SPLAT: usize = 16;
/// `u32` words per splat in the SH buffer, two f16 values per word.
pub const SH_WORDS_PER_SPLAT: usize = SH_COEFFS_PER_SPLAT * 3 / 2;

const MAX_SCALE: f32 = 100.0;

/// A Gaussian Splat representation
/// This is a Bevy component that can be attached to entities
#[derive(Component, Debug, Clone, Default, Reflect)]
#[reflect(Component)]
pub struct GaussianSplats {
    /// Positions of splats (N x 3)
    pub means: Vec<Vec3>,
    /// Rotation quaternions as [w, x, y, z] (N x 4)
    pub rotations: Vec<Vec4>,
    /// Log-space scales (N x 3)
    pub log_scales: Vec<Vec3>,
    /// Spherical harmonic coefficients (N x C x 3), C = number of SH coefficients
    pub sh_coeffs: Vec<Vec<Vec3>>,
    /// Raw opacity values (before sigmoid) (N)
    pub raw_opacities: Vec<f32>,
}

/// One primitive as laid out in the preprocess kernel's storage buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuGaussian {
    /// xyz position, w = opacity after sigmoid
    pub position_opacity: Vec4,
    /// Normalized quaternion, x y z w
    pub rotation: Vec4,
    /// Linear scale, w unused
    pub scale: Vec4,
}

/// Screen-space splat written by the preprocess kernel, indexed by primitive.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuSplat2d {
    /// Major axis xy, minor axis zw, in NDC units
    pub axes: Vec4,
    /// NDC centre xy, view depth z
    pub center_depth: Vec4,
    /// Linear RGB and opacity
    pub color: Vec4,
}

impl GaussianSplats {
    /// Create new Gaussian Splats from raw data
    pub fn new(
        means: Vec<Vec3>,
        rotations: Vec<Vec4>,
        log_scales: Vec<Vec3>,
        sh_coeffs: Vec<Vec<Vec3>>,
        raw_opacities: Vec<f32>,
    ) -> Self {
        assert_eq!(means.len(), rotations.len(), "Means and rotations must have same length");
        assert_eq!(means.len(), log_scales.len(), "Means and log_scales must have same length");
        assert_eq!(means.len(), sh_coeffs.len(), "Means and sh_coeffs must have same length");
        assert_eq!(means.len(), raw_opacities.len(), "Means and raw_opacities must have same length");

        Self {
            means,
            rotations,
            log_scales,
            sh_coeffs,
            raw_opacities,
        }
    }

    /// Number of splats
    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Get SH degree from coefficients count
    pub fn sh_degree(&self) -> u32 {
        match self.sh_coeffs.first() {
            Some(coeffs) => sh_degree_from_coeffs(coeffs.len() as u32),
            None => 0,
        }
    }

    /// Compute axis-aligned bounding box of the scene
    pub fn bounding_box(&self) -> (Vec3, Vec3) {
        let Some(&first) = self.means.first() else {
            return (Vec3::ZERO, Vec3::ZERO);
        };

        self.means
            .iter()
            .fold((first, first), |(min, max), &pos| (min.min(pos), max.max(pos)))
    }

    /// Get center of the scene
    pub fn center(&self) -> Vec3 {
        let (min, max) = self.bounding_box();
        (min + max) * 0.5
    }

    /// Get size (extent) of the scene
    pub fn size(&self) -> Vec3 {
        let (min, max) = self.bounding_box();
        max - min
    }

    /// Get suggested camera distance based on scene size
    pub fn suggested_camera_distance(&self) -> f32 {
        let size = self.size();
        size.x.max(size.y).max(size.z) * 2.5
    }

    /// Primitive `index` in GPU layout.
    pub fn gpu_gaussian(&self, index: usize) -> GpuGaussian {
        let mean = self.means[index];
        let [w, x, y, z] = self.rotations[index].to_array();
        let rotation = Vec4::new(x, y, z, w);
        let rotation = if rotation.length_squared() > 0.0 {
            rotation.normalize()
        } else {
            Vec4::W
        };
        let scale = self.log_scales[index].exp().min(Vec3::splat(MAX_SCALE));

        GpuGaussian {
            position_opacity: mean.extend(sigmoid(self.raw_opacities[index])),
            rotation,
            scale: scale.extend(0.0),
        }
    }

    /// All primitives in GPU layout, in index order.
    pub fn pack_gaussians(&self) -> Vec<GpuGaussian> {
        #[cfg(feature = "native")]
        let indices = (0..self.len()).into_par_iter();
        #[cfg(not(feature = "native"))]
        let indices = 0..self.len();

        indices.map(|i| self.gpu_gaussian(i)).collect()
    }

    /// SH coefficients as f16 pairs, `SH_WORDS_PER_SPLAT` words per splat.
    /// Missing higher-degree coefficients are zero.
    pub fn pack_sh_coefficients(&self) -> Vec<u32> {
        let mut packed = vec![0u32; self.len() * SH_WORDS_PER_SPLAT];

        #[cfg(feature = "native")]
        packed
            .par_chunks_mut(SH_WORDS_PER_SPLAT)
            .zip(self.sh_coeffs.par_iter())
            .for_each(|(words, coeffs)| pack_sh_words(coeffs, words));
        #[cfg(not(feature = "native"))]
        packed
            .chunks_mut(SH_WORDS_PER_SPLAT)
            .zip(self.sh_coeffs.iter())
            .for_each(|(words, coeffs)| pack_sh_words(coeffs, words));

        packed
    }
}

fn pack_sh_words(coeffs: &[Vec3], words: &mut [u32]) {
    let mut halves = [0u16; SH_COEFFS_PER_SPLAT * 3];
    for (k, coeff) in coeffs.iter().take(SH_COEFFS_PER_SPLAT).enumerate() {
        for (channel, value) in coeff.to_array().into_iter().enumerate() {
            halves[k * 3 + channel] = f16::from_f32(value).to_bits();
        }
    }
    for (word, pair) in words.iter_mut().zip(halves.chunks_exact(2)) {
        *word = u32::from(pair[0]) | (u32::from(pair[1]) << 16);
    }
}

/// Calculate SH degree from number of coefficients
pub fn sh_degree_from_coeffs(num_coeffs: u32) -> u32 {
    // SH degree d has (d+1)^2 coefficients
    ((num_coeffs as f32).sqrt() as u32).saturating_sub(1)
}

/// Calculate number of SH coefficients for a given degree
pub fn sh_coeffs_for_degree(degree: u32) -> u32 {
    (degree + 1) * (degree + 1)
}

/// Inverse sigmoid function
pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

/// Sigmoid function
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Create example/test Gaussian Splats
pub fn create_test_splats(count: usize) -> GaussianSplats {
    let mut means = Vec::with_capacity(count);
    let mut rotations = Vec::with_capacity(count);
    let mut log_scales = Vec::with_capacity(count);
    let mut sh_coeffs = Vec::with_capacity(count);
    let mut raw_opacities = Vec::with_capacity(count);

    // Dense 3D grid of splats
    let mut grid_size = 1;
    while grid_size * grid_size * grid_size < count {
        grid_size += 1;
    }
    let spacing = 0.1;
    let extent = grid_size as f32 * spacing;
    let offset = -extent / 2.0;

    for i in 0..count {
        let x = (i % grid_size) as f32 * spacing + offset;
        let y = ((i / grid_size) % grid_size) as f32 * spacing + offset;
        let z = (i / (grid_size * grid_size)) as f32 * spacing + offset;

        means.push(Vec3::new(x, y, z));

        // Random-ish rotation based on position
        let angle = (x + y + z) * 0.5;
        let axis = Vec3::new(x, y, z).normalize_or_zero();
        let s = (angle * 0.5).sin();
        let c = (angle * 0.5).cos();
        rotations.push(Vec4::new(c, axis.x * s, axis.y * s, axis.z * s));

        // e^(-4.0) ~ 0.018
        log_scales.push(Vec3::splat(-4.0));

        let color = Vec3::new(x - offset, y - offset, z - offset) / extent;
        sh_coeffs.push(vec![color * 0.5]);

        raw_opacities.push(inverse_sigmoid(0.9));
    }

    GaussianSplats::new(means, rotations, log_scales, sh_coeffs, raw_opacities)
}
