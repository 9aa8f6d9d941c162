// Depth-sorted 3D Gaussian Splatting for Bevy
// Preprocess, radix sort and indirect draw all stay on the GPU; splat counts never come back to the CPU.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod gaussian_point_cloud;
pub mod gaussian_splats;
pub mod preprocess;
pub mod radix_sort;
pub mod render_settings;

pub use error::{ConfigurationError, SplatRenderError, SplatResult};
pub use gaussian_point_cloud::{DeviceLossMonitor, GaussianSplatSortPlugin, SplatCloudRejected};
pub use gaussian_splats::{create_test_splats, inverse_sigmoid, sigmoid, GaussianSplats, GpuGaussian, GpuSplat2d};
pub use render_settings::{CameraUniform, RenderSettingsUniform, SortDirection, SplatRenderConfig};

// Embed shaders into the binary
use bevy::asset::embedded_asset;

pub struct EmbeddedShadersPlugin;

impl bevy::app::Plugin for EmbeddedShadersPlugin {
    fn build(&self, app: &mut bevy::app::App) {
        embedded_asset!(app, "../assets/shaders/preprocess.wgsl");
        embedded_asset!(app, "../assets/shaders/radix_sort.wgsl");
        embedded_asset!(app, "../assets/shaders/gaussian_splat.wgsl");
    }
}
