pub mod discriminator;
pub mod spectral_norm;

pub use discriminator::{Discriminator, Features, LayerSpec, ARCHITECTURE, DOWNSAMPLE_FACTOR, NUM_IN_CH};
pub use spectral_norm::{spectral_norm_conv2d, SpectralNormConfig, SpectralNormConv2d};
