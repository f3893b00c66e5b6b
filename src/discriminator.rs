use tch::{nn, TchError, Tensor};

use crate::spectral_norm::{spectral_norm_conv2d, SpectralNormConfig, SpectralNormConv2d};

pub const NUM_IN_CH: i64 = 3;
pub const NUM_FEAT: i64 = 64;
pub const NEGATIVE_SLOPE: f64 = 0.2;
/// Three stride-2 stages: input sides must be multiples of this.
pub const DOWNSAMPLE_FACTOR: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    /// Variable path inside the `VarStore`, matching Real-ESRGAN checkpoints.
    pub name: &'static str,
    pub in_channels: i64,
    pub out_channels: i64,
    pub kernel_size: i64,
    pub stride: i64,
    pub padding: i64,
    pub bias: bool,
    pub spectral_norm: bool,
}

const fn plain(name: &'static str, in_channels: i64, out_channels: i64) -> LayerSpec {
    LayerSpec {
        name,
        in_channels,
        out_channels,
        kernel_size: 3,
        stride: 1,
        padding: 1,
        bias: true,
        spectral_norm: false,
    }
}

const fn down(name: &'static str, in_channels: i64, out_channels: i64) -> LayerSpec {
    LayerSpec {
        name,
        in_channels,
        out_channels,
        kernel_size: 4,
        stride: 2,
        padding: 1,
        bias: false,
        spectral_norm: true,
    }
}

const fn refine(name: &'static str, in_channels: i64, out_channels: i64) -> LayerSpec {
    LayerSpec {
        name,
        in_channels,
        out_channels,
        kernel_size: 3,
        stride: 1,
        padding: 1,
        bias: false,
        spectral_norm: true,
    }
}

/// Layer table in forward order: input, down1..3, up1..3, refine1..2, output.
pub const ARCHITECTURE: [LayerSpec; 10] = [
    plain("conv0", NUM_IN_CH, NUM_FEAT),
    down("conv1", NUM_FEAT, NUM_FEAT * 2),
    down("conv2", NUM_FEAT * 2, NUM_FEAT * 4),
    down("conv3", NUM_FEAT * 4, NUM_FEAT * 8),
    refine("conv4", NUM_FEAT * 8, NUM_FEAT * 4),
    refine("conv5", NUM_FEAT * 4, NUM_FEAT * 2),
    refine("conv6", NUM_FEAT * 2, NUM_FEAT),
    refine("conv7", NUM_FEAT, NUM_FEAT),
    refine("conv8", NUM_FEAT, NUM_FEAT),
    plain("conv9", NUM_FEAT, 1),
];

/// Encoder activations, kept for the skip connections of the decoder.
#[derive(Debug)]
pub struct Features {
    /// full resolution, 64 channels
    pub x0: Tensor,
    /// 1/2 resolution, 128 channels
    pub x1: Tensor,
    /// 1/4 resolution, 256 channels
    pub x2: Tensor,
    /// 1/8 resolution, 512 channels
    pub x3: Tensor,
}

/// U-Net discriminator with spectral normalization.
///
/// Maps a batch of RGB images `(B, 3, H, W)` to per-pixel realism logits
/// `(B, 1, H, W)`. `H` and `W` have to be multiples of [`DOWNSAMPLE_FACTOR`],
/// otherwise the skip additions fail on mismatched shapes.
#[derive(Debug)]
pub struct Discriminator {
    input: nn::Conv2D,
    down1: SpectralNormConv2d,
    down2: SpectralNormConv2d,
    down3: SpectralNormConv2d,
    up1: SpectralNormConv2d,
    up2: SpectralNormConv2d,
    up3: SpectralNormConv2d,
    refine1: SpectralNormConv2d,
    refine2: SpectralNormConv2d,
    output: nn::Conv2D,
    skip_connection: bool,
}

fn conv_config(spec: &LayerSpec) -> nn::ConvConfig {
    nn::ConvConfig {
        stride: spec.stride,
        padding: spec.padding,
        bias: spec.bias,
        ..Default::default()
    }
}

fn plain_conv(path: &nn::Path, spec: &LayerSpec) -> nn::Conv2D {
    nn::conv2d(
        path / spec.name,
        spec.in_channels,
        spec.out_channels,
        spec.kernel_size,
        conv_config(spec),
    )
}

fn normed_conv(path: &nn::Path, spec: &LayerSpec) -> SpectralNormConv2d {
    spectral_norm_conv2d(
        path / spec.name,
        spec.in_channels,
        spec.out_channels,
        spec.kernel_size,
        conv_config(spec),
        SpectralNormConfig::default(),
    )
}

fn f_plain_conv(conv: &nn::Conv2D, spec: &LayerSpec, xs: &Tensor) -> Result<Tensor, TchError> {
    xs.f_conv2d(
        &conv.ws,
        conv.bs.as_ref(),
        [spec.stride, spec.stride],
        [spec.padding, spec.padding],
        [1, 1],
        1,
    )
}

pub fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * NEGATIVE_SLOPE))
}

/// Bilinear x2 upsampling without corner alignment.
fn f_upsample(xs: &Tensor) -> Result<Tensor, TchError> {
    let (_, _, h, w) = xs.size4()?;
    xs.f_upsample_bilinear2d([h * 2, w * 2], false, 2.0, 2.0)
}

impl Discriminator {
    pub fn new(path: nn::Path) -> Discriminator {
        let [input, down1, down2, down3, up1, up2, up3, refine1, refine2, output] = &ARCHITECTURE;
        Discriminator {
            input: plain_conv(&path, input),
            down1: normed_conv(&path, down1),
            down2: normed_conv(&path, down2),
            down3: normed_conv(&path, down3),
            up1: normed_conv(&path, up1),
            up2: normed_conv(&path, up2),
            up3: normed_conv(&path, up3),
            refine1: normed_conv(&path, refine1),
            refine2: normed_conv(&path, refine2),
            output: plain_conv(&path, output),
            skip_connection: true,
        }
    }

    pub fn layer_specs() -> &'static [LayerSpec] {
        &ARCHITECTURE
    }

    pub fn skip_connection(&self) -> bool {
        self.skip_connection
    }

    /// Toggles the additive skip connections; weights are left untouched.
    pub fn set_skip_connection(&mut self, skip_connection: bool) {
        self.skip_connection = skip_connection;
    }

    pub fn f_encode_t(&self, xs: &Tensor, train: bool) -> Result<Features, TchError> {
        let x0 = leaky_relu(&f_plain_conv(&self.input, &ARCHITECTURE[0], xs)?);
        let x1 = leaky_relu(&self.down1.f_forward_t(&x0, train)?);
        let x2 = leaky_relu(&self.down2.f_forward_t(&x1, train)?);
        let x3 = leaky_relu(&self.down3.f_forward_t(&x2, train)?);
        Ok(Features { x0, x1, x2, x3 })
    }

    pub fn f_decode_t(&self, features: &Features, train: bool) -> Result<Tensor, TchError> {
        let Features { x0, x1, x2, x3 } = features;

        let x4 = leaky_relu(&self.up1.f_forward_t(&f_upsample(x3)?, train)?);
        let x4 = if self.skip_connection { x4.f_add(x2)? } else { x4 };

        let x5 = leaky_relu(&self.up2.f_forward_t(&f_upsample(&x4)?, train)?);
        let x5 = if self.skip_connection { x5.f_add(x1)? } else { x5 };

        let x6 = leaky_relu(&self.up3.f_forward_t(&f_upsample(&x5)?, train)?);
        let x6 = if self.skip_connection { x6.f_add(x0)? } else { x6 };

        let out = leaky_relu(&self.refine1.f_forward_t(&x6, train)?);
        let out = leaky_relu(&self.refine2.f_forward_t(&out, train)?);
        f_plain_conv(&self.output, &ARCHITECTURE[9], &out)
    }

    pub fn f_forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, TchError> {
        let features = self.f_encode_t(xs, train)?;
        self.f_decode_t(&features, train)
    }
}

impl nn::ModuleT for Discriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self.f_forward_t(xs, train) {
            Ok(scores) => scores,
            Err(err) => panic!("discriminator forward failed: {err}"),
        }
    }
}
