//! Spectrally normalized 2-D convolution.
//!
//! The raw kernel is stored as `weight_orig`. On every forward pass it is
//! divided by an estimate of its largest singular value, obtained by power
//! iteration on the kernel reshaped to `(out, in * k * k)`. The estimate
//! vectors `weight_u` and `weight_v` live in the `VarStore` next to the
//! kernel (not trainable) so they are saved and restored with checkpoints.
use tch::{nn, Kind, TchError, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct SpectralNormConfig {
    pub n_power_iterations: usize,
    pub eps: f64,
}

impl Default for SpectralNormConfig {
    fn default() -> Self {
        SpectralNormConfig { n_power_iterations: 1, eps: 1e-12 }
    }
}

#[derive(Debug)]
pub struct SpectralNormConv2d {
    weight_orig: Tensor,
    weight_u: Tensor,
    weight_v: Tensor,
    bias: Option<Tensor>,
    stride: i64,
    padding: i64,
    dilation: i64,
    groups: i64,
    config: SpectralNormConfig,
}

/// Creates a spectrally normalized convolution under `path`.
///
/// Geometry and initialisation come from `conv_config` exactly as for
/// `nn::conv2d`; `padding_mode` other than zeros is not supported.
pub fn spectral_norm_conv2d<'a, T: std::borrow::Borrow<nn::Path<'a>>>(
    path: T,
    in_dim: i64,
    out_dim: i64,
    ksize: i64,
    conv_config: nn::ConvConfig,
    config: SpectralNormConfig,
) -> SpectralNormConv2d {
    let path = path.borrow();
    let fan_in = in_dim / conv_config.groups * ksize * ksize;

    let weight_orig = path.var(
        "weight_orig",
        &[out_dim, in_dim / conv_config.groups, ksize, ksize],
        conv_config.ws_init,
    );
    let bias = if conv_config.bias {
        let bound = 1.0 / (fan_in as f64).sqrt();
        Some(path.var("bias", &[out_dim], nn::Init::Uniform { lo: -bound, up: bound }))
    } else {
        None
    };

    let mut weight_u = path.zeros_no_train("weight_u", &[out_dim]);
    let mut weight_v = path.zeros_no_train("weight_v", &[fan_in]);
    tch::no_grad(|| {
        let opts = (Kind::Float, path.device());
        weight_u.copy_(&normalize(&Tensor::randn([out_dim], opts), config.eps));
        weight_v.copy_(&normalize(&Tensor::randn([fan_in], opts), config.eps));
    });

    SpectralNormConv2d {
        weight_orig,
        weight_u,
        weight_v,
        bias,
        stride: conv_config.stride,
        padding: conv_config.padding,
        dilation: conv_config.dilation,
        groups: conv_config.groups,
        config,
    }
}

fn normalize(xs: &Tensor, eps: f64) -> Tensor {
    xs / xs.norm().clamp_min(eps)
}

impl SpectralNormConv2d {
    fn weight_matrix(&self) -> Tensor {
        let out_dim = self.weight_orig.size()[0];
        self.weight_orig.reshape([out_dim, -1])
    }

    /// Runs the configured number of power iterations and stores the new
    /// estimates in place.
    pub fn update_estimates(&self) {
        tch::no_grad(|| {
            let w = self.weight_matrix();
            let mut u = self.weight_u.shallow_clone();
            let mut v = self.weight_v.shallow_clone();
            for _ in 0..self.config.n_power_iterations {
                v.copy_(&normalize(&w.transpose(0, 1).mv(&u), self.config.eps));
                u.copy_(&normalize(&w.mv(&v), self.config.eps));
            }
        })
    }

    /// Current estimate of the largest singular value of the raw kernel.
    pub fn sigma(&self) -> Tensor {
        tch::no_grad(|| self.weight_u.dot(&self.weight_matrix().mv(&self.weight_v)))
    }

    /// The kernel actually used by the convolution, `weight_orig / sigma`.
    pub fn normalized_weight(&self) -> Tensor {
        let w = self.weight_matrix();
        // u and v enter the graph as copies, the next training pass overwrites
        // the buffers in place
        let sigma = self.weight_u.copy().dot(&w.mv(&self.weight_v.copy()));
        &self.weight_orig / sigma
    }

    pub fn weight_orig(&self) -> &Tensor {
        &self.weight_orig
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn f_forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, TchError> {
        if train {
            self.update_estimates();
        }
        let weight = self.normalized_weight();
        xs.f_conv2d(
            &weight,
            self.bias.as_ref(),
            [self.stride, self.stride],
            [self.padding, self.padding],
            [self.dilation, self.dilation],
            self.groups,
        )
    }
}

impl nn::ModuleT for SpectralNormConv2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self.f_forward_t(xs, train) {
            Ok(ys) => ys,
            Err(err) => panic!("spectral norm conv2d: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tch::{nn::ModuleT, Device};

    fn layer(vs: &nn::VarStore, in_dim: i64, out_dim: i64, ksize: i64, stride: i64) -> SpectralNormConv2d {
        spectral_norm_conv2d(
            &vs.root() / "conv",
            in_dim,
            out_dim,
            ksize,
            nn::ConvConfig { stride, padding: 1, bias: false, ..Default::default() },
            SpectralNormConfig::default(),
        )
    }

    fn largest_singular_value(w: &Tensor) -> f64 {
        let out_dim = w.size()[0];
        let (_, s, _) = w.reshape([out_dim, -1]).svd(true, false);
        s.max().double_value(&[])
    }

    #[test]
    fn registers_kernel_and_estimates() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let _conv = layer(&vs, 64, 128, 4, 2);

        let vars = vs.variables();
        assert_eq!(vars.len(), 3);
        assert_eq!(vars["conv.weight_orig"].size(), vec![128, 64, 4, 4]);
        assert_eq!(vars["conv.weight_u"].size(), vec![128]);
        assert_eq!(vars["conv.weight_v"].size(), vec![64 * 4 * 4]);
        assert!(!vars.contains_key("conv.bias"));
        // only the kernel is trainable
        assert_eq!(vs.trainable_variables().len(), 1);
    }

    #[test]
    fn bias_is_registered_when_requested() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = spectral_norm_conv2d(
            &vs.root() / "conv",
            3,
            8,
            3,
            nn::ConvConfig { padding: 1, ..Default::default() },
            SpectralNormConfig::default(),
        );
        assert_eq!(conv.bias().map(Tensor::size), Some(vec![8]));
        assert_eq!(vs.trainable_variables().len(), 2);
    }

    #[test]
    fn estimates_start_as_unit_vectors() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 16, 32, 3, 1);
        assert_relative_eq!(conv.weight_u.norm().double_value(&[]), 1.0, epsilon = 1e-5);
        assert_relative_eq!(conv.weight_v.norm().double_value(&[]), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn strided_output_shape() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 4, 2);
        let xs = Tensor::rand([2, 4, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(conv.forward_t(&xs, false).size(), vec![2, 8, 8, 8]);
    }

    #[test]
    fn eval_pass_keeps_estimates() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 3, 1);
        let u = conv.weight_u.copy();
        let v = conv.weight_v.copy();

        let xs = Tensor::rand([1, 4, 8, 8], (Kind::Float, Device::Cpu));
        let _ = conv.forward_t(&xs, false);

        assert!(conv.weight_u.equal(&u));
        assert!(conv.weight_v.equal(&v));
    }

    #[test]
    fn training_pass_updates_estimates() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 3, 1);
        let u = conv.weight_u.copy();

        let xs = Tensor::rand([1, 4, 8, 8], (Kind::Float, Device::Cpu));
        let _ = conv.forward_t(&xs, true);

        assert!(!conv.weight_u.equal(&u));
        assert_relative_eq!(conv.weight_u.norm().double_value(&[]), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn power_iteration_finds_largest_singular_value() {
        tch::manual_seed(42);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 3, 1);
        for _ in 0..200 {
            conv.update_estimates();
        }

        let expected = largest_singular_value(conv.weight_orig());
        assert_relative_eq!(conv.sigma().double_value(&[]), expected, max_relative = 1e-3);

        let normalized = tch::no_grad(|| conv.normalized_weight());
        assert_relative_eq!(largest_singular_value(&normalized), 1.0, max_relative = 1e-3);
    }

    #[test]
    fn gradient_reaches_raw_kernel() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 3, 1);
        let xs = Tensor::rand([1, 4, 8, 8], (Kind::Float, Device::Cpu));

        // two training passes before backward, as when scoring real and fake batches
        let real = conv.forward_t(&xs, true);
        let fake = conv.forward_t(&xs, true);
        (real.sum(Kind::Float) - fake.sum(Kind::Float)).backward();

        assert!(conv.weight_orig().grad().defined());
    }

    #[test]
    fn wrong_input_channels_is_an_error() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = layer(&vs, 4, 8, 3, 1);
        let xs = Tensor::rand([1, 3, 8, 8], (Kind::Float, Device::Cpu));
        assert!(conv.f_forward_t(&xs, false).is_err());
    }
}
