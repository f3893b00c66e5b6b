use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::{thread_rng, Rng};
use tch::{kind, nn, Device, Kind, Tensor};
use tqdm::tqdm;
use tracing::{debug, info};

use unet_disc_rs::{Discriminator, DOWNSAMPLE_FACTOR, NUM_IN_CH};

#[derive(Parser, Debug)]
#[command(version, about = "U-Net discriminator scoring via Rust.", long_about = None)]
struct Args {
    /// Image to score, a random batch is used when absent
    #[arg(short, long)]
    image: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    batch_size: i64,
    #[arg(long, default_value_t = 64)]
    height: i64,
    #[arg(long, default_value_t = 64)]
    width: i64,
    /// Crop at a random offset instead of the centre
    #[arg(long, default_value_t = false)]
    crop: bool,
    #[arg(short, long, default_value_t = String::from("d_weights.pth"))]
    weights: String,
    /// Training-mode passes to settle the spectral norm estimates
    #[arg(long, default_value_t = 0)]
    warmup: usize,
    #[arg(long, default_value_t = false)]
    no_skip: bool,
    #[arg(short, long, default_value_t = String::from("score_map.png"))]
    output: String,
    /// Write the weights back after scoring
    #[arg(short, long, default_value_t = false)]
    save: bool,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    print_oss_license();

    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };
    info!("Use Device: {device:?}");

    // Build Discriminator
    let mut vs = nn::VarStore::new(device);
    let mut discriminator = Discriminator::new(vs.root());
    discriminator.set_skip_connection(!args.no_skip);

    // Load network's weights
    if Path::new(&args.weights).is_file() {
        vs.load(&args.weights).with_context(|| format!("loading {}", args.weights))?;
        info!("Loaded: {}", args.weights);
    }

    let xs = match &args.image {
        Some(path) => load_image(path, args.crop)?.unsqueeze(0).to_device(device),
        None => Tensor::rand([args.batch_size, NUM_IN_CH, args.height, args.width], kind::FLOAT_CPU)
            .to_device(device),
    };
    check_input(&xs)?;
    info!("Input: {:?}", xs.size());
    info!("Skip Connection: {}", discriminator.skip_connection());

    if args.warmup > 0 {
        info!("Warm up power iteration...");
        tch::no_grad(|| {
            for _ in tqdm(0..args.warmup) {
                let _ = xs.apply_t(&discriminator, true);
            }
        });
    }

    let scores = tch::no_grad(|| discriminator.f_forward_t(&xs, false))?;
    info!(
        "Scores: mean({:.4}) min({:.4}) max({:.4})",
        scores.mean(Kind::Float).double_value(&[]),
        scores.min().double_value(&[]),
        scores.max().double_value(&[]),
    );

    let map = (scores.get(0).sigmoid() * 255.0).repeat([3, 1, 1]).to_device(Device::Cpu);
    tch::vision::image::save(&map, &args.output)?;
    info!("Saved: {}", args.output);

    if args.save {
        vs.save(&args.weights)?;
        info!("Saved: {}", args.weights);
    }

    Ok(())
}

/// Loads an RGB image as a float `(3, H, W)` tensor in `[0, 1]`, cropped so
/// both sides are multiples of the downsample factor.
fn load_image(path: &Path, random: bool) -> Result<Tensor> {
    let image = tch::vision::image::load(path).with_context(|| format!("loading {}", path.display()))?;
    let (_, h, w) = image.size3()?;
    let mut rng = thread_rng();
    let (top, crop_h) = crop_window(h, random, &mut rng)?;
    let (left, crop_w) = crop_window(w, random, &mut rng)?;
    debug!("crop {h}x{w} -> {crop_h}x{crop_w} at ({top}, {left})");
    Ok(image.narrow(1, top, crop_h).narrow(2, left, crop_w).to_kind(Kind::Float) / 255.0)
}

/// Largest window along one side whose length is a multiple of the
/// downsample factor, returned as `(offset, length)`.
fn crop_window<R: Rng>(len: i64, random: bool, rng: &mut R) -> Result<(i64, i64)> {
    let size = len / DOWNSAMPLE_FACTOR * DOWNSAMPLE_FACTOR;
    ensure!(size > 0, "image side {len} is smaller than {DOWNSAMPLE_FACTOR}");
    let slack = len - size;
    let offset = if random { rng.gen_range(0..=slack) } else { slack / 2 };
    Ok((offset, size))
}

fn check_input(xs: &Tensor) -> Result<()> {
    let (_, c, h, w) = xs.size4().context("expected a (batch, channel, height, width) tensor")?;
    ensure!(c == NUM_IN_CH, "expected {NUM_IN_CH} channels, got {c}");
    ensure!(
        h >= DOWNSAMPLE_FACTOR && w >= DOWNSAMPLE_FACTOR && h % DOWNSAMPLE_FACTOR == 0 && w % DOWNSAMPLE_FACTOR == 0,
        "height and width must be positive multiples of {DOWNSAMPLE_FACTOR}, got {h}x{w}"
    );
    Ok(())
}

fn print_oss_license() {
    println!("OSS Library: PyTorch");
    println!("URL: https://github.com/pytorch/pytorch");
    println!("License: 3-Clause BSD License");
    println!();
    println!("OSS Library: tch-rs");
    println!("URL: https://github.com/LaurentMazare/tch-rs");
    println!("License: MIT License");
    println!();
    println!("OSS Library: anyhow");
    println!("URL: https://github.com/dtolnay/anyhow");
    println!("License: Apache License Version 2.0");
    println!();
    println!("OSS Library: rand");
    println!("URL: https://github.com/rust-random/rand");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: tqdm");
    println!("URL: https://github.com/mrlazy1708/tqdm");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: clap");
    println!("URL: https://github.com/clap-rs/clap");
    println!("License: MIT OR Apache-2.0");
    println!();
    println!("OSS Library: tracing");
    println!("URL: https://github.com/tokio-rs/tracing");
    println!("License: MIT License");
    println!("--------");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn centre_crop_to_multiple_of_eight() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(crop_window(64, false, &mut rng).unwrap(), (0, 64));
        assert_eq!(crop_window(30, false, &mut rng).unwrap(), (3, 24));
        assert_eq!(crop_window(13, false, &mut rng).unwrap(), (2, 8));
    }

    #[test]
    fn random_crop_stays_inside() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let (offset, size) = crop_window(30, true, &mut rng).unwrap();
            assert_eq!(size, 24);
            assert!((0..=6).contains(&offset));
        }
    }

    #[test]
    fn too_small_side_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(crop_window(7, false, &mut rng).is_err());
    }

    #[test]
    fn input_validation() {
        let ok = Tensor::zeros([2, 3, 16, 24], kind::FLOAT_CPU);
        assert!(check_input(&ok).is_ok());

        for shape in [[1, 1, 16, 16], [1, 3, 30, 32], [1, 3, 0, 8]] {
            assert!(check_input(&Tensor::zeros(shape, kind::FLOAT_CPU)).is_err(), "{shape:?}");
        }
        assert!(check_input(&Tensor::zeros([3, 16, 16], kind::FLOAT_CPU)).is_err());
    }
}
