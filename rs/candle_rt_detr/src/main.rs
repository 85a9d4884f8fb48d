//! RT-DETR training core tools
//!
//! This binary inspects configurations, decodes saved head outputs into
//! detections and scores saved decoder outputs against annotations.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_config;
mod cmd_loss;
mod cmd_postprocess;

use std::path::PathBuf;

use candle_core::Device;
use candle_rt_detr::RtDetrConfig;
use clap::{Parser, Subcommand, ValueEnum};

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// RT-DETR model variants
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Which {
    R18,
    R34,
    R50,
    R101,
}

impl Which {
    pub fn config(&self) -> RtDetrConfig {
        match self {
            Which::R18 => RtDetrConfig::r18vd(),
            Which::R34 => RtDetrConfig::r34vd(),
            Which::R50 => RtDetrConfig::r50vd(),
            Which::R101 => RtDetrConfig::r101vd(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// YAML configuration file; overrides --which.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which preset to use when no configuration file is given.
    #[arg(long, value_enum, default_value_t = Which::R50, global = true)]
    which: Which,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration and print a summary.
    Config(cmd_config::ConfigArgs),
    /// Decode saved logits/boxes (.npy) into detections.
    Postprocess(cmd_postprocess::PostprocessArgs),
    /// Score saved decoder outputs (.safetensors) against JSON annotations.
    Loss(cmd_loss::LossArgs),
}

impl Args {
    fn load_config(&self) -> anyhow::Result<RtDetrConfig> {
        match &self.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Configuration file not found at {:?}", path);
                }
                println!("Loading configuration from: {:?}", path);
                Ok(RtDetrConfig::from_yaml_file(path)?)
            }
            None => {
                println!("Using preset: {:?}", self.which);
                Ok(self.which.config())
            }
        }
    }
}

pub fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.load_config()?;

    match &args.command {
        Command::Config(cmd) => cmd_config::run(cmd, &config),
        Command::Postprocess(cmd) => {
            let device = device(args.cpu)?;
            println!("Using device: {:?}", device);
            cmd_postprocess::run(cmd, &config, &device)
        }
        Command::Loss(cmd) => {
            let device = device(args.cpu)?;
            println!("Using device: {:?}", device);
            cmd_loss::run(cmd, &config, &device)
        }
    }
}
