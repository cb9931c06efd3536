#![deny(clippy::all, clippy::pedantic)]

//! `adder`: adds two random vectors on the selected device and exits
//! non-zero if any element of the result is wrong.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use compute::{CpuDevice, ElementType};
use runtime::{Options, Report};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Cpu,
    Gpu,
}

#[derive(Debug, Parser)]
#[command(
    name = "adder",
    version,
    about = "Runs the element-wise add kernel and verifies the result"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Backend::Cpu)]
    backend: Backend,
    /// Adapter index for the gpu backend; defaults to the high-performance one.
    #[arg(long)]
    adapter: Option<usize>,
    #[arg(long, default_value_t = compute::dispatcher::DEFAULT_ELEMENT_COUNT)]
    count: usize,
    #[arg(long, default_value = "f32")]
    element: ElementType,
    #[arg(long, default_value_t = 1)]
    iterations: u32,
    /// Bounded wait per dispatch, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    max_group_size: Option<u32>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Args {
    fn options(&self) -> Options {
        Options {
            count: self.count,
            element: self.element,
            iterations: self.iterations,
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_group_size: self.max_group_size,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let options = args.options();

    let report = match args.backend {
        Backend::Cpu => runtime::run_on(Arc::new(CpuDevice::new()), &options)?,
        Backend::Gpu => run_gpu(args.adapter, &options)?,
    };

    tracing::info!(
        device = %report.device,
        elements = report.elements,
        iterations = report.iterations,
        group_size = ?report.group_size,
        elapsed = ?report.elapsed,
        "all dispatches verified"
    );
    Ok(())
}

#[cfg(feature = "gpu")]
fn run_gpu(adapter: Option<usize>, options: &Options) -> Result<Report> {
    use anyhow::Context;
    use compute::WgpuDevice;

    let device = match adapter {
        Some(index) => WgpuDevice::with_adapter(index),
        None => WgpuDevice::try_new(),
    }
    .with_context(|| {
        format!(
            "opening gpu adapter (available: {:?})",
            WgpuDevice::adapter_names()
        )
    })?;
    runtime::run_on(Arc::new(device), options)
}

#[cfg(not(feature = "gpu"))]
#[allow(clippy::unnecessary_wraps, clippy::needless_pass_by_value)]
fn run_gpu(_adapter: Option<usize>, _options: &Options) -> Result<Report> {
    anyhow::bail!("`adder` was built without the `gpu` feature")
}
