#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::cast_precision_loss, clippy::missing_errors_doc)]

//! Drives a [`Dispatcher`] with random inputs and checks every output
//! element against the host's own arithmetic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use compute::{ComputeDevice, DispatchConfig, Dispatcher, Element, ElementType};

#[derive(Debug, Clone)]
pub struct Options {
    pub count: usize,
    pub element: ElementType,
    pub iterations: u32,
    pub timeout: Option<Duration>,
    pub max_group_size: Option<u32>,
    pub seed: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            count: compute::dispatcher::DEFAULT_ELEMENT_COUNT,
            element: ElementType::F32,
            iterations: 1,
            timeout: None,
            max_group_size: None,
            seed: 0,
        }
    }
}

impl Options {
    #[must_use]
    pub fn config(&self) -> DispatchConfig {
        DispatchConfig {
            element_count: self.count,
            element_type: self.element,
            timeout: self.timeout,
            max_group_size: self.max_group_size,
            ..DispatchConfig::default()
        }
    }
}

/// Element types the harness can fill with random data.
pub trait Sample: Element {
    fn sample(rng: &fastrand::Rng) -> Self;
}

impl Sample for f32 {
    // Small integers keep float sums exact on every backend.
    fn sample(rng: &fastrand::Rng) -> Self {
        rng.i32(-1_000_000..1_000_000) as f32
    }
}

impl Sample for i32 {
    fn sample(rng: &fastrand::Rng) -> Self {
        rng.i32(..)
    }
}

impl Sample for u32 {
    fn sample(rng: &fastrand::Rng) -> Self {
        rng.u32(..)
    }
}

#[must_use]
pub fn prepare_data<T: Sample>(count: usize, rng: &fastrand::Rng) -> Vec<T> {
    (0..count).map(|_| T::sample(rng)).collect()
}

/// Fails on the first element where `result[i] != a[i] + b[i]`.
pub fn verify<T: Element>(a: &[T], b: &[T], result: &[T]) -> Result<()> {
    if result.len() != a.len() || b.len() != a.len() {
        bail!(
            "length mismatch: inputs {} and {}, result {}",
            a.len(),
            b.len(),
            result.len()
        );
    }
    for (index, ((&x, &y), &got)) in a.iter().zip(b).zip(result).enumerate() {
        let expected = x.add(y);
        if got != expected {
            bail!("mismatch at index {index}: {x:?} + {y:?} gave {got:?}, expected {expected:?}");
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Report {
    pub device: String,
    pub elements: usize,
    pub iterations: u32,
    pub group_size: Option<u32>,
    pub elapsed: Duration,
}

/// Sets up a dispatcher on `device`, then runs and verifies
/// `options.iterations` dispatches with fresh inputs each time.
pub fn run_on<D: ComputeDevice>(device: Arc<D>, options: &Options) -> Result<Report> {
    match options.element {
        ElementType::F32 => run_typed::<D, f32>(device, options),
        ElementType::I32 => run_typed::<D, i32>(device, options),
        ElementType::U32 => run_typed::<D, u32>(device, options),
    }
}

fn run_typed<D: ComputeDevice, T: Sample>(device: Arc<D>, options: &Options) -> Result<Report> {
    let name = device.info().name.clone();
    let mut dispatcher = Dispatcher::with_config(device, options.config())
        .with_context(|| format!("setting up `{}` on {name}", options.config().kernel))?;
    let rng = fastrand::Rng::with_seed(options.seed);

    let started = Instant::now();
    for iteration in 0..options.iterations {
        let a = prepare_data::<T>(options.count, &rng);
        let b = prepare_data::<T>(options.count, &rng);
        let result = dispatcher
            .run(&a, &b)
            .with_context(|| format!("dispatch {iteration} on {name}"))?;
        verify(&a, &b, &result).with_context(|| format!("dispatch {iteration} on {name}"))?;
        tracing::info!(iteration, elements = options.count, "dispatch verified");
    }

    Ok(Report {
        device: name,
        elements: options.count,
        iterations: options.iterations,
        group_size: dispatcher.group_size(),
        elapsed: started.elapsed(),
    })
}
