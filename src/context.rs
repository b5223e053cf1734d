//! Explicit compute context: device plus the seeded randomness source.
//!
//! Every component receives the context at construction or call time; nothing
//! reads a process-wide device or RNG.

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Device and RNG shared by one training or inference run.
pub struct ComputeContext<B: Backend> {
    pub device: B::Device,
    rng: ChaCha8Rng,
}

impl<B: Backend> ComputeContext<B> {
    /// Build a context and seed both the backend (parameter init) and the
    /// host RNG (noise, shuffling) from `seed`.
    pub fn new(device: B::Device, seed: u64) -> Self {
        B::seed(&device, seed);
        Self {
            device,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Standard-normal noise tensor of the given shape.
    pub fn standard_normal<const D: usize>(&mut self, shape: [usize; D]) -> Tensor<B, D> {
        let n = shape.iter().product();
        let data: Vec<f32> = (0..n)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Tensor::from_data(TensorData::new(data, shape), &self.device)
    }

    /// Shuffle a slice in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Child context on a backend sharing this device (e.g. the inner
    /// backend of an autodiff one), seeded from this context's RNG.
    pub fn fork<C: Backend<Device = B::Device>>(&mut self) -> ComputeContext<C> {
        ComputeContext {
            device: self.device.clone(),
            rng: ChaCha8Rng::seed_from_u64(self.rng.next_u64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn same_seed_gives_same_noise_and_order() {
        let mut a = ComputeContext::<B>::new(Default::default(), 7);
        let mut b = ComputeContext::<B>::new(Default::default(), 7);

        let na: Vec<f32> = a.standard_normal([2, 3]).into_data().iter::<f32>().collect();
        let nb: Vec<f32> = b.standard_normal([2, 3]).into_data().iter::<f32>().collect();
        assert_eq!(na, nb);

        let mut xa: Vec<usize> = (0..20).collect();
        let mut xb: Vec<usize> = (0..20).collect();
        a.shuffle(&mut xa);
        b.shuffle(&mut xb);
        assert_eq!(xa, xb);
    }

    #[test]
    fn forks_are_reproducible() {
        let mut a = ComputeContext::<B>::new(Default::default(), 3);
        let mut b = ComputeContext::<B>::new(Default::default(), 3);
        let mut fa = a.fork::<B>();
        let mut fb = b.fork::<B>();
        let na: Vec<f32> = fa.standard_normal([4]).into_data().iter::<f32>().collect();
        let nb: Vec<f32> = fb.standard_normal([4]).into_data().iter::<f32>().collect();
        assert_eq!(na, nb);
    }
}
