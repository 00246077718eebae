use std::num::NonZeroU64;

/// Decides which frames of a stream go through the detector.
pub trait FrameSampler: Send {
    /// `frame_index` is zero-based and counts every decoded frame.
    fn should_process(&self, frame_index: u64) -> bool;
}

/// Processes frames `0, n, 2n, ...`.
#[derive(Clone, Copy, Debug)]
pub struct FixedStride {
    stride: NonZeroU64,
}

impl FixedStride {
    pub fn new(stride: NonZeroU64) -> Self {
        Self { stride }
    }

    /// Every frame.
    pub fn every_frame() -> Self {
        Self::new(NonZeroU64::MIN)
    }
}

impl FrameSampler for FixedStride {
    fn should_process(&self, frame_index: u64) -> bool {
        frame_index % self.stride.get() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stride(n: u64) -> FixedStride {
        FixedStride::new(NonZeroU64::new(n).unwrap())
    }

    #[test]
    fn stride_one_processes_everything() {
        let sampler = FixedStride::every_frame();
        assert!((0..50).all(|index| sampler.should_process(index)));
    }

    #[test]
    fn stride_three_picks_multiples_of_three() {
        let sampler = stride(3);
        let picked: Vec<u64> = (0..10).filter(|&i| sampler.should_process(i)).collect();
        assert_eq!(picked, vec![0, 3, 6, 9]);
    }

    #[test]
    fn first_frame_is_always_processed() {
        for n in 1..20 {
            assert!(stride(n).should_process(0));
        }
    }
}
