//! Periodic samplers over signal views.

use crate::signal::{Key, ResolvedView, Tensor, ViewSpec};

/// A sampler that snapshots a signal view every `period` steps into an
/// in-memory ring of blocks.
pub struct Probe {
    key: Key,
    spec: ViewSpec,
    view: ResolvedView,
    period: u64,
    buffer: Vec<Tensor>,
}

impl Probe {
    pub(crate) fn new(key: Key, spec: ViewSpec, view: ResolvedView, period: u64) -> Probe {
        Probe { key, spec, view, period, buffer: Vec::new() }
    }

    /// The key the builder assigned.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The sampling period in steps.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// The label of the sampled view.
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// The descriptor of the sampled view.
    pub fn target(&self) -> &ViewSpec {
        &self.spec
    }

    /// Appends a snapshot of the target if `step` lands on the period.
    ///
    /// Samples reflect signal state at the end of the step, so callers run
    /// this after the operator sweep.
    pub fn sample(&mut self, step: u64) {
        if step % self.period == 0 {
            let mut data = Vec::with_capacity(self.view.len());
            self.view.gather_into(&mut data);
            self.buffer.push(Tensor::from_parts(
                data,
                self.spec.shape1,
                self.spec.shape2,
                self.spec.ndim,
            ));
        }
    }

    /// The samples collected since the last flush.
    pub fn samples(&self) -> &[Tensor] {
        &self.buffer
    }

    /// Moves the buffered samples out, leaving the ring empty for the next
    /// block.
    pub fn take_block(&mut self) -> Vec<Tensor> {
        std::mem::take(&mut self.buffer)
    }

    /// Drops buffered samples; releases capacity as well when `hard`.
    pub fn clear(&mut self, hard: bool) {
        self.buffer.clear();
        if hard {
            self.buffer.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalStore, Tensor};

    fn probe_over_scalar(period: u64) -> (SignalStore, Probe) {
        let mut store = SignalStore::default();
        store.add_base(Key(1), "a".into(), Tensor::scalar(1.5)).unwrap();
        let spec = store.get(Key(1)).unwrap().full_view();
        let view = store.view(&spec).unwrap();
        let probe = Probe::new(Key(100), spec, view, period);
        (store, probe)
    }

    #[test]
    fn period_collects_ceil_samples() {
        let (_store, mut probe) = probe_over_scalar(3);
        for step in 0..10 {
            probe.sample(step);
        }
        // Steps 0, 3, 6, 9.
        assert_eq!(probe.samples().len(), 4);
    }

    #[test]
    fn take_block_opens_a_fresh_block() {
        let (_store, mut probe) = probe_over_scalar(1);
        probe.sample(0);
        probe.sample(1);
        let block = probe.take_block();
        assert_eq!(block.len(), 2);
        assert!(probe.samples().is_empty());
        probe.sample(2);
        assert_eq!(probe.samples().len(), 1);
    }

    #[test]
    fn samples_track_current_values() {
        let (store, mut probe) = probe_over_scalar(1);
        probe.sample(0);
        store.view_from_key(Key(1)).unwrap().fill(7.0);
        probe.sample(1);
        assert_eq!(probe.samples()[0].data(), &[1.5]);
        assert_eq!(probe.samples()[1].data(), &[7.0]);
    }
}
