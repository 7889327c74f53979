//! Spiking and rate neuron models.

use crate::error::Result;
use crate::operator::Operator;
use crate::signal::ResolvedView;

/// Leaky integrate-and-fire neurons.
///
/// Per-neuron membrane voltage and refractory timers live inside the
/// operator. Each step integrates `v += dt/tau_rc * (j - v)`, clamps the
/// voltage at zero, and on reaching threshold emits `1/dt` on the output,
/// resets the voltage, and charges a refractory period extended by the
/// fraction of the step spent above threshold.
pub struct SimLif {
    tau_rc: f64,
    tau_ref: f64,
    dt: f64,
    j: ResolvedView,
    out: ResolvedView,
    voltage: Vec<f64>,
    refractory: Vec<f64>,
    j_buf: Vec<f64>,
}

impl SimLif {
    pub fn new(n: usize, tau_rc: f64, tau_ref: f64, dt: f64, j: ResolvedView, out: ResolvedView) -> SimLif {
        SimLif {
            tau_rc,
            tau_ref,
            dt,
            j,
            out,
            voltage: vec![0.0; n],
            refractory: vec![0.0; n],
            j_buf: Vec::with_capacity(n),
        }
    }
}

impl Operator for SimLif {
    fn step(&mut self) -> Result<()> {
        self.j.gather_into(&mut self.j_buf);
        let dt = self.dt;
        let tau_rc = self.tau_rc;
        let tau_ref = self.tau_ref;
        let spike = 1.0 / dt;
        let j = &self.j_buf;
        let voltage = &mut self.voltage;
        let refractory = &mut self.refractory;

        self.out.update(|i, out| {
            if refractory[i] > 0.0 {
                refractory[i] -= dt;
                *out = 0.0;
                return;
            }
            let mut v = voltage[i];
            let dv = dt / tau_rc * (j[i] - v);
            v += dv;
            if v < 0.0 {
                v = 0.0;
            }
            if v >= 1.0 {
                let overshoot = if dv > 0.0 { (v - 1.0) / dv } else { 0.0 };
                refractory[i] = tau_ref + dt * (1.0 - overshoot);
                v = 0.0;
                *out = spike;
            } else {
                *out = 0.0;
            }
            voltage[i] = v;
        });
        Ok(())
    }

    fn reset(&mut self) {
        for v in &mut self.voltage {
            *v = 0.0;
        }
        for r in &mut self.refractory {
            *r = 0.0;
        }
    }

    fn name(&self) -> &'static str {
        "SimLIF"
    }
}

/// Closed-form LIF rate approximation: the steady firing rate a constant
/// current would produce. No state.
pub struct SimLifRate {
    tau_rc: f64,
    tau_ref: f64,
    j: ResolvedView,
    out: ResolvedView,
    j_buf: Vec<f64>,
}

impl SimLifRate {
    pub fn new(n: usize, tau_rc: f64, tau_ref: f64, j: ResolvedView, out: ResolvedView) -> SimLifRate {
        SimLifRate {
            tau_rc,
            tau_ref,
            j,
            out,
            j_buf: Vec::with_capacity(n),
        }
    }
}

impl Operator for SimLifRate {
    fn step(&mut self) -> Result<()> {
        self.j.gather_into(&mut self.j_buf);
        let tau_rc = self.tau_rc;
        let tau_ref = self.tau_ref;
        let j = &self.j_buf;
        self.out.update(|i, out| {
            *out = if j[i] > 1.0 {
                1.0 / (tau_ref + tau_rc * (1.0 + 1.0 / (j[i] - 1.0)).ln())
            } else {
                0.0
            };
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SimLIFRate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Key, SignalStore, Tensor};

    fn neuron_store(j: f64) -> SignalStore {
        let mut store = SignalStore::default();
        store.add_base(Key(1), "j".into(), Tensor::scalar(j)).unwrap();
        store.add_base(Key(2), "out".into(), Tensor::scalar(0.0)).unwrap();
        store
    }

    #[test]
    fn lif_spikes_under_constant_drive() {
        let store = neuron_store(2.0);
        let mut lif = SimLif::new(
            1,
            0.02,
            0.002,
            0.001,
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
        );
        let mut spikes = 0;
        for _ in 0..50 {
            lif.step().unwrap();
            let out = store.view_from_key(Key(2)).unwrap().scalar();
            assert!(out == 0.0 || out == 1000.0);
            if out == 1000.0 {
                spikes += 1;
            }
        }
        assert!(spikes >= 1);
    }

    #[test]
    fn lif_stays_silent_below_threshold() {
        let store = neuron_store(0.5);
        let mut lif = SimLif::new(
            1,
            0.02,
            0.002,
            0.001,
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
        );
        for _ in 0..200 {
            lif.step().unwrap();
            assert_eq!(store.view_from_key(Key(2)).unwrap().scalar(), 0.0);
        }
    }

    #[test]
    fn lif_reset_reproduces_first_spike_time() {
        let store = neuron_store(2.0);
        let mut lif = SimLif::new(
            1,
            0.02,
            0.002,
            0.001,
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
        );
        let first_spike = |lif: &mut SimLif| {
            for step in 0..100 {
                lif.step().unwrap();
                if store.view_from_key(Key(2)).unwrap().scalar() > 0.0 {
                    return step;
                }
            }
            panic!("no spike in 100 steps");
        };
        let first = first_spike(&mut lif);
        lif.reset();
        assert_eq!(first_spike(&mut lif), first);
    }

    #[test]
    fn rate_positive_above_one_zero_below() {
        let store = neuron_store(2.0);
        let mut rate = SimLifRate::new(
            1,
            0.02,
            0.002,
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
        );
        rate.step().unwrap();
        let above = store.view_from_key(Key(2)).unwrap().scalar();
        // 1 / (tau_ref + tau_rc ln 2) for j = 2.
        assert!((above - 1.0 / (0.002 + 0.02 * 2.0_f64.ln())).abs() < 1e-9);

        store.view_from_key(Key(1)).unwrap().fill(0.9);
        rate.step().unwrap();
        assert_eq!(store.view_from_key(Key(2)).unwrap().scalar(), 0.0);
    }
}
