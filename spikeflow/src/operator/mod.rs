//! Operators: step-callables that mutate the signals they reference.
//!
//! The concrete set is closed: element-wise and linear-algebra updates,
//! a discrete linear filter, two neuron models, the host-callback bridge,
//! and the communication operators that ride the schedule. Operators are
//! described declaratively by an [`OpSpec`] (which is what travels in build
//! records) and constructed against the chunk's signal store at finalize.

pub mod algebra;
pub mod comm;
pub mod filter;
pub mod host;
pub mod neuron;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::signal::ViewSpec;

/// A step-callable with optional internal state.
///
/// `step` runs once per timestep, in ascending schedule order. `reset`
/// returns any internal state (filter taps, neuron voltages, communication
/// arming) to its initial value; most operators have none.
pub trait Operator {
    /// Advances the operator by one timestep.
    fn step(&mut self) -> Result<()>;

    /// Returns internal state to its initial value.
    fn reset(&mut self) {}

    /// A short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// A position in the operator schedule: the builder-assigned index, with
/// insertion order breaking ties.
///
/// Indices are floats so a builder can wedge new operators between existing
/// ones without renumbering.
#[derive(Copy, Clone, Debug)]
pub struct OpIndex {
    /// The builder-assigned schedule index.
    pub index: f64,
    /// Insertion sequence number, assigned by the chunk.
    pub seq: u64,
}

impl PartialEq for OpIndex {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpIndex {}

impl PartialOrd for OpIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.total_cmp(&other.index).then(self.seq.cmp(&other.seq))
    }
}

/// A declarative description of one operator, as shipped by the builder.
///
/// Scalar and matrix forms of the linear-algebra updates are distinct kinds;
/// a one-element matrix does not implicitly become a scalar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OpSpec {
    /// Set every element of `dst` to `value`.
    Reset { index: f64, dst: ViewSpec, value: f64 },
    /// Element-wise assignment; shapes must match.
    Copy { index: f64, dst: ViewSpec, src: ViewSpec },
    /// `y += a · x` with matrix `a`.
    DotInc { index: f64, a: ViewSpec, x: ViewSpec, y: ViewSpec },
    /// `y += a · x` with one-element `a` applied as a broadcast scalar.
    ScalarDotInc { index: f64, a: ViewSpec, x: ViewSpec, y: ViewSpec },
    /// `y = b ⊙ y + a · x` with matrix `a` and element-wise `b`.
    ProdUpdate { index: f64, a: ViewSpec, x: ViewSpec, b: ViewSpec, y: ViewSpec },
    /// `y = b · y + a · x` with one-element `a` and `b`.
    ScalarProdUpdate { index: f64, a: ViewSpec, x: ViewSpec, b: ViewSpec, y: ViewSpec },
    /// Discrete linear filter applied element-wise, state retained across steps.
    Filter { index: f64, input: ViewSpec, output: ViewSpec, numer: Vec<f64>, denom: Vec<f64> },
    /// Leaky integrate-and-fire neurons.
    SimLif { index: f64, n: usize, tau_rc: f64, tau_ref: f64, j: ViewSpec, out: ViewSpec },
    /// Closed-form LIF rate approximation.
    SimLifRate { index: f64, n: usize, tau_rc: f64, tau_ref: f64, j: ViewSpec, out: ViewSpec },
    /// Invoke a registered host callable and write its result.
    HostCallback {
        index: f64,
        fn_ref: u64,
        want_time: bool,
        input: Option<ViewSpec>,
        output: ViewSpec,
    },
    /// Ship `content` to process `target` each step.
    Send { index: f64, target: usize, tag: u32, content: ViewSpec },
    /// Receive the peer's previous-step payload into `content`.
    Recv { index: f64, source: usize, tag: u32, content: ViewSpec },
}

impl OpSpec {
    /// The builder-assigned schedule index.
    pub fn index(&self) -> f64 {
        match self {
            OpSpec::Reset { index, .. }
            | OpSpec::Copy { index, .. }
            | OpSpec::DotInc { index, .. }
            | OpSpec::ScalarDotInc { index, .. }
            | OpSpec::ProdUpdate { index, .. }
            | OpSpec::ScalarProdUpdate { index, .. }
            | OpSpec::Filter { index, .. }
            | OpSpec::SimLif { index, .. }
            | OpSpec::SimLifRate { index, .. }
            | OpSpec::HostCallback { index, .. }
            | OpSpec::Send { index, .. }
            | OpSpec::Recv { index, .. } => *index,
        }
    }

    /// The operator kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            OpSpec::Reset { .. } => "Reset",
            OpSpec::Copy { .. } => "Copy",
            OpSpec::DotInc { .. } => "DotInc",
            OpSpec::ScalarDotInc { .. } => "ScalarDotInc",
            OpSpec::ProdUpdate { .. } => "ProdUpdate",
            OpSpec::ScalarProdUpdate { .. } => "ScalarProdUpdate",
            OpSpec::Filter { .. } => "Filter",
            OpSpec::SimLif { .. } => "SimLIF",
            OpSpec::SimLifRate { .. } => "SimLIFRate",
            OpSpec::HostCallback { .. } => "HostCallback",
            OpSpec::Send { .. } => "Send",
            OpSpec::Recv { .. } => "Recv",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OpIndex;

    #[test]
    fn order_by_index_then_sequence() {
        let a = OpIndex { index: 1.0, seq: 5 };
        let b = OpIndex { index: 1.5, seq: 0 };
        let c = OpIndex { index: 1.0, seq: 9 };
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }
}
