//! A discrete linear filter applied element-wise along a signal.

use crate::error::{BuildError, Result};
use crate::operator::Operator;
use crate::signal::ResolvedView;

/// A discrete transfer function in direct form II transposed, with one state
/// column per signal element.
///
/// Coefficients are normalized by the leading denominator coefficient at
/// construction; both polynomials are padded to a common order. State is
/// retained across steps and zeroed on reset.
pub struct Filter {
    input: ResolvedView,
    output: ResolvedView,
    numer: Vec<f64>,
    denom: Vec<f64>,
    // Row m holds state tap m for every element: `state[m * n + k]`.
    state: Vec<f64>,
    in_buf: Vec<f64>,
    out_buf: Vec<f64>,
}

impl Filter {
    pub fn new(
        input: ResolvedView,
        output: ResolvedView,
        mut numer: Vec<f64>,
        mut denom: Vec<f64>,
    ) -> Result<Filter> {
        if denom.is_empty() {
            denom.push(1.0);
        }
        if numer.is_empty() {
            return Err(BuildError::BadFilter("empty numerator".into()).into());
        }
        let a0 = denom[0];
        if a0 == 0.0 {
            return Err(BuildError::BadFilter("leading denominator coefficient is zero".into()).into());
        }
        for b in &mut numer {
            *b /= a0;
        }
        for a in &mut denom {
            *a /= a0;
        }
        let order = numer.len().max(denom.len()) - 1;
        numer.resize(order + 1, 0.0);
        denom.resize(order + 1, 0.0);

        let n = input.len();
        Ok(Filter {
            input,
            output,
            numer,
            denom,
            state: vec![0.0; order * n],
            in_buf: Vec::with_capacity(n),
            out_buf: vec![0.0; n],
        })
    }

    fn order(&self) -> usize {
        self.numer.len() - 1
    }
}

impl Operator for Filter {
    fn step(&mut self) -> Result<()> {
        self.input.gather_into(&mut self.in_buf);
        let n = self.in_buf.len();
        let order = self.order();

        for k in 0..n {
            let x = self.in_buf[k];
            let y = if order == 0 {
                self.numer[0] * x
            } else {
                let y = self.numer[0] * x + self.state[k];
                for m in 0..order - 1 {
                    self.state[m * n + k] =
                        self.numer[m + 1] * x + self.state[(m + 1) * n + k] - self.denom[m + 1] * y;
                }
                self.state[(order - 1) * n + k] = self.numer[order] * x - self.denom[order] * y;
                y
            };
            self.out_buf[k] = y;
        }

        self.output.scatter_from(&self.out_buf);
        Ok(())
    }

    fn reset(&mut self) {
        for tap in &mut self.state {
            *tap = 0.0;
        }
    }

    fn name(&self) -> &'static str {
        "Filter"
    }
}
