//! Element-wise and linear-algebra operators.
//!
//! Read operands are snapshotted into operator-owned scratch buffers before
//! the write view is touched, so aliasing operands observe start-of-step
//! state. Scratch buffers are sized once and reused every step.

use crate::error::Result;
use crate::operator::Operator;
use crate::signal::ResolvedView;

/// Sets every element of its target to a constant.
pub struct Reset {
    dst: ResolvedView,
    value: f64,
}

impl Reset {
    pub fn new(dst: ResolvedView, value: f64) -> Reset {
        Reset { dst, value }
    }
}

impl Operator for Reset {
    fn step(&mut self) -> Result<()> {
        self.dst.fill(self.value);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Reset"
    }
}

/// Element-wise assignment between equal-shape views.
pub struct Copy {
    dst: ResolvedView,
    src: ResolvedView,
    scratch: Vec<f64>,
}

impl Copy {
    pub fn new(dst: ResolvedView, src: ResolvedView) -> Copy {
        let scratch = Vec::with_capacity(src.len());
        Copy { dst, src, scratch }
    }
}

impl Operator for Copy {
    fn step(&mut self) -> Result<()> {
        self.src.gather_into(&mut self.scratch);
        self.dst.scatter_from(&self.scratch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Copy"
    }
}

/// `y += a · x` with matrix `a` and vector `x`, `y`.
pub struct DotInc {
    a: ResolvedView,
    x: ResolvedView,
    y: ResolvedView,
    a_buf: Vec<f64>,
    x_buf: Vec<f64>,
}

impl DotInc {
    pub fn new(a: ResolvedView, x: ResolvedView, y: ResolvedView) -> DotInc {
        let a_buf = Vec::with_capacity(a.len());
        let x_buf = Vec::with_capacity(x.len());
        DotInc { a, x, y, a_buf, x_buf }
    }
}

impl Operator for DotInc {
    fn step(&mut self) -> Result<()> {
        self.a.gather_into(&mut self.a_buf);
        self.x.gather_into(&mut self.x_buf);
        let a = &self.a_buf;
        let x = &self.x_buf;
        let cols = x.len();
        self.y.update(|i, y| {
            let row = &a[i * cols..(i + 1) * cols];
            let mut acc = 0.0;
            for (aij, xj) in row.iter().zip(x) {
                acc += aij * xj;
            }
            *y += acc;
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DotInc"
    }
}

/// `y += a · x` with one-element `a` applied as a broadcast scalar.
pub struct ScalarDotInc {
    a: ResolvedView,
    x: ResolvedView,
    y: ResolvedView,
    x_buf: Vec<f64>,
}

impl ScalarDotInc {
    pub fn new(a: ResolvedView, x: ResolvedView, y: ResolvedView) -> ScalarDotInc {
        let x_buf = Vec::with_capacity(x.len());
        ScalarDotInc { a, x, y, x_buf }
    }
}

impl Operator for ScalarDotInc {
    fn step(&mut self) -> Result<()> {
        let alpha = self.a.scalar();
        self.x.gather_into(&mut self.x_buf);
        let x = &self.x_buf;
        self.y.update(|i, y| *y += alpha * x[i]);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ScalarDotInc"
    }
}

/// `y = b ⊙ y + a · x` with matrix `a` and element-wise `b`.
pub struct ProdUpdate {
    a: ResolvedView,
    x: ResolvedView,
    b: ResolvedView,
    y: ResolvedView,
    a_buf: Vec<f64>,
    x_buf: Vec<f64>,
    b_buf: Vec<f64>,
}

impl ProdUpdate {
    pub fn new(a: ResolvedView, x: ResolvedView, b: ResolvedView, y: ResolvedView) -> ProdUpdate {
        let a_buf = Vec::with_capacity(a.len());
        let x_buf = Vec::with_capacity(x.len());
        let b_buf = Vec::with_capacity(b.len());
        ProdUpdate { a, x, b, y, a_buf, x_buf, b_buf }
    }
}

impl Operator for ProdUpdate {
    fn step(&mut self) -> Result<()> {
        self.a.gather_into(&mut self.a_buf);
        self.x.gather_into(&mut self.x_buf);
        self.b.gather_into(&mut self.b_buf);
        let a = &self.a_buf;
        let x = &self.x_buf;
        let b = &self.b_buf;
        let cols = x.len();
        self.y.update(|i, y| {
            let row = &a[i * cols..(i + 1) * cols];
            let mut acc = 0.0;
            for (aij, xj) in row.iter().zip(x) {
                acc += aij * xj;
            }
            *y = b[i] * *y + acc;
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ProdUpdate"
    }
}

/// `y = b · y + a · x` with one-element `a` and `b`.
pub struct ScalarProdUpdate {
    a: ResolvedView,
    x: ResolvedView,
    b: ResolvedView,
    y: ResolvedView,
    x_buf: Vec<f64>,
}

impl ScalarProdUpdate {
    pub fn new(a: ResolvedView, x: ResolvedView, b: ResolvedView, y: ResolvedView) -> ScalarProdUpdate {
        let x_buf = Vec::with_capacity(x.len());
        ScalarProdUpdate { a, x, b, y, x_buf }
    }
}

impl Operator for ScalarProdUpdate {
    fn step(&mut self) -> Result<()> {
        let alpha = self.a.scalar();
        let beta = self.b.scalar();
        self.x.gather_into(&mut self.x_buf);
        let x = &self.x_buf;
        self.y.update(|i, y| *y = beta * *y + alpha * x[i]);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ScalarProdUpdate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Key, SignalStore, Tensor};

    fn store() -> SignalStore {
        let mut store = SignalStore::default();
        store
            .add_base(Key(1), "a".into(), Tensor::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        store.add_base(Key(2), "x".into(), Tensor::vector(vec![1.0, 1.0])).unwrap();
        store.add_base(Key(3), "y".into(), Tensor::vector(vec![0.0, 0.0])).unwrap();
        store
    }

    fn values(store: &SignalStore, key: Key) -> Vec<f64> {
        let mut out = Vec::new();
        store.view_from_key(key).unwrap().gather_into(&mut out);
        out
    }

    #[test]
    fn dot_inc_accumulates() {
        let store = store();
        let mut op = DotInc::new(
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
            store.view_from_key(Key(3)).unwrap(),
        );
        op.step().unwrap();
        assert_eq!(values(&store, Key(3)), vec![3.0, 7.0]);
        op.step().unwrap();
        assert_eq!(values(&store, Key(3)), vec![6.0, 14.0]);
    }

    #[test]
    fn prod_update_scales_then_adds() {
        let mut store = store();
        store.add_base(Key(4), "b".into(), Tensor::vector(vec![0.5, 0.5])).unwrap();
        store.view_from_key(Key(3)).unwrap().scatter_from(&[4.0, 4.0]);
        let mut op = ProdUpdate::new(
            store.view_from_key(Key(1)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
            store.view_from_key(Key(4)).unwrap(),
            store.view_from_key(Key(3)).unwrap(),
        );
        op.step().unwrap();
        assert_eq!(values(&store, Key(3)), vec![5.0, 9.0]);
    }

    #[test]
    fn copy_handles_aliasing_operands() {
        let store = store();
        // dst and src share a base; the snapshot makes this well defined.
        let mut op = Copy::new(
            store.view_from_key(Key(2)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
        );
        op.step().unwrap();
        assert_eq!(values(&store, Key(2)), vec![1.0, 1.0]);
    }

    #[test]
    fn scalar_prod_update_broadcasts() {
        let mut store = store();
        store.add_base(Key(10), "alpha".into(), Tensor::scalar(2.0)).unwrap();
        store.add_base(Key(11), "beta".into(), Tensor::scalar(0.0)).unwrap();
        store.view_from_key(Key(3)).unwrap().scatter_from(&[7.0, 7.0]);
        let mut op = ScalarProdUpdate::new(
            store.view_from_key(Key(10)).unwrap(),
            store.view_from_key(Key(2)).unwrap(),
            store.view_from_key(Key(11)).unwrap(),
            store.view_from_key(Key(3)).unwrap(),
        );
        op.step().unwrap();
        assert_eq!(values(&store, Key(3)), vec![2.0, 2.0]);
    }
}
