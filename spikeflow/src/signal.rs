//! Signals, views, and the per-chunk signal store.
//!
//! A [`BaseSignal`] is a contiguous rank-1 or rank-2 array of `f64` values
//! owned by a chunk. A [`ViewSpec`] is a non-owning strided descriptor naming
//! a window of a base signal; resolving it against the [`SignalStore`] yields
//! a [`ResolvedView`] holding the backing storage handle directly, so nothing
//! on the hot path ever looks a key up again. Views may alias one another;
//! operators snapshot their read operands before writing, which keeps
//! overlapping reads and writes within a single operator well defined.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// Opaque identifier assigned by the network builder; unique within a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u64);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous rank-1 or rank-2 array of `f64` values.
///
/// Rank-1 tensors are stored as `shape1` rows of one column; rank-2 tensors
/// are row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Vec<f64>,
    shape1: usize,
    shape2: usize,
    ndim: u8,
}

impl Tensor {
    /// A rank-1 tensor.
    pub fn vector(data: Vec<f64>) -> Tensor {
        let shape1 = data.len();
        Tensor { data, shape1, shape2: 1, ndim: 1 }
    }

    /// A rank-1 tensor with a single element.
    pub fn scalar(value: f64) -> Tensor {
        Tensor::vector(vec![value])
    }

    /// A row-major rank-2 tensor. `data` must hold `rows * cols` elements.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Tensor {
        assert_eq!(rows * cols, data.len(), "matrix data does not match its shape");
        Tensor { data, shape1: rows, shape2: cols, ndim: 2 }
    }

    pub(crate) fn from_parts(data: Vec<f64>, shape1: usize, shape2: usize, ndim: u8) -> Tensor {
        debug_assert_eq!(data.len(), shape1 * shape2);
        Tensor { data, shape1, shape2, ndim }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions: 1 or 2.
    pub fn ndim(&self) -> u8 {
        self.ndim
    }

    /// Extent of the first dimension.
    pub fn shape1(&self) -> usize {
        self.shape1
    }

    /// Extent of the second dimension (1 for rank-1 tensors).
    pub fn shape2(&self) -> usize {
        self.shape2
    }

    /// The elements in row-major order.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Consumes the tensor, returning its elements.
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }
}

/// A named tensor owned by a chunk.
pub struct BaseSignal {
    key: Key,
    label: String,
    shape1: usize,
    shape2: usize,
    ndim: u8,
    data: Rc<RefCell<Vec<f64>>>,
}

impl BaseSignal {
    fn new(key: Key, label: String, tensor: Tensor) -> BaseSignal {
        let shape1 = tensor.shape1();
        let shape2 = tensor.shape2();
        let ndim = tensor.ndim();
        BaseSignal {
            key,
            label,
            shape1,
            shape2,
            ndim,
            data: Rc::new(RefCell::new(tensor.into_data())),
        }
    }

    /// The key the builder assigned.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape1 * self.shape2
    }

    /// True when the signal has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A full-extent view descriptor over this signal.
    pub fn full_view(&self) -> ViewSpec {
        ViewSpec {
            base: self.key,
            label: self.label.clone(),
            ndim: self.ndim,
            shape1: self.shape1,
            shape2: self.shape2,
            stride1: if self.ndim == 2 { self.shape2 } else { 1 },
            stride2: 1,
            offset: 0,
        }
    }
}

/// A non-owning strided descriptor of a window into a base signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    /// Key of the base signal this view resolves against.
    pub base: Key,
    /// Diagnostic label.
    pub label: String,
    /// Number of dimensions: 1 or 2.
    pub ndim: u8,
    /// Extent of the first dimension.
    pub shape1: usize,
    /// Extent of the second dimension (1 for rank-1 views).
    pub shape2: usize,
    /// Element stride between rows.
    pub stride1: usize,
    /// Element stride between columns.
    pub stride2: usize,
    /// Element offset of the first element inside the base signal.
    pub offset: usize,
}

impl ViewSpec {
    /// Number of elements the view covers.
    pub fn len(&self) -> usize {
        self.shape1 * self.shape2
    }

    /// True when the view covers no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A view resolved against the signal store: the backing storage handle plus
/// the strided geometry. Cheap to clone; all clones share the storage.
#[derive(Clone)]
pub struct ResolvedView {
    data: Rc<RefCell<Vec<f64>>>,
    shape1: usize,
    shape2: usize,
    stride1: usize,
    stride2: usize,
    offset: usize,
    ndim: u8,
}

impl ResolvedView {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape1 * self.shape2
    }

    /// True when the view covers no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dimensions: 1 or 2.
    pub fn ndim(&self) -> u8 {
        self.ndim
    }

    /// Extent of the first dimension.
    pub fn shape1(&self) -> usize {
        self.shape1
    }

    /// Extent of the second dimension.
    pub fn shape2(&self) -> usize {
        self.shape2
    }

    /// The first element. Meaningful for one-element views standing in for
    /// scalars.
    pub fn scalar(&self) -> f64 {
        self.data.borrow()[self.offset]
    }

    /// Copies the view's elements into `out` in row-major order, reusing its
    /// capacity.
    pub fn gather_into(&self, out: &mut Vec<f64>) {
        let data = self.data.borrow();
        out.clear();
        for i in 0..self.shape1 {
            let row = self.offset + i * self.stride1;
            for j in 0..self.shape2 {
                out.push(data[row + j * self.stride2]);
            }
        }
    }

    /// Writes `values` into the view in row-major order.
    pub fn scatter_from(&self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.len());
        let mut data = self.data.borrow_mut();
        let mut next = values.iter();
        for i in 0..self.shape1 {
            let row = self.offset + i * self.stride1;
            for j in 0..self.shape2 {
                data[row + j * self.stride2] = *next.next().expect("scatter length checked");
            }
        }
    }

    /// Sets every element to `value`.
    pub fn fill(&self, value: f64) {
        let mut data = self.data.borrow_mut();
        for i in 0..self.shape1 {
            let row = self.offset + i * self.stride1;
            for j in 0..self.shape2 {
                data[row + j * self.stride2] = value;
            }
        }
    }

    /// Mutates each element in place, in row-major view order. The closure
    /// receives the flat view position and the element.
    pub fn update<F: FnMut(usize, &mut f64)>(&self, mut f: F) {
        let mut data = self.data.borrow_mut();
        let mut position = 0;
        for i in 0..self.shape1 {
            let row = self.offset + i * self.stride1;
            for j in 0..self.shape2 {
                f(position, &mut data[row + j * self.stride2]);
                position += 1;
            }
        }
    }
}

/// The signal store of one chunk.
///
/// Once build completes the backing storage of every base signal is stable:
/// resolved views hold the storage handle itself, never a key.
#[derive(Default)]
pub struct SignalStore {
    signals: HashMap<Key, BaseSignal>,
}

impl SignalStore {
    /// Adds a base signal. Duplicate keys are a build error.
    pub fn add_base(&mut self, key: Key, label: String, tensor: Tensor) -> Result<()> {
        if self.signals.contains_key(&key) {
            return Err(BuildError::DuplicateKey(key).into());
        }
        self.signals.insert(key, BaseSignal::new(key, label, tensor));
        Ok(())
    }

    /// Looks up a base signal.
    pub fn get(&self, key: Key) -> Result<&BaseSignal> {
        self.signals.get(&key).ok_or_else(|| BuildError::UnknownKey(key).into())
    }

    /// Number of base signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// True when the store holds no signals.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Resolves a view descriptor, checking that every element it names lies
    /// inside its base signal.
    pub fn view(&self, spec: &ViewSpec) -> Result<ResolvedView> {
        let base = self.get(spec.base)?;
        let out_of_bounds = || {
            BuildError::ViewOutOfBounds {
                label: spec.label.clone(),
                base: spec.base,
                len: base.len(),
            }
        };
        if spec.ndim == 0 || spec.ndim > 2 || spec.is_empty() || (spec.ndim == 1 && spec.shape2 != 1) {
            return Err(out_of_bounds().into());
        }
        let last = spec.offset
            + (spec.shape1 - 1) * spec.stride1
            + (spec.shape2 - 1) * spec.stride2;
        if last >= base.len() {
            return Err(out_of_bounds().into());
        }
        Ok(ResolvedView {
            data: Rc::clone(&base.data),
            shape1: spec.shape1,
            shape2: spec.shape2,
            stride1: spec.stride1,
            stride2: spec.stride2,
            offset: spec.offset,
            ndim: spec.ndim,
        })
    }

    /// Resolves a full-extent view over the signal under `key`.
    pub fn view_from_key(&self, key: Key) -> Result<ResolvedView> {
        let spec = self.get(key)?.full_view();
        self.view(&spec)
    }

    /// Snapshots every signal's current values, keyed for later restore.
    pub fn snapshot(&self) -> HashMap<Key, Vec<f64>> {
        self.signals
            .iter()
            .map(|(&key, signal)| (key, signal.data.borrow().clone()))
            .collect()
    }

    /// Restores every signal from a snapshot taken by [`SignalStore::snapshot`].
    pub fn restore(&mut self, snapshot: &HashMap<Key, Vec<f64>>) {
        for (key, values) in snapshot {
            if let Some(signal) = self.signals.get(key) {
                signal.data.borrow_mut().copy_from_slice(values);
            }
        }
    }
}
