//! Bridging to callables registered by the embedding layer.
//!
//! The mechanism that reaches the host language lives outside the core. The
//! contract here is only: call the registered handle each step with the
//! requested arguments and place the result in the output view.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, RuntimeError};
use crate::operator::Operator;
use crate::signal::ResolvedView;

/// The signature of a registered host callable: optional current simulation
/// time, optional input snapshot, dense output (or a failure message).
pub type HostFn =
    Box<dyn FnMut(Option<f64>, Option<&[f64]>) -> std::result::Result<Vec<f64>, String> + Send>;

/// Process-local registry of host callables, keyed by an opaque reference
/// chosen by the embedding layer.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<u64, HostFn>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    /// Registers `callback` under `fn_ref`, replacing any previous entry.
    pub fn register(&mut self, fn_ref: u64, callback: HostFn) {
        self.callbacks.insert(fn_ref, callback);
    }

    /// True when a callable is registered under `fn_ref`.
    pub fn contains(&self, fn_ref: u64) -> bool {
        self.callbacks.contains_key(&fn_ref)
    }

    fn invoke(
        &mut self,
        fn_ref: u64,
        time: Option<f64>,
        input: Option<&[f64]>,
    ) -> std::result::Result<Vec<f64>, String> {
        match self.callbacks.get_mut(&fn_ref) {
            Some(callback) => callback(time, input),
            None => Err("callback vanished after build".into()),
        }
    }
}

/// Invokes a host callable each step and writes its result into a view.
pub struct HostCallback {
    fn_ref: u64,
    registry: Rc<RefCell<CallbackRegistry>>,
    want_time: bool,
    time: Rc<Cell<f64>>,
    input: Option<ResolvedView>,
    output: ResolvedView,
    in_buf: Vec<f64>,
}

impl HostCallback {
    pub fn new(
        fn_ref: u64,
        registry: Rc<RefCell<CallbackRegistry>>,
        want_time: bool,
        time: Rc<Cell<f64>>,
        input: Option<ResolvedView>,
        output: ResolvedView,
    ) -> HostCallback {
        let in_buf = Vec::with_capacity(input.as_ref().map_or(0, |view| view.len()));
        HostCallback { fn_ref, registry, want_time, time, input, output, in_buf }
    }
}

impl Operator for HostCallback {
    fn step(&mut self) -> Result<()> {
        if let Some(view) = &self.input {
            view.gather_into(&mut self.in_buf);
        }
        let time = if self.want_time { Some(self.time.get()) } else { None };
        let input = self.input.as_ref().map(|_| &self.in_buf[..]);

        let result = self
            .registry
            .borrow_mut()
            .invoke(self.fn_ref, time, input)
            .map_err(|message| RuntimeError::CallbackFailed { fn_ref: self.fn_ref, message })?;

        if result.len() != self.output.len() {
            return Err(RuntimeError::CallbackShape {
                fn_ref: self.fn_ref,
                expected: self.output.len(),
                found: result.len(),
            }
            .into());
        }
        self.output.scatter_from(&result);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HostCallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Key, SignalStore, Tensor};

    fn fixture() -> (SignalStore, Rc<RefCell<CallbackRegistry>>, Rc<Cell<f64>>) {
        let mut store = SignalStore::default();
        store.add_base(Key(1), "in".into(), Tensor::vector(vec![2.0, 3.0])).unwrap();
        store.add_base(Key(2), "out".into(), Tensor::vector(vec![0.0, 0.0])).unwrap();
        (store, Rc::new(RefCell::new(CallbackRegistry::new())), Rc::new(Cell::new(0.0)))
    }

    #[test]
    fn callback_receives_input_and_time() {
        let (store, registry, time) = fixture();
        time.set(0.25);
        registry.borrow_mut().register(
            7,
            Box::new(|time, input| {
                let t = time.expect("time requested");
                Ok(input.expect("input requested").iter().map(|x| x * t).collect())
            }),
        );
        let mut op = HostCallback::new(
            7,
            Rc::clone(&registry),
            true,
            Rc::clone(&time),
            Some(store.view_from_key(Key(1)).unwrap()),
            store.view_from_key(Key(2)).unwrap(),
        );
        op.step().unwrap();
        let mut out = Vec::new();
        store.view_from_key(Key(2)).unwrap().gather_into(&mut out);
        assert_eq!(out, vec![0.5, 0.75]);
    }

    #[test]
    fn wrong_output_size_is_fatal() {
        let (store, registry, time) = fixture();
        registry.borrow_mut().register(9, Box::new(|_, _| Ok(vec![1.0])));
        let mut op = HostCallback::new(
            9,
            Rc::clone(&registry),
            false,
            time,
            None,
            store.view_from_key(Key(2)).unwrap(),
        );
        assert!(op.step().is_err());
    }
}
