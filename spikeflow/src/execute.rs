//! Entry points that build a fabric, spawn workers, and drive a master
//! closure.

use std::sync::Arc;
use std::thread;

use spikeflow_communication::{Config, Fabric};

use crate::error::{Result, RuntimeError};
use crate::operator::host::CallbackRegistry;
use crate::simulator::{worker, SimOptions, Simulator};

/// Executes a single-process simulation on the current thread.
///
/// # Examples
/// ```
/// use spikeflow::{execute_directly, Key, OpSpec, SimOptions, Tensor};
/// use spikeflow::operator::host::CallbackRegistry;
///
/// let samples = execute_directly(SimOptions::default(), CallbackRegistry::new(), |sim| {
///     sim.add_signal(0, Key(1), "a", Tensor::scalar(0.0))?;
///     let dst = spikeflow::ViewSpec {
///         base: Key(1),
///         label: "a".into(),
///         ndim: 1,
///         shape1: 1,
///         shape2: 1,
///         stride1: 1,
///         stride2: 1,
///         offset: 0,
///     };
///     sim.add_op(0, OpSpec::Reset { index: 0.0, dst, value: 3.5 })?;
///     sim.add_probe(0, Key(100), Key(1), 1)?;
///     sim.finalize_build()?;
///     sim.run_n_steps(2, false, None)?;
///     sim.probe_data(Key(100))
/// })
/// .unwrap();
/// assert_eq!(samples.len(), 2);
/// ```
pub fn execute_directly<T>(
    options: SimOptions,
    registry: CallbackRegistry,
    master: impl FnOnce(&mut Simulator) -> Result<T>,
) -> Result<T> {
    let mut builders = Config::Thread.try_build().map_err(RuntimeError::Comm)?;
    let builder = builders.pop().expect("thread config yields one fabric");
    let fabric = builder.build().map_err(RuntimeError::Comm)?;
    let mut sim = Simulator::new(fabric, options, registry)?;
    let result = master(&mut sim)?;
    sim.close()?;
    Ok(result)
}

/// Executes a simulation from a fabric configuration with empty callback
/// registries.
///
/// The master closure runs on process 0; its value comes back as
/// `Ok(Some(..))` there and `Ok(None)` on worker-only processes of a
/// cluster run. `Process` configurations spawn one thread per additional
/// process.
pub fn execute<T>(
    config: Config,
    options: SimOptions,
    master: impl FnOnce(&mut Simulator) -> Result<T>,
) -> Result<Option<T>> {
    execute_with_callbacks(config, options, |_| CallbackRegistry::new(), master)
}

/// Executes a simulation, constructing each process's callback registry
/// through `registries` (called with the process index).
pub fn execute_with_callbacks<T>(
    config: Config,
    options: SimOptions,
    registries: impl Fn(usize) -> CallbackRegistry + Send + Sync + 'static,
    master: impl FnOnce(&mut Simulator) -> Result<T>,
) -> Result<Option<T>> {
    let mut builders = config.try_build().map_err(RuntimeError::Comm)?;
    let registries = Arc::new(registries);

    let mut guards = Vec::new();
    for builder in builders.split_off(1) {
        let registries = Arc::clone(&registries);
        guards.push(
            thread::Builder::new()
                .name("spikeflow:worker".to_string())
                .spawn(move || -> Result<()> {
                    let fabric = builder.build().map_err(RuntimeError::Comm)?;
                    let registry = (*registries)(fabric.index());
                    worker(fabric, registry).inspect_err(|error| {
                        log::error!("worker failed: {}", error);
                    })
                })?,
        );
    }

    let builder = builders.pop().expect("config yields at least one fabric");
    let fabric = builder.build().map_err(RuntimeError::Comm)?;
    let index = fabric.index();
    let result = if index == 0 {
        let mut sim = Simulator::new(fabric, options, (*registries)(0))?;
        let value = master(&mut sim)?;
        sim.close()?;
        Some(value)
    } else {
        worker(fabric, (*registries)(index))?;
        None
    };

    for guard in guards {
        match guard.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                return Err(RuntimeError::Remote {
                    rank: usize::MAX,
                    message: "worker thread panicked".into(),
                }
                .into())
            }
        }
    }
    Ok(result)
}
