//! Two chunks exchanging a value each step, printed from the master.
//!
//! ```ignore
//! cargo run --example ring
//! ```

use spikeflow::{execute, Config, Key, OpSpec, SimOptions, Tensor, ViewSpec};

fn scalar_view(base: Key, label: &str) -> ViewSpec {
    ViewSpec {
        base,
        label: label.to_string(),
        ndim: 1,
        shape1: 1,
        shape2: 1,
        stride1: 1,
        stride2: 1,
        offset: 0,
    }
}

fn main() {
    env_logger::init();

    let output = execute(Config::Process(2), SimOptions::default(), |sim| {
        sim.add_signal(0, Key(1), "x0", Tensor::scalar(0.0))?;
        sim.add_signal(0, Key(2), "y0", Tensor::scalar(0.0))?;
        sim.add_signal(1, Key(11), "x1", Tensor::scalar(0.0))?;
        sim.add_signal(1, Key(12), "y1", Tensor::scalar(0.0))?;

        sim.add_op(0, OpSpec::Reset { index: 0.0, dst: scalar_view(Key(1), "x0"), value: 1.0 })?;
        sim.add_op(0, OpSpec::Send { index: 1.0, target: 1, tag: 7, content: scalar_view(Key(1), "x0") })?;
        sim.add_op(0, OpSpec::Recv { index: 2.0, source: 1, tag: 8, content: scalar_view(Key(2), "y0") })?;

        sim.add_op(1, OpSpec::Reset { index: 0.0, dst: scalar_view(Key(11), "x1"), value: 2.0 })?;
        sim.add_op(1, OpSpec::Send { index: 1.0, target: 0, tag: 8, content: scalar_view(Key(11), "x1") })?;
        sim.add_op(1, OpSpec::Recv { index: 2.0, source: 0, tag: 7, content: scalar_view(Key(12), "y1") })?;

        sim.add_probe(0, Key(100), Key(2), 1)?;
        sim.add_probe(1, Key(101), Key(12), 1)?;
        sim.finalize_build()?;
        sim.run_n_steps(5, true, None)?;
        Ok((sim.probe_data(Key(100))?, sim.probe_data(Key(101))?))
    })
    .expect("simulation failed");

    if let Some((y0, y1)) = output {
        for (step, (a, b)) in y0.iter().zip(&y1).enumerate() {
            println!("step {}: y0 = {:?}, y1 = {:?}", step, a.data(), b.data());
        }
    }
}
