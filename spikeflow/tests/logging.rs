use spikeflow::logsink::read_log;
use spikeflow::operator::host::CallbackRegistry;
use spikeflow::{execute, execute_directly, Config, Key, OpSpec, SimOptions, Tensor, ViewSpec};

fn vector_view(base: Key, label: &str, n: usize) -> ViewSpec {
    ViewSpec {
        base,
        label: label.to_string(),
        ndim: 1,
        shape1: n,
        shape2: 1,
        stride1: 1,
        stride2: 1,
        offset: 0,
    }
}

#[test]
fn flush_boundary_spills_and_reopens_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probes.log");
    let options = SimOptions { flush_every: 4, ..SimOptions::default() };

    execute_directly(options, CallbackRegistry::new(), |sim| {
        sim.add_signal(0, Key(1), "a", Tensor::scalar(0.0))?;
        sim.add_op(0, OpSpec::Reset { index: 0.0, dst: vector_view(Key(1), "a", 1), value: 1.0 })?;
        sim.add_probe(0, Key(100), Key(1), 1)?;
        sim.finalize_build()?;
        sim.run_n_steps(10, false, Some(&path))?;
        // Everything spilled to the file; nothing left in memory.
        assert!(sim.probe_data(Key(100))?.is_empty());
        Ok(())
    })
    .unwrap();

    let contents = read_log(&path).unwrap();
    assert_eq!(contents.dt, 0.001);
    let dataset = &contents.probes[&Key(100)];
    assert_eq!(dataset.decl.label, "a");
    assert_eq!(dataset.decl.period, 1);
    assert_eq!(dataset.samples.len(), 10);
    for sample in &dataset.samples {
        assert_eq!(sample.data(), &[1.0]);
    }
}

#[test]
fn peers_ship_probe_blocks_to_the_writing_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probes.log");
    let options = SimOptions { flush_every: 3, ..SimOptions::default() };

    execute(Config::Process(2), options, |sim| {
        sim.add_signal(0, Key(1), "a0", Tensor::scalar(0.0))?;
        sim.add_signal(1, Key(11), "a1", Tensor::scalar(0.0))?;
        sim.add_op(0, OpSpec::Reset { index: 0.0, dst: vector_view(Key(1), "a0", 1), value: 1.0 })?;
        sim.add_op(1, OpSpec::Reset { index: 0.0, dst: vector_view(Key(11), "a1", 1), value: 2.0 })?;
        sim.add_probe(0, Key(100), Key(1), 1)?;
        sim.add_probe(1, Key(101), Key(11), 2)?;
        sim.finalize_build()?;
        sim.run_n_steps(7, false, Some(&path))?;
        Ok(())
    })
    .unwrap();

    let contents = read_log(&path).unwrap();
    let local = &contents.probes[&Key(100)];
    assert_eq!(local.samples.len(), 7);
    assert_eq!(local.samples[0].data(), &[1.0]);
    // Period 2 over 7 steps: samples at steps 0, 2, 4, 6.
    let shipped = &contents.probes[&Key(101)];
    assert_eq!(shipped.decl.label, "a1");
    assert_eq!(shipped.samples.len(), 4);
    assert_eq!(shipped.samples[3].data(), &[2.0]);
}

#[test]
fn unwritable_log_path_does_not_stop_the_run() {
    let samples = execute_directly(SimOptions::default(), CallbackRegistry::new(), |sim| {
        sim.add_signal(0, Key(1), "a", Tensor::scalar(4.0))?;
        sim.add_probe(0, Key(100), Key(1), 1)?;
        sim.finalize_build()?;
        let bogus = std::path::Path::new("/nonexistent-directory/probes.log");
        sim.run_n_steps(3, false, Some(bogus))?;
        sim.probe_data(Key(100))
    })
    .unwrap();
    // The sink was disabled; flushed blocks are gone but the run completed.
    assert!(samples.is_empty());
}
