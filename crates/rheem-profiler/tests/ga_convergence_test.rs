//! Learner convergence on a synthesized execution log

use rheem_common::{CardinalityEstimate, Configuration};
use rheem_core::platform::state::{OperatorExecution, PartialExecution};
use rheem_core::profiling::ExecutionLog;
use rheem_profiler::GeneticOptimizerApp;

/// Synthesize records following `duration = 100 * in0 + 5000` with a small
/// deterministic multiplicative wobble standing in for measurement noise.
fn synthesize_log(path: &std::path::Path, records: usize) {
    let log = ExecutionLog::open_at(path).unwrap();
    for i in 0..records {
        let cardinality = (i as u64 + 1) * 10;
        let exact = 100.0 * cardinality as f64 + 5000.0;
        // +/- 5%, spread deterministically over the records.
        let noise = 1.0 + 0.05 * ((i as f64 * 2.399).sin());
        let millis = (exact * noise).round() as u64;
        log.append(&PartialExecution {
            measured_execution_millis: millis,
            operator_executions: vec![OperatorExecution {
                operator_name: "TestMapOperator".to_string(),
                configuration_key: Some("rheem.test.map.load".to_string()),
                input_cardinalities: vec![Some(CardinalityEstimate::exact(cardinality))],
                output_cardinalities: vec![],
                num_executions: 1,
            }],
            initialized_platforms: vec!["test".to_string()],
        })
        .unwrap();
    }
    log.flush().unwrap();
}

fn learner_configuration(log_path: &std::path::Path) -> Configuration {
    let mut configuration = Configuration::new();
    configuration.set("rheem.core.log.executions", log_path.display().to_string());
    // Loads are already expressed in milliseconds.
    configuration.set("rheem.test.speed.cpu", "1.0");
    configuration.set("rheem.profiler.ga.maxgenerations", "3000");
    configuration.set("rheem.profiler.ga.maxstablegenerations", "500");
    configuration.set("rheem.profiler.ga.superoptimizations", "2");
    configuration.set("rheem.profiler.ga.population", "40");
    configuration
}

#[test]
fn test_learner_recovers_linear_coefficients() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("executions.json");
    synthesize_log(&log_path, 200);

    let mut app = GeneticOptimizerApp::new(learner_configuration(&log_path)).unwrap();
    let model = app.run().unwrap();

    let a = model.coefficients["rheem.test.map.load.in0"];
    // The constant term splits between the operator offset and the
    // platform initialization overhead.
    let b = model.coefficients["rheem.test.map.load.offset"]
        + model.coefficients.get("test.overhead").copied().unwrap_or(0.0);

    assert!(
        (a - 100.0).abs() / 100.0 < 0.05,
        "fitted a = {a}, fitness = {}",
        model.fitness
    );
    assert!(
        (b - 5000.0).abs() / 5000.0 < 0.10,
        "fitted b = {b}, fitness = {}",
        model.fitness
    );
}

#[test]
fn test_learner_is_deterministic_for_a_fixed_seed() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("executions.json");
    synthesize_log(&log_path, 60);

    let run = || {
        let mut configuration = learner_configuration(&log_path);
        configuration.set("rheem.profiler.ga.maxgenerations", "300");
        configuration.set("rheem.profiler.ga.maxstablegenerations", "100");
        configuration.set("rheem.profiler.ga.seed", "1234");
        let mut app = GeneticOptimizerApp::new(configuration).unwrap();
        app.run().unwrap().coefficients
    };
    // Bitwise identical coefficients across runs.
    assert_eq!(run(), run());
}
