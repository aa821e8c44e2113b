use fvlinear::settings::{KrylovMethod, LinearSolverSettings, LinearizerSettings};
use fvlinear::Error;

#[test]
fn empty_json_gives_defaults() {
    assert_eq!(LinearSolverSettings::from_json_str("{}").unwrap(), LinearSolverSettings::default());
    assert_eq!(LinearizerSettings::from_json_str("{}").unwrap(), LinearizerSettings::default());
}

#[test]
fn json_overrides_individual_fields() {
    let settings = LinearSolverSettings::from_json_str(r#"{ "overlap_size": 1, "method": "Cg" }"#).unwrap();
    assert_eq!(settings.overlap_size, 1);
    assert_eq!(settings.method, KrylovMethod::Cg);
    assert_eq!(settings.tolerance, LinearSolverSettings::default().tolerance);

    let settings =
        LinearizerSettings::from_json_str(r#"{ "enable_constraints": true, "num_threads": 3 }"#).unwrap();
    assert!(settings.enable_constraints);
    assert_eq!(settings.num_threads, Some(3));
    assert!(!settings.use_linearization_lock);
}

#[test]
fn settings_survive_json() {
    let settings = LinearSolverSettings {
        verbosity: 2,
        preconditioner_order: 3,
        ..LinearSolverSettings::default()
    };
    let json = settings.to_json_string().unwrap();
    assert_eq!(LinearSolverSettings::from_json_str(&json).unwrap(), settings);
}

#[test]
fn malformed_json_is_a_configuration_error() {
    let result = LinearSolverSettings::from_json_str(r#"{ "overlap_size": -1 }"#);
    assert!(matches!(result, Err(Error::Configuration(_))));
    let result = LinearizerSettings::from_json_str("not json");
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn validation_rejects_bad_tolerances_and_relaxation() {
    assert!(LinearSolverSettings::default().validate().is_ok());

    let negative = LinearSolverSettings {
        tolerance: -1e-3,
        ..LinearSolverSettings::default()
    };
    assert!(matches!(negative.validate(), Err(Error::Configuration(_))));

    let nan = LinearSolverSettings {
        abs_tolerance: f64::NAN,
        ..LinearSolverSettings::default()
    };
    assert!(nan.validate().is_err());

    let zero_relaxation = LinearSolverSettings {
        preconditioner_relaxation: 0.0,
        ..LinearSolverSettings::default()
    };
    assert!(zero_relaxation.validate().is_err());
}
