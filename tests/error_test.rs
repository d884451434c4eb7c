//! Tests for error types

use passforge::{Error, TrialFailure};

#[test]
fn test_configuration_error() {
    let error = Error::config("unknown pass type 'Foo'");
    let error_str = format!("{error}");
    assert!(error_str.contains("Configuration error"));
    assert!(error_str.contains("unknown pass type 'Foo'"));
    assert!(error_str.contains("Fix the run configuration"));
    assert!(!error.is_local());
}

#[test]
fn test_pass_execution_error() {
    let error = Error::pass("quantization", "tool exited with status 2");
    let error_str = format!("{error}");
    assert!(error_str.contains("Pass 'quantization' failed"));
    assert!(error_str.contains("status 2"));
    assert!(error.is_local());
}

#[test]
fn test_cache_corruption_error() {
    let error = Error::CacheCorruption {
        key: "ab12".to_string(),
        message: "expected value at line 1".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Cache entry ab12 is corrupt"));
    assert!(error.is_local());
}

#[test]
fn test_no_successful_trials_lists_failures() {
    let error = Error::NoSuccessfulTrials {
        failures: vec![
            TrialFailure {
                point: "1a2b3c4d".to_string(),
                flow: "conversion-quantization".to_string(),
                cause: "Pass 'quantization' failed: boom".to_string(),
            },
            TrialFailure {
                point: "5e6f7a8b".to_string(),
                flow: "conversion".to_string(),
                cause: "Evaluation failed: no scorer".to_string(),
            },
        ],
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("No successful trials (2 failed)"));
    assert!(error_str.contains("[1a2b3c4d @ conversion-quantization] Pass 'quantization' failed: boom"));
    assert!(error_str.contains("[5e6f7a8b @ conversion]"));
    assert!(!error.is_local());
}

#[test]
fn test_trial_local_classes() {
    assert!(Error::Evaluation("nan".to_string()).is_local());
    assert!(Error::DataLoader("missing file".to_string()).is_local());
    assert!(Error::Execution("docker not found".to_string()).is_local());
    assert!(!Error::Other("pool".to_string()).is_local());
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "model.onnx");
    let error: Error = io_error.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}
