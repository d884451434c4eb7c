//! Run document resolution against the built-in pass catalog

use passforge::config::{ExecutionOrder, RunConfig};
use passforge::flow::resolve_flows;
use passforge::pass::PassRegistry;
use passforge::search::SearchSpace;
use passforge::{Engine, Error, OptionValue};
use std::collections::BTreeSet;

const DOC: &str = r#"{
    "input_model": {
        "type": "PyTorchModel",
        "config": {"model_path": "resnet.pt", "data_config": "calib"}
    },
    "data_configs": [{"name": "calib", "type": "DummyDataContainer",
                      "params_config": {"max_samples": 4}}],
    "passes": {
        "conversion": {"type": "OnnxConversion"},
        "quantization": {"type": "OnnxQuantization",
                         "config": {"data_config": "__input_model_data_config__"}},
        "perf": {"type": "OrtPerfTuning"}
    },
    "engine": {
        "search_strategy": {"execution_order": "sequential", "search_algorithm": "tpe",
                            "search_algorithm_config": {"num_samples": 5, "seed": 7}},
        "cache_dir": "cache",
        "output_dir": "models"
    }
}"#;

fn parse(doc: &str) -> RunConfig {
    RunConfig::from_json_str(doc).unwrap()
}

#[test]
fn test_searchable_options_are_union_of_schemas() {
    let config = parse(DOC);
    let registry = PassRegistry::with_builtins();
    let flows = resolve_flows(&config, &registry).unwrap();
    let space = SearchSpace::from_flows(&flows);

    let recognized: BTreeSet<(String, String)> = space.option_keys().into_iter().collect();
    let declared: BTreeSet<(String, String)> = config
        .passes
        .iter()
        .flat_map(|(name, pass)| {
            registry
                .get(&pass.pass_type)
                .unwrap()
                .schema()
                .searchable_names()
                .into_iter()
                .map(|option| (name.clone(), option.to_string()))
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(recognized, declared);
    assert!(recognized.contains(&("quantization".to_string(), "quant_mode".to_string())));
}

#[test]
fn test_unknown_option_is_configuration_error() {
    let doc = DOC.replace(
        r#""perf": {"type": "OrtPerfTuning"}"#,
        r#""perf": {"type": "OrtPerfTuning", "config": {"turbo": true}}"#,
    );
    let err = resolve_flows(&parse(&doc), &PassRegistry::with_builtins()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("turbo"));
}

#[test]
fn test_input_model_data_config_substituted() {
    let config = parse(DOC);
    let flows = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap();
    let quantization = flows[0].step("quantization").unwrap();
    let data_config = quantization.params().fixed().get("data_config").unwrap();
    let name = data_config
        .as_map()
        .and_then(|m| m.get("name"))
        .and_then(OptionValue::as_str);
    assert_eq!(name, Some("calib"));
}

#[test]
fn test_sequential_is_pass_by_pass() {
    let config = parse(DOC);
    let strategy = config.engine.search_strategy.unwrap();
    assert_eq!(strategy.execution_order, ExecutionOrder::PassByPass);
    assert_eq!(strategy.search_algorithm_config.num_samples, Some(5));
    assert_eq!(strategy.search_algorithm_config.seed, 7);
}

#[test]
fn test_incompatible_flow_order_rejected() {
    let doc = DOC.replace(
        r#""engine": {"#,
        r#""pass_flows": [["quantization", "conversion"]], "engine": {"#,
    );
    let err = resolve_flows(&parse(&doc), &PassRegistry::with_builtins()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_missing_data_config_reference_rejected() {
    let doc = DOC.replace(
        r#""config": {"data_config": "__input_model_data_config__"}"#,
        r#""config": {"data_config": "nowhere"}"#,
    );
    let err = resolve_flows(&parse(&doc), &PassRegistry::with_builtins()).unwrap_err();
    assert!(err.to_string().contains("nowhere"));
}

#[test]
fn test_engine_builds_from_catalog_document() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DOC
        .replace(r#""cache_dir": "cache""#, &format!(r#""cache_dir": {:?}"#, dir.path().join("cache")))
        .replace(r#""output_dir": "models""#, &format!(r#""output_dir": {:?}"#, dir.path().join("out")));
    let engine = Engine::from_config(parse(&doc)).unwrap();
    assert_eq!(engine.flows().len(), 1);
    assert_eq!(engine.flows()[0].id(), "conversion-quantization-perf");
    assert!(dir.path().join("cache").join("artifacts").is_dir());
}

#[test]
fn test_unknown_search_algorithm_rejected_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DOC
        .replace(r#""tpe""#, r#""annealing""#)
        .replace(r#""cache_dir": "cache""#, &format!(r#""cache_dir": {:?}"#, dir.path().join("cache")));
    let err = Engine::from_config(parse(&doc)).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("annealing"));
}

#[test]
fn test_log_severity_maps_to_directive() {
    let mut config = parse(DOC);
    for (level, directive) in [(0, "passforge=trace"), (1, "passforge=info"), (3, "passforge=error")] {
        config.engine.log_severity_level = level;
        assert_eq!(config.engine.log_directive(), directive);
    }
}
