//! Built-in pass types
//!
//! Every built-in pass is a [`ToolPass`]: the schema, formats and search
//! point validation live here, the transformation itself in the runner.

use super::{PassOptionSpec, PassSchema, ResolvedConfig, ToolPass};
use crate::artifact::ModelFormat;
use crate::search::{ConditionalSupport, SearchParameter};
use crate::value::OptionValue;
use std::sync::Arc;

/// All built-in passes.
#[must_use]
pub fn builtin_passes() -> Vec<Arc<dyn super::Pass>> {
    vec![
        Arc::new(onnx_conversion()),
        Arc::new(onnx_quantization()),
        Arc::new(onnx_dynamic_quantization()),
        Arc::new(onnx_static_quantization()),
        Arc::new(ort_transformers_optimization()),
        Arc::new(ort_perf_tuning()),
        Arc::new(lora()),
    ]
}

fn null(name: &str) -> PassOptionSpec {
    PassOptionSpec::new(name, OptionValue::Null)
}

fn onnx_conversion() -> ToolPass {
    let schema = PassSchema::new()
        .option(PassOptionSpec::new("target_opset", 13_i64).describe("ONNX opset to export with"))
        .option(PassOptionSpec::new("use_dynamo_exporter", false))
        .option(null("input_shapes"))
        .option(PassOptionSpec::new("save_as_external_data", false))
        .option(PassOptionSpec::new("all_tensors_to_one_file", true));
    ToolPass::builder("OnnxConversion")
        .schema(schema)
        .inputs([ModelFormat::PyTorch, ModelFormat::HuggingFace])
        .output(ModelFormat::Onnx)
        .build()
}

/// Options shared by every quantization flavour.
fn common_quantization() -> PassSchema {
    PassSchema::new()
        .option(
            PassOptionSpec::new("weight_type", "QInt8")
                .searchable(SearchParameter::categorical(["QInt8", "QUInt8"]))
                .describe("Data type for quantizing weights"),
        )
        .option(null("op_types_to_quantize"))
        .option(null("nodes_to_quantize"))
        .option(null("nodes_to_exclude"))
        .option(PassOptionSpec::new("per_channel", false).searchable(SearchParameter::Boolean))
        .option(PassOptionSpec::new("reduce_range", false).searchable(SearchParameter::Boolean))
        .option(PassOptionSpec::new("quant_preprocess", true).searchable(SearchParameter::Boolean))
        .option(PassOptionSpec::new("ActivationSymmetric", false))
        .option(PassOptionSpec::new("WeightSymmetric", true))
        .option(PassOptionSpec::new("EnableSubgraph", false))
        .option(PassOptionSpec::new("ForceQuantizeNoInputCheck", false))
        .option(PassOptionSpec::new("MatMulConstBOnly", false))
        .option(null("extra_options"))
}

/// Calibration data options.
fn static_dataloader() -> PassSchema {
    PassSchema::new()
        .option(null("data_config").describe("Calibration data config"))
        .option(PassOptionSpec::new("batch_size", 1_i64))
}

/// `(quant_format, weight_type) -> activation_type` support.
fn activation_support(prefix: &[&str]) -> Vec<ConditionalSupport> {
    [
        ("QDQ", "QInt8", "QInt8"),
        ("QDQ", "QUInt8", "QUInt8"),
        ("QOperator", "QUInt8", "QUInt8"),
    ]
    .into_iter()
    .map(|(format, weight, activation)| ConditionalSupport {
        when: prefix
            .iter()
            .copied()
            .chain([format, weight])
            .map(OptionValue::from)
            .collect(),
        domain: SearchParameter::categorical([activation]),
    })
    .collect()
}

/// Static-only options. With `gated`, each option is only active when
/// `quant_mode` is `static`.
fn static_optional(gated: bool) -> PassSchema {
    let gate = |domain: SearchParameter| {
        if gated {
            SearchParameter::conditional_on("quant_mode", [(OptionValue::from("static"), domain)])
        } else {
            domain
        }
    };
    let activation = if gated {
        SearchParameter::Conditional {
            parents: vec![
                "quant_mode".to_string(),
                "quant_format".to_string(),
                "weight_type".to_string(),
            ],
            support: activation_support(&["static"]),
            default: None,
        }
    } else {
        SearchParameter::Conditional {
            parents: vec!["quant_format".to_string(), "weight_type".to_string()],
            support: activation_support(&[]),
            default: None,
        }
    };
    PassSchema::new()
        .option(
            PassOptionSpec::new("calibrate_method", "MinMax")
                .searchable(gate(SearchParameter::categorical(["MinMax", "Entropy", "Percentile"]))),
        )
        .option(
            PassOptionSpec::new("quant_format", "QDQ")
                .searchable(gate(SearchParameter::categorical(["QOperator", "QDQ"]))),
        )
        .option(PassOptionSpec::new("activation_type", "QInt8").searchable(activation))
        .option(PassOptionSpec::new("prepare_qnn_config", false))
}

fn opt_str<'a>(config: &'a ResolvedConfig, key: &str) -> Option<&'a str> {
    config.get(key).and_then(OptionValue::as_str)
}

/// Static quantization cannot run with subgraphs, and QOperator has no
/// signed-activation/signed-weight kernel.
fn validate_quantization(config: &ResolvedConfig) -> bool {
    if opt_str(config, "quant_mode") != Some("static") {
        return true;
    }
    if config.get("EnableSubgraph").and_then(OptionValue::as_bool) == Some(true) {
        return false;
    }
    !(opt_str(config, "weight_type") == Some("QInt8")
        && opt_str(config, "activation_type") == Some("QInt8")
        && opt_str(config, "quant_format") == Some("QOperator"))
}

fn onnx_quantization() -> ToolPass {
    let schema = PassSchema::new()
        .option(
            PassOptionSpec::new("quant_mode", "static")
                .searchable(SearchParameter::categorical(["dynamic", "static"]))
                .describe("'dynamic' or 'static' quantization"),
        )
        .extend(common_quantization())
        .extend(static_dataloader())
        .extend(static_optional(true));
    ToolPass::builder("OnnxQuantization")
        .schema(schema)
        .inputs([ModelFormat::Onnx])
        .validator(validate_quantization)
        .build()
}

fn onnx_dynamic_quantization() -> ToolPass {
    let schema = PassSchema::new()
        .option(PassOptionSpec::new("quant_mode", "dynamic"))
        .extend(common_quantization());
    ToolPass::builder("OnnxDynamicQuantization")
        .schema(schema)
        .inputs([ModelFormat::Onnx])
        .build()
}

fn onnx_static_quantization() -> ToolPass {
    let schema = PassSchema::new()
        .option(PassOptionSpec::new("quant_mode", "static"))
        .extend(common_quantization())
        .extend(static_dataloader())
        .extend(static_optional(false));
    ToolPass::builder("OnnxStaticQuantization")
        .schema(schema)
        .inputs([ModelFormat::Onnx])
        .requires_data()
        .validator(validate_quantization)
        .build()
}

fn ort_transformers_optimization() -> ToolPass {
    let schema = PassSchema::new()
        .option(null("model_type").describe("Transformer architecture (bert, gpt2, ...)"))
        .option(PassOptionSpec::new("num_heads", 0_i64))
        .option(PassOptionSpec::new("hidden_size", 0_i64))
        .option(null("optimization_options"))
        .option(null("opt_level"))
        .option(PassOptionSpec::new("use_gpu", false))
        .option(PassOptionSpec::new("only_onnxruntime", false))
        .option(PassOptionSpec::new("float16", false))
        .option(PassOptionSpec::new("input_int32", false))
        .option(PassOptionSpec::new("keep_io_types", true));
    ToolPass::builder("OrtTransformersOptimization")
        .schema(schema)
        .inputs([ModelFormat::Onnx])
        .build()
}

fn ort_perf_tuning() -> ToolPass {
    let schema = PassSchema::new()
        .option(null("data_config"))
        .option(PassOptionSpec::new("batch_size", 1_i64))
        .option(null("input_names"))
        .option(null("input_shapes"))
        .option(PassOptionSpec::new("device", "cpu"))
        .option(null("providers_list"))
        .option(PassOptionSpec::new("io_bind", false).searchable(SearchParameter::Boolean))
        .option(PassOptionSpec::new("enable_cuda_graph", false))
        .option(
            PassOptionSpec::new("execution_mode", "ORT_SEQUENTIAL").searchable(
                SearchParameter::categorical(["ORT_SEQUENTIAL", "ORT_PARALLEL"]),
            ),
        );
    ToolPass::builder("OrtPerfTuning")
        .schema(schema)
        .inputs([ModelFormat::Onnx])
        .build()
}

fn lora() -> ToolPass {
    let schema = PassSchema::new()
        .option(
            PassOptionSpec::new("lora_r", 64_i64)
                .searchable(SearchParameter::categorical([16_i64, 32, 64]))
                .describe("Adapter rank"),
        )
        .option(PassOptionSpec::new("lora_alpha", 16_i64))
        .option(PassOptionSpec::new("lora_dropout", 0.05))
        .option(null("target_modules"))
        .option(PassOptionSpec::new("torch_dtype", "bfloat16"))
        .option(PassOptionSpec::required("train_data_config").describe("Fine-tuning data config"))
        .option(null("eval_data_config"))
        .option(null("training_args"));
    ToolPass::builder("LoRA")
        .schema(schema)
        .inputs([ModelFormat::PyTorch, ModelFormat::HuggingFace])
        .output(ModelFormat::PyTorch)
        .requires_data()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::Pass;
    use crate::search::{FlowSpace, PassValues};
    use std::collections::BTreeMap;

    fn config(pairs: &[(&str, OptionValue)]) -> ResolvedConfig {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_builtin_schemas_validate() {
        for pass in builtin_passes() {
            pass.schema()
                .validate(pass.pass_type())
                .unwrap_or_else(|e| panic!("{}: {e}", pass.pass_type()));
        }
    }

    #[test]
    fn test_quantization_validator() {
        let s8s8 = config(&[
            ("quant_mode", "static".into()),
            ("weight_type", "QInt8".into()),
            ("activation_type", "QInt8".into()),
            ("quant_format", "QOperator".into()),
            ("EnableSubgraph", false.into()),
        ]);
        assert!(!validate_quantization(&s8s8));

        let qdq = config(&[
            ("quant_mode", "static".into()),
            ("weight_type", "QInt8".into()),
            ("activation_type", "QInt8".into()),
            ("quant_format", "QDQ".into()),
            ("EnableSubgraph", false.into()),
        ]);
        assert!(validate_quantization(&qdq));

        let subgraph = config(&[("quant_mode", "static".into()), ("EnableSubgraph", true.into())]);
        assert!(!validate_quantization(&subgraph));

        let dynamic = config(&[("quant_mode", "dynamic".into()), ("EnableSubgraph", true.into())]);
        assert!(validate_quantization(&dynamic));
    }

    #[test]
    fn test_quantization_space_size() {
        let pass = onnx_quantization();
        let params = pass
            .schema()
            .resolve("quantization", &BTreeMap::new(), true, None)
            .unwrap();
        let dimensions = params
            .searchable()
            .iter()
            .map(|opt| crate::search::Dimension {
                pass: "quantization".to_string(),
                option: opt.name.clone(),
                parameter: opt.domain.clone(),
                default: params.default_of(&opt.name).cloned().unwrap_or(OptionValue::Null),
                context: opt.context.clone(),
            })
            .collect();
        let space = FlowSpace {
            flow: "quantization".to_string(),
            dimensions,
            fixed: PassValues::new(),
        };
        // 3 boolean options and weight_type in both modes; static adds
        // calibrate_method(3) x quant_format(2), activation_type has at most
        // one value per (format, weight) pair.
        let dynamic = 2 * 8;
        let static_points = 2 * 8 * 3 * 2;
        assert_eq!(space.cardinality(), Some((dynamic + static_points) as u64));
    }
}
