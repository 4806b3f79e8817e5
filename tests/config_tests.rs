//! Integration tests for configuration loading from disk and the services
//! built from it.

use std::io::Write;

use tokio_completion_orchestrator::config::{self, loader, LogFormat};
use tokio_completion_orchestrator::engine::PromptStrategy;
use tokio_completion_orchestrator::memory::MIB;
use tokio_completion_orchestrator::{ConfigError, EngineConfig};

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write");
    file
}

#[test]
fn test_full_file_loads_every_section() {
    let file = write_temp(
        r#"
[pool]
program = "/opt/tokenizer"
args = ["--model", "codet5p"]
pool_size = 4

[memory]
safety_margin_mb = 128
budget_mb = 2048

[routing]
simple_threshold = 0.2
complex_threshold = 0.6

[cache]
capacity = 1

[generation]
max_new_tokens = 24
start_token_id = 0
end_token_id = 2
default_strategy = "language_aware"

[attention]
bytes_per_token_per_layer = 4096

[observability]
log_format = "json"
"#,
    );

    let cfg = loader::load_from_file(file.path()).expect("valid config");
    assert_eq!(cfg.pool.args, vec!["--model", "codet5p"]);
    assert_eq!(cfg.pool.pool_size, 4);
    assert_eq!(cfg.memory.safety_margin_bytes(), 128 * MIB);
    assert!((cfg.routing.simple_threshold - 0.2).abs() < f64::EPSILON);
    assert_eq!(cfg.cache.capacity, 1);
    assert_eq!(cfg.generation.end_token_id, 2);
    assert_eq!(cfg.generation.default_strategy, PromptStrategy::LanguageAware);
    assert_eq!(cfg.attention.bytes_per_token_per_layer, 4096);
    assert_eq!(cfg.observability.log_format, LogFormat::Json);

    let accountant = cfg.accountant();
    assert_eq!(accountant.safety_margin(), 128 * MIB);
    assert_eq!(cfg.attention_manager().active_sessions(), 0);
}

#[test]
fn test_invalid_file_lists_every_violation() {
    let file = write_temp(
        "[pool]\npool_size = 64\n[routing]\nsimple_threshold = 0.9\ncomplex_threshold = 0.1\n[generation]\nmax_new_tokens = 0\n",
    );
    let err = loader::load_from_file(file.path()).expect_err("invalid config");
    let ConfigError::Validation(message) = err else {
        panic!("expected validation error, got {err}");
    };
    assert!(message.contains("pool.pool_size"));
    assert!(message.contains("routing"));
    assert!(message.contains("generation.max_new_tokens"));
}

#[test]
fn test_unknown_strategy_is_a_parse_error() {
    let file = write_temp("[generation]\ndefault_strategy = \"chain_of_thought\"\n");
    let err = loader::load_from_file(file.path()).expect_err("unknown variant");
    assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
}

#[test]
fn test_defaults_validate_and_schema_exports() {
    assert!(loader::load_from_str("", "defaults").is_ok());
    assert_eq!(EngineConfig::default().pool.program, "byte_tokenizer");

    let schema = config::export_schema().expect("schema");
    let value: serde_json::Value = serde_json::from_str(&schema).expect("json");
    assert!(value["properties"]["pool"].is_object());
    assert!(value["properties"]["generation"].is_object());
}
