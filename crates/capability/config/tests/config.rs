use kiln_config::{AppConfig, ConfigError, load_schema, parse_schema};
use std::io::Write;

// 环境变量是进程级共享状态，所有 from_env 断言放在同一个测试里串行执行。
#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("KILN_HTTP_ADDR", "127.0.0.1:8081");
        std::env::set_var("KILN_SIMULATED", "true");
        std::env::set_var("KILN_SIM_SEED", "42");
        std::env::set_var("KILN_FLUSH_BATCH_SIZE", "10");
        std::env::remove_var("KILN_STORE_URL");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.http_addr, "127.0.0.1:8081");
    assert!(config.simulated);
    assert_eq!(config.sim_seed, Some(42));
    assert_eq!(config.flush_batch_size, 10);
    assert_eq!(config.poll_interval_ms, 5000);
    assert_eq!(config.heartbeat_timeout_secs, 45);
    assert_eq!(config.feed_window_size, 36);
    assert!(config.store_url.is_none());

    unsafe {
        std::env::set_var("KILN_LINK_PORT", "not-a-port");
    }
    let err = AppConfig::from_env().expect_err("invalid port");
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "KILN_LINK_PORT"));

    unsafe {
        std::env::remove_var("KILN_LINK_PORT");
        std::env::set_var("KILN_SIM_ERROR_RATE", "1.5");
    }
    let err = AppConfig::from_env().expect_err("rate out of range");
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "KILN_SIM_ERROR_RATE"));

    unsafe {
        std::env::remove_var("KILN_SIM_ERROR_RATE");
    }
}

#[test]
fn schema_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        r#"{{"blocks":[{{"block_id":8,"name":"weigh","size":14,
            "modules":[{{"module_id":"weight","device_id":"hopper_1",
            "device_type":"short_hopper","kind":"weight",
            "byte_offset":0,"byte_length":14}}]}}]}}"#
    )
    .expect("write");

    let schema = load_schema(file.path()).expect("schema");
    assert_eq!(schema.blocks.len(), 1);
    assert_eq!(schema.module_count(), 1);
    assert_eq!(schema.blocks[0].modules[0].device_id, "hopper_1");
}

#[test]
fn schema_errors_name_the_problem() {
    let err = load_schema("/nonexistent/device_schema.json").expect_err("missing file");
    assert!(matches!(err, ConfigError::SchemaRead(..)));

    let err = parse_schema(r#"{"blocks":[{"block_id":"eight"}]}"#).expect_err("bad json");
    assert!(matches!(err, ConfigError::SchemaParse(..)));
}
