use std::fs;
use std::path::Path;

use hevcbs::logging::{LoggingConfig, init};
use hevcbs::parser::synth::{
    PictureSpec, StreamBuilder, StreamParams, write_pps_rbsp,
};
use hevcbs::parser::{NalUnitType, ParseMode, Parser, ParserConfig};

// 注意: 全局订阅器只能初始化一次, 本文件中只有一个测试调用 init()

fn today_log_path(dir: &Path, prefix: &str) -> std::path::PathBuf {
    let today = chrono::Local::now().date_naive();
    dir.join(format!("{}.{}.log", prefix, today.format("%Y-%m-%d")))
}

/// PPS 引用不存在的 SPS, 解析器会通过 log 门面输出警告
fn stream_with_orphan_pps() -> Vec<u8> {
    let params = StreamParams::default();
    let orphan = StreamParams {
        pps_id: 3,
        sps_id: 9,
        ..params.clone()
    };
    let mut builder = StreamBuilder::new(params);
    builder
        .parameter_sets()
        .nal(NalUnitType::Pps, &write_pps_rbsp(&orphan))
        .picture(&PictureSpec::idr());
    builder.into_bytes()
}

#[test]
fn test_init_routes_tracing_and_log_records_to_file() {
    let dir = tempfile::TempDir::new().expect("创建临时目录失败");
    let log_dir = dir.path().join("nested").join("logs");
    let config = LoggingConfig {
        level: "info".to_string(),
        directory: log_dir.to_string_lossy().to_string(),
        file_prefix: "probe-test".to_string(),
        console_level: "error".to_string(),
        retention_days: 7,
    };

    init(config.clone()).expect("日志初始化失败");
    assert!(log_dir.exists(), "嵌套日志目录应该被创建");
    assert!(init(config).is_err(), "重复初始化应该失败");

    tracing::info!("信息日志_INFO_MSG");
    tracing::debug!("调试日志_DEBUG_MSG");

    let config = ParserConfig {
        mode: ParseMode::SEQUENTIAL,
        ..Default::default()
    };
    let mut parser = Parser::from_bytes(stream_with_orphan_pps(), config).expect("创建解析器失败");
    while let Some(mut au) = parser.parse_next_au().expect("解析失败") {
        parser.sync(&mut au);
    }

    std::thread::sleep(std::time::Duration::from_millis(200));

    let log_file = today_log_path(&log_dir, "probe-test");
    let content = fs::read_to_string(&log_file)
        .unwrap_or_else(|e| panic!("读取日志文件失败: {:?}, 错误: {}", log_file, e));

    assert!(content.contains("信息日志_INFO_MSG"), "应该包含 tracing 记录");
    assert!(content.contains("INFO"), "日志应该包含级别标记");
    assert!(!content.contains("调试日志_DEBUG_MSG"), "debug 日志应该被过滤掉");
    // 解析器经 log 门面输出的警告也写入同一文件
    assert!(content.contains("WARN"), "应该包含解析器的警告, 文件内容:\n{}", content);
}

#[test]
fn test_logging_config_from_json() {
    let json = r#"{
        "level": "debug",
        "directory": "logs",
        "file_prefix": "hevcbs-probe",
        "retention_days": 3
    }"#;
    let config: LoggingConfig = serde_json::from_str(json).expect("解析配置失败");
    assert_eq!(config.file_prefix, "hevcbs-probe");
    assert_eq!(config.retention_days, 3);
    assert_eq!(config.console_level, "info", "控制台级别默认 info");
}

#[test]
fn test_logging_config_new_defaults() {
    let config = LoggingConfig::new("logs");
    assert_eq!(config.directory, "logs");
    assert_eq!(config.file_prefix, "hevcbs");
    assert_eq!(config.level, "debug");
    assert_eq!(config.retention_days, 30, "默认保留天数应该是 30");
}
