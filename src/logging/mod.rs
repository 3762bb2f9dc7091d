//! 日志初始化.
//!
//! 控制台与按日期滚动的文件两路输出. 库 crate 通过 `log` 门面记录,
//! 订阅器初始化时同时安装 `log` 桥接, 两类记录进入同一套输出.

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

mod retention;

pub use retention::cleanup_logs;

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 文件输出的过滤级别, 支持 `EnvFilter` 语法
    pub level: String,
    pub directory: String,
    pub file_prefix: String,
    /// 控制台输出的过滤级别
    #[serde(default = "default_console_level")]
    pub console_level: String,
    /// 保留天数, 0 表示不清理
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> i64 {
    30
}

impl LoggingConfig {
    /// 以给定目录构造默认配置
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            level: "debug".to_string(),
            directory: directory.into(),
            file_prefix: "hevcbs".to_string(),
            console_level: default_console_level(),
            retention_days: default_retention_days(),
        }
    }
}

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// 初始化全局订阅器, 进程内只能调用一次
pub fn init(config: LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("创建日志目录失败, path={}", config.directory))?;

    if let Err(err) = cleanup_logs(&config) {
        eprintln!("启动时清理日志失败: {:#}", err);
    }

    let file_appender = DailyFileWriter::new(config.clone())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let console_filter = EnvFilter::try_new(&config.console_level)
        .with_context(|| format!("无效的控制台日志级别: {}", config.console_level))?;
    let file_filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("无效的文件日志级别: {}", config.level))?;

    let console_layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(ConsoleFormatter)
        .with_filter(console_filter);

    let file_layer = fmt::Layer::default()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    // try_init 同时安装 log -> tracing 桥接
    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("全局日志订阅器已初始化")?;

    Ok(())
}

/// 按本地日期写入 `<prefix>.<YYYY-MM-DD>.log`, 跨日时切换文件并清理过期日志
struct DailyFileWriter {
    config: LoggingConfig,
    date: NaiveDate,
    file: File,
}

impl DailyFileWriter {
    fn new(config: LoggingConfig) -> Result<Self> {
        let date = Local::now().date_naive();
        let file_path = build_log_path(Path::new(&config.directory), &config.file_prefix, date);
        let file = open_append_file(&file_path)?;
        Ok(Self { config, date, file })
    }

    fn roll_over(&mut self, date: NaiveDate) -> std::io::Result<()> {
        let file_path = build_log_path(
            Path::new(&self.config.directory),
            &self.config.file_prefix,
            date,
        );
        self.file.flush()?;
        self.file = open_append_file(&file_path).map_err(std::io::Error::other)?;
        self.date = date;
        if let Err(err) = cleanup_logs(&self.config) {
            eprintln!("翻滚后清理日志失败: {:#}", err);
        }
        Ok(())
    }
}

impl Write for DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let today = Local::now().date_naive();
        if today != self.date {
            self.roll_over(today)?;
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn open_append_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("打开日志文件失败, path={}", path.display()))
}

pub(crate) fn build_log_path(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}

// ============================================================
// 格式化
// ============================================================

struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        let meta = event.metadata();
        write!(
            writer,
            "[{:02}:{:02}:{:02}.{:03}] ",
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis()
        )?;
        let color = match *meta.level() {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        };
        write!(
            writer,
            "{}{:5}\x1b[0m {} > ",
            color,
            meta.level().to_string(),
            meta.target()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        let meta = event.metadata();
        write!(
            writer,
            "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] {:5} {} > ",
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis(),
            meta.level().to_string(),
            meta.target()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_log_path() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 6);
        match date {
            Some(date) => {
                let path = build_log_path(Path::new("logs"), "hevcbs", date);
                assert_eq!(path, PathBuf::from("logs/hevcbs.2026-02-06.log"));
            }
            None => panic!("测试日期初始化失败"),
        }
    }

    #[test]
    fn test_config_defaults_from_json() {
        let json = r#"{"level":"trace","directory":"logs","file_prefix":"probe"}"#;
        let config: LoggingConfig = match serde_json::from_str(json) {
            Ok(config) => config,
            Err(err) => panic!("解析日志配置失败: {}", err),
        };
        assert_eq!(config.level, "trace");
        assert_eq!(config.console_level, "info");
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn test_writer_appends_to_dated_file() {
        let dir = match tempfile::TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let config = LoggingConfig::new(dir.path().to_string_lossy().to_string());
        let mut writer = match DailyFileWriter::new(config.clone()) {
            Ok(writer) => writer,
            Err(err) => panic!("创建日志写入器失败: {}", err),
        };
        assert!(writer.write_all(b"line\n").is_ok());
        assert!(writer.flush().is_ok());

        let path = build_log_path(dir.path(), &config.file_prefix, writer.date);
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(content, "line\n");
    }
}
