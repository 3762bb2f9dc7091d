use super::LoggingConfig;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use std::fs;
use std::path::Path;

/// 删除早于保留期限的日志文件, 只处理 `<prefix>.<YYYY-MM-DD>.log`
pub fn cleanup_logs(config: &LoggingConfig) -> Result<usize> {
    let directory = Path::new(&config.directory);
    if config.retention_days <= 0 || !directory.exists() {
        return Ok(0);
    }

    let today = Local::now().date_naive();
    let cutoff = today - ChronoDuration::days(config.retention_days);

    let mut removed = 0;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let date = match parse_log_name(&file_name, &config.file_prefix) {
            Some(date) => date,
            None => continue,
        };
        if date < cutoff && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

fn parse_log_name(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date_part = file_name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    if date_part.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::super::build_log_path;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_log_name() {
        let prefix = "worker";
        assert_eq!(
            parse_log_name("worker.2026-02-06.log", prefix),
            NaiveDate::from_ymd_opt(2026, 2, 6)
        );
        assert!(parse_log_name("worker.log", prefix).is_none());
        assert!(parse_log_name("other.2026-02-06.log", prefix).is_none());
        assert!(parse_log_name("worker.2026-02-06.log.gz", prefix).is_none());
    }

    #[test]
    fn test_cleanup_removes_expired_files_only() {
        let temp_dir = match TempDir::new() {
            Ok(temp_dir) => temp_dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let mut config = LoggingConfig::new(temp_dir.path().to_string_lossy().to_string());
        config.file_prefix = "worker".to_string();
        config.retention_days = 7;

        let today = Local::now().date_naive();
        let old = build_log_path(temp_dir.path(), "worker", today - ChronoDuration::days(30));
        let recent = build_log_path(temp_dir.path(), "worker", today - ChronoDuration::days(1));
        let foreign = temp_dir.path().join("notes.txt");
        for path in [&old, &recent, &foreign] {
            assert!(fs::write(path, b"x").is_ok());
        }

        let removed = cleanup_logs(&config);
        assert!(matches!(removed, Ok(1)), "清理结果: {:?}", removed);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let temp_dir = match TempDir::new() {
            Ok(temp_dir) => temp_dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let mut config = LoggingConfig::new(temp_dir.path().to_string_lossy().to_string());
        config.retention_days = 0;
        let old = build_log_path(
            temp_dir.path(),
            &config.file_prefix,
            Local::now().date_naive() - ChronoDuration::days(365),
        );
        assert!(fs::write(&old, b"x").is_ok());
        assert!(matches!(cleanup_logs(&config), Ok(0)));
        assert!(old.exists());
    }
}
