//! hevcbs-probe - HEVC 码流语法探测工具
//!
//! 读取 Annex B 格式的 H.265 码流, 逐访问单元输出 NAL 与条带段摘要.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser as ClapParser;
use serde::Serialize;

use hevcbs::logging::{self, LoggingConfig};
use hevcbs::parser::{ParseMode, Parser, ParserConfig, Status, TraceLevel};
use hevcbs::report::AuReport;

/// HEVC 码流语法探测工具
#[derive(ClapParser, Debug)]
#[command(name = "hevcbs-probe", version, about = "纯 Rust HEVC 码流语法探测工具")]
struct Cli {
    /// 输入码流路径 (Annex B)
    input: PathBuf,

    /// 解析模式, 逗号分隔: sequential, au, slice, tile, all
    #[arg(long, default_value = "sequential")]
    mode: String,

    /// 工作线程数, 0 表示硬件并发数
    #[arg(long)]
    threads: Option<usize>,

    /// AU 并行时在途访问单元上限
    #[arg(long)]
    async_depth: Option<usize>,

    /// 跟踪掩码, 逗号分隔: nalu, sps, pps, sei, slice_header, ref_list, ctu, sao,
    /// cu, pu, tu, residual, palette, coef, default, all
    #[arg(long)]
    trace: Option<String>,

    /// 从 JSON 文件读取解析器配置, 命令行参数覆盖其中的字段
    #[arg(long)]
    config: Option<PathBuf>,

    /// 日志目录, 指定后写入按日期滚动的日志文件
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// 最多处理的访问单元数
    #[arg(short = 'n', long)]
    max_aus: Option<u64>,

    /// 输出 JSON 格式
    #[arg(long)]
    json: bool,

    /// 只输出汇总
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================
// JSON 输出结构体
// ============================================================

/// 完整探测结果
#[derive(Serialize)]
struct ProbeOutput {
    file: String,
    config: ParserConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    access_units: Vec<AuReport>,
    summary: ProbeSummary,
}

/// 汇总统计
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct ProbeSummary {
    access_units: u64,
    pictures: u64,
    incomplete: u64,
    nals: u64,
    slices: u64,
    ctus: u64,
    bins: u64,
}

impl ProbeSummary {
    fn add(&mut self, report: &AuReport) {
        self.access_units += 1;
        if report.poc.is_some() {
            self.pictures += 1;
        }
        if report.incomplete {
            self.incomplete += 1;
        }
        self.nals += report.nal_count as u64;
        self.slices += report.slices.len() as u64;
        self.ctus += report.ctu_count as u64;
        self.bins += report.bins;
    }
}

// ============================================================
// 参数处理
// ============================================================

fn parse_mode(value: &str) -> Result<ParseMode> {
    let mut mode = ParseMode::SEQUENTIAL;
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        mode |= match name.to_ascii_lowercase().as_str() {
            "sequential" | "seq" => ParseMode::SEQUENTIAL,
            "au" => ParseMode::AU_PARALLEL,
            "slice" => ParseMode::SLICE_PARALLEL,
            "tile" => ParseMode::TILE_PARALLEL,
            "all" => ParseMode::all(),
            other => bail!("未知的解析模式: {}", other),
        };
    }
    Ok(mode)
}

fn parse_trace(value: &str) -> Result<TraceLevel> {
    let mut level = TraceLevel::empty();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let upper = name.to_ascii_uppercase();
        level |= match upper.as_str() {
            "ALL" => TraceLevel::all(),
            _ => TraceLevel::from_name(&upper)
                .with_context(|| format!("未知的跟踪项: {}", name))?,
        };
    }
    Ok(level)
}

fn load_config(path: &Path) -> Result<ParserConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("解析配置文件失败: {}", path.display()))
}

fn build_config(cli: &Cli) -> Result<ParserConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ParserConfig::default(),
    };
    if cli.config.is_none() || cli.mode != "sequential" {
        config.mode = parse_mode(&cli.mode)?;
    }
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }
    if let Some(depth) = cli.async_depth {
        config.async_depth = depth;
    }
    if let Some(trace) = &cli.trace {
        config.trace = parse_trace(trace)?;
    }
    config
        .validate()
        .map_err(|err| anyhow::anyhow!("配置无效: {}", err))?;
    Ok(config)
}

fn init_logging(cli: &Cli) -> Result<()> {
    match &cli.log_dir {
        Some(dir) => {
            let mut config = LoggingConfig::new(dir.to_string_lossy().to_string());
            config.file_prefix = "hevcbs-probe".to_string();
            config.console_level = "warn".to_string();
            if cli.trace.is_some() {
                config.level = "trace".to_string();
            }
            logging::init(config)
        }
        None => {
            env_logger::init();
            Ok(())
        }
    }
}

// ============================================================
// 主逻辑
// ============================================================

fn run(cli: &Cli) -> Result<ProbeSummary> {
    let config = build_config(cli)?;
    log::info!("输入 {}, 配置 {:?}", cli.input.display(), config);

    let mut parser = Parser::open(&cli.input, config.clone())
        .with_context(|| format!("打开码流失败: {}", cli.input.display()))?;

    let mut summary = ProbeSummary::default();
    let mut reports = Vec::new();
    loop {
        if cli.max_aus.is_some_and(|max| summary.access_units >= max) {
            break;
        }
        let mut au = match parser.parse_next_au() {
            Ok(Some(au)) => au,
            Ok(None) => break,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "解析第 {} 个访问单元失败 ({:?}): {}",
                    summary.access_units,
                    Status::from(&err),
                    err
                ));
            }
        };
        let status = parser.sync(&mut au);
        if status != Status::None {
            log::warn!("AU {} 同步状态 {:?}", au.index, status);
        }

        let report = AuReport::from_access_unit(&au);
        summary.add(&report);
        if !cli.quiet {
            if cli.json {
                reports.push(report);
            } else {
                println!("{}", report);
            }
        }
    }

    if cli.json {
        let output = ProbeOutput {
            file: cli.input.display().to_string(),
            config,
            access_units: reports,
            summary,
        };
        let text = serde_json::to_string_pretty(&output).context("序列化输出失败")?;
        println!("{}", text);
        return Ok(output.summary);
    }

    println!(
        "共 {} 个访问单元 ({} 幅图像, {} 个不完整), {} NAL, {} 条带段, {} CTU, {} bins",
        summary.access_units,
        summary.pictures,
        summary.incomplete,
        summary.nals,
        summary.slices,
        summary.ctus,
        summary.bins
    );
    Ok(summary)
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(&cli) {
        eprintln!("错误: 初始化日志失败: {:#}", err);
        process::exit(1);
    }

    match run(&cli) {
        Ok(summary) if summary.incomplete > 0 => process::exit(2),
        Ok(_) => {}
        Err(err) => {
            eprintln!("错误: {:#}", err);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["hevcbs-probe"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("参数解析失败")
    }

    #[test]
    fn test_parse_mode_combinations() {
        assert_eq!(parse_mode("sequential").unwrap(), ParseMode::SEQUENTIAL);
        assert_eq!(
            parse_mode("au, tile").unwrap(),
            ParseMode::AU_PARALLEL | ParseMode::TILE_PARALLEL
        );
        assert_eq!(parse_mode("ALL").unwrap(), ParseMode::all());
        assert!(parse_mode("frame").is_err());
    }

    #[test]
    fn test_parse_trace_names() {
        assert_eq!(
            parse_trace("sps,slice_header").unwrap(),
            TraceLevel::SPS | TraceLevel::SLICE_HEADER
        );
        assert_eq!(parse_trace("default").unwrap(), TraceLevel::DEFAULT);
        assert_eq!(parse_trace("all").unwrap(), TraceLevel::all());
        assert!(parse_trace("pixels").is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let cli = cli(&["in.265", "--mode", "slice", "--threads", "2", "--trace", "nalu"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.mode, ParseMode::SLICE_PARALLEL);
        assert_eq!(config.threads, 2);
        assert_eq!(config.trace, TraceLevel::NALU);
        assert_eq!(config.async_depth, ParserConfig::default().async_depth);
    }

    #[test]
    fn test_build_config_from_json_file() {
        let stored = ParserConfig {
            mode: ParseMode::AU_PARALLEL,
            async_depth: 3,
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&stored).unwrap().as_bytes())
            .unwrap();
        file.flush().unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = build_config(&cli(&["in.265", "--config", path.as_str()])).unwrap();
        assert_eq!(config, stored);

        // 命令行参数覆盖文件中的字段
        let config =
            build_config(&cli(&["in.265", "--config", path.as_str(), "--async-depth", "7"])).unwrap();
        assert_eq!(config.mode, ParseMode::AU_PARALLEL);
        assert_eq!(config.async_depth, 7);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cli = cli(&["in.265", "--async-depth", "0"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_missing_input_fails() {
        let cli = cli(&["/nonexistent/input.265", "--quiet"]);
        let err = run(&cli).unwrap_err();
        assert!(format!("{:#}", err).contains("打开码流失败"));
    }
}
