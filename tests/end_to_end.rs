//! 合成码流的端到端解析与模式一致性.

use std::io::Write;

use hevcbs::core::Status;
use hevcbs::parser::synth::{CuPattern, PictureSpec, StreamBuilder, StreamParams};
use hevcbs::parser::{ParseMode, Parser, ParserConfig};
use hevcbs::report::AuReport;

fn build_stream(params: StreamParams, pics: &[PictureSpec]) -> Vec<u8> {
    let mut builder = StreamBuilder::new(params);
    builder.parameter_sets();
    for pic in pics {
        builder.picture(pic);
    }
    builder.into_bytes()
}

fn collect_reports(mut parser: Parser) -> Vec<AuReport> {
    let mut reports = Vec::new();
    while let Some(mut au) = parser.parse_next_au().expect("解析失败") {
        assert_eq!(parser.sync(&mut au), Status::None, "AU {} 同步失败", au.index);
        reports.push(AuReport::from_access_unit(&au));
    }
    reports
}

fn parse_reports(data: &[u8], mode: ParseMode) -> Vec<AuReport> {
    let config = ParserConfig {
        mode,
        threads: 3,
        async_depth: 3,
        ..Default::default()
    };
    collect_reports(Parser::from_bytes(data.to_vec(), config).expect("创建解析器失败"))
}

/// 分块 + 依赖条带段 + SAO + 时域运动预测的 GOP
fn mixed_gop() -> Vec<u8> {
    let params = StreamParams {
        width: 128,
        height: 64,
        tile_columns: 2,
        dependent_slices: true,
        sao: true,
        temporal_mvp: true,
        ..Default::default()
    };
    // 8x4 CTB, 两列分块: ts 0-15 与 16-31
    let pics = [
        PictureSpec::idr().segments(&[(0, false), (8, true), (16, false)]),
        PictureSpec::trail_p(1).temporal_mvp(true),
        PictureSpec::trail_p(2)
            .temporal_mvp(true)
            .pattern(CuPattern::SplitIntra(-1)),
        PictureSpec::trail_p(3)
            .temporal_mvp(true)
            .segments(&[(0, false), (16, false)]),
    ];
    build_stream(params, &pics)
}

#[test]
fn test_gop_report() {
    let reports = parse_reports(&mixed_gop(), ParseMode::SEQUENTIAL);
    assert_eq!(reports.len(), 4);

    let idr = &reports[0];
    assert_eq!(idr.poc, Some(0));
    assert!(!idr.incomplete);
    assert_eq!(idr.ctu_count, 32);
    assert_eq!(idr.nals[0].nal_type, "VPS_NUT");
    // 条带段地址为光栅扫描地址: ts 8 -> 第 2 行首, ts 16 -> 第 4 列
    let addrs: Vec<u32> = idr.slices.iter().map(|s| s.address).collect();
    assert_eq!(addrs, vec![0, 16, 4]);
    assert!(idr.slices[1].dependent);
    assert!(idr.slices.iter().all(|s| s.slice_type == "I"));

    for (poc, report) in reports.iter().enumerate().skip(1) {
        assert_eq!(report.poc, Some(poc as i32));
        assert!(!report.incomplete, "POC {} 不完整", poc);
        assert_eq!(report.ctu_count, 32);
        for slice in &report.slices {
            assert_eq!(slice.slice_type, "P");
            assert_eq!(slice.l0, vec![poc as i32 - 1]);
            assert!(!slice.corrupted && !slice.partial);
        }
    }
    // 8x8 CU 划分
    assert_eq!(reports[2].slices[0].cus, 32 * 4);
}

#[test]
fn test_every_mode_matches_sequential() {
    let data = mixed_gop();
    let reference = parse_reports(&data, ParseMode::SEQUENTIAL);
    for mode in [
        ParseMode::AU_PARALLEL,
        ParseMode::SLICE_PARALLEL,
        ParseMode::TILE_PARALLEL,
        ParseMode::all(),
    ] {
        assert_eq!(parse_reports(&data, mode), reference, "模式 {:?}", mode);
    }
}

#[test]
fn test_file_input_matches_memory_input() {
    let data = mixed_gop();
    let mut file = tempfile::NamedTempFile::new().expect("创建临时文件失败");
    file.write_all(&data).expect("写入临时文件失败");
    file.flush().expect("刷新临时文件失败");

    let config = ParserConfig {
        window_size: 4096,
        ..Default::default()
    };
    let parser = Parser::open(file.path(), config).expect("打开文件失败");
    assert_eq!(
        collect_reports(parser),
        parse_reports(&data, ParseMode::SEQUENTIAL)
    );
}

#[test]
fn test_report_serializes_to_json() {
    let reports = parse_reports(&mixed_gop(), ParseMode::SEQUENTIAL);
    let json = serde_json::to_value(&reports[1]).expect("序列化失败");
    assert_eq!(json["poc"], 1);
    assert_eq!(json["slices"][0]["slice_type"], "P");
    assert_eq!(json["slices"][0]["l0"][0], 0);
    assert!(json["nals"][0].get("error").is_none(), "无错误时省略 error 字段");

    let text = reports[1].to_string();
    assert!(text.starts_with("AU #1 POC 1"), "文本摘要: {}", text);
}

#[test]
fn test_version() {
    assert!(!hevcbs::version().is_empty());
}
