use super::super::control::ParseMode;
use super::super::orchestrator::Parser;

use super::helpers::*;
use crate::synth::{CuPattern, PictureSpec, StreamParams};

const MODES: [ParseMode; 5] = [
    ParseMode::SEQUENTIAL,
    ParseMode::AU_PARALLEL,
    ParseMode::SLICE_PARALLEL,
    ParseMode::TILE_PARALLEL,
    ParseMode::AU_PARALLEL
        .union(ParseMode::SLICE_PARALLEL)
        .union(ParseMode::TILE_PARALLEL),
];

fn assert_modes_agree(data: Vec<u8>) {
    let reference: Vec<AuSummary> = parse_all(data.clone(), ParseMode::SEQUENTIAL)
        .iter()
        .map(summarize)
        .collect();
    assert!(!reference.is_empty());
    for au in &reference {
        assert!(!au.incomplete, "顺序解码不应出错: {:?}", au);
    }
    for mode in MODES.iter().skip(1) {
        let got: Vec<AuSummary> = parse_all(data.clone(), *mode).iter().map(summarize).collect();
        assert_eq!(got, reference, "模式 {:?} 的输出与顺序解码不一致", mode);
    }
}

#[test]
fn test_modes_agree_on_tiles_and_slices() {
    let params = StreamParams {
        tile_columns: 2,
        tile_rows: 2,
        dependent_slices: true,
        sao: true,
        ..Default::default()
    };
    // 2x2 分块: ts 0-1, 2-3, 4-7, 8-11
    let pics = [
        PictureSpec::idr().segments(&[(0, false), (2, true), (4, false), (8, true), (10, true)]),
        PictureSpec::trail_p(1).segments(&[(0, false), (4, false)]),
        PictureSpec::trail_p(2).pattern(CuPattern::SplitIntra(1)),
    ];
    assert_modes_agree(build_stream(params, &pics));
}

#[test]
fn test_modes_agree_on_wavefront() {
    let params = StreamParams {
        wpp: true,
        dependent_slices: true,
        temporal_mvp: true,
        ..Default::default()
    };
    let pics = [
        PictureSpec::idr().segments(&[(0, false), (6, true), (8, true)]),
        PictureSpec::trail_p(1).temporal_mvp(true),
        PictureSpec::trail_p(2).temporal_mvp(true).segments(&[(0, false), (8, false)]),
        PictureSpec::trail_p(3).temporal_mvp(true),
    ];
    assert_modes_agree(build_stream(params, &pics));
}

#[test]
fn test_au_parallel_long_sequence_stays_in_order() {
    let params = StreamParams {
        temporal_mvp: true,
        ..Default::default()
    };
    let mut pics = vec![PictureSpec::idr()];
    pics.extend((1..20).map(|poc| PictureSpec::trail_p(poc).temporal_mvp(true)));
    let data = build_stream(params, &pics);

    let mut cfg = config(ParseMode::AU_PARALLEL);
    cfg.async_depth = 2;
    let mut parser = Parser::from_bytes(data, cfg).unwrap();

    // 先取出全部访问单元, 再逆序同步
    let mut aus = Vec::new();
    while let Some(au) = parser.parse_next_au().unwrap() {
        aus.push(au);
    }
    assert_eq!(aus.len(), 20);
    for au in aus.iter_mut().rev() {
        assert!(parser.sync(au).is_ok());
        assert!(au.is_ready());
    }
    for (i, au) in aus.iter().enumerate() {
        assert_eq!(au.index, i as u64);
        assert_eq!(au.poc, Some(i as i32));
        assert_eq!(au.stats.ctu_count, 12);
        assert!(!au.incomplete, "AU {} 不完整", i);
    }
}

#[test]
fn test_dropping_unsynced_units_is_safe() {
    let pics: Vec<PictureSpec> = std::iter::once(PictureSpec::idr())
        .chain((1..8).map(PictureSpec::trail_p))
        .collect();
    let data = build_stream(StreamParams::default(), &pics);

    let mut parser = Parser::from_bytes(data, config(ParseMode::AU_PARALLEL)).unwrap();
    let mut count = 0;
    while let Some(au) = parser.parse_next_au().unwrap() {
        count += 1;
        drop(au);
    }
    assert_eq!(count, 8);
}
