use super::super::au::NalPayload;
use super::super::control::ParseMode;
use super::super::motion::Mv;
use super::super::nal::NalUnitType;
use super::super::quadtree::PredMode;
use super::super::slice_header::SliceType;

use super::helpers::*;
use crate::synth::{CuPattern, PictureSpec, StreamBuilder, StreamParams};

#[test]
fn test_idr_single_slice_ctus() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr()]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    assert_eq!(aus.len(), 1, "应只有一个访问单元");

    let au = &aus[0];
    assert_eq!(au.poc, Some(0));
    assert!(!au.incomplete, "合成码流不应有错误");
    assert_eq!(au.nals.len(), 4, "VPS + SPS + PPS + 条带");
    assert!(matches!(au.nals[0].payload, NalPayload::Vps(_)));
    assert!(matches!(au.nals[3].payload, NalPayload::Slice(0)));

    assert_eq!(au.slices.len(), 1);
    let slice = &au.slices[0];
    assert_eq!(slice.header.slice_type, SliceType::I);
    assert!(!slice.corrupted && !slice.partial);
    // 64x48, CTB 16 -> 4x3
    assert_eq!(slice.data.ctus.len(), 12);
    assert_eq!(au.stats.ctu_count, 12);
    assert_eq!(au.stats.slice_count, 1);
    assert_eq!(au.stats.nal_count, 4);
    assert!(au.stats.bins > 0);

    for (i, ctu) in slice.data.ctus.iter().enumerate() {
        assert_eq!(ctu.addr_ts, i as u32);
        let cus = slice.data.cus_of(ctu);
        assert_eq!(cus.len(), 1, "CTB {} 应为单个 CU", i);
        assert_eq!(cus[0].log2_size, 4);
        assert_eq!(cus[0].pred_mode, PredMode::Intra);
    }
    assert_eq!(slice.data.coeffs.len(), 12);
    assert!(slice.data.coeffs.iter().all(|c| c.pos == 0 && c.level == 3));
}

#[test]
fn test_split_intra_to_min_cb() {
    let pic = PictureSpec::idr().pattern(CuPattern::SplitIntra(-2));
    let data = build_stream(StreamParams::default(), &[pic]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let slice = &aus[0].slices[0];
    assert!(!slice.corrupted);
    // 每个 CTB 划分为 4 个 8x8 CU
    assert_eq!(slice.data.cus.len(), 48);
    assert!(slice.data.cus.iter().all(|cu| cu.log2_size == 3 && cu.ct_depth == 1));
    assert_eq!(slice.data.coeffs.len(), 48);
    assert!(slice.data.coeffs.iter().all(|c| c.level == -2));
}

#[test]
fn test_multiple_independent_segments() {
    let pic = PictureSpec::idr().segments(&[(0, false), (5, false)]);
    let data = build_stream(StreamParams::default(), &[pic]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    assert_eq!(aus.len(), 1, "同一图像的条带段属于同一访问单元");

    let au = &aus[0];
    assert_eq!(au.slices.len(), 2);
    assert_eq!(au.slices[0].data.ctus.len(), 5);
    assert_eq!(au.slices[1].data.ctus.len(), 7);
    assert_eq!(au.slices[1].header.slice_segment_address, 5);
    assert_eq!(au.slices[1].data.ctus[0].addr_ts, 5);
    assert_eq!(au.stats.ctu_count, 12);
    assert!(au.slices.iter().all(|s| !s.corrupted));
}

#[test]
fn test_dependent_slice_segments() {
    let params = StreamParams {
        dependent_slices: true,
        ..Default::default()
    };
    let pic = PictureSpec::idr().segments(&[(0, false), (3, true), (8, false)]);
    let data = build_stream(params, &[pic]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let au = &aus[0];

    assert_eq!(au.slices.len(), 3);
    assert!(!au.slices[0].header.dependent_slice_segment_flag);
    assert!(au.slices[1].header.dependent_slice_segment_flag);
    assert!(!au.slices[2].header.dependent_slice_segment_flag);
    // 依赖条带段继承独立条带段的头部字段
    assert_eq!(au.slices[1].header.slice_type, SliceType::I);
    let counts: Vec<usize> = au.slices.iter().map(|s| s.data.ctus.len()).collect();
    assert_eq!(counts, vec![3, 5, 4]);
    assert!(au.slices.iter().all(|s| !s.corrupted && !s.partial));
}

#[test]
fn test_tiles_with_entry_points() {
    let params = StreamParams {
        tile_columns: 2,
        ..Default::default()
    };
    let data = build_stream(params, &[PictureSpec::idr()]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let slice = &aus[0].slices[0];

    assert_eq!(slice.header.num_entry_points(), 1);
    assert!(!slice.corrupted);
    assert_eq!(slice.data.ctus.len(), 12);
    // 第二个分块 (第 2-3 列) 从 ts=6 开始
    let ctu = &slice.data.ctus[6];
    assert_eq!(ctu.addr_ts, 6);
    assert_eq!(ctu.addr_rs, 2);
    let ts: Vec<u32> = slice.data.ctus.iter().map(|c| c.addr_ts).collect();
    assert_eq!(ts, (0..12).collect::<Vec<_>>());
}

#[test]
fn test_wavefront_rows_with_sao() {
    let params = StreamParams {
        wpp: true,
        sao: true,
        ..Default::default()
    };
    let data = build_stream(params, &[PictureSpec::idr()]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let slice = &aus[0].slices[0];

    assert_eq!(slice.header.num_entry_points(), 2, "3 行 CTB 有 2 个入口点");
    assert!(!slice.corrupted);
    assert_eq!(slice.data.ctus.len(), 12);
    for ctu in &slice.data.ctus {
        let sao = ctu.sao.expect("开启 SAO 时每个 CTU 都有 SAO 参数");
        assert!(!sao.merge_left && !sao.merge_up);
        assert!(sao.comps.iter().all(|c| c.type_idx == 0));
    }
}

#[test]
fn test_p_skip_reference_lists() {
    let pics = [
        PictureSpec::idr(),
        PictureSpec::trail_p(1),
        PictureSpec::trail_p(2),
    ];
    let data = build_stream(StreamParams::default(), &pics);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    assert_eq!(aus.len(), 3);

    for (i, au) in aus.iter().enumerate().skip(1) {
        let poc = i as i32;
        assert_eq!(au.poc, Some(poc));
        let slice = &au.slices[0];
        assert_eq!(slice.header.slice_type, SliceType::P);
        let l0: Vec<i32> = slice.lists.l0.iter().map(|r| r.poc).collect();
        assert_eq!(l0, vec![poc - 1], "L0 应只含前一幅图像");
        assert!(slice.lists.l0.iter().all(|r| !r.lost));
        assert!(!slice.corrupted && !slice.partial);

        assert_eq!(slice.data.cus.len(), 12);
        assert!(slice.data.cus.iter().all(|cu| cu.pred_mode == PredMode::Skip));
        assert_eq!(slice.data.pus.len(), 12);
        for pu in &slice.data.pus {
            assert!(pu.merge_flag);
            assert_eq!(pu.merge_idx, 0);
            assert_eq!(pu.motion.pred_flag, [true, false]);
            assert_eq!(pu.motion.ref_idx[0], 0);
            assert_eq!(pu.motion.mv[0], Mv::ZERO);
        }
        assert!(slice.data.coeffs.is_empty());
    }
}

#[test]
fn test_temporal_mvp_uses_stored_motion() {
    let params = StreamParams {
        temporal_mvp: true,
        ..Default::default()
    };
    let pics = [
        PictureSpec::idr(),
        PictureSpec::trail_p(1).temporal_mvp(true),
        PictureSpec::trail_p(2).temporal_mvp(true),
    ];
    let data = build_stream(params, &pics);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    assert_eq!(aus.len(), 3);
    for au in &aus {
        assert!(!au.incomplete, "AU {} 不应缺少同位运动场", au.index);
        let slice = &au.slices[0];
        assert!(!slice.corrupted && !slice.partial);
    }
    assert!(aus[2].slices[0].header.temporal_mvp_enabled_flag);
    assert!(aus[2].slices[0].data.pus.iter().all(|pu| pu.motion.mv[0] == Mv::ZERO));
}

#[test]
fn test_missing_collocated_picture_marks_partial() {
    let params = StreamParams {
        temporal_mvp: true,
        ..Default::default()
    };
    // 码流从非 IRAP 图像开始, 参考图像缺失
    let data = build_stream(params, &[PictureSpec::trail_p(1).temporal_mvp(true)]);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let slice = &aus[0].slices[0];
    assert!(slice.lists.l0[0].lost);
    assert!(slice.partial, "同位图像缺失时条带应标记为部分解码");
    assert!(!slice.corrupted);
    assert_eq!(slice.data.ctus.len(), 12);
}

#[test]
fn test_truncated_slice_is_corrupted() {
    let mut builder = StreamBuilder::new(StreamParams::default());
    builder.parameter_sets();
    let header_len = builder.bytes().len();
    builder.picture(&PictureSpec::idr());
    let mut data = builder.into_bytes();
    let slice_len = data.len() - header_len;
    data.truncate(header_len + slice_len / 2);

    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let au = &aus[0];
    assert!(au.slices[0].corrupted);
    assert!(au.incomplete);
    assert!(au.stats.ctu_count < 12);
}

#[test]
fn test_idr_after_trailing_pictures_resets_poc() {
    let pics = [
        PictureSpec::idr(),
        PictureSpec::trail_p(1),
        PictureSpec::idr(),
        PictureSpec::trail_p(1),
    ];
    let data = build_stream(StreamParams::default(), &pics);
    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let pocs: Vec<Option<i32>> = aus.iter().map(|au| au.poc).collect();
    assert_eq!(pocs, vec![Some(0), Some(1), Some(0), Some(1)]);
    assert_eq!(aus[2].nals[0].header.nal_type, NalUnitType::IdrWRadl);
    assert!(aus[3].slices[0].lists.l0.iter().all(|r| !r.lost));
}
