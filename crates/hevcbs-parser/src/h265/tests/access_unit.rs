use std::io::Write;

use hevcbs_core::{BsError, BsResult, Status};

use super::super::au::NalPayload;
use super::super::control::{ParseMode, ParserConfig, TraceLevel};
use super::super::nal::NalUnitType;
use super::super::orchestrator::Parser;
use super::super::sei::{
    ActiveParameterSets, PictureTiming, SEI_ACTIVE_PARAMETER_SETS, SEI_PICTURE_TIMING, SeiPayload,
};

use super::helpers::*;
use crate::synth::{
    PictureSpec, StreamBuilder, StreamParams, write_pps_rbsp, write_sei_rbsp, write_sps_rbsp,
    write_vps_rbsp,
};

fn sei_messages(payload: &NalPayload) -> &[super::super::sei::SeiMessage] {
    match payload {
        NalPayload::Sei(messages) => messages,
        other => panic!("应为 SEI 负载, 实际 {:?}", other),
    }
}

#[test]
fn test_sei_waiting_for_active_sps_is_reparsed() {
    let mut builder = StreamBuilder::new(StreamParams::default());
    builder
        .parameter_sets()
        .nal(NalUnitType::PrefixSei, &write_sei_rbsp(SEI_PICTURE_TIMING, &[]))
        .picture(&PictureSpec::idr());
    let aus = parse_all(builder.into_bytes(), ParseMode::SEQUENTIAL);

    let au = &aus[0];
    assert_eq!(au.nals[3].header.nal_type, NalUnitType::PrefixSei);
    let messages = sei_messages(&au.nals[3].payload);
    assert_eq!(messages.len(), 1);
    // 解析 SEI 时 SPS 尚未激活, 访问单元结束时重新解析
    assert_eq!(
        messages[0].payload,
        SeiPayload::PictureTiming(PictureTiming::default())
    );
}

#[test]
fn test_sei_before_vps_is_reparsed_after_vps() {
    let params = StreamParams::default();
    let mut builder = StreamBuilder::new(params.clone());
    // active_vps_id=0, self_contained=1, no_update=0, ue(0), ue(0)
    builder
        .nal(NalUnitType::PrefixSei, &write_sei_rbsp(SEI_ACTIVE_PARAMETER_SETS, &[0x0B]))
        .nal(NalUnitType::Vps, &write_vps_rbsp(&params))
        .nal(NalUnitType::Sps, &write_sps_rbsp(&params))
        .nal(NalUnitType::Pps, &write_pps_rbsp(&params))
        .picture(&PictureSpec::idr());
    let aus = parse_all(builder.into_bytes(), ParseMode::SEQUENTIAL);

    let messages = sei_messages(&aus[0].nals[0].payload);
    assert_eq!(
        messages[0].payload,
        SeiPayload::ActiveParameterSets(ActiveParameterSets {
            active_vps_id: 0,
            self_contained_cvs_flag: true,
            no_parameter_set_update_flag: false,
            active_sps_ids: vec![0],
            layer_sps_idx: Vec::new(),
        })
    );
}

#[test]
fn test_lock_keeps_block_after_drop() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr()]);
    let mut parser = Parser::from_bytes(data, ParserConfig::default()).unwrap();
    let au = parser.parse_next_au().unwrap().expect("应有一个访问单元");
    let block = au.block().expect("访问单元应有竞技场块");

    assert_eq!(parser.lock(&au), Status::None);
    drop(au);
    assert!(parser.arena().is_live(block), "加锁的块不应随访问单元释放");

    assert!(parser.arena().unlock(block).is_ok());
    assert!(!parser.arena().is_live(block));
}

#[test]
fn test_locked_access_unit_keeps_parameter_sets() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr()]);
    let mut parser = Parser::from_bytes(data, ParserConfig::default()).unwrap();
    let au = parser.parse_next_au().unwrap().expect("应有一个访问单元");
    let block = au.block().expect("访问单元应有竞技场块");
    let (sps, pps) = parser.params().resolve(0).unwrap();
    let arena = std::sync::Arc::clone(parser.arena());

    assert_eq!(parser.lock(&au), Status::None);
    drop(au);
    drop(parser);
    // 访问单元块依赖其 SPS 与 PPS
    assert!(arena.is_live(block));
    assert!(arena.is_live(sps.block), "访问单元引用的 SPS 不应先于它回收");
    assert!(arena.is_live(pps.block), "访问单元引用的 PPS 不应先于它回收");

    assert!(arena.unlock(block).is_ok());
    assert!(!arena.is_live(block));
    assert!(!arena.is_live(pps.block));
}

#[test]
fn test_lock_unlock_pairs() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr()]);
    let mut parser = Parser::from_bytes(data, ParserConfig::default()).unwrap();
    let au = parser.parse_next_au().unwrap().unwrap();
    assert_eq!(parser.lock(&au), Status::None);
    assert_eq!(parser.unlock(&au), Status::None);
    // 未加锁时解锁是参数错误
    assert_eq!(parser.unlock(&au), Status::InvalidParams);
}

#[test]
fn test_next_au_status_interface() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr(), PictureSpec::trail_p(1)]);
    let mut parser = Parser::from_bytes(data, ParserConfig::default()).unwrap();
    let mut out = None;
    let mut pocs = Vec::new();
    loop {
        assert_eq!(parser.next_au(&mut out), Status::None);
        match out.take() {
            Some(au) => pocs.push(au.poc),
            None => break,
        }
    }
    assert_eq!(pocs, vec![Some(0), Some(1)]);
}

#[test]
fn test_end_of_sequence_stays_in_access_unit() {
    let mut builder = StreamBuilder::new(StreamParams::default());
    builder
        .parameter_sets()
        .picture(&PictureSpec::idr())
        .picture(&PictureSpec::trail_p(1))
        .nal(NalUnitType::Eos, &[]);
    let cra = PictureSpec {
        nal_type: NalUnitType::Cra,
        poc: 3,
        ref_deltas: Vec::new(),
        ..PictureSpec::idr()
    };
    builder.picture(&cra);
    let aus = parse_all(builder.into_bytes(), ParseMode::SEQUENTIAL);

    assert_eq!(aus.len(), 3);
    let last_nal = aus[1].nals.last().unwrap();
    assert_eq!(last_nal.header.nal_type, NalUnitType::Eos);
    assert!(matches!(last_nal.payload, NalPayload::Skipped));
    // EOS 之后的 CRA 开始新的编码视频序列
    assert_eq!(aus[2].poc, Some(3));
    assert!(aus[2].slices[0].lists.dpb.is_empty());
    assert!(!aus[2].incomplete);
}

#[test]
fn test_pps_without_sps_is_corrupt() {
    let params = StreamParams::default();
    let orphan = StreamParams {
        pps_id: 1,
        sps_id: 5,
        ..params.clone()
    };
    let mut builder = StreamBuilder::new(params);
    builder
        .parameter_sets()
        .nal(NalUnitType::Pps, &write_pps_rbsp(&orphan))
        .picture(&PictureSpec::idr());
    let aus = parse_all(builder.into_bytes(), ParseMode::SEQUENTIAL);

    let au = &aus[0];
    assert!(matches!(au.nals[3].payload, NalPayload::Corrupt(_)));
    assert!(au.incomplete);
    // 条带仍使用 PPS 0 正常解码
    assert!(!au.slices[0].corrupted);
    assert_eq!(au.stats.ctu_count, 12);
}

#[test]
fn test_non_base_layer_is_skipped() {
    let mut builder = StreamBuilder::new(StreamParams::default());
    builder.parameter_sets();
    let split = builder.bytes().len();
    builder.picture(&PictureSpec::idr());
    let stream = builder.into_bytes();

    let mut data = stream[..split].to_vec();
    // PREFIX_SEI, nuh_layer_id = 1
    data.extend_from_slice(&[0, 0, 0, 1, 39 << 1, (1 << 3) | 1, 0xFF, 0x80]);
    data.extend_from_slice(&stream[split..]);

    let aus = parse_all(data, ParseMode::SEQUENTIAL);
    let au = &aus[0];
    assert_eq!(au.nals[3].header.layer_id, 1);
    assert!(matches!(au.nals[3].payload, NalPayload::Skipped));
    assert!(!au.incomplete);
    assert_eq!(au.stats.ctu_count, 12);
}

#[test]
fn test_updater_feeds_small_chunks() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr(), PictureSpec::trail_p(1)]);
    let expected: Vec<_> = parse_all(data.clone(), ParseMode::SEQUENTIAL)
        .iter()
        .map(summarize)
        .collect();

    let mut pos = 0;
    let updater = move |buf: &mut Vec<u8>| -> BsResult<usize> {
        let n = 7usize.min(data.len() - pos);
        buf.extend_from_slice(&data[pos..pos + n]);
        pos += n;
        Ok(n)
    };
    let mut parser = Parser::with_updater(Box::new(updater), ParserConfig::default()).unwrap();
    let mut got = Vec::new();
    while let Some(au) = parser.parse_next_au().unwrap() {
        got.push(summarize(&au));
    }
    assert_eq!(got, expected);
}

#[test]
fn test_open_reads_file() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr()]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let cfg = ParserConfig {
        window_size: 4096,
        ..Default::default()
    };
    let mut parser = Parser::open(file.path(), cfg).unwrap();
    let au = parser.parse_next_au().unwrap().unwrap();
    assert_eq!(au.stats.ctu_count, 12);
    assert!(parser.parse_next_au().unwrap().is_none());
}

#[test]
fn test_open_missing_file_fails() {
    let err = Parser::open("/nonexistent/stream.265", ParserConfig::default()).unwrap_err();
    assert!(matches!(err, BsError::Io(_)));
    assert_eq!(Status::from(&err), Status::Unknown);
}

#[test]
fn test_invalid_config_rejected() {
    let cfg = ParserConfig {
        async_depth: 0,
        ..Default::default()
    };
    let err = Parser::from_bytes(Vec::new(), cfg).unwrap_err();
    assert!(matches!(err, BsError::InvalidArgument(_)));
}

#[test]
fn test_trace_level_does_not_change_output() {
    let data = build_stream(StreamParams::default(), &[PictureSpec::idr(), PictureSpec::trail_p(1)]);
    let expected: Vec<_> = parse_all(data.clone(), ParseMode::SEQUENTIAL)
        .iter()
        .map(summarize)
        .collect();

    let mut parser = Parser::from_bytes(data, ParserConfig::default()).unwrap();
    parser.set_trace_level(TraceLevel::all());
    assert_eq!(parser.config().trace, TraceLevel::all());
    let mut got = Vec::new();
    while let Some(au) = parser.parse_next_au().unwrap() {
        got.push(summarize(&au));
    }
    assert_eq!(got, expected);
}

#[test]
fn test_empty_stream() {
    let mut parser = Parser::from_bytes(Vec::new(), ParserConfig::default()).unwrap();
    assert!(parser.parse_next_au().unwrap().is_none());
}
