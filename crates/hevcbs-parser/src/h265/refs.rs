//! 参考图像管理: POC 推导, RPS 解码, L0/L1 列表构造, DPB 存活表.

use std::collections::BTreeMap;

use hevcbs_core::{BsError, BsResult};
use log::{debug, warn};
use serde::Serialize;

use super::nal::NalUnitType;
use super::params::{Pps, Sps};
use super::slice_header::SliceHeader;

/// 参考图像项 (按值复制到各条带)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefPic {
    pub poc: i32,
    pub long_term: bool,
    /// 被当前图像引用
    pub used: bool,
    /// 在 DPB 中不存在
    pub lost: bool,
    /// 当前图像本身 (屏幕内容编码的帧内块拷贝)
    pub current: bool,
}

/// 条带的 DPB (RPS 全部成员) 与两个参考列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefLists {
    pub dpb: Vec<RefPic>,
    pub l0: Vec<RefPic>,
    pub l1: Vec<RefPic>,
}

/// 当前图像的 RPS 分类结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureRps {
    pub poc: i32,
    pub st_curr_before: Vec<RefPic>,
    pub st_curr_after: Vec<RefPic>,
    pub lt_curr: Vec<RefPic>,
    pub foll: Vec<RefPic>,
}

impl PictureRps {
    /// 全部 RPS 成员
    pub fn all(&self) -> Vec<RefPic> {
        self.st_curr_before
            .iter()
            .chain(&self.st_curr_after)
            .chain(&self.lt_curr)
            .chain(&self.foll)
            .copied()
            .collect()
    }

    /// 缺失的参考数量
    pub fn lost_count(&self) -> usize {
        self.all().iter().filter(|r| r.lost).count()
    }
}

/// 开始一幅新图像的结果
#[derive(Debug, Clone, Default)]
pub struct PictureStart {
    pub rps: PictureRps,
    /// 因不在 RPS 中而移出 DPB 的图像
    pub evicted: Vec<i32>,
}

/// DPB 中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DpbEntry {
    long_term: bool,
}

/// 参考图像管理器
#[derive(Debug, Default)]
pub struct RefManager {
    /// POC -> 存活状态
    dpb: BTreeMap<i32, DpbEntry>,
    /// prevTid0Pic 的 POC
    prev_tid0_poc: i32,
    /// 下一幅 IRAP 图像视为新序列 (码流开头或 EOS 之后)
    new_sequence: bool,
}

impl RefManager {
    pub fn new() -> Self {
        Self {
            new_sequence: true,
            ..Default::default()
        }
    }

    /// 遇到 EOS: 下一幅图像开启新的编码视频序列
    pub fn end_of_sequence(&mut self) {
        self.new_sequence = true;
    }

    /// 当前 DPB 中存活的 POC
    pub fn live_pocs(&self) -> Vec<i32> {
        self.dpb.keys().copied().collect()
    }

    pub fn is_live(&self, poc: i32) -> bool {
        self.dpb.contains_key(&poc)
    }

    /// NoRaslOutputFlag
    pub fn no_rasl_output(&self, nal_type: NalUnitType) -> bool {
        nal_type.is_idr() || nal_type.is_bla() || (nal_type.is_irap() && self.new_sequence)
    }

    /// 推导 PicOrderCntVal (8.3.1)
    pub fn decode_poc(
        &mut self,
        nal_type: NalUnitType,
        temporal_id: u8,
        sh: &SliceHeader,
        sps: &Sps,
    ) -> i32 {
        let max_lsb = sps.max_pic_order_cnt_lsb as i32;
        let lsb = sh.pic_order_cnt_lsb as i32;

        let msb = if nal_type.is_irap() && self.no_rasl_output(nal_type) {
            0
        } else {
            let prev_lsb = self.prev_tid0_poc & (max_lsb - 1);
            let prev_msb = self.prev_tid0_poc - prev_lsb;
            if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                prev_msb + max_lsb
            } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                prev_msb - max_lsb
            } else {
                prev_msb
            }
        };
        let poc = msb + lsb;

        if temporal_id == 0
            && !nal_type.is_rasl()
            && !nal_type.is_radl()
            && !nal_type.is_sub_layer_non_ref()
        {
            self.prev_tid0_poc = poc;
        }
        poc
    }

    /// 开始新图像: 推导 POC, 解码 RPS, 标记缺失参考并更新 DPB.
    ///
    /// 不在 RPS 中的图像被移出 DPB, 当前图像随后加入.
    pub fn begin_picture(
        &mut self,
        nal_type: NalUnitType,
        temporal_id: u8,
        sh: &SliceHeader,
        sps: &Sps,
    ) -> PictureStart {
        let poc = self.decode_poc(nal_type, temporal_id, sh, sps);
        let irap_reset = nal_type.is_irap() && self.no_rasl_output(nal_type);
        self.new_sequence = false;

        let mut evicted = Vec::new();
        if irap_reset {
            evicted.extend(self.dpb.keys().copied());
            self.dpb.clear();
        }

        let rps = if nal_type.is_idr() {
            PictureRps {
                poc,
                ..Default::default()
            }
        } else {
            self.decode_rps(poc, sh, sps)
        };

        let keep: BTreeMap<i32, DpbEntry> = rps
            .all()
            .into_iter()
            .filter(|r| !r.lost)
            .map(|r| (r.poc, DpbEntry { long_term: r.long_term }))
            .collect();
        for old in self.dpb.keys() {
            if !keep.contains_key(old) {
                evicted.push(*old);
            }
        }
        self.dpb = keep;
        if self.dpb.insert(poc, DpbEntry { long_term: false }).is_some() {
            warn!("POC {} 在 DPB 中重复", poc);
        }

        let lost = rps.lost_count();
        if lost > 0 {
            warn!("POC {}: {} 个参考图像缺失", poc, lost);
        }
        debug!("POC {}: DPB={:?} 移出={:?}", poc, self.live_pocs(), evicted);
        PictureStart { rps, evicted }
    }

    /// 解码 RPS (8.3.2), 按当前 DPB 标记缺失项
    fn decode_rps(&self, poc: i32, sh: &SliceHeader, sps: &Sps) -> PictureRps {
        let mut out = PictureRps {
            poc,
            ..Default::default()
        };
        let st = |delta: i32, used: bool| {
            let p = poc + delta;
            RefPic {
                poc: p,
                used,
                lost: !self.dpb.contains_key(&p),
                ..Default::default()
            }
        };
        for e in &sh.st_rps.negative {
            let r = st(e.delta_poc, e.used);
            if e.used {
                out.st_curr_before.push(r);
            } else {
                out.foll.push(r);
            }
        }
        for e in &sh.st_rps.positive {
            let r = st(e.delta_poc, e.used);
            if e.used {
                out.st_curr_after.push(r);
            } else {
                out.foll.push(r);
            }
        }

        let max_lsb = sps.max_pic_order_cnt_lsb as i32;
        for lt in &sh.long_term {
            let mut lt_poc = lt.poc_lsb as i32;
            let found = if lt.delta_poc_msb_present {
                lt_poc += poc
                    - (lt.delta_poc_msb_cycle as i32).wrapping_mul(max_lsb)
                    - (poc & (max_lsb - 1));
                self.dpb.contains_key(&lt_poc).then_some(lt_poc)
            } else {
                self.dpb
                    .keys()
                    .copied()
                    .find(|p| (p & (max_lsb - 1)) == lt_poc)
            };
            let r = RefPic {
                poc: found.unwrap_or(lt_poc),
                long_term: true,
                used: lt.used_by_curr_pic,
                lost: found.is_none(),
                current: false,
            };
            if lt.used_by_curr_pic {
                out.lt_curr.push(r);
            } else {
                out.foll.push(r);
            }
        }
        out
    }

    /// 构造条带的 L0/L1 (8.3.4)
    pub fn build_lists(sh: &SliceHeader, pps: &Pps, rps: &PictureRps) -> BsResult<RefLists> {
        let mut lists = RefLists {
            dpb: rps.all(),
            ..Default::default()
        };
        if sh.slice_type.is_intra() {
            return Ok(lists);
        }

        let cpr = pps.scc_ext.curr_pic_ref_enabled_flag;
        let current = RefPic {
            poc: rps.poc,
            long_term: true,
            used: true,
            lost: false,
            current: true,
        };
        let total = rps.st_curr_before.len() + rps.st_curr_after.len() + rps.lt_curr.len()
            + usize::from(cpr);
        if total == 0 {
            return Err(BsError::syntax(format!(
                "{} 条带没有可用参考图像",
                sh.slice_type.name()
            )));
        }

        let build = |first: &[RefPic], second: &[RefPic], active: usize, entries: &[u32], modified: bool| {
            let temp_len = active.max(total);
            let mut temp = Vec::with_capacity(temp_len + 1);
            while temp.len() < temp_len {
                for group in [first, second, &rps.lt_curr[..]] {
                    for r in group {
                        if temp.len() < temp_len {
                            temp.push(*r);
                        }
                    }
                }
                if cpr {
                    temp.push(current);
                }
            }
            let mut list = Vec::with_capacity(active);
            for i in 0..active {
                let idx = if modified {
                    entries.get(i).copied().unwrap_or(0) as usize
                } else {
                    i
                };
                list.push(temp.get(idx).copied().unwrap_or(RefPic {
                    lost: true,
                    ..Default::default()
                }));
            }
            if cpr && !modified && temp_len > active && active > 0 {
                list[active - 1] = current;
            }
            list
        };

        lists.l0 = build(
            &rps.st_curr_before,
            &rps.st_curr_after,
            sh.num_ref_idx_l0_active as usize,
            &sh.list_entry_l0,
            sh.ref_pic_list_modification_flag_l0,
        );
        if sh.slice_type.is_b() {
            lists.l1 = build(
                &rps.st_curr_after,
                &rps.st_curr_before,
                sh.num_ref_idx_l1_active as usize,
                &sh.list_entry_l1,
                sh.ref_pic_list_modification_flag_l1,
            );
        }
        Ok(lists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h265::params::{RpsEntry, ShortTermRps};
    use crate::h265::slice_header::SliceType;

    fn sps_lsb(log2: u32) -> Sps {
        Sps {
            log2_max_pic_order_cnt_lsb_minus4: log2 - 4,
            max_pic_order_cnt_lsb: 1 << log2,
            ..Default::default()
        }
    }

    fn header(lsb: u32, negative: &[i32]) -> SliceHeader {
        SliceHeader {
            pic_order_cnt_lsb: lsb,
            slice_type: SliceType::P,
            num_ref_idx_l0_active: 2,
            st_rps: ShortTermRps {
                negative: negative
                    .iter()
                    .map(|&d| RpsEntry { delta_poc: d, used: true })
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_poc_wraparound() {
        let sps = sps_lsb(4); // MaxPicOrderCntLsb = 16
        let mut rm = RefManager::new();
        let idr = header(0, &[]);
        assert_eq!(rm.decode_poc(NalUnitType::IdrWRadl, 0, &idr, &sps), 0);
        assert_eq!(rm.decode_poc(NalUnitType::TrailR, 0, &header(14, &[]), &sps), -2);
        assert_eq!(rm.decode_poc(NalUnitType::TrailR, 0, &header(6, &[]), &sps), 6);
        assert_eq!(rm.decode_poc(NalUnitType::TrailR, 0, &header(13, &[]), &sps), 13);
        assert_eq!(rm.decode_poc(NalUnitType::TrailR, 0, &header(2, &[]), &sps), 18);
        // 非参考图像不更新 prevTid0Pic
        assert_eq!(rm.decode_poc(NalUnitType::TrailN, 0, &header(12, &[]), &sps), 12);
        assert_eq!(rm.decode_poc(NalUnitType::TrailR, 0, &header(3, &[]), &sps), 19);
    }

    #[test]
    fn test_rps_marks_lost_and_evicts() {
        let sps = sps_lsb(8);
        let mut rm = RefManager::new();
        rm.begin_picture(NalUnitType::IdrWRadl, 0, &header(0, &[]), &sps);
        rm.begin_picture(NalUnitType::TrailR, 0, &header(1, &[-1]), &sps);
        assert_eq!(rm.live_pocs(), vec![0, 1]);

        // POC 3 引用 2 (缺失) 与 1, 不引用 0
        let start = rm.begin_picture(NalUnitType::TrailR, 0, &header(3, &[-1, -2]), &sps);
        assert_eq!(start.rps.st_curr_before.len(), 2);
        assert!(start.rps.st_curr_before[0].lost);
        assert!(!start.rps.st_curr_before[1].lost);
        assert_eq!(start.evicted, vec![0]);
        assert_eq!(rm.live_pocs(), vec![1, 3]);
    }

    #[test]
    fn test_build_lists_cycles_and_modification() {
        let sps = sps_lsb(8);
        let mut rm = RefManager::new();
        rm.begin_picture(NalUnitType::IdrWRadl, 0, &header(0, &[]), &sps);
        rm.begin_picture(NalUnitType::TrailR, 0, &header(4, &[-4]), &sps);
        let mut sh = header(2, &[]);
        sh.slice_type = SliceType::B;
        sh.st_rps.negative = vec![RpsEntry { delta_poc: -2, used: true }];
        sh.st_rps.positive = vec![RpsEntry { delta_poc: 2, used: true }];
        sh.num_ref_idx_l0_active = 3;
        sh.num_ref_idx_l1_active = 1;
        let start = rm.begin_picture(NalUnitType::TrailR, 0, &sh, &sps);

        let pps = crate::synth::default_pps(0, 0);
        let lists = RefManager::build_lists(&sh, &pps, &start.rps).unwrap();
        let l0: Vec<i32> = lists.l0.iter().map(|r| r.poc).collect();
        let l1: Vec<i32> = lists.l1.iter().map(|r| r.poc).collect();
        assert_eq!(l0, vec![0, 4, 0]);
        assert_eq!(l1, vec![4]);

        sh.ref_pic_list_modification_flag_l0 = true;
        sh.list_entry_l0 = vec![1, 1, 0];
        let lists = RefManager::build_lists(&sh, &pps, &start.rps).unwrap();
        let l0: Vec<i32> = lists.l0.iter().map(|r| r.poc).collect();
        assert_eq!(l0, vec![4, 4, 0]);
    }

    #[test]
    fn test_p_slice_without_refs_is_error() {
        let sps = sps_lsb(8);
        let mut rm = RefManager::new();
        let sh = header(0, &[]);
        let start = rm.begin_picture(NalUnitType::Cra, 0, &sh, &sps);
        let pps = crate::synth::default_pps(0, 0);
        assert!(RefManager::build_lists(&sh, &pps, &start.rps).is_err());
    }
}
