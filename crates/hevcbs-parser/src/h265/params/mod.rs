//! HEVC 参数集 (VPS / SPS / PPS) 与按 id 索引的缓存.
//!
//! 每个参数集存放在竞技场块中. 同 id 的新参数集到达时, 旧块被释放;
//! 若仍有访问单元绑定在旧块上, 回收会推迟到这些访问单元释放之后.
//! SPS 块依赖所引用的 VPS 块, PPS 块依赖所引用的 SPS 块.

pub mod common;
pub mod pps;
pub mod sps;
pub mod vps;

use std::sync::Arc;

use hevcbs_core::{BlockId, BsError, BsResult, Handle, MemoryArena};
use log::{debug, warn};

pub use common::{HrdParameters, ProfileTierLevel, RpsEntry, ScalingList, ShortTermRps, Vui};
pub use pps::{Pps, TileSpec};
pub use sps::Sps;
pub use vps::Vps;

const MAX_VPS: usize = 16;
const MAX_SPS: usize = 16;
const MAX_PPS: usize = 64;

/// 缓存槽: 竞技场句柄 + 共享只读副本
struct Slot<T> {
    handle: Handle<Arc<T>>,
    value: Arc<T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            value: Arc::clone(&self.value),
        }
    }
}

/// 已激活的参数集引用
#[derive(Clone)]
pub struct ParamRef<T> {
    pub block: BlockId,
    pub value: Arc<T>,
}

/// 按 id 索引的参数集缓存 (每个解析器实例独立一份)
pub struct ParamSetCache {
    arena: Arc<MemoryArena>,
    vps: Vec<Option<Slot<Vps>>>,
    sps: Vec<Option<Slot<Sps>>>,
    pps: Vec<Option<Slot<Pps>>>,
    active_sps: Option<u8>,
}

impl ParamSetCache {
    pub fn new(arena: Arc<MemoryArena>) -> Self {
        Self {
            arena,
            vps: vec![None; MAX_VPS],
            sps: vec![None; MAX_SPS],
            pps: vec![None; MAX_PPS],
            active_sps: None,
        }
    }

    fn store<T: Send + Sync + 'static>(
        arena: &MemoryArena,
        slots: &mut [Option<Slot<T>>],
        id: usize,
        value: T,
        bases: &[BlockId],
    ) -> BsResult<BlockId> {
        let value = Arc::new(value);
        let handle = arena.alloc(Arc::clone(&value), bases)?;
        let block = handle.id();
        if let Some(old) = slots[id].replace(Slot { handle, value }) {
            let released = arena.free(old.handle.id())?;
            debug!(
                "参数集槽 {} 被替换, 旧块 {} {}",
                id,
                old.handle.id(),
                if released { "已回收" } else { "延迟回收" }
            );
        }
        Ok(block)
    }

    /// 登记 VPS
    pub fn insert_vps(&mut self, vps: Vps) -> BsResult<BlockId> {
        let id = usize::from(vps.vps_id);
        Self::store(&self.arena, &mut self.vps, id, vps, &[])
    }

    /// 登记 SPS. 被替换的 SPS 若处于激活状态则取消激活.
    pub fn insert_sps(&mut self, sps: Sps) -> BsResult<BlockId> {
        let id = sps.sps_id;
        let vps_block = self.vps(sps.vps_id).map(|v| v.block);
        if vps_block.is_none() {
            warn!("SPS {} 引用的 VPS {} 尚未出现", id, sps.vps_id);
        }
        if self.active_sps == Some(id) {
            self.active_sps = None;
        }
        let bases: Vec<BlockId> = vps_block.into_iter().collect();
        Self::store(&self.arena, &mut self.sps, usize::from(id), sps, &bases)
    }

    /// 登记 PPS, 所引用的 SPS 必须已存在
    pub fn insert_pps(&mut self, pps: Pps) -> BsResult<BlockId> {
        let sps_block = self.sps(pps.sps_id).map(|s| s.block).ok_or_else(|| {
            BsError::NoActiveSet(format!(
                "PPS {} 引用的 SPS {} 尚未出现",
                pps.pps_id, pps.sps_id
            ))
        })?;
        let id = usize::from(pps.pps_id);
        Self::store(&self.arena, &mut self.pps, id, pps, &[sps_block])
    }

    pub fn vps(&self, id: u8) -> Option<ParamRef<Vps>> {
        slot_ref(self.vps.get(usize::from(id)))
    }

    pub fn sps(&self, id: u8) -> Option<ParamRef<Sps>> {
        slot_ref(self.sps.get(usize::from(id)))
    }

    pub fn pps(&self, id: u8) -> Option<ParamRef<Pps>> {
        slot_ref(self.pps.get(usize::from(id)))
    }

    /// 按 id 取 PPS 及其 SPS, 任一缺失返回 NoActiveSet
    pub fn resolve(&self, pps_id: u32) -> BsResult<(ParamRef<Sps>, ParamRef<Pps>)> {
        let pps = u8::try_from(pps_id)
            .ok()
            .and_then(|id| self.pps(id))
            .ok_or_else(|| BsError::NoActiveSet(format!("PPS {} 尚未出现", pps_id)))?;
        let sps = self
            .sps(pps.value.sps_id)
            .ok_or_else(|| BsError::NoActiveSet(format!("SPS {} 尚未出现", pps.value.sps_id)))?;
        Ok((sps, pps))
    }

    /// 当前激活的 SPS
    pub fn active_sps(&self) -> Option<ParamRef<Sps>> {
        self.active_sps.and_then(|id| self.sps(id))
    }

    /// 设置激活 SPS (由条带或 active_parameter_sets SEI 触发)
    pub fn activate_sps(&mut self, id: u8) -> BsResult<()> {
        if self.sps(id).is_none() {
            return Err(BsError::NoActiveSet(format!("SPS {} 尚未出现", id)));
        }
        self.active_sps = Some(id);
        Ok(())
    }

    /// 访问单元开始时清除激活状态
    pub fn deactivate(&mut self) {
        self.active_sps = None;
    }
}

fn slot_ref<T>(slot: Option<&Option<Slot<T>>>) -> Option<ParamRef<T>> {
    slot.and_then(Option::as_ref).map(|s| ParamRef {
        block: s.handle.id(),
        value: Arc::clone(&s.value),
    })
}

impl Drop for ParamSetCache {
    fn drop(&mut self) {
        let ids: Vec<BlockId> = self
            .vps
            .iter()
            .flatten()
            .map(|s| s.handle.id())
            .chain(self.sps.iter().flatten().map(|s| s.handle.id()))
            .chain(self.pps.iter().flatten().map(|s| s.handle.id()))
            .collect();
        for id in ids {
            if let Err(err) = self.arena.free(id) {
                warn!("释放参数集块 {} 失败: {}", id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sps(id: u8) -> Sps {
        Sps {
            sps_id: id,
            ..Default::default()
        }
    }

    #[test]
    fn test_pps_requires_sps() {
        let arena = Arc::new(MemoryArena::new(0));
        let mut cache = ParamSetCache::new(Arc::clone(&arena));
        let pps = crate::synth::default_pps(0, 3);
        assert!(matches!(cache.insert_pps(pps.clone()), Err(BsError::NoActiveSet(_))));
        cache.insert_sps(test_sps(3)).unwrap();
        cache.insert_pps(pps).unwrap();
        let (sps, pps) = cache.resolve(0).unwrap();
        assert_eq!(sps.value.sps_id, 3);
        assert_eq!(pps.value.pps_id, 0);
        assert!(matches!(cache.resolve(1), Err(BsError::NoActiveSet(_))));
    }

    #[test]
    fn test_replacement_deferred_while_bound() {
        let arena = Arc::new(MemoryArena::new(0));
        let mut cache = ParamSetCache::new(Arc::clone(&arena));
        let old = cache.insert_sps(test_sps(0)).unwrap();

        // 模拟访问单元绑定在旧 SPS 上
        let au = arena.alloc(0u32, &[old]).unwrap();
        let new = cache.insert_sps(test_sps(0)).unwrap();
        assert_ne!(old, new);
        assert!(arena.is_live(old));
        assert_eq!(cache.sps(0).map(|s| s.block), Some(new));

        arena.free(au.id()).unwrap();
        assert!(!arena.is_live(old));
    }

    #[test]
    fn test_replaced_base_sets_outlive_dependents() {
        let arena = Arc::new(MemoryArena::new(0));
        let mut cache = ParamSetCache::new(Arc::clone(&arena));
        let vps = cache
            .insert_vps(Vps {
                vps_id: 0,
                ..Default::default()
            })
            .unwrap();
        let sps = cache.insert_sps(test_sps(3)).unwrap();
        let pps = cache.insert_pps(crate::synth::default_pps(0, 3)).unwrap();

        // 新 VPS 替换旧 VPS 后, 旧块仍被 SPS 引用
        cache
            .insert_vps(Vps {
                vps_id: 0,
                ..Default::default()
            })
            .unwrap();
        assert!(arena.is_live(vps));

        // 新 SPS 替换旧 SPS 后, 旧 SPS 仍被 PPS 引用
        cache.insert_sps(test_sps(3)).unwrap();
        assert!(arena.is_live(sps));
        assert!(arena.is_live(vps));

        // 替换 PPS 后整条链依次回收
        cache.insert_pps(crate::synth::default_pps(0, 3)).unwrap();
        assert!(!arena.is_live(pps));
        assert!(!arena.is_live(sps));
        assert!(!arena.is_live(vps));
    }

    #[test]
    fn test_active_sps_reset_on_replace() {
        let arena = Arc::new(MemoryArena::new(0));
        let mut cache = ParamSetCache::new(arena);
        cache.insert_sps(test_sps(1)).unwrap();
        cache.activate_sps(1).unwrap();
        assert!(cache.active_sps().is_some());
        cache.insert_sps(test_sps(1)).unwrap();
        assert!(cache.active_sps().is_none());
        assert!(cache.activate_sps(2).is_err());
    }
}
