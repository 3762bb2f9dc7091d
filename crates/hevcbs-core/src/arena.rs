//! 带依赖跟踪的内存竞技场.
//!
//! 每个块记录自己依赖的 *基础块* 集合和依赖自己的 *从属块* 集合, 以及锁计数.
//! `free` 是惰性的: 块被加锁或仍有从属块时只标记为待释放; 条件满足的那一刻
//! (最后一个锁或从属关系解除) 才真正回收, 回收会沿基础块链递归传播.
//! 依赖图按构造无环, 不需要环检测.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{trace, warn};

use crate::{BsError, BsResult};

/// 块标识
pub type BlockId = u64;

/// 带类型的块句柄 (不持有数据, 可自由复制)
pub struct Handle<T> {
    id: BlockId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn id(&self) -> BlockId {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

struct Block {
    payload: Arc<dyn Any + Send + Sync>,
    size: usize,
    bases: Vec<BlockId>,
    dependents: HashSet<BlockId>,
    locks: u32,
    pending_free: bool,
}

#[derive(Default)]
struct ArenaTable {
    blocks: HashMap<BlockId, Block>,
    next_id: BlockId,
    bytes: usize,
    released: u64,
}

impl ArenaTable {
    fn block_mut(&mut self, id: BlockId) -> BsResult<&mut Block> {
        self.blocks.get_mut(&id).ok_or(BsError::BadHandle)
    }

    /// 从 `id` 开始尝试回收, 返回实际回收的块数
    fn try_release(&mut self, id: BlockId) -> usize {
        let mut stack = vec![id];
        let mut count = 0;
        while let Some(cur) = stack.pop() {
            let reclaimable = self
                .blocks
                .get(&cur)
                .is_some_and(|b| b.pending_free && b.locks == 0 && b.dependents.is_empty());
            if !reclaimable {
                continue;
            }
            let Some(block) = self.blocks.remove(&cur) else {
                continue;
            };
            self.bytes = self.bytes.saturating_sub(block.size);
            self.released += 1;
            count += 1;
            trace!("arena: 回收块 {}, 大小 {}", cur, block.size);
            for base in block.bases {
                if let Some(b) = self.blocks.get_mut(&base) {
                    b.dependents.remove(&cur);
                    if b.dependents.is_empty() {
                        stack.push(base);
                    }
                }
            }
        }
        count
    }
}

/// 内存竞技场
pub struct MemoryArena {
    table: Mutex<ArenaTable>,
    /// 字节上限, 0 表示不限
    limit: usize,
}

impl Default for MemoryArena {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryArena {
    /// 创建竞技场, `limit` 为字节上限 (0 表示不限)
    pub fn new(limit: usize) -> Self {
        Self {
            table: Mutex::new(ArenaTable::default()),
            limit,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, ArenaTable> {
        // 持锁线程 panic 不会破坏表结构, 直接取回内部数据
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert<T: Send + Sync + 'static>(
        &self,
        value: T,
        size: usize,
        bases: &[BlockId],
    ) -> BsResult<Handle<T>> {
        let mut table = self.lock_table();
        if self.limit != 0 && table.bytes + size > self.limit {
            return Err(BsError::AllocFailure(format!(
                "竞技场超出上限: 已用 {} + 请求 {} > {}",
                table.bytes, size, self.limit
            )));
        }
        for base in bases {
            if !table.blocks.contains_key(base) {
                return Err(BsError::BadHandle);
            }
        }
        table.next_id += 1;
        let id = table.next_id;
        for base in bases {
            table.block_mut(*base)?.dependents.insert(id);
        }
        table.blocks.insert(
            id,
            Block {
                payload: Arc::new(value),
                size,
                bases: bases.to_vec(),
                dependents: HashSet::new(),
                locks: 0,
                pending_free: false,
            },
        );
        table.bytes += size;
        Ok(Handle {
            id,
            _marker: PhantomData,
        })
    }

    /// 分配一个对象, 并声明它依赖 `bases`
    pub fn alloc<T: Send + Sync + 'static>(
        &self,
        value: T,
        bases: &[BlockId],
    ) -> BsResult<Handle<T>> {
        self.insert(value, std::mem::size_of::<T>(), bases)
    }

    /// 分配 `count` 个默认值元素的数组
    pub fn alloc_array<T: Default + Clone + Send + Sync + 'static>(
        &self,
        count: usize,
        bases: &[BlockId],
    ) -> BsResult<Handle<Vec<T>>> {
        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| BsError::AllocFailure(format!("数组长度溢出: {}", count)))?;
        if self.limit != 0 && size > self.limit {
            return Err(BsError::AllocFailure(format!(
                "数组大小 {} 超出竞技场上限 {}",
                size, self.limit
            )));
        }
        let mut v = Vec::new();
        v.try_reserve_exact(count)
            .map_err(|e| BsError::AllocFailure(e.to_string()))?;
        v.resize(count, T::default());
        self.insert(v, size, bases)
    }

    /// 声明 `dependent` 依赖 `base`
    pub fn bound(&self, dependent: BlockId, base: BlockId) -> BsResult<()> {
        if dependent == base {
            return Err(BsError::InvalidArgument("块不能依赖自身".into()));
        }
        let mut table = self.lock_table();
        if !table.blocks.contains_key(&dependent) {
            return Err(BsError::BadHandle);
        }
        let base_block = table.block_mut(base)?;
        if !base_block.dependents.insert(dependent) {
            return Ok(());
        }
        table.block_mut(dependent)?.bases.push(base);
        Ok(())
    }

    /// 释放块. 返回值表示是否被立即回收.
    pub fn free(&self, id: BlockId) -> BsResult<bool> {
        let mut table = self.lock_table();
        let block = table.block_mut(id)?;
        if block.pending_free {
            return Ok(false);
        }
        block.pending_free = true;
        Ok(table.try_release(id) > 0)
    }

    /// 加锁, 阻止回收
    pub fn lock(&self, id: BlockId) -> BsResult<()> {
        let mut table = self.lock_table();
        table.block_mut(id)?.locks += 1;
        Ok(())
    }

    /// 解锁. 返回值表示是否因此被回收.
    pub fn unlock(&self, id: BlockId) -> BsResult<bool> {
        let mut table = self.lock_table();
        let block = table.block_mut(id)?;
        if block.locks == 0 {
            return Err(BsError::InvalidArgument(format!("块 {} 未加锁", id)));
        }
        block.locks -= 1;
        if block.locks > 0 {
            return Ok(false);
        }
        Ok(table.try_release(id) > 0)
    }

    /// 加锁并返回 RAII 守卫, 守卫析构时自动解锁
    pub fn pin<T>(self: &Arc<Self>, handle: Handle<T>) -> BsResult<PinGuard> {
        self.lock(handle.id)?;
        Ok(PinGuard {
            arena: Arc::clone(self),
            id: handle.id,
        })
    }

    /// 取得块内对象
    pub fn get<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> BsResult<Arc<T>> {
        let table = self.lock_table();
        let block = table.blocks.get(&handle.id).ok_or(BsError::BadHandle)?;
        Arc::clone(&block.payload)
            .downcast::<T>()
            .map_err(|_| BsError::BadHandle)
    }

    /// 块是否仍存活 (未被物理回收)
    pub fn is_live(&self, id: BlockId) -> bool {
        self.lock_table().blocks.contains_key(&id)
    }

    /// 存活块数量
    pub fn live_blocks(&self) -> usize {
        self.lock_table().blocks.len()
    }

    /// 已用字节数
    pub fn bytes_in_use(&self) -> usize {
        self.lock_table().bytes
    }

    /// 累计回收块数
    pub fn released_blocks(&self) -> u64 {
        self.lock_table().released
    }
}

/// 块锁守卫
pub struct PinGuard {
    arena: Arc<MemoryArena>,
    id: BlockId,
}

impl PinGuard {
    pub fn id(&self) -> BlockId {
        self.id
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Err(err) = self.arena.unlock(self.id) {
            warn!("arena: 解锁块 {} 失败: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_is_deferred_while_dependent_exists() {
        let arena = MemoryArena::new(0);
        let base = arena.alloc(vec![1u8; 16], &[]).unwrap();
        let dep = arena.alloc(7u32, &[]).unwrap();
        arena.bound(dep.id(), base.id()).unwrap();

        assert!(!arena.free(base.id()).unwrap(), "仍有从属块时不应回收");
        assert!(arena.is_live(base.id()));
        assert_eq!(*arena.get(base).unwrap(), vec![1u8; 16]);

        // 释放从属块后基础块随之回收
        assert!(arena.free(dep.id()).unwrap());
        assert!(!arena.is_live(dep.id()));
        assert!(!arena.is_live(base.id()));
        assert_eq!(arena.live_blocks(), 0);
        assert_eq!(arena.released_blocks(), 2);
    }

    #[test]
    fn test_lock_defers_release() {
        let arena = MemoryArena::new(0);
        let h = arena.alloc(String::from("sps"), &[]).unwrap();
        arena.lock(h.id()).unwrap();
        arena.lock(h.id()).unwrap();
        assert!(!arena.free(h.id()).unwrap());
        assert!(!arena.unlock(h.id()).unwrap());
        assert!(arena.is_live(h.id()));
        assert!(arena.unlock(h.id()).unwrap());
        assert!(matches!(arena.get(h), Err(BsError::BadHandle)));
    }

    #[test]
    fn test_unfreed_base_survives_dependent_release() {
        let arena = MemoryArena::new(0);
        let base = arena.alloc(1u64, &[]).unwrap();
        let dep = arena.alloc(2u64, &[base.id()]).unwrap();
        assert!(arena.free(dep.id()).unwrap());
        assert!(arena.is_live(base.id()), "未调用 free 的基础块不应被回收");
    }

    #[test]
    fn test_release_recurses_through_chain() {
        let arena = MemoryArena::new(0);
        let sps = arena.alloc(1u8, &[]).unwrap();
        let pps = arena.alloc(2u8, &[sps.id()]).unwrap();
        let slice = arena.alloc(3u8, &[pps.id()]).unwrap();
        arena.free(sps.id()).unwrap();
        arena.free(pps.id()).unwrap();
        assert_eq!(arena.live_blocks(), 3);
        arena.free(slice.id()).unwrap();
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn test_pin_guard_unlocks_on_drop() {
        let arena = Arc::new(MemoryArena::new(0));
        let h = arena.alloc([0u8; 4], &[]).unwrap();
        {
            let _guard = arena.pin(h).unwrap();
            arena.free(h.id()).unwrap();
            assert!(arena.is_live(h.id()));
        }
        assert!(!arena.is_live(h.id()));
    }

    #[test]
    fn test_alloc_limit() {
        let arena = MemoryArena::new(64);
        let ok = arena.alloc_array::<u8>(32, &[]);
        assert!(ok.is_ok());
        let err = arena.alloc_array::<u8>(64, &[]);
        assert!(matches!(err, Err(BsError::AllocFailure(_))));
        assert_eq!(arena.bytes_in_use(), 32);
    }

    #[test]
    fn test_type_mismatch_is_bad_handle() {
        let arena = MemoryArena::new(0);
        let h = arena.alloc(5u32, &[]).unwrap();
        let wrong: Handle<u64> = Handle {
            id: h.id(),
            _marker: PhantomData,
        };
        assert!(matches!(arena.get(wrong), Err(BsError::BadHandle)));
        assert!(matches!(arena.bound(h.id(), 999), Err(BsError::BadHandle)));
    }
}
