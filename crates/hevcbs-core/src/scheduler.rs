//! 基于依赖图的任务调度器.
//!
//! 固定大小的工作线程池, 每个空闲线程从队列中取出优先级最高的就绪任务执行.
//! 任务状态流转:
//!
//! ```text
//! Waiting ──(依赖全部完成)──> Queued ──> Working ──> Done / Failed
//!    │                          │
//!    └──(依赖失败或丢失)────────┴──> Lost (向所有从属任务传递)
//! ```
//!
//! 队列容量有上限, 满时只能逐出处于终态且没有未结束从属任务的记录.
//! 以 Failed / Lost 结束的任务记录被回收后, 其 id 仍保留在有界的失败表中,
//! 之后依赖它提交的任务直接标记为 Lost.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::{BsError, BsResult};

/// 任务例程
pub type Routine = Box<dyn FnOnce() -> BsResult<()> + Send + 'static>;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Done,
    Working,
    Waiting,
    Queued,
    Lost,
    Failed,
}

impl TaskState {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Lost | Self::Failed)
    }
}

/// 任务同步点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncPoint(u64);

impl SyncPoint {
    pub fn id(self) -> u64 {
        self.0
    }
}

struct TaskEntry {
    routine: Option<Routine>,
    priority: i32,
    pending_deps: usize,
    dependents: Vec<u64>,
    state: TaskState,
    detached: bool,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    /// 同优先级按提交顺序, 取反以使 BinaryHeap 先弹出较早的任务
    order: std::cmp::Reverse<u64>,
}

/// 失败表保留的 id 数
const FAILED_HISTORY: usize = 4096;

/// 已回收记录的依赖解析结果
enum Resolved {
    Done,
    Lost,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<u64, TaskEntry>,
    queue: BinaryHeap<(QueueKey, u64)>,
    next_id: u64,
    shutdown: bool,
    /// 以 Failed / Lost 结束且记录已回收的任务
    failed: HashSet<u64>,
    failed_order: VecDeque<u64>,
}

impl TaskTable {
    /// 删除任务记录, 失败的任务记入失败表
    fn remove(&mut self, id: u64) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        if matches!(task.state, TaskState::Failed | TaskState::Lost) && self.failed.insert(id) {
            self.failed_order.push_back(id);
            if self.failed_order.len() > FAILED_HISTORY {
                if let Some(old) = self.failed_order.pop_front() {
                    self.failed.remove(&old);
                }
            }
        }
    }

    /// 解析没有记录的依赖 id
    fn resolve_missing(&self, id: u64) -> BsResult<Resolved> {
        if id == 0 || id > self.next_id {
            return Err(BsError::BadHandle);
        }
        if self.failed.contains(&id) {
            Ok(Resolved::Lost)
        } else {
            Ok(Resolved::Done)
        }
    }

    fn enqueue(&mut self, id: u64) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Queued;
            let key = QueueKey {
                priority: task.priority,
                order: std::cmp::Reverse(id),
            };
            self.queue.push((key, id));
        }
    }

    /// 将 `id` 及其所有传递从属任务标记为 Lost
    fn mark_lost(&mut self, id: u64) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(task) = self.tasks.get_mut(&cur) else {
                continue;
            };
            if task.state.is_terminal() || task.state == TaskState::Working {
                continue;
            }
            task.state = TaskState::Lost;
            task.routine = None;
            trace!("scheduler: 任务 {} 丢失", cur);
            stack.append(&mut task.dependents);
        }
    }

    /// 任务进入终态后通知从属任务
    fn resolve_dependents(&mut self, id: u64, state: TaskState) {
        // 通知过的从属任务不再计入, 记录随后可被逐出
        let dependents = match self.tasks.get_mut(&id) {
            Some(task) => std::mem::take(&mut task.dependents),
            None => return,
        };
        for dep in dependents {
            if state == TaskState::Done {
                let ready = match self.tasks.get_mut(&dep) {
                    Some(task) if task.state == TaskState::Waiting => {
                        task.pending_deps = task.pending_deps.saturating_sub(1);
                        task.pending_deps == 0
                    }
                    _ => false,
                };
                if ready {
                    self.enqueue(dep);
                }
            } else {
                self.mark_lost(dep);
            }
        }
    }

    /// 回收已分离且处于终态的任务
    fn collect_detached(&mut self) {
        let done: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.detached && t.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            self.remove(id);
        }
    }

    /// 从属任务中是否还有未结束的
    fn has_live_dependents(&self, task: &TaskEntry) -> bool {
        task.dependents.iter().any(|d| {
            self.tasks
                .get(d)
                .is_some_and(|t| !t.state.is_terminal())
        })
    }

    /// 逐出一条处于终态且无未结束从属任务的记录
    fn evict_one(&mut self) -> bool {
        let victim = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state.is_terminal() && !self.has_live_dependents(t))
            .map(|(id, _)| *id)
            .min();
        match victim {
            Some(id) => {
                self.remove(id);
                true
            }
            None => false,
        }
    }
}

struct Shared {
    table: Mutex<TaskTable>,
    /// 有新任务就绪
    work_cv: Condvar,
    /// 有任务进入终态
    done_cv: Condvar,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 任务调度器
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    /// 创建调度器.
    ///
    /// `threads` 为 0 时使用硬件并发数; `capacity` 为任务表上限.
    pub fn new(threads: usize, capacity: usize) -> BsResult<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
        let shared = Arc::new(Shared {
            table: Mutex::new(TaskTable::default()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            capacity: capacity.max(1),
        });
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("hevcbs-worker-{}", idx))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!("scheduler: 启动 {} 个工作线程, 容量 {}", threads, capacity);
        Ok(Self { shared, workers })
    }

    /// 工作线程数
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// 提交任务
    pub fn submit(
        &self,
        routine: Routine,
        priority: i32,
        dependencies: &[SyncPoint],
    ) -> BsResult<SyncPoint> {
        let mut table = self.shared.lock();
        if table.shutdown {
            return Err(BsError::Scheduling("调度器已关闭".into()));
        }
        table.collect_detached();
        while table.tasks.len() >= self.shared.capacity {
            if !table.evict_one() {
                return Err(BsError::Scheduling(format!(
                    "任务队列已满 (容量 {})",
                    self.shared.capacity
                )));
            }
        }

        let mut lost = false;
        for dep in dependencies {
            if !table.tasks.contains_key(&dep.0) {
                if let Resolved::Lost = table.resolve_missing(dep.0)? {
                    lost = true;
                }
            }
        }

        table.next_id += 1;
        let id = table.next_id;
        let mut pending = 0usize;
        for dep in dependencies {
            if let Some(task) = table.tasks.get_mut(&dep.0) {
                match task.state {
                    TaskState::Done => {}
                    TaskState::Lost | TaskState::Failed => lost = true,
                    _ => {
                        task.dependents.push(id);
                        pending += 1;
                    }
                }
            }
        }

        let state = if lost {
            TaskState::Lost
        } else if pending > 0 {
            TaskState::Waiting
        } else {
            TaskState::Queued
        };
        table.tasks.insert(
            id,
            TaskEntry {
                routine: if lost { None } else { Some(routine) },
                priority,
                pending_deps: pending,
                dependents: Vec::new(),
                state,
                detached: false,
            },
        );
        match state {
            TaskState::Queued => {
                table.enqueue(id);
                self.shared.work_cv.notify_one();
            }
            TaskState::Lost => {
                self.shared.done_cv.notify_all();
            }
            _ => {}
        }
        trace!("scheduler: 提交任务 {} ({:?}, 优先级 {})", id, state, priority);
        Ok(SyncPoint(id))
    }

    /// 为尚未开始的任务追加依赖
    pub fn add_dependency(&self, task: SyncPoint, dependency: SyncPoint) -> BsResult<()> {
        let mut table = self.shared.lock();
        let task_state = table
            .tasks
            .get(&task.0)
            .map(|t| t.state)
            .ok_or(BsError::BadHandle)?;
        if !matches!(task_state, TaskState::Queued | TaskState::Waiting) {
            return Err(BsError::InvalidArgument(format!(
                "任务 {} 已开始执行, 无法追加依赖",
                task.0
            )));
        }
        let dep_state = match table.tasks.get(&dependency.0) {
            Some(dep) => Some(dep.state),
            None => match table.resolve_missing(dependency.0)? {
                Resolved::Done => None,
                Resolved::Lost => Some(TaskState::Lost),
            },
        };
        match dep_state {
            None | Some(TaskState::Done) => Ok(()),
            Some(TaskState::Lost) | Some(TaskState::Failed) => {
                table.mark_lost(task.0);
                self.shared.done_cv.notify_all();
                Ok(())
            }
            Some(_) => {
                if let Some(dep) = table.tasks.get_mut(&dependency.0) {
                    dep.dependents.push(task.0);
                }
                if let Some(t) = table.tasks.get_mut(&task.0) {
                    t.pending_deps += 1;
                    // 已在队列中的条目会在出队时因状态不符被跳过
                    t.state = TaskState::Waiting;
                }
                Ok(())
            }
        }
    }

    /// 等待任务进入终态或超时.
    ///
    /// `timeout` 为 `None` 时无限等待; `keep_stat` 为假时终态任务记录随即删除.
    pub fn sync(
        &self,
        point: SyncPoint,
        timeout: Option<Duration>,
        keep_stat: bool,
    ) -> BsResult<TaskState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.shared.lock();
        loop {
            let state = table
                .tasks
                .get(&point.0)
                .map(|t| t.state)
                .ok_or(BsError::BadHandle)?;
            if state.is_terminal() {
                if !keep_stat {
                    table.remove(point.0);
                }
                return Ok(state);
            }
            table = match deadline {
                None => self
                    .shared
                    .done_cv
                    .wait(table)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(state);
                    }
                    self.shared
                        .done_cv
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// 取消任务.
    ///
    /// 尚未开始的任务被标记为 Lost 并返回真; 正在执行的任务等待至多 `timeout`,
    /// 超时仍在执行则返回假.
    pub fn abort(&self, point: SyncPoint, timeout: Option<Duration>) -> BsResult<bool> {
        {
            let mut table = self.shared.lock();
            let state = table
                .tasks
                .get(&point.0)
                .map(|t| t.state)
                .ok_or(BsError::BadHandle)?;
            match state {
                TaskState::Queued | TaskState::Waiting => {
                    table.mark_lost(point.0);
                    self.shared.done_cv.notify_all();
                    debug!("scheduler: 任务 {} 已取消", point.0);
                    return Ok(true);
                }
                s if s.is_terminal() => return Ok(true),
                _ => {}
            }
        }
        let state = self.sync(point, timeout.or(Some(Duration::ZERO)), true)?;
        if !state.is_terminal() {
            warn!("scheduler: 任务 {} 仍在执行, 取消失败", point.0);
        }
        Ok(state.is_terminal())
    }

    /// 分离任务: 调用方不再 sync, 任务进入终态后自动回收
    pub fn detach(&self, point: SyncPoint) -> BsResult<()> {
        let mut table = self.shared.lock();
        let task = table.tasks.get_mut(&point.0).ok_or(BsError::BadHandle)?;
        task.detached = true;
        if task.state.is_terminal() {
            table.remove(point.0);
        }
        Ok(())
    }

    /// 查询任务当前状态
    pub fn state(&self, point: SyncPoint) -> Option<TaskState> {
        self.shared.lock().tasks.get(&point.0).map(|t| t.state)
    }

    /// 任务表中的记录数
    pub fn len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        {
            let mut table = self.shared.lock();
            table.shutdown = true;
            let ids: Vec<u64> = table
                .tasks
                .iter()
                .filter(|(_, t)| matches!(t.state, TaskState::Queued | TaskState::Waiting))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                table.mark_lost(id);
            }
        }
        self.shared.work_cv.notify_all();
        self.shared.done_cv.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("scheduler: 工作线程异常退出");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (id, routine) = {
            let mut table = shared.lock();
            loop {
                if table.shutdown {
                    return;
                }
                let mut picked = None;
                while let Some((_, id)) = table.queue.pop() {
                    let runnable = table
                        .tasks
                        .get(&id)
                        .is_some_and(|t| t.state == TaskState::Queued);
                    if runnable {
                        picked = Some(id);
                        break;
                    }
                }
                if let Some(id) = picked {
                    let routine = table.tasks.get_mut(&id).and_then(|t| {
                        t.state = TaskState::Working;
                        t.routine.take()
                    });
                    if let Some(routine) = routine {
                        break (id, routine);
                    }
                    continue;
                }
                table = shared
                    .work_cv
                    .wait(table)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(routine));
        let state = match outcome {
            Ok(Ok(())) => TaskState::Done,
            Ok(Err(err)) => {
                debug!("scheduler: 任务 {} 失败: {}", id, err);
                TaskState::Failed
            }
            Err(_) => {
                warn!("scheduler: 任务 {} panic", id);
                TaskState::Failed
            }
        };

        let mut table = shared.lock();
        if let Some(task) = table.tasks.get_mut(&id) {
            task.state = state;
        }
        table.resolve_dependents(id, state);
        let detached = table.tasks.get(&id).is_some_and(|t| t.detached);
        if detached {
            table.remove(id);
        }
        drop(table);
        shared.done_cv.notify_all();
        shared.work_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_failed_dependency_marks_dependent_lost() {
        let sched = TaskScheduler::new(2, 16).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let t1 = sched
            .submit(
                Box::new(|| Err(BsError::syntax("故意失败"))),
                0,
                &[],
            )
            .unwrap();
        let ran2 = Arc::clone(&ran);
        let t2 = sched
            .submit(
                Box::new(move || {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                0,
                &[t1],
            )
            .unwrap();
        assert_eq!(sched.sync(t1, None, false).unwrap(), TaskState::Failed);
        assert_eq!(sched.sync(t2, None, false).unwrap(), TaskState::Lost);
        assert!(!ran.load(Ordering::SeqCst), "丢失的任务不应执行");
    }

    #[test]
    fn test_reclaimed_failed_dependency_marks_dependent_lost() {
        let sched = TaskScheduler::new(1, 16).unwrap();
        let t1 = sched
            .submit(Box::new(|| Err(BsError::syntax("故意失败"))), 0, &[])
            .unwrap();
        assert_eq!(sched.sync(t1, None, true).unwrap(), TaskState::Failed);
        // 记录回收后依赖关系仍按失败处理
        sched.detach(t1).unwrap();
        assert_eq!(sched.state(t1), None);

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let t2 = sched
            .submit(
                Box::new(move || {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                0,
                &[t1],
            )
            .unwrap();
        assert_eq!(sched.sync(t2, None, false).unwrap(), TaskState::Lost);
        assert!(!ran.load(Ordering::SeqCst), "丢失的任务不应执行");

        // t2 以 Lost 结束且已回收, 追加依赖同样传播丢失
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        let blocker = sched
            .submit(
                Box::new(move || {
                    while !g.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    Ok(())
                }),
                0,
                &[],
            )
            .unwrap();
        let t3 = sched.submit(Box::new(|| Ok(())), 0, &[blocker]).unwrap();
        sched.add_dependency(t3, t2).unwrap();
        assert_eq!(sched.state(t3), Some(TaskState::Lost));
        gate.store(true, Ordering::SeqCst);
        assert_eq!(sched.sync(blocker, None, false).unwrap(), TaskState::Done);
    }

    #[test]
    fn test_resolved_dependents_allow_eviction() {
        let sched = TaskScheduler::new(1, 4).unwrap();
        for _ in 0..4 {
            let a = sched
                .submit(
                    Box::new(|| {
                        std::thread::sleep(Duration::from_millis(10));
                        Ok(())
                    }),
                    0,
                    &[],
                )
                .unwrap();
            let b = sched.submit(Box::new(|| Ok(())), 0, &[a]).unwrap();
            assert_eq!(sched.sync(b, None, false).unwrap(), TaskState::Done);
            assert_eq!(sched.sync(a, None, true).unwrap(), TaskState::Done);
        }
        // 每轮保留的 a 已无未结束的从属任务, 均可逐出
        assert!(sched.len() <= 4);
        let last = sched.submit(Box::new(|| Ok(())), 0, &[]).unwrap();
        assert_eq!(sched.sync(last, None, false).unwrap(), TaskState::Done);
    }

    #[test]
    fn test_dependency_chain_preserves_order() {
        let sched = TaskScheduler::new(4, 64).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut prev: Option<SyncPoint> = None;
        let mut points = Vec::new();
        for i in 0..8 {
            let order = Arc::clone(&order);
            let deps: Vec<SyncPoint> = prev.into_iter().collect();
            let p = sched
                .submit(
                    Box::new(move || {
                        order.lock().unwrap().push(i);
                        Ok(())
                    }),
                    0,
                    &deps,
                )
                .unwrap();
            points.push(p);
            prev = Some(p);
        }
        for p in points {
            assert_eq!(sched.sync(p, None, false).unwrap(), TaskState::Done);
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_abort_waiting_task() {
        let sched = TaskScheduler::new(1, 16).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let gate2 = Arc::clone(&gate);
        let blocker = sched
            .submit(
                Box::new(move || {
                    let (lock, cv) = &*gate2;
                    let mut open = lock.lock().unwrap();
                    while !*open {
                        open = cv.wait(open).unwrap();
                    }
                    Ok(())
                }),
                0,
                &[],
            )
            .unwrap();
        let waiting = sched.submit(Box::new(|| Ok(())), 0, &[blocker]).unwrap();
        let follower = sched.submit(Box::new(|| Ok(())), 0, &[waiting]).unwrap();
        assert!(sched.abort(waiting, None).unwrap());
        assert_eq!(sched.state(follower), Some(TaskState::Lost));

        // 正在执行的任务无法取消
        std::thread::sleep(Duration::from_millis(20));
        assert!(!sched.abort(blocker, Some(Duration::from_millis(10))).unwrap());
        {
            let (lock, cv) = &*gate;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        assert_eq!(sched.sync(blocker, None, false).unwrap(), TaskState::Done);
    }

    #[test]
    fn test_queue_overflow_and_eviction() {
        let sched = TaskScheduler::new(1, 2).unwrap();
        let a = sched.submit(Box::new(|| Ok(())), 0, &[]).unwrap();
        assert_eq!(sched.sync(a, None, true).unwrap(), TaskState::Done);
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        let b = sched
            .submit(
                Box::new(move || {
                    while !g.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    Ok(())
                }),
                0,
                &[],
            )
            .unwrap();
        // a 处于终态且无从属任务, 可被逐出
        let c = sched.submit(Box::new(|| Ok(())), 0, &[b]).unwrap();
        assert_eq!(sched.state(a), None);
        // b 与 c 均未结束, 无可逐出记录
        let overflow = sched.submit(Box::new(|| Ok(())), 0, &[]);
        assert!(matches!(overflow, Err(BsError::Scheduling(_))));
        gate.store(true, Ordering::SeqCst);
        assert_eq!(sched.sync(c, None, false).unwrap(), TaskState::Done);
        assert_eq!(sched.sync(b, None, false).unwrap(), TaskState::Done);
    }

    #[test]
    fn test_detached_tasks_are_collected() {
        let sched = TaskScheduler::new(2, 16).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let p = sched
            .submit(
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                0,
                &[],
            )
            .unwrap();
        sched.detach(p).unwrap();
        let tail = sched.submit(Box::new(|| Ok(())), -1, &[p]).unwrap();
        assert_eq!(sched.sync(tail, None, false).unwrap(), TaskState::Done);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(sched.sync(p, None, false), Err(BsError::BadHandle)));
    }

    #[test]
    fn test_panicking_routine_is_failed() {
        let sched = TaskScheduler::new(1, 4).unwrap();
        let p = sched
            .submit(Box::new(|| -> BsResult<()> { panic!("worker panic") }), 0, &[])
            .unwrap();
        assert_eq!(sched.sync(p, None, false).unwrap(), TaskState::Failed);
    }
}
