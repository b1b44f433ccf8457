//! 缓存层
//!
//! 缓冲缓存把磁盘块的副本保存在固定大小的内存池中，按 `(dev, blockno)`
//! 定位，既减少磁盘读取，也是多线程访问同一磁盘块时的同步点。
//!
//! 缓冲块按哈希键分散在 [`NBUFMAP_BUCKET`] 个桶中，每个桶一把自旋锁；
//! 未命中时的替换路径由每个哈希键一把的驱逐锁串行化，并在全部桶中
//! 寻找 `lastuse` 最小且引用计数为零的缓冲块作为牺牲者。
//! 缓冲块本体存放在扁平数组里，桶链表只保存数组下标，
//! 因此"一个缓冲块同一时刻只属于一个桶"是结构性保证。

use array_macro::array;

use core::cell::Cell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::consts::{BSIZE, NBUF, NBUFMAP_BUCKET};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};
use super::device::BlockDevice;

/// 计算 `(dev, blockno)` 的哈希桶键。
#[inline]
fn bufmap_hash(dev: u32, blockno: u32) -> usize {
    ((((dev as u64) << 27) | blockno as u64) % NBUFMAP_BUCKET as u64) as usize
}

/// 缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `BufCache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问并提升 I/O 性能。它按近似 LRU（最久未使用的
/// 空闲块优先被替换）策略回收缓冲块，并通过桶自旋锁与每块一把的
/// 睡眠锁实现线程安全的数据访问。
///
/// 该结构在挂载阶段被构造，是文件系统与块设备驱动之间的关键缓冲层。
pub struct BufCache {
    /// 桶链表，每个桶由一把自旋锁保护。
    /// 桶锁同时保护当前挂在该桶中所有缓冲块的控制字段（`BufCtrl`）。
    buckets: [SpinLock<BufMap>; NBUFMAP_BUCKET],

    /// 每个哈希键一把驱逐锁，串行化指向同一键的并发未命中，
    /// 防止同一磁盘块被装入两个缓冲块。
    eviction: [SpinLock<()>; NBUFMAP_BUCKET],

    /// 缓冲块控制字段（身份、引用计数、时间戳、桶内后继）。
    /// 访问约定见 [`BufCtrl`]。
    ctrl: [BufCtrl; NBUF],

    /// 缓冲块数据本体，每块由睡眠锁保护。
    bufs: [BufInner; NBUF],

    /// 单调递增的时间戳源，引用计数归零时给缓冲块打 `lastuse` 戳。
    ticks: AtomicU64,

    /// 底层块设备驱动。
    disk: Arc<dyn BlockDevice>,
}

/// 安全性：`ctrl` 中的 `Cell` 字段只在持有所属桶的桶锁
/// （或驱逐重链时按既定顺序持有的两把桶锁）时访问，
/// 互斥性由锁约定而非类型系统保证。
unsafe impl Sync for BufCache {}

/// 单个哈希桶：以数组下标表达的单向链表表头。
struct BufMap {
    head: Option<usize>,
}

impl BufCache {
    /// 创建缓冲缓存并把所有缓冲块挂入 0 号桶。
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let cache = Self {
            buckets: array![_ => SpinLock::new(BufMap { head: None }, "bufmap"); NBUFMAP_BUCKET],
            eviction: array![_ => SpinLock::new((), "bufeviction"); NBUFMAP_BUCKET],
            ctrl: array![_ => BufCtrl::new(); NBUF],
            bufs: array![_ => BufInner::new(); NBUF],
            ticks: AtomicU64::new(0),
            disk,
        };

        // 初始时全部缓冲块都没有身份，串在 0 号桶里等待被回收使用
        let mut bucket = cache.buckets[0].lock();
        for i in (0..NBUF).rev() {
            cache.ctrl[i].next.set(bucket.head);
            bucket.head = Some(i);
        }
        drop(bucket);
        cache
    }

    /// 在持有对应桶锁的前提下，在桶链表中查找 `(dev, blockno)`。
    fn scan_bucket(&self, map: &BufMap, dev: u32, blockno: u32) -> Option<usize> {
        let mut cur = map.head;
        while let Some(index) = cur {
            let ctrl = &self.ctrl[index];
            if ctrl.dev.get() == dev && ctrl.blockno.get() == blockno {
                return Some(index);
            }
            cur = ctrl.next.get();
        }
        None
    }

    /// 获取指定设备与块号对应的缓冲块引用。
    ///
    /// # 功能说明
    /// `bget` 是缓冲区缓存系统的底层接口，用于查找是否已缓存给定的
    /// `(dev, blockno)` 对应的块。若缓存命中，增加引用计数后返回；
    /// 否则回收一个引用计数为零的缓冲块并将其分配给新请求。
    /// 该函数不涉及实际磁盘读写，调用者需通过 `valid` 标志判断是否
    /// 需要从磁盘加载数据。
    ///
    /// # 流程解释
    /// - 快路径：锁住目标桶并查找，命中则 `refcnt+1` 返回；
    /// - 慢路径：先取得该哈希键的驱逐锁（串行化同键并发未命中），
    ///   再次查找目标桶 —— 两次加锁之间别的线程可能已装入该块；
    /// - 仍未命中时按桶序扫描全部桶，寻找 `refcnt == 0` 且 `lastuse`
    ///   最小的缓冲块。扫描期间始终持有当前最优候选所在桶的锁
    ///   （手递手策略），封住"选中后、摘除前"牺牲者被别人引用的窗口；
    /// - 若牺牲者不在目标桶中，将其摘出原桶、挂入目标桶，
    ///   然后绑定新身份并将 `valid` 清零；
    /// - 释放全部自旋锁后获取缓冲块的睡眠锁并返回。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都处于被引用状态时无法替换，触发 panic
    ///   （`"bget: no buffers"`）。
    ///
    /// # 安全性
    /// - 控制字段的修改都在所属桶锁的保护下进行；
    /// - 扫描阶段按桶下标递增的顺序取锁，且最多额外持有一把
    ///   "当前最优"桶锁，因此并发驱逐之间不会构成环路等待；
    /// - 睡眠锁的获取放在所有自旋锁释放之后。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = bufmap_hash(dev, blockno);

        // 快路径
        {
            let bucket = self.buckets[key].lock();
            if let Some(index) = self.scan_bucket(&bucket, dev, blockno) {
                let ctrl = &self.ctrl[index];
                ctrl.refcnt.set(ctrl.refcnt.get() + 1);
                drop(bucket);
                return self.take_buf(index, dev, blockno);
            }
        }

        // 慢路径
        let evicting = self.eviction[key].lock();

        // 重新检查：驱逐锁拿到之前别的线程可能已经装入该块
        {
            let bucket = self.buckets[key].lock();
            if let Some(index) = self.scan_bucket(&bucket, dev, blockno) {
                let ctrl = &self.ctrl[index];
                ctrl.refcnt.set(ctrl.refcnt.get() + 1);
                drop(bucket);
                drop(evicting);
                return self.take_buf(index, dev, blockno);
            }
        }

        // 全局回收：找 lastuse 最小的空闲缓冲块，手递手持有候选所在桶的锁
        let mut best: Option<Victim> = None;
        let mut best_guard: Option<SpinLockGuard<'_, BufMap>> = None;
        for i in 0..NBUFMAP_BUCKET {
            let guard = self.buckets[i].lock();
            let mut found = false;
            let mut prev: Option<usize> = None;
            let mut cur = guard.head;
            while let Some(index) = cur {
                let ctrl = &self.ctrl[index];
                if ctrl.refcnt.get() == 0
                    && best
                        .as_ref()
                        .map_or(true, |v| ctrl.lastuse.get() < v.lastuse)
                {
                    best = Some(Victim {
                        bucket: i,
                        prev,
                        index,
                        lastuse: ctrl.lastuse.get(),
                    });
                    found = true;
                }
                prev = Some(index);
                cur = ctrl.next.get();
            }
            if found {
                // 换持新的候选桶锁，旧的随赋值释放
                best_guard = Some(guard);
            }
        }

        let victim = match best {
            Some(v) => v,
            None => panic!("bget: no buffers"),
        };
        let mut guard = best_guard.take().expect("victim bucket lock");
        let ctrl = &self.ctrl[victim.index];
        debug_assert_eq!(ctrl.refcnt.get(), 0);

        if victim.bucket != key {
            // 从原桶摘除
            match victim.prev {
                None => guard.head = ctrl.next.get(),
                Some(p) => self.ctrl[p].next.set(ctrl.next.get()),
            }
            drop(guard);
            // 挂入目标桶
            let mut bucket = self.buckets[key].lock();
            ctrl.next.set(bucket.head);
            bucket.head = Some(victim.index);
            ctrl.dev.set(dev);
            ctrl.blockno.set(blockno);
            ctrl.refcnt.set(1);
            self.bufs[victim.index].valid.store(false, Ordering::Relaxed);
            drop(bucket);
        } else {
            ctrl.dev.set(dev);
            ctrl.blockno.set(blockno);
            ctrl.refcnt.set(1);
            self.bufs[victim.index].valid.store(false, Ordering::Relaxed);
            drop(guard);
        }
        drop(evicting);
        self.take_buf(victim.index, dev, blockno)
    }

    /// 在所有自旋锁都已释放后获取缓冲块睡眠锁，组装 [`Buf`]。
    fn take_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 读取指定设备与块号对应的缓冲块。
    ///
    /// 若缓冲块尚未从磁盘加载（`valid` 为假），先执行一次同步磁盘
    /// 读取再返回；否则直接返回缓存内容。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        let index = b.index;
        if !self.bufs[index].valid.load(Ordering::Relaxed) {
            self.disk.read_block(blockno, b.bytes_mut());
            self.bufs[index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放一次对缓冲块的引用；归零时打上 `lastuse` 时间戳。
    fn brelse(&self, index: usize, dev: u32, blockno: u32) {
        let key = bufmap_hash(dev, blockno);
        let bucket = self.buckets[key].lock();
        let ctrl = &self.ctrl[index];
        let rc = ctrl.refcnt.get();
        debug_assert!(rc > 0);
        ctrl.refcnt.set(rc - 1);
        if rc == 1 {
            ctrl.lastuse
                .set(self.ticks.fetch_add(1, Ordering::Relaxed) + 1);
        }
        drop(bucket);
    }
}

/// 缓冲块数据的包装结构，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 代表一个特定 `(dev, blockno)` 的缓冲区块，持有对其数据的
/// 独占访问权限（由 `SleepLockGuard` 保护），并在生命周期结束时自动
/// 调用 `Drop` 归还引用计数。只要存在引用计数大于零的 `Buf`（或日志
/// 的 pin），该缓冲块的身份就不会被驱逐路径改变。
pub struct Buf<'a> {
    /// 所属缓存。
    cache: &'a BufCache,

    /// 缓冲块在全局缓冲数组中的索引位置。
    index: usize,

    /// 缓冲块对应的设备编号。
    dev: u32,

    /// 缓冲块在设备中的逻辑块号。
    blockno: u32,

    /// 缓冲数据的睡眠锁守卫。
    /// 在 `Buf` 生命周期内保证始终为 `Some`，
    /// `Drop` 时先释放该守卫再归还引用计数。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 将缓冲块内容同步写入磁盘。
    pub fn bwrite(&mut self) {
        let data = self.data.as_ref().unwrap();
        self.cache.disk.write_block(self.blockno, data.bytes());
    }

    /// 缓冲块数据的只读字节视图。
    pub fn bytes(&self) -> &[u8; BSIZE] {
        self.data.as_ref().unwrap().bytes()
    }

    /// 缓冲块数据的可写字节视图。
    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        self.data.as_mut().unwrap().bytes_mut()
    }

    /// 提供指向缓冲区数据的原始常量指针。
    pub fn raw_data(&self) -> *const BufData {
        self.data.as_ref().unwrap().deref()
    }

    /// 提供指向缓冲区数据的原始可变指针。
    pub fn raw_data_mut(&mut self) -> *mut BufData {
        self.data.as_mut().unwrap().deref_mut()
    }

    /// 将缓冲块的引用计数加一，防止其在日志提交前被驱逐。
    ///
    /// 日志层在 `log_write` 记录某块后调用本方法；此后即使所有 `Buf`
    /// 都被释放，该缓冲块仍保持引用计数大于零，提交安装阶段以缓存
    /// 中的内容为准。必须与 [`Buf::unpin`] 配对。
    pub(crate) fn pin(&self) {
        let key = bufmap_hash(self.dev, self.blockno);
        let bucket = self.cache.buckets[key].lock();
        let ctrl = &self.cache.ctrl[self.index];
        ctrl.refcnt.set(ctrl.refcnt.get() + 1);
        drop(bucket);
    }

    /// 解除 [`Buf::pin`] 施加的钉住状态。
    pub(crate) fn unpin(&self) {
        let key = bufmap_hash(self.dev, self.blockno);
        let bucket = self.cache.buckets[key].lock();
        let ctrl = &self.cache.ctrl[self.index];
        let rc = ctrl.refcnt.get();
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.refcnt.set(rc - 1);
        drop(bucket);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        // 先释放睡眠锁，再归还引用计数
        drop(self.data.take());
        self.cache.brelse(self.index, self.dev, self.blockno);
    }
}

/// 全局 LRU 扫描中的候选牺牲者：所在桶、桶内前驱与时间戳。
struct Victim {
    bucket: usize,
    prev: Option<usize>,
    index: usize,
    lastuse: u64,
}

/// 缓冲块控制结构，记录缓冲块的身份与回收元信息。
///
/// 字段全部以 `Cell` 表达：它们受"当前容纳该缓冲块的桶的桶锁"保护，
/// 见 [`BufCache`] 的安全性说明。
struct BufCtrl {
    /// 缓冲块所属的设备号。
    dev: Cell<u32>,

    /// 缓冲块在设备中的逻辑块号。
    blockno: Cell<u32>,

    /// 当前引用计数：在用的 `Buf` 数量加上日志的 pin 数。
    /// 为 0 时该块可被 `bget` 的回收路径替换。
    refcnt: Cell<u32>,

    /// 引用计数最近一次归零时的时间戳，回收时取最小者。
    lastuse: Cell<u64>,

    /// 桶内链表后继（扁平数组下标）。
    next: Cell<Option<usize>>,
}

impl BufCtrl {
    fn new() -> Self {
        Self {
            // dev 取不可能的设备号，避免与首次请求撞出伪命中
            dev: Cell::new(u32::MAX),
            blockno: Cell::new(u32::MAX),
            refcnt: Cell::new(0),
            lastuse: Cell::new(0),
            next: Cell::new(None),
        }
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其有效性标志。
struct BufInner {
    /// 标志该缓冲块的数据是否有效。
    ///
    /// - `true`: 缓冲块已包含对应磁盘块的内容，可直接使用；
    /// - `false`: 需要先从磁盘读取填充数据；
    ///
    /// 由 `bget` 在重绑定身份时清零，由 `bread` 在读盘后置位。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护。
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }

    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
