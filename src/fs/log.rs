//! 日志层
//!
//! 预写重做日志为跨多个磁盘块的文件系统操作提供崩溃原子性。
//! 并发操作共享同一个事务（组提交）：每个操作用
//! [`Log::begin_op`]/[`Log::end_op`] 括住自己的全部写入，最后一个
//! 操作结束时才真正提交。提交顺序固定为：缓存内容复制到日志区并
//! 落盘 → 写日志头（**提交点**）→ 把日志块安装回原位置 → 清空日志头。
//! 崩溃发生在提交点之前则整个事务如同没有发生；发生在提交点之后
//! 则挂载时的恢复流程重放日志，使事务完整生效。

use core::mem;
use core::ptr;
use std::sync::{Arc, Condvar, Mutex};

use crate::consts::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use super::bio::{Buf, BufCache, BufData};
use super::superblock::SuperBlock;

/// 日志子系统，文件系统写操作的统一入口。
///
/// 日志的生命周期与文件系统一致：挂载阶段由 [`Log::new`] 构造并在
/// 必要时执行崩溃恢复，此后每次文件系统调用都通过
/// [`Log::begin_op`] 与 [`Log::end_op`] 管理事务边界。
///
/// # 实现说明
/// - 内部状态由阻塞互斥锁保护，容量不足或正在提交时通过条件变量
///   让调用者休眠，`end_op` 负责唤醒；
/// - 提交动作在不持有状态锁的情况下执行：`committing` 标志阻止了
///   新事务进入，日志头在提交期间不会被并发修改。
pub struct Log {
    /// 日志内部状态（日志头、事务计数、提交标志）。
    inner: Mutex<LogInner>,
    /// 等待日志空间或提交完成的休眠点。
    cond: Condvar,
    /// 底层缓冲缓存。
    bcache: Arc<BufCache>,
}

struct LogInner {
    /// 日志区在磁盘中的起始块号（由超级块中读取）。
    start: u32,
    /// 日志区域中可用块的数量（包括日志头块和数据块）。
    size: u32,
    /// 所在磁盘设备的编号。
    dev: u32,
    /// 当前正在进行的文件系统操作数。
    outstanding: u32,
    /// 指示日志系统是否正在提交事务，
    /// 为 true 时禁止新的文件系统操作进入。
    committing: bool,
    /// 当前事务的日志头，记录了修改的块号及数量。
    lh: LogHeader,
}

impl Log {
    /// 初始化日志系统并在必要时执行崩溃恢复。
    ///
    /// # 功能说明
    /// 从超级块读取日志区域的起始位置与大小，构造日志实例；
    /// 随后读取磁盘上的日志头，若其中仍有记录（说明上次关机前有
    /// 已提交但未安装完的事务），则把日志块写回原位置并清空日志头。
    /// 重放是幂等的：日志块本身就是权威内容，重复安装不改变结果。
    ///
    /// # 参数
    /// - `bcache`: 底层缓冲缓存；
    /// - `sb`: 已校验的超级块；
    /// - `dev`: 日志所在的块设备编号。
    pub fn new(bcache: Arc<BufCache>, sb: &SuperBlock, dev: u32) -> Self {
        debug_assert!(mem::size_of::<LogHeader>() < BSIZE);
        debug_assert_eq!(
            mem::align_of::<BufData>() % mem::align_of::<LogHeader>(),
            0
        );

        let (start, size) = sb.read_log();
        let log = Self {
            inner: Mutex::new(LogInner {
                start,
                size,
                dev,
                outstanding: 0,
                committing: false,
                lh: LogHeader::empty(),
            }),
            cond: Condvar::new(),
            bcache,
        };
        log.recover();
        log
    }

    /// 挂载时的崩溃恢复：重放已提交的日志并清空日志头。
    ///
    /// 与 [`Log::commit`] 一样，持有状态锁时只做快照，
    /// 读写缓冲块（内含睡眠锁）都在释放状态锁之后进行。
    fn recover(&self) {
        log::info!("file system: checking logs");
        let (start, dev) = {
            let inner = self.inner.lock().unwrap();
            (inner.start, inner.dev)
        };
        let lh = self.read_head(start, dev);
        if lh.len > 0 {
            log::info!("file system: recovering from logs");
            self.install_trans(start, dev, &lh, true);
            let empty = {
                let mut inner = self.inner.lock().unwrap();
                inner.lh.len = 0;
                inner.lh.clone()
            };
            self.write_head(start, dev, &empty);
        } else {
            log::info!("file system: no need to recover");
        }
    }

    /// 从磁盘中读取日志头。
    fn read_head(&self, start: u32, dev: u32) -> LogHeader {
        let buf = self.bcache.bread(dev, start);
        let lh = unsafe { ptr::read(buf.raw_data() as *const LogHeader) };
        drop(buf);
        lh
    }

    /// 将日志头写入磁盘。
    /// 在提交流程中这是当前事务真正被提交的时间点。
    fn write_head(&self, start: u32, dev: u32, lh: &LogHeader) {
        let mut buf = self.bcache.bread(dev, start);
        unsafe {
            ptr::copy_nonoverlapping(lh, buf.raw_data_mut() as *mut LogHeader, 1);
        }
        buf.bwrite();
        drop(buf);
    }

    /// 将日志中已提交的块复制回它们原本在磁盘中的位置。
    ///
    /// # 功能说明
    /// 对日志头记录的每个块：读出日志区副本（`start + 1 + i`）与
    /// 原位置缓冲块，把副本内容覆盖过去并同步写盘。
    /// 两种场景共用此函数：
    /// - 正常事务提交（`recovering == false`）：安装后解除
    ///   `log_write` 施加的钉住；
    /// - 挂载时崩溃恢复（`recovering == true`）：当时没有钉住过
    ///   任何缓冲块，只做复制。
    fn install_trans(&self, start: u32, dev: u32, lh: &LogHeader, recovering: bool) {
        for i in 0..lh.len {
            let log_buf = self.bcache.bread(dev, start + 1 + i);
            let mut disk_buf = self.bcache.bread(dev, lh.blocknos[i as usize]);
            disk_buf.bytes_mut().copy_from_slice(log_buf.bytes());
            disk_buf.bwrite();
            if !recovering {
                disk_buf.unpin();
            }
            drop(log_buf);
            drop(disk_buf);
        }
    }

    /// 将缓存中的原始数据块复制到日志区域的磁盘块中。
    ///
    /// 逐块把事务涉及的缓存内容写入日志区（跳过日志头块），
    /// 此后即使崩溃，日志区中也保有本事务的完整新内容。
    fn write_log(&self, start: u32, dev: u32, lh: &LogHeader) {
        for i in 0..lh.len {
            let mut log_buf = self.bcache.bread(dev, start + 1 + i);
            let cache_buf = self.bcache.bread(dev, lh.blocknos[i as usize]);
            log_buf.bytes_mut().copy_from_slice(cache_buf.bytes());
            log_buf.bwrite();
            drop(cache_buf);
            drop(log_buf);
        }
    }

    /// 提交当前事务。
    ///
    /// # 流程解释
    /// 1. 短暂加锁取出日志头快照（提交期间 `committing` 标志保证
    ///    没有别的线程改动日志头）；
    /// 2. 日志头非空时依次执行：复制缓存块到日志区并落盘、
    ///    写日志头（提交点）、安装回原位置并解除钉住、
    ///    清空内存与磁盘上的日志头。
    ///
    /// # 安全性
    /// 调用时必须已设置 `committing`，且不得持有 `inner` 锁，
    /// 否则安装期间的缓冲块睡眠锁会和状态锁构成嵌套。
    fn commit(&self) {
        let (start, dev, lh) = {
            let inner = self.inner.lock().unwrap();
            debug_assert!(inner.committing);
            (inner.start, inner.dev, inner.lh.clone())
        };

        if lh.len > 0 {
            self.write_log(start, dev, &lh);
            self.write_head(start, dev, &lh); // 真正的提交点
            self.install_trans(start, dev, &lh, false);
            let empty = {
                let mut inner = self.inner.lock().unwrap();
                inner.lh.len = 0;
                inner.lh.clone()
            };
            self.write_head(start, dev, &empty);
        }
    }

    /// 在每次文件系统调用开始时调用，用于标记日志事务的起始。
    ///
    /// # 功能说明
    /// 确保当前操作可以被日志系统接纳：若日志正在提交，或为所有
    /// 活跃操作各预留 `MAXOPBLOCKS` 块后容量不足，则休眠等待
    /// `end_op` 的唤醒；否则把 `outstanding` 加一后返回。
    ///
    /// 预留是保守的：每个活跃操作按最坏情况占用 `MAXOPBLOCKS` 块，
    /// 从而保证已放行的操作合在一起永远写得进日志区。
    pub fn begin_op(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.committing
                || inner.lh.len as usize + (inner.outstanding as usize + 1) * MAXOPBLOCKS
                    > LOGSIZE
            {
                inner = self.cond.wait(inner).unwrap();
            } else {
                inner.outstanding += 1;
                break;
            }
        }
    }

    /// 将给定的缓冲块记录到当前事务中，并在提交前钉住该块。
    ///
    /// # 功能说明
    /// 在一次文件系统写操作中，把被修改的块注册到事务的日志头里，
    /// 提交时统一写入磁盘。同一事务内对同一块的重复写入只占用一个
    /// 日志槽位（吸收）。新登记的块会被钉在缓存中，防止提交前被
    /// 驱逐——安装阶段以缓存内容为准。
    ///
    /// # Panics
    /// - 日志槽位耗尽（`len >= LOGSIZE` 或超出磁盘日志区容量）；
    /// - 在事务之外调用（`outstanding < 1`）。
    pub fn write(&self, buf: Buf<'_>) {
        let mut inner = self.inner.lock().unwrap();

        if inner.lh.len as usize >= LOGSIZE || inner.lh.len + 1 >= inner.size {
            panic!("log: too big a transaction");
        }
        if inner.outstanding < 1 {
            panic!("log: write outside of transaction");
        }

        // 吸收：该块已在本事务中登记过
        for i in 0..inner.lh.len {
            if inner.lh.blocknos[i as usize] == buf.blockno() {
                drop(inner);
                drop(buf);
                return;
            }
        }

        buf.pin();
        let len = inner.lh.len as usize;
        inner.lh.blocknos[len] = buf.blockno();
        inner.lh.len += 1;
        drop(inner);
        drop(buf);
    }

    /// 在每次文件系统调用结束时调用，标记事务结束，并在必要时提交。
    ///
    /// # 流程解释
    /// 1. 把 `outstanding` 减一；此时日志不可能处于提交中
    ///    （提交期间 `begin_op` 不放行任何操作）；
    /// 2. 若归零，设置 `committing` 并在释放状态锁之后执行提交，
    ///    完成后清除标志；
    /// 3. 无论哪条路径，最后都唤醒所有等待者（等空间的或等提交完成的）。
    pub fn end_op(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding -= 1;
        if inner.committing {
            panic!("log: end fs op while the log is committing");
        }
        let do_commit = if inner.outstanding == 0 {
            inner.committing = true;
            true
        } else {
            // 腾出了预留空间，唤醒等待者
            self.cond.notify_all();
            false
        };
        drop(inner);

        if do_commit {
            // 提交时不持有状态锁，committing 标志保护日志头
            self.commit();
            let mut inner = self.inner.lock().unwrap();
            inner.committing = false;
            drop(inner);
            self.cond.notify_all();
        }
    }

    /// 当前事务已登记的块数（仅测试用）。
    #[cfg(test)]
    pub(crate) fn logged_len(&self) -> u32 {
        self.inner.lock().unwrap().lh.len
    }
}

/// 日志头结构体，记录当前事务中被修改的磁盘块信息。
///
/// 存储在日志区域的第一个块中；`len` 为有效条目数，
/// `blocknos[i]` 是第 `i` 个日志块的原位置块号。
/// 磁盘上 `len > 0` 意味着存在已提交但可能尚未安装完的事务。
#[repr(C)]
#[derive(Clone)]
struct LogHeader {
    /// 当前事务中记录的块数量。
    len: u32,

    /// 被当前事务修改的磁盘块号数组，
    /// 与日志区中的数据块（头块之后）一一对应。
    blocknos: [u32; LOGSIZE],
}

impl LogHeader {
    const fn empty() -> Self {
        Self {
            len: 0,
            blocknos: [0; LOGSIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::ROOTINUM;
    use crate::fs::device::{BlockDevice, MemDisk};
    use crate::fs::mkfs;

    const DEV: u32 = 1;

    fn setup() -> (Arc<MemDisk>, Arc<BufCache>, Log, SuperBlock) {
        let disk = Arc::new(MemDisk::new(200));
        mkfs::format(disk.as_ref(), 200, 16);
        let bcache = Arc::new(BufCache::new(disk.clone()));
        let sb = SuperBlock::load(&bcache, DEV);
        let log = Log::new(bcache.clone(), &sb, DEV);
        (disk, bcache, log, sb)
    }

    /// 找一个必然空闲的数据块：位图起始块之后足够远的块。
    fn scratch_block(sb: &SuperBlock) -> u32 {
        sb.size() - 4
    }

    #[test]
    fn absorption_takes_one_slot() {
        let (_disk, bcache, log, sb) = setup();
        let bn = scratch_block(&sb);
        log.begin_op();
        for byte in [0x11u8, 0x22] {
            let mut buf = bcache.bread(DEV, bn);
            buf.bytes_mut()[0] = byte;
            log.write(buf);
        }
        assert_eq!(log.logged_len(), 1);
        log.end_op();
    }

    #[test]
    fn commit_installs_to_home_location() {
        let (disk, bcache, log, sb) = setup();
        let bn = scratch_block(&sb);
        log.begin_op();
        let mut buf = bcache.bread(DEV, bn);
        buf.bytes_mut()[..4].copy_from_slice(b"xlog");
        log.write(buf);
        log.end_op();

        // 直接读设备：原位置已更新，日志头已清空
        let mut block = [0u8; BSIZE];
        disk.read_block(bn, &mut block);
        assert_eq!(&block[..4], b"xlog");
        let (logstart, _) = sb.read_log();
        disk.read_block(logstart, &mut block);
        assert_eq!(u32::from_ne_bytes(block[..4].try_into().unwrap()), 0);
    }

    #[test]
    fn recovery_replays_committed_log() {
        let (disk, _bcache, log, sb) = setup();
        drop(log);
        let (logstart, _) = sb.read_log();
        let target = scratch_block(&sb);

        // 手工构造一条已提交但未安装的日志：
        // 日志块 1 存放新内容，日志头记录其原位置。
        let mut payload = [0u8; BSIZE];
        payload[..7].copy_from_slice(b"replay!");
        disk.write_block(logstart + 1, &payload);
        let mut head = [0u8; BSIZE];
        head[..4].copy_from_slice(&1u32.to_ne_bytes());
        head[4..8].copy_from_slice(&target.to_ne_bytes());
        disk.write_block(logstart, &head);

        // 重新挂载日志层，触发恢复
        let bcache = Arc::new(BufCache::new(disk.clone()));
        let sb = SuperBlock::load(&bcache, DEV);
        let _log = Log::new(bcache.clone(), &sb, DEV);

        let mut block = [0u8; BSIZE];
        disk.read_block(target, &mut block);
        assert_eq!(&block[..7], b"replay!");
        disk.read_block(logstart, &mut block);
        assert_eq!(u32::from_ne_bytes(block[..4].try_into().unwrap()), 0);
    }

    #[test]
    fn format_allocates_root_inode() {
        let (_disk, bcache, _log, sb) = setup();
        // 根 inode 位于 inode 区首块的 1 号槽位
        let buf = bcache.bread(DEV, sb.locate_inode(ROOTINUM));
        let itype = u16::from_ne_bytes(buf.bytes()[64..66].try_into().unwrap());
        assert_eq!(itype, 1, "root inode must be a directory");
    }
}
