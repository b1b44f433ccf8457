//! 索引节点层
//!
//! 磁盘 inode 记录一个文件的类型、链接数、大小与数据块映射；
//! 内存中维护一个固定大小的 inode 缓存，缓存项由引用计数管理生命周期，
//! 内容字段由睡眠锁保护。路径解析、目录操作与文件读写都建立在本层之上。

use array_macro::array;

use core::{cmp::min, mem, ptr};
use std::sync::Arc;

use crate::consts::{
    BSIZE, MAX_DIR_SIZE, MAX_FILE_SIZE, NDIRECT, NINDIRECT, NINODE, ROOTINUM,
};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use super::bio::{BufCache, BufData};
use super::block::{bm_alloc, bm_free, inode_alloc};
use super::log::Log;
use super::superblock::SuperBlock;

/// inode 缓存池，维护所有活跃 inode 的元数据与内容数据。
///
/// # 结构体用途
/// `InodeCache` 负责统一管理所有正在使用或被引用的 inode 实例，
/// 避免重复从磁盘读取，并提供线程安全的 inode 生命周期控制机制。
///
/// - `meta` 包含设备号、inode 号、引用计数，用于判重与生命周期管理，
///   由一把自旋锁整体保护；
/// - `data` 包含实际 `DiskInode` 内容和有效性信息，每项一把睡眠锁，
///   支持按需从磁盘加载和更新。
///
/// 所有 inode 操作（打开文件、路径解析、目录遍历等）都基于该缓存执行，
/// 并结合引用计数与 `Drop` 自动释放 inode 占用的槽位。
pub struct InodeCache {
    /// inode 元信息数组，受全局自旋锁保护。
    meta: SpinLock<[InodeMeta; NINODE]>,

    /// inode 实际内容数组，每个元素由独立的睡眠锁保护。
    data: [SleepLock<InodeData>; NINODE],

    /// 缓存所属的设备号（根目录所在设备）。
    dev: u32,
}

impl InodeCache {
    /// 构造 inode 缓存；下层各子系统的共享句柄会被存进每个内容槽位。
    pub fn new(bcache: Arc<BufCache>, log: Arc<Log>, sb: Arc<SuperBlock>, dev: u32) -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE], "InodeMeta"),
            data: array![_ => SleepLock::new(
                InodeData::new(bcache.clone(), log.clone(), sb.clone()),
                "InodeData",
            ); NINODE],
            dev,
        }
    }

    /// 在 inode 缓存中查找指定编号的 inode。
    ///
    /// # 功能说明
    /// 给定设备号 `dev` 和 inode 编号 `inum`，在缓存中查找是否已有对应的
    /// inode 实例。若存在则增加其引用计数并返回句柄；
    /// 若不存在，则占用一个空闲槽位保存元信息（不会立即从磁盘加载数据）。
    ///
    /// # 可能的错误
    /// 缓存已满（没有空闲槽位）时触发 panic（`"inode: not enough"`）。
    pub fn get(cache: &Arc<Self>, dev: u32, inum: u32) -> Inode {
        let mut guard = cache.meta.lock();

        // 在缓存中查找
        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if guard[i].inum == inum && guard[i].refs > 0 && guard[i].dev == dev {
                guard[i].refs += 1;
                return Inode {
                    cache: Arc::clone(cache),
                    dev,
                    inum,
                    index: i,
                };
            }
            if empty_i.is_none() && guard[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        // 未找到，占用一个空槽
        let empty_i = match empty_i {
            Some(i) => i,
            None => panic!("inode: not enough"),
        };
        guard[empty_i].dev = dev;
        guard[empty_i].inum = inum;
        guard[empty_i].refs = 1;
        Inode {
            cache: Arc::clone(cache),
            dev,
            inum,
            index: empty_i,
        }
    }

    /// 释放对一个 inode 的引用，并在合适时回收该 inode。
    ///
    /// # 功能说明
    /// 减少 inode 的引用计数。当这是最后一个引用、内容已加载且硬链接数
    /// 为零时，该 inode 被销毁：截断全部数据块、磁盘类型清零、缓存失效。
    /// 由 [`Inode`] 的 `Drop` 自动调用。
    ///
    /// # 安全性
    /// - 引用计数为 1 说明没有别的线程持有该 inode，
    ///   因此内容睡眠锁的获取不会阻塞；
    /// - 销毁路径会产生日志写入，调用方必须处于事务之内；
    /// - 失效必须发生在内容写回磁盘之后，过早清除会丢失修改。
    fn put(&self, inode: &Inode) {
        let mut guard = self.meta.lock();
        let i = inode.index;
        let imeta = &mut guard[i];

        if imeta.refs == 1 {
            // 引用计数为 1，这个锁不会阻塞
            let mut idata = self.data[i].lock();
            if idata.valid.is_none() || idata.dinode.nlink > 0 {
                idata.valid.take();
                drop(idata);
                imeta.refs -= 1;
                drop(guard);
            } else {
                drop(guard);
                idata.dinode.itype = InodeType::Empty;
                idata.truncate();
                idata.valid.take();
                drop(idata);

                // 当缓存中的此 inode 内容不再有效后再回收槽位
                let mut guard = self.meta.lock();
                guard[i].refs -= 1;
                debug_assert_eq!(guard[i].refs, 0);
                drop(guard);
            }
        } else {
            imeta.refs -= 1;
            drop(guard);
        }
    }

    /// 路径解析的通用实现，为 `namei` 与 `namei_parent` 服务。
    ///
    /// # 功能说明
    /// 从根目录（路径以 `/` 开头或未提供起点）或调用者给定的目录出发，
    /// 逐级解析路径分量：
    /// - `is_parent == false` 时返回路径末尾对应的 inode；
    /// - `is_parent == true` 时返回倒数第二级目录的 inode
    ///   （未加锁但已持引用），并把最后一级名称写入 `name`。
    ///
    /// # 流程解释
    /// 每一步都只锁住当前目录一个 inode：校验其为目录、查找下一分量、
    /// 释放锁之后才下降到子目录。两条交叉路径的并发遍历因此不会死锁。
    ///
    /// # 可能的错误
    /// - 途中遇到非目录或分量缺失时返回 `None`；
    /// - 查询根目录的父目录时返回 `None`。
    fn namex(
        cache: &Arc<Self>,
        start: Option<&Inode>,
        path: &[u8],
        name: &mut [u8; MAX_DIR_SIZE],
        is_parent: bool,
    ) -> Option<Inode> {
        let mut inode: Inode;
        if path.first() == Some(&b'/') {
            inode = Self::get(cache, cache.dev, ROOTINUM);
        } else {
            match start {
                Some(cwd) => inode = cwd.clone(),
                None => inode = Self::get(cache, cache.dev, ROOTINUM),
            }
        }

        let mut cur: usize = 0;
        loop {
            cur = skip_path(path, cur, name);
            if cur == 0 {
                break;
            }
            let mut data_guard = inode.lock();
            if data_guard.dinode.itype != InodeType::Directory {
                drop(data_guard);
                return None;
            }
            if is_parent && (cur >= path.len() || path[cur] == 0) {
                drop(data_guard);
                return Some(inode);
            }
            match data_guard.dir_lookup(cache, name, false) {
                None => {
                    drop(data_guard);
                    return None;
                }
                Some((last_inode, _)) => {
                    drop(data_guard);
                    inode = last_inode;
                }
            }
        }

        if is_parent {
            // 只有查询根目录的父目录才会走到这里
            log::warn!("namex querying root inode's parent");
            None
        } else {
            Some(inode)
        }
    }

    /// 解析给定路径并返回其对应的 inode。
    ///
    /// 路径是字节串（如 `b"/usr/bin/test"`），多余的 `/` 会被忽略。
    /// 路径非法、某级目录项缺失或类型错误时返回 `None`。
    pub fn namei(cache: &Arc<Self>, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        Self::namex(cache, None, path, &mut name, false)
    }

    /// Same behavior as `namei`, but return the parent of the inode,
    /// and copy the end path into name.
    pub fn namei_parent(
        cache: &Arc<Self>,
        path: &[u8],
        name: &mut [u8; MAX_DIR_SIZE],
    ) -> Option<Inode> {
        Self::namex(cache, None, path, name, true)
    }

    /// 从给定目录出发解析相对路径（绝对路径则仍从根出发）。
    pub fn namei_at(cache: &Arc<Self>, cwd: &Inode, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        Self::namex(cache, Some(cwd), path, &mut name, false)
    }

    /// 在给定路径上查找并创建一个新的 inode。
    ///
    /// # 功能说明
    /// 若路径对应的目录项已存在，按 `reuse` 决定是返回已有 inode 还是
    /// 失败；否则在磁盘 inode 表中分配一个新 inode，初始化类型与设备号，
    /// 目录类型还会建立 `.` 与 `..` 并把父目录的链接数加一，
    /// 最后把新名字挂入父目录。
    ///
    /// # 可能的错误
    /// - 父目录路径无法解析时返回 `None`；
    /// - 目标已存在且 `reuse == false` 时返回 `None`；
    /// - 目录初始化或父目录挂链失败属于结构性错误，触发 panic。
    ///
    /// # 安全性
    /// 调用方必须处于日志事务之内。
    pub fn create(
        cache: &Arc<Self>,
        path: &[u8],
        itype: InodeType,
        major: u16,
        minor: u16,
        reuse: bool,
    ) -> Option<Inode> {
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        let dir_inode = Self::namei_parent(cache, path, &mut name)?;
        let mut dir_idata = dir_inode.lock();

        // 先查找
        if let Some((inode, _)) = dir_idata.dir_lookup(cache, &name, false) {
            if reuse {
                return Some(inode);
            } else {
                return None;
            }
        }

        // 未找到，创建
        let (dev, _) = *dir_idata.valid.as_ref().unwrap();
        let inum = inode_alloc(&dir_idata.bcache, &dir_idata.log, &dir_idata.sb, dev, itype);
        let inode = Self::get(cache, dev, inum);
        let mut idata = inode.lock();
        idata.dinode.major = major;
        idata.dinode.minor = minor;
        idata.dinode.nlink = 1;
        idata.update();
        debug_assert_eq!(idata.dinode.itype, itype);

        // if dir, create . and ..
        if itype == InodeType::Directory {
            dir_idata.dinode.nlink += 1;
            dir_idata.update();
            let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
            // . -> itself
            name[0] = b'.';
            if idata.dir_link(cache, &name, inum).is_err() {
                panic!("dir link .");
            }
            // .. -> parent
            name[1] = b'.';
            if idata.dir_link(cache, &name, dir_inode.inum).is_err() {
                panic!("dir link ..");
            }
        }

        if dir_idata.dir_link(cache, &name, inum).is_err() {
            panic!("parent dir link");
        }

        drop(dir_idata);
        drop(dir_inode);
        drop(idata);
        Some(inode)
    }
}

/// 跳过路径中的一个路径分量，并将其拷贝到 `name` 缓冲区中。
///
/// 从 `cur` 开始先跳过一个或多个 `/`，把接下来的分量复制进 `name`
/// （超长截断，余下部分清零），再跳过其后的 `/`，返回下一个未处理
/// 字符的位置；路径已经耗尽时返回 0。字节 0 视作路径结束。
fn skip_path(path: &[u8], mut cur: usize, name: &mut [u8; MAX_DIR_SIZE]) -> usize {
    // 跳过前面的 b'/'
    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    if cur >= path.len() || path[cur] == 0 {
        return 0;
    }

    let start = cur;
    while cur < path.len() && path[cur] != b'/' && path[cur] != 0 {
        cur += 1;
    }
    let mut count = cur - start;
    if count >= name.len() {
        count = name.len() - 1;
    }
    name[..count].copy_from_slice(&path[start..start + count]);
    // 清掉上一个分量的残留字节
    name[count..].fill(0);

    // 跳过后续的 b'/'
    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    cur
}

/// 比较两个目录项名称是否相同。
///
/// 名称最长 `MAX_DIR_SIZE` 字节，逐字节比较到首个 0 为止；
/// 写满 `MAX_DIR_SIZE` 字节的名称没有结尾 0，此时比较全部字节。
pub fn name_eq(a: &[u8; MAX_DIR_SIZE], b: &[u8; MAX_DIR_SIZE]) -> bool {
    for i in 0..MAX_DIR_SIZE {
        if a[i] != b[i] {
            return false;
        }
        if a[i] == 0 {
            return true;
        }
    }
    true
}

/// 表示活动的 inode 句柄，由 inode 缓存统一分配和管理。
///
/// # 结构体用途
/// `Inode` 并不直接包含 inode 的数据，而是一个轻量级句柄，
/// 通过 `index` 字段指向缓存中的具体槽位，配合引用计数实现共享与回收：
/// `clone` 增加引用计数，`drop` 归还引用并在必要时销毁 inode。
///
/// 实际数据访问需通过 [`Inode::lock`] 获取受保护的 [`InodeData`]。
pub struct Inode {
    /// 所属缓存。
    cache: Arc<InodeCache>,

    /// 设备号，标识该 inode 所在的磁盘或设备。
    dev: u32,

    /// inode 编号，唯一标识该设备上的一个 inode。
    inum: u32,

    /// 在 inode 缓存中的槽位下标。
    index: usize,
}

impl Clone for Inode {
    /// 克隆句柄：仅增加缓存项的引用计数。
    fn clone(&self) -> Self {
        let mut guard = self.cache.meta.lock();
        guard[self.index].refs += 1;
        drop(guard);
        Self {
            cache: Arc::clone(&self.cache),
            dev: self.dev,
            inum: self.inum,
            index: self.index,
        }
    }
}

impl Inode {
    /// 加锁当前 inode，并在必要时从磁盘加载其内容。
    ///
    /// # 功能说明
    /// 首次访问时（缓存项尚未加载），从磁盘读取 inode 结构体写入缓存并
    /// 置有效标志；否则直接返回锁保护的 [`InodeData`]。
    ///
    /// # Panics
    /// 磁盘上的 inode 类型为空（未分配）时触发 panic。
    pub fn lock(&self) -> SleepLockGuard<'_, InodeData> {
        let mut guard = self.cache.data[self.index].lock();

        if guard.valid.is_none() {
            let bcache = guard.bcache.clone();
            let buf = bcache.bread(self.dev, guard.sb.locate_inode(self.inum));
            let offset = locate_inode_offset(self.inum);
            let dinode = unsafe { (buf.raw_data() as *const DiskInode).offset(offset) };
            guard.dinode = unsafe { ptr::read(dinode) };
            drop(buf);
            guard.valid = Some((self.dev, self.inum));
            if guard.dinode.itype == InodeType::Empty {
                panic!("inode: lock an empty inode");
            }
        }

        guard
    }

    /// inode 编号。
    pub fn inum(&self) -> u32 {
        self.inum
    }
}

impl Drop for Inode {
    /// 处理完此 inode。
    /// 如果这是 inode 缓存中的最后一个引用，则槽位可能被回收。
    /// 此外，如果此 inode 不再有任何链接，则在磁盘中释放该 inode。
    fn drop(&mut self) {
        let cache = Arc::clone(&self.cache);
        cache.put(self);
    }
}

/// inode 缓存项的元信息，用于唯一标识并管理 inode 的生命周期。
struct InodeMeta {
    /// 设备号。
    dev: u32,

    /// inode 编号。
    inum: u32,

    /// 当前引用计数，为 0 表示该槽位未被使用。
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// inode 在内存中的完整副本，包含从磁盘加载的内容及其有效性标志。
///
/// 与 [`SleepLock`] 配对使用；除 `valid` 中记录的身份外，
/// 所有字段只有持有对应睡眠锁时才允许读写。
pub struct InodeData {
    /// 底层缓冲缓存。
    pub(super) bcache: Arc<BufCache>,

    /// 日志子系统，所有持久化修改都经由它登记。
    pub(super) log: Arc<Log>,

    /// 超级块（定位 inode 与位图）。
    pub(super) sb: Arc<SuperBlock>,

    /// `None` 表示缓存内容无效；`Some((dev, inum))` 表示已从磁盘加载。
    valid: Option<(u32, u32)>,

    /// 磁盘 inode 的内容副本，可修改后写回。
    dinode: DiskInode,
}

impl InodeData {
    fn new(bcache: Arc<BufCache>, log: Arc<Log>, sb: Arc<SuperBlock>) -> Self {
        Self {
            bcache,
            log,
            sb,
            valid: None,
            dinode: DiskInode::new(),
        }
    }

    /// 获取 inode 的设备编号和 inode 编号。
    #[inline]
    pub fn get_dev_inum(&self) -> (u32, u32) {
        self.valid.unwrap()
    }

    /// 获取 inode 类型。
    #[inline]
    pub fn get_itype(&self) -> InodeType {
        self.dinode.itype
    }

    /// 获取主、次设备编号。
    #[inline]
    pub fn get_devnum(&self) -> (u16, u16) {
        (self.dinode.major, self.dinode.minor)
    }

    /// 文件当前的字节大小。
    #[inline]
    pub fn size(&self) -> u32 {
        self.dinode.size
    }

    /// 将硬链接数增加 1（须随后调用 [`InodeData::update`]）。
    #[inline]
    pub fn link(&mut self) {
        self.dinode.nlink += 1;
    }

    /// 将硬链接数减少 1。
    #[inline]
    pub fn unlink(&mut self) {
        self.dinode.nlink -= 1;
    }

    /// 丢弃当前 inode 所有的数据块，并将其大小清零。
    ///
    /// # 功能说明
    /// 回收 inode 占用的全部数据块资源：直接块、一级间接块及其指向的
    /// 数据块、二级间接块及其两层指向的所有块；地址数组清零、
    /// 大小归零并写回磁盘。文件删除与显式截断共用此路径。
    ///
    /// # 安全性
    /// 释放操作全部经过日志，调用方必须处于事务之内。
    /// 同一事务内对位图块的多次修改会被日志吸收，不会挤爆日志空间。
    pub fn truncate(&mut self) {
        let (dev, _) = *self.valid.as_ref().unwrap();

        // 直接块
        for i in 0..NDIRECT {
            if self.dinode.addrs[i] > 0 {
                bm_free(&self.bcache, &self.log, &self.sb, dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        // 一级间接块
        if self.dinode.addrs[NDIRECT] > 0 {
            let buf = self.bcache.bread(dev, self.dinode.addrs[NDIRECT]);
            let buf_ptr = buf.raw_data() as *const BlockNo;
            for i in 0..NINDIRECT {
                let bn = unsafe { ptr::read(buf_ptr.add(i)) };
                if bn > 0 {
                    bm_free(&self.bcache, &self.log, &self.sb, dev, bn);
                }
            }
            drop(buf);
            bm_free(&self.bcache, &self.log, &self.sb, dev, self.dinode.addrs[NDIRECT]);
            self.dinode.addrs[NDIRECT] = 0;
        }

        // 二级间接块：先放内层，再放外层
        if self.dinode.addrs[NDIRECT + 1] > 0 {
            let dbl_buf = self.bcache.bread(dev, self.dinode.addrs[NDIRECT + 1]);
            let dbl_ptr = dbl_buf.raw_data() as *const BlockNo;
            for i in 0..NINDIRECT {
                let l1_bn = unsafe { ptr::read(dbl_ptr.add(i)) };
                if l1_bn == 0 {
                    continue;
                }
                let l1_buf = self.bcache.bread(dev, l1_bn);
                let l1_ptr = l1_buf.raw_data() as *const BlockNo;
                for j in 0..NINDIRECT {
                    let bn = unsafe { ptr::read(l1_ptr.add(j)) };
                    if bn > 0 {
                        bm_free(&self.bcache, &self.log, &self.sb, dev, bn);
                    }
                }
                drop(l1_buf);
                bm_free(&self.bcache, &self.log, &self.sb, dev, l1_bn);
            }
            drop(dbl_buf);
            bm_free(&self.bcache, &self.log, &self.sb, dev, self.dinode.addrs[NDIRECT + 1]);
            self.dinode.addrs[NDIRECT + 1] = 0;
        }

        self.dinode.size = 0;
        self.update();
    }

    /// 将已修改的内存中 inode 信息写回磁盘。
    ///
    /// 每当 inode 的持久字段（类型、大小、链接计数或数据块地址）发生
    /// 更改时调用；修改通过日志登记，随调用方的事务一起落盘。
    pub fn update(&mut self) {
        let (dev, inum) = *self.valid.as_ref().unwrap();

        let bcache = self.bcache.clone();
        let mut buf = bcache.bread(dev, self.sb.locate_inode(inum));
        let offset = locate_inode_offset(inum);
        let dinode = unsafe { (buf.raw_data_mut() as *mut DiskInode).offset(offset) };
        unsafe { ptr::write(dinode, self.dinode) };
        self.log.write(buf);
    }

    /// 从 inode 的数据区读取 `dst.len()` 字节到 `dst`。
    ///
    /// 读取范围必须完全落在 `[0, size]` 之内，否则返回 `Err(())`；
    /// 宽松版本见 [`InodeData::try_iread`]。
    pub fn iread(&mut self, dst: &mut [u8], offset: u32) -> Result<(), ()> {
        let count = u32::try_from(dst.len()).map_err(|_| ())?;
        let end = offset.checked_add(count).ok_or(())?;
        if end > self.dinode.size {
            return Err(());
        }

        let (dev, _) = *self.valid.as_ref().unwrap();
        let total = dst.len();
        let mut block_base = (offset as usize) / BSIZE;
        let mut block_offset = (offset as usize) % BSIZE;
        let mut done = 0usize;
        while done < total {
            let read_count = min(BSIZE - block_offset, total - done);
            let bn = self.map_blockno(block_base);
            let buf = self.bcache.bread(dev, bn);
            dst[done..done + read_count]
                .copy_from_slice(&buf.bytes()[block_offset..block_offset + read_count]);
            drop(buf);

            done += read_count;
            block_base += 1;
            block_offset = 0;
        }
        Ok(())
    }

    /// 尽可能多地读取数据，返回实际读取的字节数。
    ///
    /// 偏移越过文件末尾时返回 `Ok(0)`；
    /// 读取范围超出文件末尾时截断到末尾。
    pub fn try_iread(&mut self, dst: &mut [u8], offset: u32) -> Result<u32, ()> {
        if offset > self.dinode.size {
            return Ok(0);
        }
        let count = u32::try_from(dst.len()).map_err(|_| ())?;
        let end = offset.checked_add(count).ok_or(())?;
        let actual_count = if end > self.dinode.size {
            self.dinode.size - offset
        } else {
            count
        };
        self.iread(&mut dst[..actual_count as usize], offset)?;
        Ok(actual_count)
    }

    /// 把 `src` 的全部字节写入 inode 数据区；任何不完整写入都算失败。
    pub fn iwrite(&mut self, src: &[u8], offset: u32) -> Result<(), ()> {
        match self.try_iwrite(src, offset) {
            Ok(ret) if ret as usize == src.len() => Ok(()),
            _ => Err(()),
        }
    }

    /// 尝试写入数据并返回实际写入的字节数。
    ///
    /// # 功能说明
    /// 把 `src` 写入文件偏移 `offset` 处，按需通过块映射分配新块，
    /// 写入超过原大小时更新文件大小。每个被修改的数据块都登记进日志。
    ///
    /// # 可能的错误
    /// - `offset` 越过文件末尾（不允许写出空洞）返回 `Err(())`；
    /// - 写入范围超过单文件最大尺寸返回 `Err(())`。
    ///
    /// # 安全性
    /// 调用方必须处于日志事务之内；
    /// 无论是否扩展大小，最后都会写回 inode（块映射可能已经改变）。
    pub fn try_iwrite(&mut self, src: &[u8], offset: u32) -> Result<u32, ()> {
        if offset > self.dinode.size {
            return Err(());
        }
        let count = u32::try_from(src.len()).map_err(|_| ())?;
        let end = offset.checked_add(count).ok_or(())? as usize;
        if end > MAX_FILE_SIZE {
            return Err(());
        }

        let (dev, _) = *self.valid.as_ref().unwrap();
        let total = src.len();
        let mut block_base = (offset as usize) / BSIZE;
        let mut block_offset = (offset as usize) % BSIZE;
        let mut done = 0usize;
        while done < total {
            let write_count = min(BSIZE - block_offset, total - done);
            let bn = self.map_blockno(block_base);
            let mut buf = self.bcache.bread(dev, bn);
            buf.bytes_mut()[block_offset..block_offset + write_count]
                .copy_from_slice(&src[done..done + write_count]);
            self.log.write(buf);

            done += write_count;
            block_base += 1;
            block_offset = 0;
        }

        let size = (offset as usize + done) as u32;
        if size > self.dinode.size {
            self.dinode.size = size;
        }
        self.update();
        Ok(done as u32)
    }

    /// 填充 [`FileStat`]，报告当前 inode 的元数据信息。
    pub fn istat(&self, stat: &mut FileStat) {
        let (dev, inum) = self.valid.unwrap();
        stat.dev = dev;
        stat.inum = inum;
        stat.itype = self.dinode.itype;
        stat.nlink = self.dinode.nlink;
        stat.size = self.dinode.size as u64;
    }

    /// 根据数据块逻辑编号返回其磁盘块号，必要时分配新块。
    ///
    /// # 功能说明
    /// 逻辑块号分三段映射：
    /// - `[0, NDIRECT)`：直接地址数组；
    /// - `[NDIRECT, NDIRECT + NINDIRECT)`：经一级间接块中转；
    /// - 其后 `NINDIRECT²` 块：经二级间接块两层中转。
    /// 缺失的中转块与数据块都在此按需分配；
    /// 被修改的间接块缓冲立即登记进日志。
    ///
    /// # Panics
    /// 逻辑块号超出单文件最大块数时触发 panic。
    fn map_blockno(&mut self, offset_bn: usize) -> u32 {
        let (dev, _) = *self.valid.as_ref().unwrap();
        if offset_bn < NDIRECT {
            // 直接块
            if self.dinode.addrs[offset_bn] == 0 {
                let free_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                self.dinode.addrs[offset_bn] = free_bn;
                free_bn
            } else {
                self.dinode.addrs[offset_bn]
            }
        } else if offset_bn < NDIRECT + NINDIRECT {
            // 一级间接块
            let count = (offset_bn - NDIRECT) as isize;

            let indirect_bn = if self.dinode.addrs[NDIRECT] == 0 {
                let free_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                self.dinode.addrs[NDIRECT] = free_bn;
                free_bn
            } else {
                self.dinode.addrs[NDIRECT]
            };
            let mut indirect_buf = self.bcache.bread(dev, indirect_bn);
            let bn_ptr = unsafe { (indirect_buf.raw_data_mut() as *mut BlockNo).offset(count) };
            let bn = unsafe { ptr::read(bn_ptr) };
            if bn == 0 {
                let free_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                unsafe {
                    ptr::write(bn_ptr, free_bn);
                }
                self.log.write(indirect_buf);
                free_bn
            } else {
                drop(indirect_buf);
                bn
            }
        } else if offset_bn < NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT {
            // 二级间接块：两层查找
            let count = offset_bn - NDIRECT - NINDIRECT;
            let level_1 = (count / NINDIRECT) as isize;
            let level_2 = (count % NINDIRECT) as isize;

            let dbl_bn = if self.dinode.addrs[NDIRECT + 1] == 0 {
                let free_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                self.dinode.addrs[NDIRECT + 1] = free_bn;
                free_bn
            } else {
                self.dinode.addrs[NDIRECT + 1]
            };
            let mut dbl_buf = self.bcache.bread(dev, dbl_bn);
            let l1_ptr = unsafe { (dbl_buf.raw_data_mut() as *mut BlockNo).offset(level_1) };
            let mut l1_bn = unsafe { ptr::read(l1_ptr) };
            if l1_bn == 0 {
                l1_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                unsafe {
                    ptr::write(l1_ptr, l1_bn);
                }
                self.log.write(dbl_buf);
            } else {
                drop(dbl_buf);
            }

            let mut l1_buf = self.bcache.bread(dev, l1_bn);
            let bn_ptr = unsafe { (l1_buf.raw_data_mut() as *mut BlockNo).offset(level_2) };
            let bn = unsafe { ptr::read(bn_ptr) };
            if bn == 0 {
                let free_bn = bm_alloc(&self.bcache, &self.log, &self.sb, dev);
                unsafe {
                    ptr::write(bn_ptr, free_bn);
                }
                self.log.write(l1_buf);
                free_bn
            } else {
                drop(l1_buf);
                bn
            }
        } else {
            panic!("queried offset_bn out of range");
        }
    }

    /// 在当前目录中查找指定名称的目录项，返回对应的 inode。
    ///
    /// # 功能说明
    /// 逐项扫描目录内容，跳过空槽（`inum == 0`），对首个匹配项返回新
    /// 获取的 inode 句柄；`need_offset` 为真时一并返回目录项的字节偏移，
    /// 供后续覆盖或删除使用。
    ///
    /// # Panics
    /// 当前 inode 不是目录时触发 panic。
    ///
    /// # 安全性
    /// 调用者必须持有本 inode 的内容锁。
    pub fn dir_lookup(
        &mut self,
        icache: &Arc<InodeCache>,
        name: &[u8; MAX_DIR_SIZE],
        need_offset: bool,
    ) -> Option<(Inode, Option<u32>)> {
        let (dev, _) = *self.valid.as_ref().unwrap();
        debug_assert!(dev != 0);
        if self.dinode.itype != InodeType::Directory {
            panic!("inode type not dir");
        }

        let de_size = mem::size_of::<DirEntry>();
        let mut dir_entry = DirEntry::empty();
        for offset in (0..self.dinode.size).step_by(de_size) {
            self.iread(dir_entry.as_bytes_mut(), offset)
                .expect("read dir entry");
            if dir_entry.inum == 0 {
                continue;
            }
            if name_eq(&dir_entry.name, name) {
                return Some((
                    InodeCache::get(icache, dev, dir_entry.inum as u32),
                    if need_offset { Some(offset) } else { None },
                ));
            }
        }

        None
    }

    /// 向当前目录写入一个新的目录项。
    ///
    /// # 功能说明
    /// 建立名称到 inode 编号的映射：先确认没有同名项（有则返回
    /// `Err(())`），再找到第一个空槽或在末尾追加，写入新目录项。
    ///
    /// # Panics
    /// - `inum` 超出目录项能表达的范围；
    /// - 目录内容写入失败（结构性错误）。
    ///
    /// # 安全性
    /// 调用者必须持有本 inode 的内容锁且处于事务之内。
    pub fn dir_link(
        &mut self,
        icache: &Arc<InodeCache>,
        name: &[u8; MAX_DIR_SIZE],
        inum: u32,
    ) -> Result<(), ()> {
        if inum > u16::MAX as u32 {
            panic!("inum {} too large", inum);
        }
        let inum = inum as u16;

        // 该条目不应已存在
        if self.dir_lookup(icache, name, false).is_some() {
            // 返回的 inode 句柄随即释放
            return Err(());
        }

        // 找一个空槽，没有就追加到末尾
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut dir_entry = DirEntry::empty();
        let mut offset = self.dinode.size;
        for off in (0..self.dinode.size).step_by(de_size as usize) {
            self.iread(dir_entry.as_bytes_mut(), off)
                .expect("read dir entry");
            if dir_entry.inum == 0 {
                offset = off;
                break;
            }
        }

        assert_eq!(offset % de_size, 0);
        // 名称规范化：拷到首个 0 为止，余下字节清零
        dir_entry.name.fill(0);
        let name_len = name.iter().position(|&c| c == 0).unwrap_or(MAX_DIR_SIZE);
        dir_entry.name[..name_len].copy_from_slice(&name[..name_len]);
        dir_entry.inum = inum;
        if self.iwrite(dir_entry.as_bytes(), offset).is_err() {
            panic!("inode write error");
        }

        Ok(())
    }

    /// 从当前目录中删除指定名称的目录项，并维护相关链接计数。
    ///
    /// # 功能说明
    /// 查找目录项并将其清空；目标 inode 的链接数减一并写回。
    /// 目标是目录时要求其内容为空（只剩 `.` 和 `..`），且当前目录的
    /// 链接数随之减一（对应消失的 `..`）。
    ///
    /// # 可能的错误
    /// - 名称为 `.` 或 `..`、目录项不存在、目录非空时返回 `Err(())`；
    /// - 目标 inode 的链接数已为零属于结构性错误，触发 panic。
    ///
    /// # 安全性
    /// 调用者必须持有本 inode 的内容锁且处于事务之内；
    /// 目标 inode 的磁盘回收发生在其最后一个句柄释放时。
    pub fn dir_unlink(
        &mut self,
        icache: &Arc<InodeCache>,
        name: &[u8; MAX_DIR_SIZE],
    ) -> Result<(), ()> {
        // 名称不能是 . 和 ..
        if name[0] == b'.' && (name[1] == 0 || (name[1] == b'.' && name[2] == 0)) {
            return Err(());
        }

        // 查找与该名称对应的条目
        let inode: Inode;
        let offset: u32;
        match self.dir_lookup(icache, name, true) {
            Some((i, Some(off))) => {
                inode = i;
                offset = off;
            }
            _ => return Err(()),
        }

        // 检查该条目
        let mut idata = inode.lock();
        if idata.dinode.nlink < 1 {
            panic!("entry inode's link is zero");
        }
        if idata.dinode.itype == InodeType::Directory && !idata.dir_is_empty() {
            return Err(());
        }

        // 清空该条目
        let dir_entry = DirEntry::empty();
        if self.iwrite(dir_entry.as_bytes(), offset).is_err() {
            panic!("cannot write entry previously read");
        }

        // 维护链接数
        if idata.dinode.itype == InodeType::Directory {
            self.dinode.nlink -= 1;
            self.update();
        }
        idata.dinode.nlink -= 1;
        idata.update();

        Ok(())
    }

    /// 判断当前目录除 `.` 和 `..` 之外是否没有其他有效目录项。
    fn dir_is_empty(&mut self) -> bool {
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut dir_entry = DirEntry::empty();
        for offset in ((2 * de_size)..self.dinode.size).step_by(de_size as usize) {
            if self.iread(dir_entry.as_bytes_mut(), offset).is_err() {
                panic!("read dir entry");
            }
            if dir_entry.inum != 0 {
                return false;
            }
        }

        true
    }
}

/// 单个块中的 inode 数量。
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

/// 给定一个 inode 编号，计算该 inode 在块内的偏移索引。
#[inline]
pub fn locate_inode_offset(inum: u32) -> isize {
    (inum as usize % IPB) as isize
}

/// 挂载前的磁盘结构布局检查。
pub fn icheck() {
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DiskInode>(), 0);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<BlockNo>(), 0);
    debug_assert_eq!(mem::size_of::<BlockNo>(), mem::size_of::<u32>());
    debug_assert_eq!(BSIZE % mem::size_of::<DiskInode>(), 0);
    debug_assert_eq!(BSIZE % mem::size_of::<DirEntry>(), 0);
    debug_assert!(MAX_FILE_SIZE <= u32::MAX as usize);
}

type BlockNo = u32;

/// 文件或目录的状态信息，向上层报告 inode 的元数据。
#[repr(C)]
#[derive(Debug)]
pub struct FileStat {
    /// 文件所在的设备编号。
    pub dev: u32,

    /// 文件的 inode 编号。
    pub inum: u32,

    /// 文件类型。
    pub itype: InodeType,

    /// 硬链接计数。
    pub nlink: u16,

    /// 文件的总大小（以字节为单位）。
    pub size: u64,
}

impl FileStat {
    pub const fn uninit() -> Self {
        Self {
            dev: 0,
            inum: 0,
            itype: InodeType::Empty,
            nlink: 0,
            size: 0,
        }
    }
}

/// 磁盘上的 inode 结构体，描述文件的元信息与数据块映射。
///
/// 每块打包 [`IPB`] 个，从超级块记录的 inode 区起始块开始排布；
/// 通过块缓存加载和修改，由 [`InodeData`] 封装为内存中的表示。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    /// 文件类型，`Empty` 表示该槽位空闲。
    pub(crate) itype: InodeType,

    /// 主设备号，仅设备文件有效。
    pub(crate) major: u16,

    /// 次设备号，仅设备文件有效。
    pub(crate) minor: u16,

    /// 硬链接计数，表示该 inode 被多少个目录项引用。
    pub(crate) nlink: u16,

    /// 文件的实际字节大小。
    pub(crate) size: u32,

    /// 数据块地址数组：
    /// - 前 `NDIRECT` 项为直接块地址；
    /// - 第 `NDIRECT` 项为一级间接块地址；
    /// - 第 `NDIRECT+1` 项为二级间接块地址。
    pub(crate) addrs: [u32; NDIRECT + 2],
}

impl DiskInode {
    pub(crate) const fn new() -> Self {
        Self {
            itype: InodeType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
        }
    }

    /// 如果该磁盘 inode 空闲（类型为空），清零整个槽位并设置新类型。
    pub fn try_alloc(&mut self, itype: InodeType) -> Result<(), ()> {
        if self.itype == InodeType::Empty {
            unsafe {
                ptr::write_bytes(self, 0, 1);
            }
            self.itype = itype;
            Ok(())
        } else {
            Err(())
        }
    }
}

/// Inode type.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

/// 磁盘上的目录项结构体，表示目录中名称到 inode 编号的一条映射。
///
/// 目录文件的内容就是此结构的数组；`inum == 0` 表示空槽，可复用。
#[repr(C)]
pub(crate) struct DirEntry {
    /// 目标 inode 编号，0 表示该目录项为空。
    pub(crate) inum: u16,

    /// 目录项名称，不足 `MAX_DIR_SIZE` 字节时以 0 填充；
    /// 写满时没有结尾 0。
    pub(crate) name: [u8; MAX_DIR_SIZE],
}

impl DirEntry {
    pub(crate) const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; MAX_DIR_SIZE],
        }
    }

    /// 目录项的原始字节视图（定长，无填充）。
    pub(crate) fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const DirEntry as *const u8,
                mem::size_of::<DirEntry>(),
            )
        }
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self as *mut DirEntry as *mut u8,
                mem::size_of::<DirEntry>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of(s: &[u8]) -> [u8; MAX_DIR_SIZE] {
        let mut name = [0u8; MAX_DIR_SIZE];
        name[..s.len()].copy_from_slice(s);
        name
    }

    #[test]
    fn skip_path_extracts_components() {
        let mut name = [0u8; MAX_DIR_SIZE];
        let cur = skip_path(b"a/bb/c", 0, &mut name);
        assert_eq!(cur, 2);
        assert_eq!(name, name_of(b"a"));

        let cur = skip_path(b"a/bb/c", cur, &mut name);
        assert_eq!(cur, 5);
        assert_eq!(name, name_of(b"bb"));

        let cur = skip_path(b"a/bb/c", cur, &mut name);
        assert_eq!(cur, 6);
        assert_eq!(name, name_of(b"c"));

        assert_eq!(skip_path(b"a/bb/c", cur, &mut name), 0);
    }

    #[test]
    fn skip_path_collapses_slashes() {
        let mut name = [0u8; MAX_DIR_SIZE];
        let cur = skip_path(b"///init//", 0, &mut name);
        assert_eq!(name, name_of(b"init"));
        assert_eq!(skip_path(b"///init//", cur, &mut name), 0);
    }

    #[test]
    fn skip_path_clears_stale_bytes() {
        let mut name = [0u8; MAX_DIR_SIZE];
        skip_path(b"verylongname1/a", 0, &mut name);
        let cur = skip_path(b"verylongname1/a", 14, &mut name);
        assert_eq!(cur, 15);
        assert_eq!(name, name_of(b"a"));
    }

    #[test]
    fn skip_path_truncates_overlong_component() {
        let mut name = [0u8; MAX_DIR_SIZE];
        skip_path(b"abcdefghijklmnopq", 0, &mut name);
        assert_eq!(&name[..13], b"abcdefghijklm");
        assert_eq!(name[13], 0);
    }

    #[test]
    fn name_eq_stops_at_nul() {
        assert!(name_eq(&name_of(b"abc"), &name_of(b"abc")));
        assert!(!name_eq(&name_of(b"abc"), &name_of(b"abd")));
        assert!(!name_eq(&name_of(b"abc"), &name_of(b"ab")));
        // 写满 14 字节、没有结尾 0 的名称
        assert!(name_eq(&name_of(b"abcdefghijklmn"), &name_of(b"abcdefghijklmn")));
    }

    #[test]
    fn disk_layout_constants() {
        assert_eq!(mem::size_of::<DiskInode>(), 64);
        assert_eq!(IPB, 16);
        assert_eq!(mem::size_of::<DirEntry>(), 16);
        icheck();
    }
}
