//! 文件系统模块
//!
//! 自下而上由五层组成：块设备接口、缓冲缓存、日志、索引节点层、
//! 目录与路径解析。[`FileSystem`] 把这些子系统的单例组合成一个可以
//! 整体传递的值：挂载时按 缓冲缓存 → 超级块 → 日志（可能回放）→
//! inode 缓存 的顺序初始化，对上层暴露事务边界与路径操作。

pub mod device;
pub mod mkfs;

mod bio;
mod block;
mod inode;
mod log;
mod superblock;

pub use device::{BlockDevice, FileDisk, MemDisk};
pub use inode::{FileStat, Inode, InodeData, InodeType};

use std::sync::Arc;

use crate::consts::{MAX_DIR_SIZE, ROOTINUM};
use self::bio::BufCache;
use self::inode::{icheck, InodeCache};
use self::log::Log;
use self::superblock::SuperBlock;

/// 一个已挂载的文件系统实例。
///
/// 所有子系统都由该值持有并通过 `Arc` 在层间共享；不存在进程级
/// 全局状态，同一进程可以同时挂载多个互不相干的实例（测试正是
/// 这样模拟崩溃重启的）。
///
/// # 使用约定
/// 每个会写盘的逻辑操作都必须用 [`FileSystem::begin_op`] /
/// [`FileSystem::end_op`] 括住——包括可能触发 inode 销毁的句柄释放。
/// 单次操作最多写 `MAXOPBLOCKS` 个块，更大的写入需按块分段、
/// 每段一个事务。
pub struct FileSystem {
    /// 实例所在的设备号。
    dev: u32,
    /// 缓冲缓存。
    #[allow(dead_code)]
    bcache: Arc<BufCache>,
    /// 超级块（挂载后只读）。
    #[allow(dead_code)]
    sb: Arc<SuperBlock>,
    /// 日志子系统。
    log: Arc<Log>,
    /// inode 缓存。
    icache: Arc<InodeCache>,
}

impl FileSystem {
    /// 挂载一块已格式化的设备。
    ///
    /// 读取并校验超级块，必要时回放日志完成崩溃恢复。
    ///
    /// # Panics
    /// 超级块魔数不匹配（设备未格式化或已损坏）时触发 panic。
    pub fn mount(disk: Arc<dyn BlockDevice>, dev: u32) -> Arc<Self> {
        icheck();
        let bcache = Arc::new(BufCache::new(disk));
        let sb = Arc::new(SuperBlock::load(&bcache, dev));
        let log = Arc::new(Log::new(bcache.clone(), &sb, dev));
        let icache = Arc::new(InodeCache::new(
            bcache.clone(),
            log.clone(),
            sb.clone(),
            dev,
        ));
        ::log::info!("file system: setup done");
        Arc::new(Self {
            dev,
            bcache,
            sb,
            log,
            icache,
        })
    }

    /// 开始一个文件系统操作（日志事务）。
    pub fn begin_op(&self) {
        self.log.begin_op();
    }

    /// 结束一个文件系统操作；最后一个并发操作结束时提交日志。
    pub fn end_op(&self) {
        self.log.end_op();
    }

    /// 获取根目录的 inode 句柄。
    pub fn root(&self) -> Inode {
        InodeCache::get(&self.icache, self.dev, ROOTINUM)
    }

    /// 解析路径，返回对应的 inode。
    pub fn namei(&self, path: &[u8]) -> Option<Inode> {
        InodeCache::namei(&self.icache, path)
    }

    /// 解析路径，返回其父目录的 inode，并把最后一级名称写入 `name`。
    pub fn namei_parent(
        &self,
        path: &[u8],
        name: &mut [u8; MAX_DIR_SIZE],
    ) -> Option<Inode> {
        InodeCache::namei_parent(&self.icache, path, name)
    }

    /// 从给定目录出发解析相对路径。
    pub fn namei_at(&self, cwd: &Inode, path: &[u8]) -> Option<Inode> {
        InodeCache::namei_at(&self.icache, cwd, path)
    }

    /// 在给定路径上创建文件、目录或设备节点。
    ///
    /// `reuse` 为真时，路径已存在则直接返回已有 inode。
    /// 必须在事务之内调用。
    pub fn create(
        &self,
        path: &[u8],
        itype: InodeType,
        major: u16,
        minor: u16,
        reuse: bool,
    ) -> Option<Inode> {
        InodeCache::create(&self.icache, path, itype, major, minor, reuse)
    }

    /// 为已有文件建立一个新的硬链接。
    ///
    /// 目录不允许再链接；失败时回滚链接计数。
    /// 必须在事务之内调用。
    pub fn link(&self, old: &[u8], new: &[u8]) -> Result<(), ()> {
        let inode = self.namei(old).ok_or(())?;

        let mut idata = inode.lock();
        if idata.get_itype() == InodeType::Directory {
            return Err(());
        }
        idata.link();
        idata.update();
        drop(idata);

        let mut name = [0u8; MAX_DIR_SIZE];
        let linked = match InodeCache::namei_parent(&self.icache, new, &mut name) {
            Some(dir) => {
                let mut dir_data = dir.lock();
                dir_data.dir_link(&self.icache, &name, inode.inum()).is_ok()
            }
            None => false,
        };
        if !linked {
            // 回滚
            let mut idata = inode.lock();
            idata.unlink();
            idata.update();
            return Err(());
        }
        Ok(())
    }

    /// 删除路径对应的目录项；这是最后一个链接且没有活动引用时，
    /// inode 连同其数据块一并被回收。
    ///
    /// 必须在事务之内调用。
    pub fn unlink(&self, path: &[u8]) -> Result<(), ()> {
        let mut name = [0u8; MAX_DIR_SIZE];
        let dir = InodeCache::namei_parent(&self.icache, path, &mut name).ok_or(())?;
        let mut dir_data = dir.lock();
        dir_data.dir_unlink(&self.icache, &name)
    }
}
