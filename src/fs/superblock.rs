//! 超级块操作

use core::mem;
use core::ptr;

use crate::consts::{BPB, FSMAGIC};
use super::bio::BufCache;
use super::inode::IPB;

/// 内存中的超级块副本。
///
/// # 设计说明
/// - 封装磁盘上的 [`RawSuperBlock`] 结构；
/// - 挂载时从块 1 读出并校验魔数，此后只读，
///   因此可以在各层之间自由共享引用。
#[derive(Debug)]
pub struct SuperBlock {
    data: RawSuperBlock,
}

impl SuperBlock {
    /// 从磁盘设备读取并校验超级块。
    ///
    /// # 功能说明
    /// 1. 通过缓冲缓存读取设备的第 1 块；
    /// 2. 验证文件系统魔数（`FSMAGIC`）；
    /// 3. 返回内存中的超级块副本。
    ///
    /// # Panics
    /// 文件系统魔数不匹配时触发 panic。
    pub fn load(bcache: &BufCache, dev: u32) -> Self {
        debug_assert_eq!(
            mem::align_of::<super::bio::BufData>() % mem::align_of::<RawSuperBlock>(),
            0
        );

        let buf = bcache.bread(dev, 1);
        let data = unsafe { ptr::read(buf.raw_data() as *const RawSuperBlock) };
        drop(buf);
        if data.magic != FSMAGIC {
            panic!("invalid file system magic num");
        }
        log::debug!("super block data: {:?}", data);
        Self { data }
    }

    /// 读取日志区域信息，返回元组`(起始块号, 日志块数量)`。
    pub fn read_log(&self) -> (u32, u32) {
        (self.data.logstart, self.data.nlog)
    }

    /// 定位索引节点所在的磁盘块。
    ///
    /// # Panics
    /// 当`inum`超出索引节点总数时触发panic。
    pub fn locate_inode(&self, inum: u32) -> u32 {
        if inum >= self.data.ninodes {
            panic!(
                "query inum {} larger than maximum inode nums {}",
                inum, self.data.ninodes
            );
        }
        (inum / (IPB as u32)) + self.data.inodestart
    }

    /// 获取文件系统索引节点总数。
    pub fn inode_size(&self) -> u32 {
        self.data.ninodes
    }

    /// 定位块对应的位图块。
    ///
    /// 位图块号 = 位图起始块 + (块号 / 每块管理的位数)。
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        (blockno / BPB) + self.data.bmapstart
    }

    /// 获取文件系统总块数。
    pub fn size(&self) -> u32 {
        self.data.size
    }
}

/// 磁盘上的原始超级块结构。
///
/// # 内存布局
/// - `#[repr(C)]` 确保与磁盘布局一致；
/// - 所有字段均为小端序的 32 位无符号整数。
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSuperBlock {
    /// 文件系统魔数，必须为`FSMAGIC`。
    pub magic: u32,
    /// 文件系统映像总块数。
    pub size: u32,
    /// 数据块数量（不含元数据）。
    pub nblocks: u32,
    /// 索引节点总数。
    pub ninodes: u32,
    /// 日志块数量。
    pub nlog: u32,
    /// 第一个日志块的块号。
    pub logstart: u32,
    /// 第一个索引节点块的块号。
    pub inodestart: u32,
    /// 第一个位图块的块号。
    pub bmapstart: u32,
}
