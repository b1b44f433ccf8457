//! 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备；[`BlockDevice`] 是对
//! 同步读写单个磁盘块的抽象，实现了此特质的类型称为块设备驱动。
//! 文件系统本身只通过该特质访问磁盘，驱动的内部实现不在本 crate 范围内。

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::consts::BSIZE;

/// 块设备驱动特质。
///
/// 两个操作都是同步的：返回时本次传输已经完成。
/// `buf` 的长度必须等于 [`BSIZE`]。
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8]);
    fn write_block(&self, blockno: u32, buf: &[u8]);
}

/// 内存块设备，用于测试与演示。
///
/// 所有块保存在一个互斥保护的向量中；[`MemDisk::snapshot`] 复制
/// 当前磁盘镜像，可在其副本上重新挂载以模拟掉电后的重启。
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
}

impl MemDisk {
    /// 创建一个全零的内存磁盘，共 `total` 块。
    pub fn new(total: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BSIZE]; total as usize]),
        }
    }

    /// 复制当前磁盘内容，返回一个独立的新设备。
    pub fn snapshot(&self) -> MemDisk {
        MemDisk {
            blocks: Mutex::new(self.blocks.lock().unwrap().clone()),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[blockno as usize]);
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[blockno as usize].copy_from_slice(buf);
    }
}

/// 镜像文件块设备，`mkfs` 等宿主工具使用。
pub struct FileDisk(pub Mutex<File>);

impl FileDisk {
    pub fn new(file: File) -> Self {
        Self(Mutex::new(file))
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("seeking error");
        assert_eq!(file.read(buf).unwrap(), BSIZE, "not a complete block!");
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("seeking error");
        assert_eq!(file.write(buf).unwrap(), BSIZE, "not a complete block!");
    }
}
