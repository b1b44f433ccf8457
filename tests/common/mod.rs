//! 集成测试公共设施：挂载辅助、位图统计与掉电模拟设备。
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ferrofs::consts::BSIZE;
use ferrofs::fs::mkfs;
use ferrofs::{BlockDevice, FileSystem, MemDisk};

/// 格式化并挂载一块内存磁盘。
pub fn fresh_fs(size: u32, ninodes: u32) -> (Arc<MemDisk>, Arc<FileSystem>) {
    let disk = Arc::new(MemDisk::new(size));
    mkfs::format(disk.as_ref(), size, ninodes);
    let fs = FileSystem::mount(disk.clone(), 1);
    (disk, fs)
}

/// 读取磁盘上超级块的第 `index` 个 u32 字段。
pub fn sb_field(disk: &dyn BlockDevice, index: usize) -> u32 {
    let mut buf = [0u8; BSIZE];
    disk.read_block(1, &mut buf);
    u32::from_ne_bytes(buf[index * 4..index * 4 + 4].try_into().unwrap())
}

/// 统计位图中已分配的块数（直接读设备，绕过缓存）。
pub fn used_blocks(disk: &dyn BlockDevice) -> u32 {
    let size = sb_field(disk, 1);
    let bmapstart = sb_field(disk, 7);
    let mut buf = [0u8; BSIZE];
    disk.read_block(bmapstart, &mut buf);
    let mut count = 0;
    for bn in 0..size as usize {
        if buf[bn / 8] & (1 << (bn % 8)) != 0 {
            count += 1;
        }
    }
    count
}

/// 可在任意一次磁盘写入处"掉电"的设备。
///
/// 写预算耗尽后，后续写入被静默丢弃（掉电瞬间之后的行为无关紧要，
/// 测试随后对 [`CrashDisk::snapshot`] 的副本重新挂载）。读取不受限制。
pub struct CrashDisk {
    inner: MemDisk,
    budget: Mutex<Option<u32>>,
}

impl CrashDisk {
    pub fn new(inner: MemDisk) -> Self {
        Self {
            inner,
            budget: Mutex::new(None),
        }
    }

    /// 允许再写 `n` 次，之后的写入全部丢失。
    pub fn set_write_budget(&self, n: u32) {
        *self.budget.lock().unwrap() = Some(n);
    }

    /// 当前盘面内容的副本，相当于掉电后重新上电看到的磁盘。
    pub fn snapshot(&self) -> MemDisk {
        self.inner.snapshot()
    }
}

impl BlockDevice for CrashDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        self.inner.read_block(blockno, buf);
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        {
            let mut budget = self.budget.lock().unwrap();
            if let Some(n) = budget.as_mut() {
                if *n == 0 {
                    return;
                }
                *n -= 1;
            }
        }
        self.inner.write_block(blockno, buf);
    }
}
