//! 磁盘块操作，包括位映射与索引节点分配
//!
//! 这两类分配都必须在日志事务内调用：位图块与 inode 块的修改全部
//! 通过 `log.write` 登记，与调用者的其余修改一起原子落盘。

use core::ptr;

use bit_field::BitField;

use crate::consts::BPB;
use super::bio::BufCache;
use super::inode::{locate_inode_offset, DiskInode, InodeType};
use super::log::Log;
use super::superblock::SuperBlock;

/// 从位图中分配一个空闲磁盘块，清零后返回其块号。
///
/// # 功能说明
/// 在文件系统位图中查找一个尚未分配的数据块，将其标记为已使用，
/// 并把对应磁盘块内容清零。位图块与数据块的修改都记录进当前事务。
///
/// # 流程解释
/// 1. 按 `BPB`（每个位图块管理的块数）分段迭代整个设备；
/// 2. 对每个位图块遍历其中每一位，段内越过设备总块数即停
///    （最后一个位图块只有前面一部分位是有效的，外层步进同样
///    以总块数为界）；
/// 3. 找到空闲位后置位并登记日志，再读出对应数据块清零登记；
/// 4. 返回该块号。
///
/// # Panics
/// 设备上已无空闲块时触发 panic。
pub fn bm_alloc(bcache: &BufCache, log: &Log, sb: &SuperBlock, dev: u32) -> u32 {
    let total_block = sb.size();
    for base in (0..total_block).step_by(BPB as usize) {
        let mut buf = bcache.bread(dev, sb.bitmap_blockno(base));
        for offset in 0..BPB {
            if base + offset >= total_block {
                break;
            }
            let index = (offset / 8) as isize;
            let bit = (offset % 8) as usize;
            let byte = unsafe {
                (buf.raw_data_mut() as *mut u8).offset(index).as_mut().unwrap()
            };
            if byte.get_bit(bit) {
                continue;
            }
            byte.set_bit(bit, true);
            log.write(buf);

            // 清零刚分配的块
            let free_bn = base + offset;
            let mut free_buf = bcache.bread(dev, free_bn);
            unsafe {
                ptr::write_bytes(free_buf.raw_data_mut(), 0, 1);
            }
            log.write(free_buf);
            return free_bn;
        }
        drop(buf);
    }

    panic!("bitmap: cannot alloc any free block");
}

/// 释放一个磁盘块：把位图中对应位清零。
///
/// # Panics
/// 释放一个本就空闲的块（对应位已为 0）时触发 panic。
pub fn bm_free(bcache: &BufCache, log: &Log, sb: &SuperBlock, dev: u32, blockno: u32) {
    let bm_blockno = sb.bitmap_blockno(blockno);
    let bm_offset = blockno % BPB;
    let index = (bm_offset / 8) as isize;
    let bit = (bm_offset % 8) as usize;
    let mut buf = bcache.bread(dev, bm_blockno);

    let byte = unsafe {
        (buf.raw_data_mut() as *mut u8).offset(index).as_mut().unwrap()
    };
    if !byte.get_bit(bit) {
        panic!("bitmap: double freeing a block");
    }
    byte.set_bit(bit, false);
    log.write(buf);
}

/// 在磁盘 inode 表中分配一个空闲 inode，设置其类型后返回编号。
///
/// # 流程解释
/// 从编号 1 开始（0 号保留）逐个检查磁盘 inode：
/// 类型为空即认领，把整个槽位清零、写入新类型并登记日志。
///
/// # Panics
/// inode 表耗尽时触发 panic。
pub fn inode_alloc(
    bcache: &BufCache,
    log: &Log,
    sb: &SuperBlock,
    dev: u32,
    itype: InodeType,
) -> u32 {
    let size = sb.inode_size();
    for inum in 1..size {
        let blockno = sb.locate_inode(inum);
        let offset = locate_inode_offset(inum);
        let mut buf = bcache.bread(dev, blockno);
        let dinode = unsafe { (buf.raw_data_mut() as *mut DiskInode).offset(offset) };
        let dinode = unsafe { &mut *dinode };
        if dinode.try_alloc(itype).is_ok() {
            log.write(buf);
            return inum;
        }
    }

    panic!("not enough inode to alloc");
}
