//! 格式化
//!
//! 在一块空设备上铺设文件系统：写超级块、建立根目录（inode 1，
//! 含 `.` 与 `..`）、在位图中标记全部元数据块为已占用。
//! 磁盘布局：`[ 引导块 | 超级块 | 日志 | inode 区 | 位图 | 数据 ]`。
//!
//! 此时还不存在需要保持一致的文件系统，所以这里绕过缓冲缓存与日志，
//! 直接对块设备操作；格式化完成后方可挂载。

use core::cmp::min;
use core::mem;
use core::ptr;

use crate::consts::{BPB, BSIZE, FSMAGIC, LOGSIZE, NDIRECT, ROOTINUM};
use super::device::BlockDevice;
use super::inode::{locate_inode_offset, DirEntry, DiskInode, InodeType, IPB};
use super::superblock::RawSuperBlock;

/// 格式化一块设备。
///
/// # 功能说明
/// 1. 按给定的总块数与 inode 总数计算布局，全盘清零后写入超级块；
/// 2. 分配根目录 inode（编号必为 [`ROOTINUM`]）并写入 `.`、`..` 两个
///    目录项；
/// 3. 把引导块、超级块、日志区、inode 区、位图本身以及根目录已用的
///    数据块在位图中标记为已占用。
///
/// # Panics
/// - 设备容量放不下元数据区；
/// - 单个位图块表达不下整个设备（超出本工具支持的规模）。
pub fn format(disk: &dyn BlockDevice, size: u32, ninodes: u32) {
    assert_eq!(BSIZE % mem::size_of::<DiskInode>(), 0);
    assert_eq!(BSIZE % mem::size_of::<DirEntry>(), 0);

    let nbitmap = size / BPB + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nlog = LOGSIZE as u32;
    // 元数据：引导块、超级块、日志、inode 区、位图
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta < size, "device too small for metadata");

    let sb = RawSuperBlock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };

    let mut img = Mkfs {
        disk,
        sb,
        freeinode: 1,
        freeblock: nmeta,
    };

    let zeroes = [0u8; BSIZE];
    for bn in 0..size {
        disk.write_block(bn, &zeroes);
    }

    let mut buf = [0u8; BSIZE];
    unsafe {
        ptr::copy_nonoverlapping(
            &sb as *const RawSuperBlock as *const u8,
            buf.as_mut_ptr(),
            mem::size_of::<RawSuperBlock>(),
        );
    }
    img.wsect(1, &buf);

    let rootino = img.ialloc(InodeType::Directory);
    assert_eq!(rootino, ROOTINUM);

    let mut de = DirEntry::empty();
    de.inum = rootino as u16;
    de.name[0] = b'.';
    img.iappend(rootino, de.as_bytes());
    de.name[1] = b'.';
    img.iappend(rootino, de.as_bytes());

    img.balloc();

    log::info!(
        "mkfs: nmeta {} (boot, super, log blocks {}, inode blocks {}, bitmap blocks {}) data blocks {} total {}",
        nmeta, nlog, ninodeblocks, nbitmap, sb.nblocks, size
    );
}

/// 格式化过程的工作状态：设备、布局和两个分配游标。
struct Mkfs<'a> {
    disk: &'a dyn BlockDevice,
    sb: RawSuperBlock,
    /// 下一个待分配的 inode 编号。
    freeinode: u32,
    /// 第一个尚未占用的数据块号。
    freeblock: u32,
}

impl Mkfs<'_> {
    fn wsect(&self, bn: u32, data: &[u8; BSIZE]) {
        self.disk.write_block(bn, data);
    }

    fn rsect(&self, bn: u32) -> [u8; BSIZE] {
        let mut buf = [0u8; BSIZE];
        self.disk.read_block(bn, &mut buf);
        buf
    }

    /// 读出编号 `inum` 的磁盘 inode。
    fn rinode(&self, inum: u32) -> DiskInode {
        let bn = self.sb.inodestart + inum / IPB as u32;
        let buf = self.rsect(bn);
        unsafe {
            ptr::read_unaligned(
                (buf.as_ptr() as *const DiskInode).offset(locate_inode_offset(inum)),
            )
        }
    }

    /// 把 `din` 写回编号 `inum` 的磁盘 inode 槽位。
    fn winode(&self, inum: u32, din: DiskInode) {
        let bn = self.sb.inodestart + inum / IPB as u32;
        let mut buf = self.rsect(bn);
        unsafe {
            ptr::write_unaligned(
                (buf.as_mut_ptr() as *mut DiskInode).offset(locate_inode_offset(inum)),
                din,
            );
        }
        self.wsect(bn, &buf);
    }

    /// 取下一个空闲 inode 编号并初始化其磁盘槽位。
    fn ialloc(&mut self, itype: InodeType) -> u32 {
        let inum = self.freeinode;
        self.freeinode += 1;

        let mut din = DiskInode::new();
        din.itype = itype;
        din.nlink = 1;
        din.size = 0;
        self.winode(inum, din);
        inum
    }

    /// 在 inode 末尾追加数据，按需占用新的直接块。
    ///
    /// 格式化阶段只有根目录需要内容，直接块足够；
    /// 镜像打包工具写入普通文件走挂载后的正常写路径。
    fn iappend(&mut self, inum: u32, data: &[u8]) {
        let mut din = self.rinode(inum);
        let mut off = din.size as usize;
        let mut remaining = data;
        while !remaining.is_empty() {
            let fbn = off / BSIZE;
            assert!(fbn < NDIRECT, "format-time append supports direct blocks only");
            if din.addrs[fbn] == 0 {
                din.addrs[fbn] = self.freeblock;
                self.freeblock += 1;
            }
            let bn = din.addrs[fbn];
            let block_offset = off - fbn * BSIZE;
            let n = min(remaining.len(), BSIZE - block_offset);
            let mut sec = self.rsect(bn);
            sec[block_offset..block_offset + n].copy_from_slice(&remaining[..n]);
            self.wsect(bn, &sec);
            off += n;
            remaining = &remaining[n..];
        }
        din.size = off as u32;
        self.winode(inum, din);
    }

    /// 在位图中标记 `[0, freeblock)` 为已占用。
    fn balloc(&self) {
        let used = self.freeblock as usize;
        assert!(used < BPB as usize, "device exceeds one bitmap block");
        log::debug!("mkfs: first {} blocks have been allocated", used);

        let mut sec = [0u8; BSIZE];
        for i in 0..used {
            sec[i / 8] |= 1 << (i % 8);
        }
        self.wsect(self.sb.bmapstart, &sec);
    }
}
