//! 日志式崩溃一致性块文件系统
//!
//! 一个面向单块设备的层次化文件系统：带桶式哈希与 LRU 替换的并发
//! 缓冲缓存、提供多块操作崩溃原子性的预写重做日志、直接/一级间接/
//! 二级间接三段块映射的索引节点层，以及目录与路径解析。
//!
//! 块设备驱动与调度原语是外部协作者：磁盘通过 [`BlockDevice`] 特质
//! 接入，阻塞等待建立在标准库的互斥量与条件变量之上。
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrofs::{FileSystem, InodeType, MemDisk};
//! use ferrofs::fs::mkfs;
//!
//! let disk = Arc::new(MemDisk::new(200));
//! mkfs::format(disk.as_ref(), 200, 200);
//! let fs = FileSystem::mount(disk, 1);
//!
//! fs.begin_op();
//! let file = fs.create(b"/hello", InodeType::File, 0, 0, false).unwrap();
//! file.lock().iwrite(b"hello", 0).unwrap();
//! drop(file);
//! fs.end_op();
//! ```

pub mod consts;
pub mod fs;
pub mod sleeplock;
pub mod spinlock;

pub use fs::{BlockDevice, FileDisk, FileStat, FileSystem, Inode, InodeType, MemDisk};
