//! 崩溃一致性测试：在提交流程的不同写入点掉电，
//! 重新挂载后事务要么完整生效、要么完全无痕。
//!
//! 确定性构造：覆盖一个已有文件的首块会在日志中登记恰好两个块
//! （数据块与 inode 块），于是提交流程的磁盘写入序列为：
//! 2 次日志块、1 次日志头（提交点）、2 次安装、1 次清头。

mod common;

use std::sync::Arc;

use common::CrashDisk;
use ferrofs::fs::mkfs;
use ferrofs::{FileSystem, InodeType, MemDisk};

/// 建立一个内容为 "AAAA" 的文件，然后在写预算 `budget` 下覆盖为
/// "BBBB"，掉电重启后返回文件内容。
fn overwrite_with_budget(budget: u32) -> [u8; 4] {
    let disk = {
        let inner = MemDisk::new(200);
        mkfs::format(&inner, 200, 16);
        Arc::new(CrashDisk::new(inner))
    };
    let fs = FileSystem::mount(disk.clone(), 1);

    fs.begin_op();
    let f = fs.create(b"/f", InodeType::File, 0, 0, false).unwrap();
    f.lock().iwrite(b"AAAA", 0).unwrap();
    drop(f);
    fs.end_op();

    // 从这里开始限制磁盘写入次数
    disk.set_write_budget(budget);
    fs.begin_op();
    let f = fs.namei(b"/f").unwrap();
    f.lock().iwrite(b"BBBB", 0).unwrap();
    drop(f);
    fs.end_op();

    // 掉电：对盘面快照重新挂载
    let snapshot = Arc::new(disk.snapshot());
    let fs2 = FileSystem::mount(snapshot, 1);
    let f = fs2.namei(b"/f").unwrap();
    let mut data = [0u8; 4];
    f.lock().iread(&mut data, 0).unwrap();
    data
}

#[test]
fn crash_before_commit_point_discards_transaction() {
    // 只有两个日志块落盘，日志头未写：事务如同没有发生
    assert_eq!(&overwrite_with_budget(2), b"AAAA");
}

#[test]
fn crash_at_commit_point_applies_transaction() {
    // 日志头已落盘，安装全部丢失：恢复流程重放日志
    assert_eq!(&overwrite_with_budget(3), b"BBBB");
}

#[test]
fn crash_during_install_applies_transaction() {
    // 安装进行到一半：重放是幂等的，结果仍完整生效
    assert_eq!(&overwrite_with_budget(4), b"BBBB");
}

#[test]
fn crash_with_nothing_committed_leaves_disk_untouched() {
    let disk = {
        let inner = MemDisk::new(200);
        mkfs::format(&inner, 200, 16);
        Arc::new(CrashDisk::new(inner))
    };
    let fs = FileSystem::mount(disk.clone(), 1);

    // 事务未结束就掉电：所有修改都只在缓存里
    fs.begin_op();
    let f = fs.create(b"/ghost", InodeType::File, 0, 0, false).unwrap();
    f.lock().iwrite(b"gone", 0).unwrap();
    drop(f);
    let snapshot = Arc::new(disk.snapshot());
    fs.end_op();

    let fs2 = FileSystem::mount(snapshot, 1);
    assert!(fs2.namei(b"/ghost").is_none());
}

#[test]
fn committed_transactions_survive_reboot() {
    let disk = {
        let inner = MemDisk::new(200);
        mkfs::format(&inner, 200, 16);
        Arc::new(CrashDisk::new(inner))
    };
    let fs = FileSystem::mount(disk.clone(), 1);

    fs.begin_op();
    let f = fs.create(b"/keep", InodeType::File, 0, 0, false).unwrap();
    f.lock().iwrite(b"durable", 0).unwrap();
    drop(f);
    fs.end_op();

    // end_op 返回之后立即掉电
    let snapshot = Arc::new(disk.snapshot());
    let fs2 = FileSystem::mount(snapshot, 1);
    let f = fs2.namei(b"/keep").unwrap();
    let mut guard = f.lock();
    assert_eq!(guard.size(), 7);
    let mut data = [0u8; 7];
    guard.iread(&mut data, 0).unwrap();
    assert_eq!(&data, b"durable");
}
