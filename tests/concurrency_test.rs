//! 并发测试：交叉路径遍历、组提交与并行创建。

mod common;

use std::thread;

use common::fresh_fs;
use ferrofs::consts::BSIZE;
use ferrofs::{FileSystem, InodeType};

#[test]
fn crossing_path_walks_complete() {
    let (_disk, fs) = fresh_fs(400, 64);

    fs.begin_op();
    fs.create(b"/a", InodeType::Directory, 0, 0, false).unwrap();
    fs.create(b"/b", InodeType::Directory, 0, 0, false).unwrap();
    fs.create(b"/a/b", InodeType::Directory, 0, 0, false).unwrap();
    fs.create(b"/b/a", InodeType::Directory, 0, 0, false).unwrap();
    fs.end_op();

    // 两个线程以相反的顺序遍历交叉的路径；
    // 路径遍历同一时刻至多锁一个目录，因此不会互相卡死
    thread::scope(|s| {
        let fs1: &FileSystem = &fs;
        let fs2: &FileSystem = &fs;
        s.spawn(move || {
            for _ in 0..200 {
                fs1.namei(b"/a/b").unwrap();
            }
        });
        s.spawn(move || {
            for _ in 0..200 {
                fs2.namei(b"/b/a").unwrap();
            }
        });
    });
}

#[test]
fn group_commit_merges_concurrent_ops() {
    let (disk, fs) = fresh_fs(400, 64);

    fs.begin_op();
    fs.create(b"/t0", InodeType::File, 0, 0, false).unwrap();
    fs.create(b"/t1", InodeType::File, 0, 0, false).unwrap();
    fs.end_op();

    // 两个操作并发打开事务，各写 6 个数据块，
    // 连同位图与 inode 仍在每操作 MAXOPBLOCKS 的预留之内
    thread::scope(|s| {
        for t in 0..2u8 {
            let fs = &fs;
            s.spawn(move || {
                let path = if t == 0 { b"/t0".as_slice() } else { b"/t1".as_slice() };
                let payload = vec![t + 1; 6 * BSIZE];
                fs.begin_op();
                let f = fs.namei(path).unwrap();
                f.lock().iwrite(&payload, 0).unwrap();
                drop(f);
                fs.end_op();
            });
        }
    });

    // 重启后两份内容都完整
    drop(fs);
    let fs = FileSystem::mount(disk.clone(), 1);
    for t in 0..2u8 {
        let path = if t == 0 { b"/t0".as_slice() } else { b"/t1".as_slice() };
        let f = fs.namei(path).unwrap();
        let mut guard = f.lock();
        assert_eq!(guard.size() as usize, 6 * BSIZE);
        let mut data = vec![0u8; 6 * BSIZE];
        guard.iread(&mut data, 0).unwrap();
        assert!(data.iter().all(|&b| b == t + 1));
    }
}

#[test]
fn parallel_creation_under_shared_root() {
    let (disk, fs) = fresh_fs(400, 64);

    // 八个操作争抢日志预留与根目录锁；
    // 准入控制最多同时放行三个，其余在 begin_op 中休眠
    thread::scope(|s| {
        for t in 0..8u8 {
            let fs = &fs;
            s.spawn(move || {
                let path = format!("/file{}", t).into_bytes();
                fs.begin_op();
                let f = fs.create(&path, InodeType::File, 0, 0, false).unwrap();
                f.lock().iwrite(&[t; 100], 0).unwrap();
                drop(f);
                fs.end_op();
            });
        }
    });

    drop(fs);
    let fs = FileSystem::mount(disk.clone(), 1);
    for t in 0..8u8 {
        let path = format!("/file{}", t).into_bytes();
        let f = fs.namei(&path).unwrap();
        let mut guard = f.lock();
        assert_eq!(guard.size(), 100);
        let mut data = [0u8; 100];
        guard.iread(&mut data, 0).unwrap();
        assert!(data.iter().all(|&b| b == t));
    }
}

#[test]
fn concurrent_reads_of_one_file() {
    let (_disk, fs) = fresh_fs(400, 64);

    fs.begin_op();
    let f = fs.create(b"/shared", InodeType::File, 0, 0, false).unwrap();
    f.lock().iwrite(&[0x42; 2 * BSIZE], 0).unwrap();
    drop(f);
    fs.end_op();

    thread::scope(|s| {
        for _ in 0..4 {
            let fs = &fs;
            s.spawn(move || {
                for _ in 0..50 {
                    let f = fs.namei(b"/shared").unwrap();
                    let mut data = vec![0u8; 2 * BSIZE];
                    f.lock().iread(&mut data, 0).unwrap();
                    assert!(data.iter().all(|&b| b == 0x42));
                }
            });
        }
    });
}
