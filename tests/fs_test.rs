//! 端到端功能测试：挂载、路径解析、读写、链接与回收。

mod common;

use common::{fresh_fs, used_blocks};
use ferrofs::consts::{BSIZE, NDIRECT, NINDIRECT, ROOTINUM};
use ferrofs::{FileStat, FileSystem, InodeType};

#[test]
fn mount_reads_root_directory() {
    let (_disk, fs) = fresh_fs(200, 200);
    let root = fs.namei(b"/").unwrap();
    let mut stat = FileStat::uninit();
    root.lock().istat(&mut stat);
    assert_eq!(stat.itype, InodeType::Directory);
    assert_eq!(stat.inum, ROOTINUM);
    assert_eq!(stat.nlink, 1);
    // 格式化后根目录只有 "." 和 ".."
    assert_eq!(stat.size, 32);
}

#[test]
fn create_write_read_persists_across_remount() {
    let (disk, fs) = fresh_fs(200, 200);

    fs.begin_op();
    let file = fs.create(b"/hello.txt", InodeType::File, 0, 0, false).unwrap();
    file.lock().iwrite(b"hello", 0).unwrap();
    drop(file);
    fs.end_op();
    drop(fs);

    // 重新挂载同一块设备，相当于重启
    let fs = FileSystem::mount(disk.clone(), 1);
    let file = fs.namei(b"/hello.txt").unwrap();
    let mut guard = file.lock();
    assert_eq!(guard.size(), 5);
    let mut data = [0u8; 16];
    assert_eq!(guard.try_iread(&mut data, 0).unwrap(), 5);
    assert_eq!(&data[..5], b"hello");
    // 越过文件末尾的读取返回 0
    assert_eq!(guard.try_iread(&mut data, 100).unwrap(), 0);
}

#[test]
fn path_resolution_walks_directories() {
    let (_disk, fs) = fresh_fs(400, 64);

    fs.begin_op();
    fs.create(b"/a", InodeType::Directory, 0, 0, false).unwrap();
    fs.create(b"/a/b", InodeType::Directory, 0, 0, false).unwrap();
    let c = fs.create(b"/a/b/c", InodeType::File, 0, 0, false).unwrap();
    c.lock().iwrite(b"leaf", 0).unwrap();
    drop(c);
    fs.end_op();

    // 绝对路径与多余斜杠
    assert!(fs.namei(b"/a/b/c").is_some());
    assert!(fs.namei(b"//a///b/c").is_some());
    // 缺失的分量
    assert!(fs.namei(b"/a/x/c").is_none());
    // 非目录出现在路径中间
    assert!(fs.namei(b"/a/b/c/d").is_none());

    // 父目录解析
    let mut name = [0u8; 14];
    let parent = fs.namei_parent(b"/a/b/c", &mut name).unwrap();
    assert_eq!(&name[..2], b"c\0");
    let b_dir = fs.namei(b"/a/b").unwrap();
    assert_eq!(parent.inum(), b_dir.inum());

    // 相对路径
    let a_dir = fs.namei(b"/a").unwrap();
    let via_rel = fs.namei_at(&a_dir, b"b/c").unwrap();
    let via_abs = fs.namei(b"/a/b/c").unwrap();
    assert_eq!(via_rel.inum(), via_abs.inum());

    // 查询根目录的父目录没有结果
    assert!(fs.namei_parent(b"/", &mut name).is_none());
}

#[test]
fn duplicate_create_and_reuse() {
    let (_disk, fs) = fresh_fs(200, 64);

    fs.begin_op();
    let first = fs.create(b"/dup", InodeType::File, 0, 0, false).unwrap();
    // 不允许重名
    assert!(fs.create(b"/dup", InodeType::File, 0, 0, false).is_none());
    // reuse 模式返回已有 inode
    let again = fs.create(b"/dup", InodeType::File, 0, 0, true).unwrap();
    assert_eq!(first.inum(), again.inum());
    drop(first);
    drop(again);
    fs.end_op();
}

#[test]
fn hard_links_share_content() {
    let (_disk, fs) = fresh_fs(200, 64);

    fs.begin_op();
    let f = fs.create(b"/orig", InodeType::File, 0, 0, false).unwrap();
    f.lock().iwrite(b"shared", 0).unwrap();
    drop(f);
    fs.link(b"/orig", b"/alias").unwrap();
    fs.end_op();

    let alias = fs.namei(b"/alias").unwrap();
    let mut stat = FileStat::uninit();
    let mut guard = alias.lock();
    guard.istat(&mut stat);
    assert_eq!(stat.nlink, 2);
    let mut data = [0u8; 6];
    guard.iread(&mut data, 0).unwrap();
    assert_eq!(&data, b"shared");
    drop(guard);

    // 目录不允许硬链接
    fs.begin_op();
    assert!(fs.link(b"/", b"/rootlink").is_err());
    fs.end_op();

    // 删除其中一个名字，内容仍在
    fs.begin_op();
    fs.unlink(b"/orig").unwrap();
    fs.end_op();
    assert!(fs.namei(b"/orig").is_none());
    assert!(fs.namei(b"/alias").is_some());
}

#[test]
fn unlink_frees_all_blocks() {
    let (disk, fs) = fresh_fs(400, 64);
    let before = used_blocks(disk.as_ref());

    fs.begin_op();
    let f = fs.create(b"/junk", InodeType::File, 0, 0, false).unwrap();
    fs.end_op();

    // 写 NDIRECT + 2 块，迫使一级间接块被分配
    let block = [0xa5u8; BSIZE];
    for i in 0..NDIRECT + 2 {
        fs.begin_op();
        f.lock().iwrite(&block, (i * BSIZE) as u32).unwrap();
        fs.end_op();
    }
    assert!(used_blocks(disk.as_ref()) > before);

    fs.begin_op();
    fs.unlink(b"/junk").unwrap();
    drop(f); // 最后一个引用：inode 销毁发生在本事务内
    fs.end_op();

    assert!(fs.namei(b"/junk").is_none());
    assert_eq!(used_blocks(disk.as_ref()), before);
}

#[test]
fn rmdir_semantics_on_directories() {
    let (_disk, fs) = fresh_fs(400, 64);

    fs.begin_op();
    fs.create(b"/d", InodeType::Directory, 0, 0, false).unwrap();
    fs.create(b"/d/inner", InodeType::File, 0, 0, false).unwrap();
    fs.end_op();

    // 非空目录不可删除
    fs.begin_op();
    assert!(fs.unlink(b"/d").is_err());
    fs.unlink(b"/d/inner").unwrap();
    fs.unlink(b"/d").unwrap();
    fs.end_op();
    assert!(fs.namei(b"/d").is_none());

    // "." 与 ".." 永远不可删除
    fs.begin_op();
    assert!(fs.unlink(b"/.").is_err());
    fs.end_op();
}

#[test]
fn big_file_spans_double_indirect_region() {
    let (disk, fs) = fresh_fs(400, 16);
    let baseline = used_blocks(disk.as_ref());

    fs.begin_op();
    let f = fs.create(b"/big", InodeType::File, 0, 0, false).unwrap();
    fs.end_op();

    // 直接块、一级间接与二级间接区各写一部分
    let total_blocks = NDIRECT + NINDIRECT + 5;
    let mut chunk = vec![0u8; BSIZE];
    for bn in 0..total_blocks {
        chunk.fill((bn % 251) as u8);
        fs.begin_op();
        f.lock().iwrite(&chunk, (bn * BSIZE) as u32).unwrap();
        fs.end_op();
    }

    let mut guard = f.lock();
    assert_eq!(guard.size() as usize, total_blocks * BSIZE);
    let mut readback = vec![0u8; BSIZE];
    for bn in [
        0,
        NDIRECT - 1,
        NDIRECT,
        NDIRECT + NINDIRECT - 1,
        NDIRECT + NINDIRECT,
        total_blocks - 1,
    ] {
        guard.iread(&mut readback, (bn * BSIZE) as u32).unwrap();
        assert!(
            readback.iter().all(|&b| b == (bn % 251) as u8),
            "block {} content mismatch",
            bn
        );
    }
    drop(guard);

    // 截断释放全部数据块与两层间接块
    fs.begin_op();
    f.lock().truncate();
    fs.end_op();
    assert_eq!(f.lock().size(), 0);

    fs.begin_op();
    fs.unlink(b"/big").unwrap();
    drop(f);
    fs.end_op();
    assert_eq!(used_blocks(disk.as_ref()), baseline);
}

#[test]
fn write_beyond_limits_is_reported() {
    let (_disk, fs) = fresh_fs(200, 64);
    fs.begin_op();
    let f = fs.create(b"/sparse", InodeType::File, 0, 0, false).unwrap();
    // 不允许在文件末尾之后写出空洞
    assert!(f.lock().iwrite(b"x", 10).is_err());
    fs.end_op();
}
