//! 镜像格式化工具
//!
//! 创建（或截断）一个镜像文件，在其上格式化文件系统，
//! 并可选地把宿主机文件打包进根目录。

use std::cmp::min;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ferrofs::consts::BSIZE;
use ferrofs::fs::mkfs;
use ferrofs::{FileDisk, FileSystem, InodeType};

#[derive(Parser)]
#[command(about = "Format a file system image and optionally pack files into it")]
struct Cli {
    /// 输出镜像文件名
    #[arg(short, long)]
    output: PathBuf,

    /// 镜像总块数
    #[arg(long, default_value_t = 2000)]
    size: u32,

    /// inode 总数
    #[arg(long, default_value_t = 200)]
    ninodes: u32,

    /// 要打包进根目录的文件
    files: Vec<PathBuf>,
}

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.output)?;
    fd.set_len(cli.size as u64 * BSIZE as u64)?;

    let disk = Arc::new(FileDisk::new(fd));
    mkfs::format(disk.as_ref(), cli.size, cli.ninodes);
    println!(
        "formatted {}: {} blocks, {} inodes",
        cli.output.display(),
        cli.size,
        cli.ninodes
    );

    if cli.files.is_empty() {
        return Ok(());
    }

    // 打包文件走挂载后的正常写路径
    let fs = FileSystem::mount(disk, 1);
    for path in &cli.files {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("packed file must have a valid name");

        let mut target = b"/".to_vec();
        target.extend_from_slice(name.as_bytes());

        fs.begin_op();
        let inode = fs
            .create(&target, InodeType::File, 0, 0, false)
            .expect("create packed file");
        fs.end_op();

        // 单个事务最多写 MAXOPBLOCKS 个块，大文件按小段分事务写入：
        // 每段 3 个数据块，加上位图、间接块与 inode 本身仍在限额之内
        let chunk = 3 * BSIZE;
        let mut off = 0usize;
        while off < data.len() {
            let n = min(chunk, data.len() - off);
            fs.begin_op();
            inode
                .lock()
                .iwrite(&data[off..off + n], off as u32)
                .expect("write packed file");
            fs.end_op();
            off += n;
        }
        println!("packed {} ({} bytes)", name, data.len());
    }

    Ok(())
}
