//! 文件系统常量
//!
//! 所有编译期几何参数集中在此处。运行期几何（总块数、inode 总数）
//! 由格式化工具写入超级块，挂载时从磁盘读出。

/// 磁盘块大小（字节）。
pub const BSIZE: usize = 1024;

/// 超级块魔数，格式化时写入块 1，挂载时校验。
pub const FSMAGIC: u32 = 0x1020_3040;

/// 缓冲缓存中的缓冲块数量。
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 缓冲缓存的哈希桶数量（小素数）。
pub const NBUFMAP_BUCKET: usize = 13;

/// 单个文件系统操作最多写入的块数。
pub const MAXOPBLOCKS: usize = 10;

/// 磁盘日志中数据块数量的上限。
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// inode 缓存的槽位数量（同时活跃的 inode 上限）。
pub const NINODE: usize = 50;

/// 每个 inode 的直接块地址数量。
pub const NDIRECT: usize = 11;

/// 一个间接块可容纳的块地址数量。
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// 单个文件的最大块数：直接块 + 一级间接 + 二级间接。
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// 单个文件的最大字节数。
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BSIZE;

/// 目录项名称的最大长度（含结尾 0 时为 13 字节有效名）。
pub const MAX_DIR_SIZE: usize = 14;

/// 每个位图块管理的块数（每块一位）。
pub const BPB: u32 = (BSIZE * 8) as u32;

/// 根目录的 inode 编号（0 保留不用）。
pub const ROOTINUM: u32 = 1;
