//! 睡眠锁模块
//! 提供基于线程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会进入休眠状态，避免忙等待。
//! 缓冲块与 inode 内容在磁盘 I/O 期间都由睡眠锁保护。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use std::sync::{Condvar, Mutex};

/// 睡眠锁结构，提供阻塞式同步机制。
///
/// 与自旋锁不同，当锁被占用时，尝试获取的线程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁
/// （例如跨磁盘读写持有的缓冲块锁）。
///
/// # 字段说明
/// - `locked`: 互斥保护的占用标志，`true` 表示锁已被某个线程持有；
/// - `cond`: 条件变量，释放锁时唤醒等待者；
/// - `name`: 锁的标识名称，用于调试；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
pub struct SleepLock<T: ?Sized> {
    locked: Mutex<bool>,
    cond: Condvar,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例。
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞线程）。
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。如果锁已被占用，当前线程将进入休眠状态，
    /// 直到锁被释放后被唤醒。返回守卫对象提供对数据的访问。
    ///
    /// # 流程解释
    /// 1. 获取内部互斥锁保护 `locked` 标志；
    /// 2. 若已被占用，在条件变量上等待（等待期间释放互斥锁，被唤醒后重新持有）；
    /// 3. 设置 `locked = true` 并返回守卫。
    ///
    /// # 安全性
    /// - `locked` 标志保证同一时刻只有一个守卫存在，
    ///   因此通过 `UnsafeCell` 取出的可变引用是独占的。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cond.wait(locked).unwrap();
        }
        *locked = true;
        drop(locked);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁并唤醒一个等待者（内部方法，由守卫的 Drop 调用）。
    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        *locked = false;
        drop(locked);
        self.cond.notify_one();
    }

    /// 返回锁的调试名称。
    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问。
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
