//! Buffer 池
//!
//! 固定数量的后端 buffer 在两个集合之间流转：
//! - free：可以填充并提交
//! - queued：已提交给 source，顺序 = 播放顺序（FIFO）
//!
//! 不变量：free ∪ queued = 整个池，且两者不相交

use std::collections::VecDeque;

use crate::audio::backend::BufferId;

pub struct BufferPool {
    free: Vec<BufferId>,
    queued: VecDeque<BufferId>,
    size: usize,
}

impl BufferPool {
    pub fn new(buffers: Vec<BufferId>) -> Self {
        let size = buffers.len();
        Self {
            free: buffers,
            queued: VecDeque::with_capacity(size),
            size,
        }
    }

    /// 池大小
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// 下一个可用的空闲 buffer（不移出，提交成功后再调用 [`BufferPool::mark_queued`]）
    #[inline]
    pub fn peek_free(&self) -> Option<BufferId> {
        self.free.last().copied()
    }

    /// free → queued（追加到队尾）
    pub fn mark_queued(&mut self, buffer: BufferId) -> bool {
        let Some(idx) = self.free.iter().position(|b| *b == buffer) else {
            return false;
        };
        self.free.swap_remove(idx);
        self.queued.push_back(buffer);
        true
    }

    /// 后端取回的 buffer：queued → free
    ///
    /// 返回实际回收的数量；不属于本池的句柄会被忽略
    pub fn reclaim(&mut self, buffers: &[BufferId]) -> usize {
        let mut reclaimed = 0;
        for buffer in buffers {
            if self.queued.front() == Some(buffer) {
                self.queued.pop_front();
            } else if let Some(idx) = self.queued.iter().position(|b| b == buffer) {
                log::warn!(
                    "Buffer {:?} returned out of order (queue position {})",
                    buffer,
                    idx
                );
                self.queued.remove(idx);
            } else {
                log::warn!("Backend returned unknown buffer {:?}", buffer);
                continue;
            }
            self.free.push(*buffer);
            reclaimed += 1;
        }
        reclaimed
    }

    /// 全部回到 free（stop 之后）
    pub fn release_all(&mut self) {
        self.free.extend(self.queued.drain(..));
    }

    /// 所有句柄（销毁时使用）
    pub fn all(&self) -> Vec<BufferId> {
        self.free.iter().chain(self.queued.iter()).copied().collect()
    }

    pub fn queued(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.queued.iter().copied()
    }

    /// 检查分区不变量
    pub fn is_partitioned(&self) -> bool {
        if self.free.len() + self.queued.len() != self.size {
            return false;
        }
        !self.free.iter().any(|b| self.queued.contains(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(vec![BufferId(1), BufferId(2), BufferId(3)])
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let pool = pool();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.queued_count(), 0);
        assert!(pool.is_partitioned());
    }

    #[test]
    fn test_queue_preserves_submission_order() {
        let mut pool = pool();
        let a = pool.peek_free().unwrap();
        assert!(pool.mark_queued(a));
        let b = pool.peek_free().unwrap();
        assert!(pool.mark_queued(b));

        assert_ne!(a, b);
        assert_eq!(pool.queued().collect::<Vec<_>>(), vec![a, b]);
        assert!(pool.is_partitioned());

        // 已排队的 buffer 不能重复排队
        assert!(!pool.mark_queued(a));
    }

    #[test]
    fn test_reclaim_from_front() {
        let mut pool = pool();
        while let Some(b) = pool.peek_free() {
            pool.mark_queued(b);
        }
        let order: Vec<_> = pool.queued().collect();

        assert_eq!(pool.reclaim(&order[..2]), 2);
        assert_eq!(pool.queued().collect::<Vec<_>>(), vec![order[2]]);
        assert_eq!(pool.free_count(), 2);
        assert!(pool.is_partitioned());
    }

    #[test]
    fn test_reclaim_ignores_unknown() {
        let mut pool = pool();
        assert_eq!(pool.reclaim(&[BufferId(99)]), 0);
        assert_eq!(pool.free_count(), 3);
        assert!(pool.is_partitioned());
    }

    #[test]
    fn test_release_all() {
        let mut pool = pool();
        let a = pool.peek_free().unwrap();
        pool.mark_queued(a);
        pool.release_all();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(pool.all().len(), 3);
    }
}
