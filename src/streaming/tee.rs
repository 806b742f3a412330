//! 流分叉
//!
//! 同一个流实例不能被两个消费者读取。需要两份结果时（例如测试中既要线路字节
//! 又要逐项断言），用 [`tee`] 得到两个独立的半流：每个半流按顺序各自看到每一项一次，
//! 源流只在领先的一方拉取时才被拉取，落后一方的待读项缓存在它自己的队列里。

use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

struct TeeState<T> {
    source: Pin<Box<dyn Stream<Item = T> + Send>>,
    buffers: [VecDeque<T>; 2],
    wakers: [Option<Waker>; 2],
    dropped: [bool; 2],
    done: bool,
}

/// 分叉后的一半
pub struct TeeHalf<T> {
    state: Arc<Mutex<TeeState<T>>>,
    side: usize,
}

/// 把一个流分叉为两个独立的半流
pub fn tee<S, T>(stream: S) -> (TeeHalf<T>, TeeHalf<T>)
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
{
    let state = Arc::new(Mutex::new(TeeState {
        source: Box::pin(stream),
        buffers: [VecDeque::new(), VecDeque::new()],
        wakers: [None, None],
        dropped: [false, false],
        done: false,
    }));
    (
        TeeHalf {
            state: state.clone(),
            side: 0,
        },
        TeeHalf { state, side: 1 },
    )
}

impl<T> TeeHalf<T> {
    /// 另一半尚未读取、缓存在本侧的项数
    pub fn buffered(&self) -> usize {
        self.state.lock().buffers[self.side].len()
    }
}

impl<T: Clone> Stream for TeeHalf<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let side = self.side;
        let other = 1 - side;
        let mut state = self.state.lock();

        if let Some(item) = state.buffers[side].pop_front() {
            return Poll::Ready(Some(item));
        }
        if state.done {
            return Poll::Ready(None);
        }

        let polled = state.source.as_mut().poll_next(cx);
        match polled {
            Poll::Ready(Some(item)) => {
                if !state.dropped[other] {
                    state.buffers[other].push_back(item.clone());
                }
                if let Some(waker) = state.wakers[other].take() {
                    waker.wake();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                state.done = true;
                if let Some(waker) = state.wakers[other].take() {
                    waker.wake();
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                state.wakers[side] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for TeeHalf<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.dropped[self.side] = true;
        state.buffers[self.side].clear();
        // 源流可能只记住了本侧的 waker，让另一侧自己重新拉取
        if let Some(waker) = state.wakers[1 - self.side].take() {
            waker.wake();
        }
    }
}

// ============================================================================
// 测试模块
// ============================================================================
