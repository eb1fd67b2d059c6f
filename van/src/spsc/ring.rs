//! Bounded lock-free ring for exactly one producer and one consumer.
//!
//! Each side publishes a monotonically increasing position (`head` for the
//! producer, `tail` for the consumer) and keeps a private copy of the other
//! side's position. The peer's cache line is only touched when the private
//! copy says the ring looks full (producer) or empty (consumer).
//!
//! # Safety
//!
//! [`Ring::push`] and [`Ring::pop`] are `unsafe`: at most one thread may act
//! as producer and at most one as consumer at any time. The typed endpoints in
//! [`crate::ipc::spsc`] enforce this within a process.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A value only one side of the ring ever touches.
#[repr(transparent)]
pub struct Local<T>(UnsafeCell<T>);

impl<T: Copy> Local<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    ///
    /// Caller is the side that owns this value.
    #[inline]
    unsafe fn load(&self) -> T {
        unsafe { *self.0.get() }
    }

    /// # Safety
    ///
    /// Caller is the side that owns this value.
    #[inline]
    unsafe fn store(&self, value: T) {
        unsafe { *self.0.get() = value }
    }
}

// SAFETY: each Local is written by exactly one side; the other side never
// reads it.
unsafe impl<T: Send> Sync for Local<T> {}

/// Published position of one side plus its view of the peer.
#[repr(C)]
#[repr(align(64))]
pub struct Side {
    /// Position published to the peer.
    pub position: AtomicUsize,
    /// Last peer position this side loaded.
    pub peer: Local<usize>,
}

impl Side {
    pub const fn new() -> Self {
        Self {
            position: AtomicUsize::new(0),
            peer: Local::new(0),
        }
    }
}

impl Default for Side {
    fn default() -> Self {
        Self::new()
    }
}

/// One element of the ring's storage.
#[repr(transparent)]
pub struct Slot<T>(pub UnsafeCell<MaybeUninit<T>>);

// SAFETY: a slot is owned by the producer while `head - tail < N` excludes
// it and by the consumer once the producer has published it.
unsafe impl<T: Send> Sync for Slot<T> {}

/// The ring itself: two sides on their own cache lines, then `N` slots.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    pub producer: Side,
    pub consumer: Side,
    pub slots: [Slot<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    /// Pushes `item`, handing it back when the ring is full.
    ///
    /// # Safety
    ///
    /// Single producer; the ring's sides are initialized.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.position.load(Ordering::Relaxed);

        // SAFETY: producer-owned cache.
        let mut tail = unsafe { self.producer.peer.load() };
        if head.wrapping_sub(tail) >= N {
            tail = self.consumer.position.load(Ordering::Acquire);
            unsafe { self.producer.peer.store(tail) };
            if head.wrapping_sub(tail) >= N {
                return Err(item);
            }
        }

        // SAFETY: head - tail < N, so the consumer has released this slot and
        // will not read it before the head store below.
        unsafe {
            (*self.slots[head % N].0.get()).write(item);
        }
        self.producer
            .position
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pops the oldest item, or `None` when the ring is empty.
    ///
    /// # Safety
    ///
    /// Single consumer; the ring's sides are initialized.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.position.load(Ordering::Relaxed);

        // SAFETY: consumer-owned cache.
        let mut head = unsafe { self.consumer.peer.load() };
        if head == tail {
            head = self.producer.position.load(Ordering::Acquire);
            unsafe { self.consumer.peer.store(head) };
            if head == tail {
                return None;
            }
        }

        // SAFETY: tail < head, so the producer wrote this slot and published
        // it with the Release store observed above.
        let item = unsafe { (*self.slots[tail % N].0.get()).assume_init_read() };
        self.consumer
            .position
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Number of items published and not yet consumed. Racy by nature; exact
    /// only when neither side is active.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.consumer.position.load(Ordering::Acquire);
        let head = self.producer.position.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    fn ring<const N: usize>() -> Box<Ring<u32, N>> {
        Box::new(Ring {
            producer: Side::new(),
            consumer: Side::new(),
            slots: std::array::from_fn(|_| Slot(UnsafeCell::new(MaybeUninit::uninit()))),
        })
    }

    #[test]
    fn sides_on_separate_cache_lines() {
        assert_eq!(align_of::<Side>(), 64);
        assert_eq!(offset_of!(Ring<u32, 4>, consumer), 64);
        assert_eq!(offset_of!(Ring<u32, 4>, slots), 128);
    }

    #[test]
    fn fifo_until_full() {
        let ring = ring::<4>();
        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            assert_eq!(ring.push(99), Err(99));
            assert_eq!(ring.len(), 4);

            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
            for i in 1..=4 {
                assert_eq!(ring.pop(), Some(i));
            }
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn positions_wrap_around_capacity() {
        let ring = ring::<3>();
        unsafe {
            for round in 0..10u32 {
                for i in 0..3 {
                    ring.push(round * 10 + i).unwrap();
                }
                for i in 0..3 {
                    assert_eq!(ring.pop(), Some(round * 10 + i));
                }
            }
        }
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn threads_see_every_item_in_order() {
        let ring = std::sync::Arc::new(*ring::<8>());
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    let mut item = i;
                    loop {
                        match unsafe { ring.push(item) } {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            })
        };

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(value) = unsafe { ring.pop() } {
                assert_eq!(value, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
