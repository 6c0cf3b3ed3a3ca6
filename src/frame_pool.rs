// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storage for decoded pictures.
//!
//! The DPB never touches pixels. It asks a [`FrameAllocator`] for one frame per slot when it is
//! initialized and then only moves the returned handles around.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use thiserror::Error;

/// Size in bytes of one 8-bit 4:2:0 macroblock: 256 luma samples plus two 64-sample chroma
/// blocks.
pub const MB_SIZE_BYTES: usize = 384;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("could not allocate {size} bytes of picture storage")]
pub struct AllocationError {
    pub size: usize,
}

/// Provides the storage backing each DPB slot.
pub trait FrameAllocator {
    /// Handle to the storage of one frame. Cloning must be cheap and must not copy the pixels.
    type Frame: Clone;

    /// Allocates storage for a frame of `pic_size_in_mbs` macroblocks.
    fn allocate(&mut self, pic_size_in_mbs: u32) -> Result<Self::Frame, AllocationError>;
}

/// A frame living in system memory, shared between the DPB and whoever reads it for display.
#[derive(Clone, Debug)]
pub struct HeapFrame(Rc<RefCell<Vec<u8>>>);

impl HeapFrame {
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the pixel data.
    pub fn data(&self) -> Ref<'_, Vec<u8>> {
        self.0.borrow()
    }

    /// Mutably borrows the pixel data. Panics if the data is already borrowed.
    pub fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.0.borrow_mut()
    }

    /// Whether `self` and `other` point to the same storage.
    pub fn ptr_eq(&self, other: &HeapFrame) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Allocates zeroed frames on the heap, optionally within a fixed byte budget.
#[derive(Debug, Default)]
pub struct HeapFrameAllocator {
    budget: Option<usize>,
    allocated: usize,
}

impl HeapFrameAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates an allocator that fails once more than `budget` bytes have been handed out.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            allocated: 0,
        }
    }

    /// Total number of bytes handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl FrameAllocator for HeapFrameAllocator {
    type Frame = HeapFrame;

    fn allocate(&mut self, pic_size_in_mbs: u32) -> Result<HeapFrame, AllocationError> {
        let size = (pic_size_in_mbs as usize)
            .checked_mul(MB_SIZE_BYTES)
            .ok_or(AllocationError { size: usize::MAX })?;

        if let Some(budget) = self.budget {
            if self.allocated.saturating_add(size) > budget {
                return Err(AllocationError { size });
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocationError { size })?;
        data.resize(size, 0);

        self.allocated += size;
        log::trace!("Allocated frame of {} bytes", size);

        Ok(HeapFrame(Rc::new(RefCell::new(data))))
    }
}
