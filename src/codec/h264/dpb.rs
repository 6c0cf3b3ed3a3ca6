// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 decoded picture buffer.
//!
//! The DPB owns `dpb_size + 1` picture slots. The first `dpb_size` slots hold committed pictures
//! that are either used for reference or waiting for output, the last one receives the picture
//! being decoded. Slots are kept sorted so that reference pictures come first, short-term before
//! long-term, and free slots last.
//!
//! A picture goes through the DPB as follows:
//!
//! 1. [`Dpb::check_gaps_in_frame_num`] infers the pictures missing before it,
//! 2. [`Dpb::allocate_current_slot`] hands out the storage to decode into,
//! 3. [`Dpb::init_ref_pic_list`] and [`Dpb::reorder_ref_pic_list`] build reference list 0,
//! 4. [`Dpb::mark_dec_ref_pic`] commits it and stages the pictures that are ready for output,
//!    which are then retrieved with [`Dpb::next_output`].

mod gaps;
mod marking;
mod ordering;
mod output;
mod ref_list;

use std::fmt;

use thiserror::Error;

use crate::codec::h264::header::MaxLongTermFrameIdx;
use crate::codec::h264::params::DpbParams;
use crate::codec::h264::picture::PictureData;
use crate::frame_pool::AllocationError;
use crate::frame_pool::FrameAllocator;

pub use ordering::compare_pictures;
pub use output::OutputRecord;
pub use ref_list::SlotRef;

/// Maximum number of entries of reference picture list 0.
pub const MAX_NUM_REF_IDX_L0_ACTIVE: usize = 16;

fn ref_kind(long_term: &bool) -> &'static str {
    if *long_term {
        "long-term"
    } else {
        "short-term"
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DpbError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("invalid DPB parameters: {0}")]
    InvalidParameters(String),
    #[error("the DPB storage is not allocated")]
    NotAllocated,
    #[error("could not find {} reference picture with pic_num {pic_num}", ref_kind(.long_term))]
    ReferenceNotFound { pic_num: i32, long_term: bool },
    #[error("no room for a new reference picture")]
    NoRoomForReference,
    #[error("long_term_frame_idx {long_term_frame_idx} is above MaxLongTermFrameIdx {max:?}")]
    InvalidLongTermFrameIdx {
        long_term_frame_idx: u32,
        max: MaxLongTermFrameIdx,
    },
    #[error("invalid frame_num {frame_num} for a reference picture")]
    InvalidFrameNumSequence { frame_num: u32 },
    #[error("more reference picture list modifications than active references")]
    TooManyModifications,
}

/// One storage slot of the DPB.
struct PictureSlot<T> {
    /// Storage of the picture.
    image: T,
    /// Identifies `image` for as long as the DPB is allocated. Travels with the image.
    storage_id: usize,
    /// Unique value assigned every time a picture is committed to the slot.
    generation: u64,
    data: PictureData,
}

pub struct Dpb<T> {
    /// Picture slots, `dpb_size` committed ones plus the current one at the end.
    slots: Vec<PictureSlot<T>>,
    /// Reference picture list 0 for the picture being decoded.
    ref_pic_list: Vec<Option<SlotRef>>,
    /// Pictures staged for output.
    out_buf: Vec<OutputRecord<T>>,
    /// Index of the next record of `out_buf` to return.
    out_index: usize,
    /// Parameters the DPB was initialized with, if it is allocated.
    params: Option<DpbParams>,
    /// Number of committed slots.
    dpb_size: usize,
    max_ref_frames: usize,
    max_frame_num: u32,
    /// Whether pictures are output in decoding order, as soon as they are marked.
    no_reordering: bool,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    /// Number of short-term, long-term and non-existing pictures.
    num_ref_frames: usize,
    /// Number of pictures used for reference or waiting for output.
    fullness: usize,
    /// `PrevRefFrameNum`, used to detect gaps in `frame_num`.
    prev_ref_frame_num: u32,
    /// Whether the last marked picture carried a MMCO 5.
    last_contains_mmco5: bool,
    /// Whether all pending pictures have been staged for output by `flush`.
    flushed: bool,
    /// Whether the current slot has been handed out for decoding.
    current_allocated: bool,
    /// Last generation assigned to a committed picture.
    generation: u64,
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            ref_pic_list: Default::default(),
            out_buf: Default::default(),
            out_index: 0,
            params: None,
            dpb_size: 0,
            max_ref_frames: 0,
            max_frame_num: 0,
            no_reordering: false,
            max_long_term_frame_idx: Default::default(),
            num_ref_frames: 0,
            fullness: 0,
            prev_ref_frame_num: 0,
            last_contains_mmco5: false,
            flushed: false,
            current_allocated: false,
            generation: 0,
        }
    }
}

impl<T: Clone> Dpb<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates the storage of the DPB according to `params` and resets its state.
    ///
    /// On failure the DPB is left without storage.
    pub fn init<A>(&mut self, allocator: &mut A, params: DpbParams) -> Result<(), DpbError>
    where
        A: FrameAllocator<Frame = T>,
    {
        self.free();
        params.validate()?;

        let dpb_size = params.effective_dpb_size();
        let mut slots = Vec::with_capacity(dpb_size + 1);
        for storage_id in 0..=dpb_size {
            slots.push(PictureSlot {
                image: allocator.allocate(params.pic_size_in_mbs)?,
                storage_id,
                generation: 0,
                data: Default::default(),
            });
        }

        self.slots = slots;
        self.ref_pic_list = vec![None; MAX_NUM_REF_IDX_L0_ACTIVE + 1];
        self.out_buf = Vec::with_capacity(dpb_size + 1);
        self.dpb_size = dpb_size;
        self.max_ref_frames = params.effective_max_ref_frames();
        self.max_frame_num = params.max_frame_num;
        self.no_reordering = params.no_reordering;
        self.params = Some(params);

        log::debug!(
            "Initialized DPB: {} slots, {} reference frames, max_frame_num {}, no_reordering {}",
            self.dpb_size,
            self.max_ref_frames,
            self.max_frame_num,
            self.no_reordering
        );

        Ok(())
    }

    /// Frees the storage and reinitializes the DPB. Used when the active sequence parameters
    /// change.
    pub fn reset<A>(&mut self, allocator: &mut A, params: DpbParams) -> Result<(), DpbError>
    where
        A: FrameAllocator<Frame = T>,
    {
        log::debug!("Resetting the DPB");
        self.init(allocator, params)
    }

    /// Drops all the storage. The DPB must be initialized again before use.
    pub fn free(&mut self) {
        let generation = self.generation;

        *self = Default::default();

        // Keep generations unique across allocations.
        self.generation = generation;
    }

    pub fn is_initialized(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Returns the storage to decode the current picture into.
    pub fn allocate_current_slot(&mut self) -> Result<T, DpbError> {
        let current = self.slots.get_mut(self.dpb_size).ok_or(DpbError::NotAllocated)?;

        if current.data.reference.is_ref() || current.data.needed_for_output {
            return Err(DpbError::NoRoomForReference);
        }

        current.data = Default::default();
        self.current_allocated = true;

        Ok(current.image.clone())
    }

    /// Storage id of the slot the next picture will be decoded into.
    pub fn current_storage_id(&self) -> Option<usize> {
        self.slots.get(self.dpb_size).map(|slot| slot.storage_id)
    }

    /// Returns the metadata of all slots, in table order.
    pub fn pictures(&self) -> impl Iterator<Item = &PictureData> {
        self.slots.iter().map(|slot| &slot.data)
    }

    pub fn params(&self) -> Option<&DpbParams> {
        self.params.as_ref()
    }

    /// Number of committed slots, i.e. the effective DPB size.
    pub fn dpb_size(&self) -> usize {
        self.dpb_size
    }

    pub fn max_ref_frames(&self) -> usize {
        self.max_ref_frames
    }

    pub fn max_frame_num(&self) -> u32 {
        self.max_frame_num
    }

    pub fn num_ref_frames(&self) -> usize {
        self.num_ref_frames
    }

    pub fn fullness(&self) -> usize {
        self.fullness
    }

    pub fn prev_ref_frame_num(&self) -> u32 {
        self.prev_ref_frame_num
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx
    }

    /// Whether the last picture marked carried a memory_management_control_operation 5.
    pub fn last_contains_mmco5(&self) -> bool {
        self.last_contains_mmco5
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Marks the picture at `index` as unused for reference.
    fn unmark_reference(&mut self, index: usize) {
        let pic = &mut self.slots[index].data;

        log::debug!(
            "Marking picture frame_num {} pic_num {} ({:?}) as unused for reference",
            pic.frame_num,
            pic.pic_num,
            pic.reference
        );

        pic.set_reference(Default::default(), 0);
        self.num_ref_frames -= 1;
        if !pic.needed_for_output {
            self.fullness -= 1;
        }
    }
}

impl<T> fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pics = self.slots.iter().map(|slot| (slot.storage_id, &slot.data)).collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("dpb_size", &self.dpb_size)
            .field("max_ref_frames", &self.max_ref_frames)
            .field("max_frame_num", &self.max_frame_num)
            .field("no_reordering", &self.no_reordering)
            .field("max_long_term_frame_idx", &self.max_long_term_frame_idx)
            .field("num_ref_frames", &self.num_ref_frames)
            .field("fullness", &self.fullness)
            .field("prev_ref_frame_num", &self.prev_ref_frame_num)
            .field("staged_outputs", &(self.out_buf.len() - self.out_index))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::h264::header::RefPicMarking;
    use crate::codec::h264::picture::CurrentPicture;
    use crate::codec::h264::picture::Reference;
    use crate::frame_pool::HeapFrame;
    use crate::frame_pool::HeapFrameAllocator;

    pub(crate) fn params(dpb_size: usize, max_ref_frames: usize) -> DpbParams {
        DpbParams {
            pic_size_in_mbs: 1,
            dpb_size,
            max_ref_frames,
            max_frame_num: 16,
            no_reordering: false,
        }
    }

    pub(crate) fn new_dpb(params: DpbParams) -> Dpb<HeapFrame> {
        let mut dpb = Dpb::new();
        dpb.init(&mut HeapFrameAllocator::new(), params).unwrap();
        dpb
    }

    /// Runs the whole picture boundary sequence for one frame.
    pub(crate) fn decode(
        dpb: &mut Dpb<HeapFrame>,
        marking: Option<RefPicMarking>,
        is_idr: bool,
        frame_num: u32,
        pic_order_cnt: i32,
    ) -> Result<(), DpbError> {
        if !is_idr {
            dpb.check_gaps_in_frame_num(frame_num, marking.is_some(), true)?;
        }
        dpb.allocate_current_slot()?;
        dpb.mark_dec_ref_pic(
            marking.as_ref(),
            &CurrentPicture {
                frame_num,
                pic_order_cnt,
                is_idr,
                external_id: pic_order_cnt as u32,
                num_err_mbs: 0,
            },
        )
    }

    /// Checks the counters against the slot contents.
    pub(crate) fn check_invariants(dpb: &Dpb<HeapFrame>) {
        let num_refs = dpb.pictures().filter(|p| p.reference.is_ref()).count();
        let fullness = dpb
            .pictures()
            .filter(|p| p.reference.is_ref() || p.needed_for_output)
            .count();

        assert_eq!(dpb.num_ref_frames(), num_refs);
        assert_eq!(dpb.fullness(), fullness);
        assert!(dpb.num_ref_frames() <= dpb.max_ref_frames());
        assert!(dpb.fullness() <= dpb.dpb_size());

        let last = dpb.pictures().last().unwrap();
        assert_eq!(last.reference, Reference::None);
        assert!(!last.needed_for_output);
    }

    #[test]
    fn init_allocates_one_extra_slot() {
        let mut allocator = HeapFrameAllocator::new();
        let mut dpb = Dpb::new();

        dpb.init(&mut allocator, params(4, 2)).unwrap();

        assert!(dpb.is_initialized());
        assert_eq!(dpb.pictures().count(), 5);
        assert_eq!(allocator.allocated(), 5 * crate::frame_pool::MB_SIZE_BYTES);
        assert_eq!(dpb.current_storage_id(), Some(4));
        assert_eq!(dpb.fullness(), 0);
        assert_eq!(dpb.num_ref_frames(), 0);
    }

    #[test]
    fn init_without_reordering_keeps_references_only() {
        let dpb = new_dpb(DpbParams {
            no_reordering: true,
            ..params(8, 0)
        });

        assert_eq!(dpb.dpb_size(), 1);
        assert_eq!(dpb.max_ref_frames(), 1);
        assert_eq!(dpb.pictures().count(), 2);
    }

    #[test]
    fn init_failures() {
        let mut dpb: Dpb<HeapFrame> = Dpb::new();

        let mut allocator = HeapFrameAllocator::with_budget(3 * crate::frame_pool::MB_SIZE_BYTES);
        assert!(matches!(
            dpb.init(&mut allocator, params(4, 2)),
            Err(DpbError::Allocation(_))
        ));
        assert!(!dpb.is_initialized());

        assert!(matches!(
            dpb.init(&mut HeapFrameAllocator::new(), params(2, 4)),
            Err(DpbError::InvalidParameters(_))
        ));
        assert!(!dpb.is_initialized());
    }

    #[test]
    fn uninitialized_dpb() {
        let mut dpb: Dpb<HeapFrame> = Dpb::new();

        assert_eq!(dpb.allocate_current_slot().unwrap_err(), DpbError::NotAllocated);
        assert_eq!(
            dpb.mark_dec_ref_pic(None, &Default::default()).unwrap_err(),
            DpbError::NotAllocated
        );
        assert_eq!(dpb.next_output().map(|o| o.external_id), None);
    }

    #[test]
    fn marking_requires_allocated_slot() {
        let mut dpb = new_dpb(params(2, 1));

        assert_eq!(
            dpb.mark_dec_ref_pic(None, &Default::default()).unwrap_err(),
            DpbError::NotAllocated
        );
    }

    #[test]
    fn free_and_reset() {
        let mut allocator = HeapFrameAllocator::new();
        let mut dpb = Dpb::new();
        dpb.init(&mut allocator, params(2, 1)).unwrap();
        decode(&mut dpb, Some(Default::default()), true, 0, 0).unwrap();
        assert_eq!(dpb.num_ref_frames(), 1);

        dpb.free();
        assert!(!dpb.is_initialized());
        assert_eq!(dpb.num_ref_frames(), 0);
        assert_eq!(dpb.allocate_current_slot().unwrap_err(), DpbError::NotAllocated);

        dpb.reset(&mut allocator, params(3, 3)).unwrap();
        assert_eq!(dpb.dpb_size(), 3);
        assert_eq!(dpb.max_ref_frames(), 3);
        assert_eq!(dpb.params(), Some(&params(3, 3)));
        assert_eq!(dpb.fullness(), 0);
    }

    #[test]
    fn debug_output_skips_handles() {
        let dpb = new_dpb(params(2, 1));
        let dump = format!("{:?}", dpb);

        assert!(dump.contains("fullness: 0"));
        assert!(dump.contains("dpb_size: 2"));
    }
}
