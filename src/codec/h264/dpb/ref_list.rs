// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list 0 initialization and modification, 8.2.4.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::MAX_NUM_REF_IDX_L0_ACTIVE;
use crate::codec::h264::header::ModificationOfPicNums;
use crate::codec::h264::header::RefPicListModification;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// Weak reference to a picture of the DPB.
///
/// Only resolves while the slot at `index` still holds the picture that was there when the
/// reference was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    index: usize,
    generation: u64,
}

impl SlotRef {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T: Clone> Dpb<T> {
    fn slot_ref(&self, index: usize) -> SlotRef {
        SlotRef {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Builds the initial reference picture list 0 for a P frame, 8.2.4.2.1: short-term pictures
    /// by descending `PicNum`, then long-term ones by ascending `LongTermPicNum`. This is the
    /// order of the slots.
    pub fn init_ref_pic_list(&mut self) {
        for i in 0..self.ref_pic_list.len() {
            self.ref_pic_list[i] = if i < self.num_ref_frames {
                Some(self.slot_ref(i))
            } else {
                None
            };
        }

        log::debug!(
            "Initial ref_pic_list0 with {} entries",
            self.num_ref_frames
        );
    }

    /// Resolves `slot_ref` to its picture if it is still an existing reference.
    fn resolve(&self, slot_ref: &SlotRef) -> Option<usize> {
        let slot = self.slots.get(slot_ref.index)?;

        (slot.generation == slot_ref.generation && slot.data.reference.is_existing())
            .then_some(slot_ref.index)
    }

    /// Returns the storage of entry `index` of reference picture list 0, if it designates a
    /// decoded reference picture.
    pub fn ref_pic_list_entry(&self, index: usize) -> Option<&T> {
        let slot_ref = self.ref_pic_list.get(index)?.as_ref()?;
        let index = self.resolve(slot_ref)?;

        Some(&self.slots[index].image)
    }

    /// Returns the metadata of the picture at entry `index` of reference picture list 0. Unlike
    /// `ref_pic_list_entry`, non-existing pictures are returned.
    pub fn ref_pic_list_picture(&self, index: usize) -> Option<&PictureData> {
        let slot_ref = self.ref_pic_list.get(index)?.as_ref()?;
        let slot = self.slots.get(slot_ref.index)?;

        (slot.generation == slot_ref.generation && slot.data.reference.is_ref())
            .then_some(&slot.data)
    }

    /// The current reference picture list 0.
    pub fn ref_pic_list(&self) -> &[Option<SlotRef>] {
        &self.ref_pic_list
    }

    /// Moves `target` to position `ref_idx` of the list and removes its later occurrences, as per
    /// 8-37 and 8-38.
    fn insert_modified_entry(
        &mut self,
        target: SlotRef,
        ref_idx: &mut usize,
        num_ref_idx_active: usize,
    ) -> Result<(), DpbError> {
        if *ref_idx >= num_ref_idx_active {
            return Err(DpbError::TooManyModifications);
        }

        let list = &mut self.ref_pic_list;

        for c_idx in (*ref_idx + 1..=num_ref_idx_active).rev() {
            list[c_idx] = list[c_idx - 1];
        }

        list[*ref_idx] = Some(target);
        *ref_idx += 1;

        let mut n_idx = *ref_idx;
        for c_idx in *ref_idx..=num_ref_idx_active {
            if list[c_idx] != Some(target) {
                list[n_idx] = list[c_idx];
                n_idx += 1;
            }
        }

        Ok(())
    }

    /// Modification process of reference picture lists for short-term reference pictures,
    /// 8.2.4.3.1. `pic_num_pred` is updated with the new prediction.
    fn short_term_pic_list_modification(
        &mut self,
        modification: &ModificationOfPicNums,
        curr_pic_num: i32,
        pic_num_pred: &mut i32,
        ref_idx: &mut usize,
        num_ref_idx_active: usize,
    ) -> Result<(), DpbError> {
        let max_pic_num = self.max_frame_num as i32;

        let pic_num_no_wrap = match *modification {
            ModificationOfPicNums::SubtractPicNum(abs_diff_pic_num_minus1) => {
                let abs_diff_pic_num = abs_diff_pic_num(abs_diff_pic_num_minus1, max_pic_num);
                if *pic_num_pred - abs_diff_pic_num < 0 {
                    *pic_num_pred - abs_diff_pic_num + max_pic_num
                } else {
                    *pic_num_pred - abs_diff_pic_num
                }
            }
            ModificationOfPicNums::AddPicNum(abs_diff_pic_num_minus1) => {
                let abs_diff_pic_num = abs_diff_pic_num(abs_diff_pic_num_minus1, max_pic_num);
                if *pic_num_pred + abs_diff_pic_num >= max_pic_num {
                    *pic_num_pred + abs_diff_pic_num - max_pic_num
                } else {
                    *pic_num_pred + abs_diff_pic_num
                }
            }
            _ => return Ok(()),
        };

        *pic_num_pred = pic_num_no_wrap;

        let pic_num = if pic_num_no_wrap > curr_pic_num {
            pic_num_no_wrap - max_pic_num
        } else {
            pic_num_no_wrap
        };

        let index = self
            .find_short_term_with_pic_num(pic_num)
            .filter(|&index| self.slots[index].data.reference == Reference::ShortTerm)
            .ok_or(DpbError::ReferenceNotFound {
                pic_num,
                long_term: false,
            })?;

        self.insert_modified_entry(self.slot_ref(index), ref_idx, num_ref_idx_active)
    }

    /// Modification process of reference picture lists for long-term reference pictures,
    /// 8.2.4.3.2.
    fn long_term_pic_list_modification(
        &mut self,
        long_term_pic_num: u32,
        ref_idx: &mut usize,
        num_ref_idx_active: usize,
    ) -> Result<(), DpbError> {
        let index = self
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(DpbError::ReferenceNotFound {
                pic_num: i32::try_from(long_term_pic_num).unwrap_or(i32::MAX),
                long_term: true,
            })?;

        self.insert_modified_entry(self.slot_ref(index), ref_idx, num_ref_idx_active)
    }

    /// Applies the `ref_pic_list_modification()` of the current slice to the list built by
    /// `init_ref_pic_list`. `PicNum`s are recomputed relative to `curr_frame_num` first, even
    /// when no modification is present.
    pub fn reorder_ref_pic_list(
        &mut self,
        rplm: &RefPicListModification,
        curr_frame_num: u32,
        num_ref_idx_active: usize,
    ) -> Result<(), DpbError> {
        if !self.is_initialized() {
            return Err(DpbError::NotAllocated);
        }

        if num_ref_idx_active > MAX_NUM_REF_IDX_L0_ACTIVE {
            return Err(DpbError::InvalidParameters(format!(
                "num_ref_idx_l0_active {} exceeds {}",
                num_ref_idx_active, MAX_NUM_REF_IDX_L0_ACTIVE
            )));
        }

        self.update_pic_nums(curr_frame_num);

        if !rplm.ref_pic_list_modification_flag_l0 {
            return Ok(());
        }

        log::trace!("Dpb state before reordering: {:#?}", self);

        let curr_pic_num = curr_frame_num as i32;
        let mut pic_num_pred = curr_pic_num;
        let mut ref_idx = 0;

        for modification in &rplm.modifications {
            match modification {
                ModificationOfPicNums::SubtractPicNum(_) | ModificationOfPicNums::AddPicNum(_) => {
                    self.short_term_pic_list_modification(
                        modification,
                        curr_pic_num,
                        &mut pic_num_pred,
                        &mut ref_idx,
                        num_ref_idx_active,
                    )?
                }
                ModificationOfPicNums::LongTermPicNum(long_term_pic_num) => self
                    .long_term_pic_list_modification(
                        *long_term_pic_num,
                        &mut ref_idx,
                        num_ref_idx_active,
                    )?,
                ModificationOfPicNums::End => break,
            }
        }

        // The list is num_ref_idx_l0_active_minus1 + 1 entries long after the modification.
        for entry in &mut self.ref_pic_list[num_ref_idx_active..] {
            *entry = None;
        }

        Ok(())
    }
}

/// `abs_diff_pic_num_minus1 + 1`, bounded by `MaxPicNum` as required by 7.4.3.1.
fn abs_diff_pic_num(abs_diff_pic_num_minus1: u32, max_pic_num: i32) -> i32 {
    i32::try_from(abs_diff_pic_num_minus1)
        .map_or(max_pic_num, |diff| diff.saturating_add(1))
        .min(max_pic_num)
}
