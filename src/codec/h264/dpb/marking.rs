// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded reference picture marking process, 8.2.5.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::OutputRecord;
use crate::codec::h264::header::MaxLongTermFrameIdx;
use crate::codec::h264::header::Mmco;
use crate::codec::h264::header::RefPicMarking;
use crate::codec::h264::picture::CurrentPicture;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// Computes `picNumX` (8-39) for a frame.
fn pic_num_x(curr_pic_num: i32, difference_of_pic_nums_minus1: u32) -> i32 {
    let difference = i32::try_from(difference_of_pic_nums_minus1).unwrap_or(i32::MAX);
    curr_pic_num.saturating_sub(difference).saturating_sub(1)
}

impl<T: Clone> Dpb<T> {
    /// Computes `PicNum` for every short-term picture relative to `frame_num`, as per 8.2.4.1.
    /// Long-term pictures keep their `LongTermFrameIdx` as `LongTermPicNum`.
    pub(super) fn update_pic_nums(&mut self, frame_num: u32) {
        let max_frame_num = self.max_frame_num as i32;

        for slot in &mut self.slots[..self.dpb_size] {
            let pic = &mut slot.data;
            if !pic.reference.is_short_term() {
                continue;
            }

            pic.pic_num = if pic.frame_num > frame_num {
                pic.frame_num as i32 - max_frame_num
            } else {
                pic.frame_num as i32
            };
        }
    }

    /// Finds a committed short-term picture with the given `pic_num`. Non-existing pictures are
    /// included.
    pub(super) fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<usize> {
        let position = self.slots[..self.dpb_size]
            .iter()
            .position(|slot| slot.data.reference.is_short_term() && slot.data.pic_num == pic_num);

        log::debug!(
            "find_short_term_with_pic_num: {}, found position {:?}",
            pic_num,
            position
        );

        position
    }

    /// Finds a committed long-term picture with the given `long_term_pic_num`.
    pub(super) fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: u32,
    ) -> Option<usize> {
        let position = self.slots[..self.dpb_size].iter().position(|slot| {
            slot.data.reference.is_long_term() && slot.data.long_term_frame_idx == long_term_pic_num
        });

        log::debug!(
            "find_long_term_with_long_term_pic_num: {}, found position {:?}",
            long_term_pic_num,
            position
        );

        position
    }

    /// Finds the short-term picture with the lowest `pic_num`, i.e. the oldest one.
    fn find_short_term_lowest_pic_num(&self) -> Option<usize> {
        self.slots[..self.dpb_size]
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.data.reference.is_short_term())
            .min_by_key(|(_, slot)| slot.data.pic_num)
            .map(|(index, _)| index)
    }

    /// Sliding window decoded reference picture marking, 8.2.5.3. Makes room for one more
    /// reference picture by dropping the oldest short-term one if needed.
    pub(super) fn sliding_window_marking(&mut self) -> Result<(), DpbError> {
        if self.num_ref_frames < self.max_ref_frames {
            return Ok(());
        }

        let to_unmark = self
            .find_short_term_lowest_pic_num()
            .ok_or(DpbError::NoRoomForReference)?;

        self.unmark_reference(to_unmark);

        Ok(())
    }

    /// Checks `long_term_frame_idx` against the current `MaxLongTermFrameIdx`.
    fn check_long_term_frame_idx(&self, long_term_frame_idx: u32) -> Result<(), DpbError> {
        if self.max_long_term_frame_idx.allows(long_term_frame_idx) {
            Ok(())
        } else {
            Err(DpbError::InvalidLongTermFrameIdx {
                long_term_frame_idx,
                max: self.max_long_term_frame_idx,
            })
        }
    }

    /// Drops the long-term picture currently holding `long_term_frame_idx`, if any.
    fn unmark_long_term_frame_idx(&mut self, long_term_frame_idx: u32) {
        if let Some(holder) = self.find_long_term_with_long_term_pic_num(long_term_frame_idx) {
            self.unmark_reference(holder);
        }
    }

    pub(super) fn mmco_op_1(
        &mut self,
        curr_pic_num: i32,
        difference_of_pic_nums_minus1: u32,
    ) -> Result<(), DpbError> {
        let pic_num_x = pic_num_x(curr_pic_num, difference_of_pic_nums_minus1);

        log::debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(DpbError::ReferenceNotFound {
                pic_num: pic_num_x,
                long_term: false,
            })?;

        self.unmark_reference(to_mark);

        Ok(())
    }

    pub(super) fn mmco_op_2(&mut self, long_term_pic_num: u32) -> Result<(), DpbError> {
        log::debug!("MMCO op 2 for long_term_pic_num {}", long_term_pic_num);
        log::trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(long_term_pic_num)
            .ok_or(DpbError::ReferenceNotFound {
                pic_num: i32::try_from(long_term_pic_num).unwrap_or(i32::MAX),
                long_term: true,
            })?;

        self.unmark_reference(to_mark);

        Ok(())
    }

    pub(super) fn mmco_op_3(
        &mut self,
        curr_pic_num: i32,
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    ) -> Result<(), DpbError> {
        let pic_num_x = pic_num_x(curr_pic_num, difference_of_pic_nums_minus1);

        log::debug!(
            "MMCO op 3 for pic_num_x {}, long_term_frame_idx {}",
            pic_num_x,
            long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=3: {:#?}", self);

        self.check_long_term_frame_idx(long_term_frame_idx)?;

        // When LongTermFrameIdx equal to long_term_frame_idx is already
        // assigned to a long-term reference frame, that frame is marked as
        // "unused for reference".
        self.unmark_long_term_frame_idx(long_term_frame_idx);

        let to_mark_as_long = self
            .find_short_term_with_pic_num(pic_num_x)
            .filter(|&index| self.slots[index].data.reference == Reference::ShortTerm)
            .ok_or(DpbError::ReferenceNotFound {
                pic_num: pic_num_x,
                long_term: false,
            })?;

        self.slots[to_mark_as_long]
            .data
            .set_reference(Reference::LongTerm, long_term_frame_idx);

        Ok(())
    }

    pub(super) fn mmco_op_4(&mut self, max_long_term_frame_idx: MaxLongTermFrameIdx) {
        log::debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            max_long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=4: {:#?}", self);

        self.max_long_term_frame_idx = max_long_term_frame_idx;

        for index in 0..self.dpb_size {
            let pic = &self.slots[index].data;
            if pic.reference.is_long_term() && max_long_term_frame_idx < pic.long_term_frame_idx {
                self.unmark_reference(index);
            }
        }
    }

    /// Marks all the committed pictures as unused for reference and stages every picture waiting
    /// for output. Also used for IDR pictures.
    pub(super) fn mmco_op_5(&mut self) {
        log::debug!("MMCO op 5, marking all pictures as unused for reference");
        log::trace!("Dpb state before MMCO=5: {:#?}", self);

        for index in 0..self.dpb_size {
            if self.slots[index].data.reference.is_ref() {
                self.unmark_reference(index);
            }
        }

        while self.bump() {}

        self.num_ref_frames = 0;
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        self.prev_ref_frame_num = 0;
    }

    /// Marks the current picture as long-term with `long_term_frame_idx`. The reference counters
    /// are updated when the picture is committed.
    pub(super) fn mmco_op_6(&mut self, long_term_frame_idx: u32) -> Result<(), DpbError> {
        log::debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        log::trace!("Dpb state before MMCO=6: {:#?}", self);

        self.check_long_term_frame_idx(long_term_frame_idx)?;
        self.unmark_long_term_frame_idx(long_term_frame_idx);

        if self.num_ref_frames >= self.max_ref_frames {
            return Err(DpbError::NoRoomForReference);
        }

        self.slots[self.dpb_size]
            .data
            .set_reference(Reference::LongTerm, long_term_frame_idx);

        Ok(())
    }

    /// Runs the adaptive marking operations on behalf of the current picture, stopping at the
    /// first failure. `frame_num` is set to 0 if a MMCO 5 is met.
    fn handle_memory_management_ops(
        &mut self,
        marking: &RefPicMarking,
        frame_num: &mut u32,
    ) -> Result<(), DpbError> {
        for op in &marking.inner {
            let curr_pic_num = *frame_num as i32;

            match *op {
                Mmco::MarkShortTermUnused {
                    difference_of_pic_nums_minus1,
                } => self.mmco_op_1(curr_pic_num, difference_of_pic_nums_minus1)?,
                Mmco::MarkLongTermUnused { long_term_pic_num } => {
                    self.mmco_op_2(long_term_pic_num)?
                }
                Mmco::ShortTermToLongTerm {
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                } => self.mmco_op_3(
                    curr_pic_num,
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                )?,
                Mmco::SetMaxLongTermFrameIdx(max) => self.mmco_op_4(max),
                Mmco::MarkAllUnused => {
                    self.mmco_op_5();
                    self.last_contains_mmco5 = true;
                    *frame_num = 0;
                }
                Mmco::MarkCurrentLongTerm {
                    long_term_frame_idx,
                } => self.mmco_op_6(long_term_frame_idx)?,
            }
        }

        Ok(())
    }

    /// Marks an IDR picture, 8.2.5.1. Everything in the DPB is dropped.
    fn mark_idr(&mut self, marking: &RefPicMarking) {
        self.out_buf.clear();
        self.out_index = 0;

        self.mmco_op_5();

        if marking.no_output_of_prior_pics_flag || self.no_reordering {
            log::debug!("Discarding {} pictures waiting for output", self.out_buf.len());
            self.out_buf.clear();
        }

        let current = &mut self.slots[self.dpb_size].data;
        if marking.long_term_reference_flag {
            current.set_reference(Reference::LongTerm, 0);
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
        } else {
            current.set_reference(Reference::ShortTerm, 0);
            current.pic_num = 0;
            self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        }
    }

    /// Marks a non-IDR reference picture, 8.2.5.3 and 8.2.5.4. `frame_num` and `pic_order_cnt`
    /// are reset if the marking contains a MMCO 5.
    fn mark_reference(
        &mut self,
        marking: &RefPicMarking,
        frame_num: &mut u32,
        pic_order_cnt: &mut i32,
    ) -> Result<(), DpbError> {
        self.update_pic_nums(*frame_num);

        let res = if marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(marking, frame_num)
        } else {
            self.sliding_window_marking()
        };

        if self.last_contains_mmco5 {
            // 8.2.1: tempPicOrderCnt is subtracted from the picture order count, leaving 0 for a
            // frame.
            *pic_order_cnt = 0;
        }

        let current = &mut self.slots[self.dpb_size].data;
        if current.reference.is_long_term() {
            return res;
        }

        if self.num_ref_frames < self.max_ref_frames {
            current.set_reference(Reference::ShortTerm, 0);
            current.pic_num = *frame_num as i32;
            res
        } else {
            res.and(Err(DpbError::NoRoomForReference))
        }
    }

    /// Commits the current picture to the DPB, marking it and the pictures already stored as
    /// specified by `marking`, then stages the pictures that are ready for output.
    ///
    /// `marking` is `None` for non-reference pictures. On failure the current picture is still
    /// committed, as a non-reference picture if it could not be stored for reference, and the
    /// first error met is returned.
    pub fn mark_dec_ref_pic(
        &mut self,
        marking: Option<&RefPicMarking>,
        pic: &CurrentPicture,
    ) -> Result<(), DpbError> {
        if !self.current_allocated {
            return Err(DpbError::NotAllocated);
        }

        let current = self.dpb_size;
        let to_be_displayed = !self.no_reordering;
        let mut frame_num = pic.frame_num;
        let mut pic_order_cnt = pic.pic_order_cnt;

        self.last_contains_mmco5 = false;
        self.flushed = false;
        self.slots[current].data = PictureData {
            frame_num,
            pic_num: frame_num as i32,
            pic_order_cnt,
            is_idr: pic.is_idr,
            external_id: pic.external_id,
            num_err_mbs: pic.num_err_mbs,
            ..Default::default()
        };

        let res = match marking {
            None => Ok(()),
            Some(marking) if pic.is_idr => {
                self.mark_idr(marking);
                frame_num = 0;
                pic_order_cnt = 0;
                Ok(())
            }
            Some(marking) => self.mark_reference(marking, &mut frame_num, &mut pic_order_cnt),
        };

        if let Err(e) = &res {
            log::warn!("Reference marking failed for frame_num {}: {}", pic.frame_num, e);
        }

        let generation = self.next_generation();
        let slot = &mut self.slots[current];
        slot.generation = generation;
        slot.data.frame_num = frame_num;
        slot.data.pic_order_cnt = pic_order_cnt;
        slot.data.needed_for_output = to_be_displayed;
        if slot.data.reference.is_ref() {
            self.num_ref_frames += 1;
        }
        if slot.data.reference.is_ref() || slot.data.needed_for_output {
            self.fullness += 1;
        }

        log::debug!(
            "Stored picture frame_num {} POC {} as {:?}, fullness {}",
            slot.data.frame_num,
            slot.data.pic_order_cnt,
            slot.data.reference,
            self.fullness
        );

        if self.no_reordering {
            let record = OutputRecord::new(slot);
            self.out_buf.push(record);
        } else {
            while self.fullness > self.dpb_size {
                if !self.bump() {
                    break;
                }
            }
        }

        self.sort_pictures();
        self.current_allocated = false;

        res
    }
}
