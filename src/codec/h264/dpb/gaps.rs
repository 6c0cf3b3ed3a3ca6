// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding process for gaps in frame_num, 8.2.5.2.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

impl<T: Clone> Dpb<T> {
    /// Stores a "non-existing" frame with `frame_num` after making room for it.
    fn insert_non_existing(&mut self, frame_num: u32) -> Result<(), DpbError> {
        self.update_pic_nums(frame_num);
        self.sliding_window_marking()?;

        while self.fullness >= self.dpb_size {
            if !self.bump() {
                return Err(DpbError::NoRoomForReference);
            }
        }

        log::debug!("Inserting non-existing frame {}", frame_num);

        let generation = self.next_generation();
        let slot = &mut self.slots[self.dpb_size];
        slot.generation = generation;
        slot.data = PictureData {
            frame_num,
            pic_num: frame_num as i32,
            reference: Reference::NonExisting,
            ..Default::default()
        };

        self.fullness += 1;
        self.num_ref_frames += 1;

        self.sort_pictures();

        Ok(())
    }

    /// Makes sure the current slot does not hold storage staged for output, which would be
    /// overwritten by the next picture. `previous_storage_id` is the storage the current slot held
    /// before the gap was filled.
    fn release_staged_storage(&mut self, previous_storage_id: usize) {
        let current = self.dpb_size;
        let storage_id = self.slots[current].storage_id;

        if !self.out_buf.iter().any(|o| o.storage_id == storage_id) {
            return;
        }

        match self.slots[..current]
            .iter()
            .position(|slot| slot.storage_id == previous_storage_id)
        {
            Some(index) => {
                log::debug!(
                    "Swapping storage {} and {} after gap recovery",
                    storage_id,
                    previous_storage_id
                );

                let (committed, rest) = self.slots.split_at_mut(current);
                let slot = &mut committed[index];
                std::mem::swap(&mut slot.image, &mut rest[0].image);
                std::mem::swap(&mut slot.storage_id, &mut rest[0].storage_id);
            }
            None => log::warn!(
                "Storage {} is staged for output but could not be released",
                storage_id
            ),
        }
    }

    /// Checks `frame_num` against `PrevRefFrameNum` and fills any gap with "non-existing" frames
    /// when `gaps_in_frame_num_value_allowed_flag` is set. Must be called before the current
    /// picture is allocated, except for IDR pictures.
    ///
    /// Clears the pictures staged for output. The inferred frames may cause new pictures to be
    /// staged.
    pub fn check_gaps_in_frame_num(
        &mut self,
        frame_num: u32,
        is_reference: bool,
        gaps_allowed: bool,
    ) -> Result<(), DpbError> {
        self.out_buf.clear();
        self.out_index = 0;

        if !gaps_allowed {
            return Ok(());
        }

        if !self.is_initialized() {
            return Err(DpbError::NotAllocated);
        }

        if frame_num >= self.max_frame_num {
            return Err(DpbError::InvalidFrameNumSequence { frame_num });
        }

        self.current_allocated = false;

        let max_frame_num = self.max_frame_num;
        let prev_ref_frame_num = self.prev_ref_frame_num;

        if frame_num != prev_ref_frame_num && frame_num != (prev_ref_frame_num + 1) % max_frame_num
        {
            log::debug!(
                "Gap in frame_num: previous reference {}, current {}",
                prev_ref_frame_num,
                frame_num
            );

            let previous_storage_id = self.slots[self.dpb_size].storage_id;
            let mut unused_short_term_frame_num = (prev_ref_frame_num + 1) % max_frame_num;

            while unused_short_term_frame_num != frame_num {
                self.insert_non_existing(unused_short_term_frame_num)?;
                unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
            }

            self.release_staged_storage(previous_storage_id);
        } else if is_reference && frame_num == prev_ref_frame_num {
            return Err(DpbError::InvalidFrameNumSequence { frame_num });
        }

        if is_reference {
            self.prev_ref_frame_num = frame_num;
        } else if frame_num != prev_ref_frame_num {
            self.prev_ref_frame_num = (frame_num + max_frame_num - 1) % max_frame_num;
        }

        Ok(())
    }
}
