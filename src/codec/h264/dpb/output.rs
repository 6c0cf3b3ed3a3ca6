// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output of pictures in display order, C.4.5.3.

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::PictureSlot;

/// A picture released for display.
///
/// `image` shares its storage with the DPB slot it comes from. The DPB may decode into that
/// storage again once the record has been handed out, so its content should be consumed before
/// the next picture is decoded.
#[derive(Clone, Debug)]
pub struct OutputRecord<T> {
    pub image: T,
    pub storage_id: usize,
    pub external_id: u32,
    pub is_idr: bool,
    pub num_err_mbs: u32,
}

impl<T: Clone> OutputRecord<T> {
    pub(super) fn new(slot: &PictureSlot<T>) -> Self {
        Self {
            image: slot.image.clone(),
            storage_id: slot.storage_id,
            external_id: slot.data.external_id,
            is_idr: slot.data.is_idr,
            num_err_mbs: slot.data.num_err_mbs,
        }
    }
}

impl<T: Clone> Dpb<T> {
    /// Find the lowest POC in the DPB that can be bumped.
    fn find_lowest_poc_for_bumping(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.data.needed_for_output)
            .min_by_key(|(_, slot)| slot.data.pic_order_cnt)
            .map(|(index, _)| index)
    }

    /// Stages the picture with the lowest POC for output. Returns `false` if there was no
    /// picture to output.
    ///
    /// Pictures are never bumped when reordering is disabled, they are staged as soon as they are
    /// marked instead.
    pub(super) fn bump(&mut self) -> bool {
        if self.no_reordering {
            return false;
        }

        let index = match self.find_lowest_poc_for_bumping() {
            Some(index) => index,
            None => return false,
        };

        let slot = &mut self.slots[index];

        log::debug!(
            "Bumping picture frame_num {} POC {} from the DPB",
            slot.data.frame_num,
            slot.data.pic_order_cnt
        );

        slot.data.needed_for_output = false;
        if !slot.data.reference.is_ref() {
            self.fullness -= 1;
        }

        let record = OutputRecord::new(slot);
        self.out_buf.push(record);

        true
    }

    /// Returns the next picture staged for output, if any.
    pub fn next_output(&mut self) -> Option<OutputRecord<T>> {
        let record = self.out_buf.get(self.out_index)?.clone();
        self.out_index += 1;

        Some(record)
    }

    /// Number of pictures staged and not yet returned by `next_output`.
    pub fn num_staged_outputs(&self) -> usize {
        self.out_buf.len() - self.out_index
    }

    /// Stages every picture still waiting for output. Used at the end of a stream.
    pub fn flush(&mut self) {
        log::debug!("Flushing the DPB");

        self.out_buf.drain(..self.out_index);
        self.out_index = 0;

        while self.bump() {}

        self.flushed = true;
    }
}
