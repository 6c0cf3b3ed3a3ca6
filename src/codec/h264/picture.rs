// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Marking status of a picture held in the DPB.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    /// Unused for reference. The picture may still be waiting for output.
    #[default]
    None,
    /// A short-term placeholder inferred from a gap in `frame_num`. It has no pixel content and is
    /// never output.
    NonExisting,
    ShortTerm,
    LongTerm,
}

impl Reference {
    /// Whether the picture counts against the reference budget.
    pub fn is_ref(&self) -> bool {
        !matches!(self, Reference::None)
    }

    /// Whether the picture is identified by its `PicNum`, as opposed to a long-term index.
    pub fn is_short_term(&self) -> bool {
        matches!(self, Reference::ShortTerm | Reference::NonExisting)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self, Reference::LongTerm)
    }

    /// Whether the picture is a reference with decoded content.
    pub fn is_existing(&self) -> bool {
        matches!(self, Reference::ShortTerm | Reference::LongTerm)
    }
}

/// Metadata of a picture stored in the DPB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    /// `frame_num` as decoded from the slice header, or 0 after an IDR or MMCO 5.
    pub frame_num: u32,
    /// `PicNum` for short-term pictures, relative to the picture being decoded. `LongTermPicNum`
    /// for long-term pictures.
    pub pic_num: i32,
    pub long_term_frame_idx: u32,
    pub pic_order_cnt: i32,
    pub reference: Reference,
    pub needed_for_output: bool,

    // Pass-through data for the client.
    pub external_id: u32,
    pub num_err_mbs: u32,
    pub is_idr: bool,
}

impl PictureData {
    /// Sets the marking of the picture. Long-term pictures use their index as `pic_num`.
    pub fn set_reference(&mut self, reference: Reference, long_term_frame_idx: u32) {
        self.reference = reference;
        if reference.is_long_term() {
            self.long_term_frame_idx = long_term_frame_idx;
            self.pic_num = i32::try_from(long_term_frame_idx).unwrap_or(i32::MAX);
        }
    }
}

/// Identification of the picture being decoded, handed to the DPB when it is committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CurrentPicture {
    pub frame_num: u32,
    pub pic_order_cnt: i32,
    pub is_idr: bool,
    pub external_id: u32,
    /// Number of macroblocks the decoder could not reconstruct.
    pub num_err_mbs: u32,
}
