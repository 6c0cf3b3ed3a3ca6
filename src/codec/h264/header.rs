// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice header syntax consumed by the DPB.
//!
//! These types are filled by the slice header parser, which lives outside of this crate. The
//! `from_syntax` constructors accept the raw syntax element values as read from the bitstream.

use enumn::N;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid memory_management_control_operation {0}")]
    InvalidMmco(u32),
    #[error("invalid modification_of_pic_nums_idc {0}")]
    InvalidModificationOfPicNumsIdc(u32),
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }

    /// Whether `long_term_frame_idx` may be assigned under this limit.
    pub fn allows(self, long_term_frame_idx: u32) -> bool {
        match self {
            Self::NoLongTermFrameIndices => false,
            Self::Idx(max) => long_term_frame_idx <= max,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// Values of `memory_management_control_operation`, Table 7-9.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoType {
    End = 0,
    MarkShortTermUnused = 1,
    MarkLongTermUnused = 2,
    ShortTermToLongTerm = 3,
    SetMaxLongTermFrameIdx = 4,
    MarkAllUnused = 5,
    MarkCurrentLongTerm = 6,
}

/// One memory management control operation, with the data it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mmco {
    /// MMCO 1: mark the short-term picture `difference_of_pic_nums_minus1 + 1` pictures back as
    /// unused for reference.
    MarkShortTermUnused { difference_of_pic_nums_minus1: u32 },
    /// MMCO 2: mark the long-term picture `long_term_pic_num` as unused for reference.
    MarkLongTermUnused { long_term_pic_num: u32 },
    /// MMCO 3: convert a short-term picture to long-term with `long_term_frame_idx`.
    ShortTermToLongTerm {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// MMCO 4: set `MaxLongTermFrameIdx`, dropping the long-term pictures above it.
    SetMaxLongTermFrameIdx(MaxLongTermFrameIdx),
    /// MMCO 5: mark everything as unused for reference and restart numbering.
    MarkAllUnused,
    /// MMCO 6: mark the current picture as long-term with `long_term_frame_idx`.
    MarkCurrentLongTerm { long_term_frame_idx: u32 },
}

impl Mmco {
    /// Builds an operation from the raw syntax elements of one `dec_ref_pic_marking()` loop
    /// iteration. Returns `Ok(None)` for the end-of-list operation (0).
    pub fn from_syntax(
        memory_management_control_operation: u32,
        difference_of_pic_nums_minus1: u32,
        long_term_pic_num: u32,
        long_term_frame_idx: u32,
        max_long_term_frame_idx_plus1: u32,
    ) -> Result<Option<Self>, HeaderError> {
        let op = u8::try_from(memory_management_control_operation)
            .ok()
            .and_then(MmcoType::n)
            .ok_or(HeaderError::InvalidMmco(memory_management_control_operation))?;

        let mmco = match op {
            MmcoType::End => return Ok(None),
            MmcoType::MarkShortTermUnused => Mmco::MarkShortTermUnused {
                difference_of_pic_nums_minus1,
            },
            MmcoType::MarkLongTermUnused => Mmco::MarkLongTermUnused { long_term_pic_num },
            MmcoType::ShortTermToLongTerm => Mmco::ShortTermToLongTerm {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            },
            MmcoType::SetMaxLongTermFrameIdx => Mmco::SetMaxLongTermFrameIdx(
                MaxLongTermFrameIdx::from_value_plus1(max_long_term_frame_idx_plus1),
            ),
            MmcoType::MarkAllUnused => Mmco::MarkAllUnused,
            MmcoType::MarkCurrentLongTerm => Mmco::MarkCurrentLongTerm { long_term_frame_idx },
        };

        Ok(Some(mmco))
    }

    /// The `memory_management_control_operation` value of this operation.
    pub fn op_type(&self) -> MmcoType {
        match self {
            Mmco::MarkShortTermUnused { .. } => MmcoType::MarkShortTermUnused,
            Mmco::MarkLongTermUnused { .. } => MmcoType::MarkLongTermUnused,
            Mmco::ShortTermToLongTerm { .. } => MmcoType::ShortTermToLongTerm,
            Mmco::SetMaxLongTermFrameIdx(_) => MmcoType::SetMaxLongTermFrameIdx,
            Mmco::MarkAllUnused => MmcoType::MarkAllUnused,
            Mmco::MarkCurrentLongTerm { .. } => MmcoType::MarkCurrentLongTerm,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If unset, specifies that the MaxLongTermFrameIdx variable is set equal
    /// to "no long-term frame indices" and that the IDR picture is marked as
    /// "used for short-term reference". If set, specifies that the
    /// MaxLongTermFrameIdx variable is set equal to 0 and that the current IDR
    /// picture is marked "used for long-term reference" and is assigned
    /// LongTermFrameIdx equal to 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture as specified in Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The operations to apply, in bitstream order, without the terminating 0.
    pub inner: Vec<Mmco>,
}

impl RefPicMarking {
    /// Marking for a non-IDR reference picture using the sliding window.
    pub fn sliding_window() -> Self {
        Default::default()
    }

    /// Marking for a non-IDR reference picture using `ops`.
    pub fn adaptive(ops: Vec<Mmco>) -> Self {
        Self {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: ops,
            ..Default::default()
        }
    }

    pub fn has_mmco_5(&self) -> bool {
        self.adaptive_ref_pic_marking_mode_flag
            && self.inner.iter().any(|op| matches!(op, Mmco::MarkAllUnused))
    }
}

/// One `modification_of_pic_nums_idc` command, Table 7-7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModificationOfPicNums {
    /// idc 0: picture number predictor minus `abs_diff_pic_num_minus1 + 1`.
    SubtractPicNum(u32),
    /// idc 1: picture number predictor plus `abs_diff_pic_num_minus1 + 1`.
    AddPicNum(u32),
    /// idc 2: the long-term picture with the given `long_term_pic_num`.
    LongTermPicNum(u32),
    /// idc 3: end of the list.
    End,
}

impl ModificationOfPicNums {
    /// Builds a command from `modification_of_pic_nums_idc` and the value that follows it
    /// (`abs_diff_pic_num_minus1` or `long_term_pic_num`, ignored for the end command).
    pub fn from_syntax(modification_of_pic_nums_idc: u32, value: u32) -> Result<Self, HeaderError> {
        match modification_of_pic_nums_idc {
            0 => Ok(Self::SubtractPicNum(value)),
            1 => Ok(Self::AddPicNum(value)),
            2 => Ok(Self::LongTermPicNum(value)),
            3 => Ok(Self::End),
            idc => Err(HeaderError::InvalidModificationOfPicNumsIdc(idc)),
        }
    }
}

/// Reference picture list 0 modification as parsed with the `ref_pic_list_modification()`
/// process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    /// If set, specifies that `modifications` is present for reference picture list 0.
    pub ref_pic_list_modification_flag_l0: bool,
    pub modifications: Vec<ModificationOfPicNums>,
}

impl RefPicListModification {
    pub fn new(modifications: Vec<ModificationOfPicNums>) -> Self {
        Self {
            ref_pic_list_modification_flag_l0: true,
            modifications,
        }
    }
}
