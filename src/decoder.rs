// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream-level driver of the DPB.
//!
//! [`StreamDecoder`] runs the per-picture sequence of DPB operations around an accelerator-style
//! [`PictureDecoder`]: gap recovery, allocation of the current slot, construction of reference
//! picture list 0, decoding proper, reference marking and output.

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::OutputRecord;
use crate::codec::h264::header::RefPicListModification;
use crate::codec::h264::header::RefPicMarking;
use crate::codec::h264::params::DpbParams;
use crate::codec::h264::params::SequenceParams;
use crate::codec::h264::picture::CurrentPicture;
use crate::frame_pool::FrameAllocator;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no sequence has been activated")]
    NoActiveSequence,
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error("backend failed to decode the picture: {0:#}")]
    Backend(#[from] anyhow::Error),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// The slice header values of a picture that matter to the DPB.
#[derive(Clone, Debug, Default)]
pub struct PictureParams {
    pub frame_num: u32,
    pub pic_order_cnt: i32,
    pub idr: bool,
    pub nal_ref_idc: u8,
    pub dec_ref_pic_marking: RefPicMarking,
    pub ref_pic_list_modification: RefPicListModification,
    pub num_ref_idx_l0_active_minus1: u8,
    /// Client identifier returned with the picture on output.
    pub external_id: u32,
}

impl PictureParams {
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }

    pub fn num_ref_idx_l0_active(&self) -> usize {
        usize::from(self.num_ref_idx_l0_active_minus1) + 1
    }
}

/// Decodes the content of a picture. Implemented by backends.
pub trait PictureDecoder<T> {
    /// Decodes `picture` into `target`, predicting from `ref_pic_list0`. Entries of the list are
    /// `None` where no usable reference exists.
    ///
    /// Returns the number of macroblocks that could not be decoded.
    fn decode_picture(
        &mut self,
        picture: &PictureParams,
        target: &T,
        ref_pic_list0: &[Option<&T>],
    ) -> anyhow::Result<u32>;
}

/// Queue of pictures ready to be displayed.
struct ReadyFramesQueue<T> {
    queue: VecDeque<OutputRecord<T>>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Extend<OutputRecord<T>> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = OutputRecord<T>>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = OutputRecord<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop_front()
    }
}

/// Drives a [`Dpb`] over a stream of pictures decoded by `D`, with storage obtained from `A`.
pub struct StreamDecoder<A, D>
where
    A: FrameAllocator,
{
    allocator: A,
    backend: D,
    dpb: Dpb<A::Frame>,
    /// Parameters the DPB has been initialized with.
    active_params: Option<DpbParams>,
    gaps_allowed: bool,
    /// Output in decoding order regardless of what the stream allows.
    no_reordering: bool,
    ready_queue: ReadyFramesQueue<A::Frame>,
}

impl<A, D> StreamDecoder<A, D>
where
    A: FrameAllocator,
    D: PictureDecoder<A::Frame>,
{
    pub fn new(allocator: A, backend: D, no_reordering: bool) -> Self {
        Self {
            allocator,
            backend,
            dpb: Dpb::new(),
            active_params: None,
            gaps_allowed: false,
            no_reordering,
            ready_queue: Default::default(),
        }
    }

    /// Makes `seq` the active sequence. The DPB is flushed and reallocated if `seq` requires a
    /// different configuration than the current one.
    pub fn activate_sequence(&mut self, seq: &SequenceParams) -> DecodeResult<()> {
        let params = DpbParams::from_sequence(seq, self.no_reordering)?;
        self.gaps_allowed = seq.gaps_in_frame_num_value_allowed_flag;

        if self.active_params == Some(params) {
            return Ok(());
        }

        log::debug!("New DPB parameters: {:?}", params);

        if self.dpb.is_initialized() {
            self.flush();
        }

        self.active_params = None;
        self.dpb.reset(&mut self.allocator, params)?;
        self.active_params = Some(params);

        Ok(())
    }

    /// Decodes one picture and queues the pictures it makes ready for output.
    ///
    /// Pictures staged by the DPB are queued even when decoding fails.
    pub fn decode(&mut self, picture: &PictureParams) -> DecodeResult<()> {
        if self.active_params.is_none() {
            return Err(DecodeError::NoActiveSequence);
        }

        let res = self.decode_picture(picture);
        self.queue_staged_outputs();

        res
    }

    fn decode_picture(&mut self, picture: &PictureParams) -> DecodeResult<()> {
        if !picture.idr {
            self.dpb.check_gaps_in_frame_num(
                picture.frame_num,
                picture.is_reference(),
                self.gaps_allowed,
            )?;
        }

        let target = self.dpb.allocate_current_slot()?;

        let num_ref_idx_active = picture.num_ref_idx_l0_active();
        self.dpb.init_ref_pic_list();

        let decode_res = match self.dpb.reorder_ref_pic_list(
            &picture.ref_pic_list_modification,
            picture.frame_num,
            num_ref_idx_active,
        ) {
            Ok(()) => {
                let ref_pic_list0: Vec<_> = (0..num_ref_idx_active)
                    .map(|i| self.dpb.ref_pic_list_entry(i))
                    .collect();

                self.backend
                    .decode_picture(picture, &target, &ref_pic_list0)
                    .map_err(DecodeError::Backend)
            }
            Err(e) => Err(DecodeError::Dpb(e)),
        };

        // A picture that could not be decoded is still stored, with all its macroblocks in error,
        // so that the reference state of the stream stays consistent.
        let num_err_mbs = match &decode_res {
            Ok(num_err_mbs) => *num_err_mbs,
            Err(e) => {
                log::warn!(
                    "Failed to decode picture frame_num {}: {}",
                    picture.frame_num,
                    e
                );
                self.dpb.params().map_or(0, |p| p.pic_size_in_mbs)
            }
        };

        let marking = picture
            .is_reference()
            .then_some(&picture.dec_ref_pic_marking);

        let mark_res = self.dpb.mark_dec_ref_pic(
            marking,
            &CurrentPicture {
                frame_num: picture.frame_num,
                pic_order_cnt: picture.pic_order_cnt,
                is_idr: picture.idr,
                external_id: picture.external_id,
                num_err_mbs,
            },
        );

        decode_res?;
        mark_res?;

        Ok(())
    }

    fn queue_staged_outputs(&mut self) {
        self.ready_queue
            .extend(std::iter::from_fn(|| self.dpb.next_output()));
    }

    /// Returns the next picture in display order, if one is ready.
    pub fn next_output(&mut self) -> Option<OutputRecord<A::Frame>> {
        (&mut self.ready_queue).next()
    }

    /// Number of pictures ready to be returned by `next_output`.
    pub fn num_ready_outputs(&self) -> usize {
        self.ready_queue.len()
    }

    /// Makes all the pictures still held by the DPB ready for output.
    pub fn flush(&mut self) {
        self.dpb.flush();
        self.queue_staged_outputs();
    }

    pub fn dpb(&self) -> &Dpb<A::Frame> {
        &self.dpb
    }

    pub fn backend(&self) -> &D {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut D {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::header::Mmco;
    use crate::codec::h264::header::ModificationOfPicNums;
    use crate::codec::h264::params::BitstreamRestriction;
    use crate::codec::h264::params::Level;
    use crate::frame_pool::HeapFrame;
    use crate::frame_pool::HeapFrameAllocator;

    /// Writes the external id of each picture into its first byte, and records which pictures
    /// were used as references.
    #[derive(Default)]
    struct RecordingBackend {
        decoded: Vec<(u32, Vec<Option<u8>>)>,
        fail_on: Option<u32>,
    }

    impl PictureDecoder<HeapFrame> for RecordingBackend {
        fn decode_picture(
            &mut self,
            picture: &PictureParams,
            target: &HeapFrame,
            ref_pic_list0: &[Option<&HeapFrame>],
        ) -> anyhow::Result<u32> {
            if self.fail_on == Some(picture.external_id) {
                anyhow::bail!("corrupted slice data");
            }

            target.data_mut()[0] = picture.external_id as u8;
            let refs = ref_pic_list0
                .iter()
                .map(|r| r.map(|frame| frame.data()[0]))
                .collect();
            self.decoded.push((picture.external_id, refs));

            Ok(0)
        }
    }

    fn sequence(max_num_ref_frames: u32, max_dec_frame_buffering: u32) -> SequenceParams {
        SequenceParams {
            profile_idc: 77,
            level_idc: Level::L1,
            pic_width_in_mbs: 1,
            pic_height_in_mbs: 1,
            max_num_ref_frames,
            bitstream_restriction: Some(BitstreamRestriction {
                max_num_reorder_frames: 1,
                max_dec_frame_buffering,
            }),
            ..Default::default()
        }
    }

    fn picture(
        external_id: u32,
        idr: bool,
        is_ref: bool,
        frame_num: u32,
        pic_order_cnt: i32,
    ) -> PictureParams {
        PictureParams {
            frame_num,
            pic_order_cnt,
            idr,
            nal_ref_idc: if is_ref { 1 } else { 0 },
            external_id,
            ..Default::default()
        }
    }

    fn new_decoder() -> StreamDecoder<HeapFrameAllocator, RecordingBackend> {
        StreamDecoder::new(HeapFrameAllocator::new(), Default::default(), false)
    }

    fn outputs(decoder: &mut StreamDecoder<HeapFrameAllocator, RecordingBackend>) -> Vec<u32> {
        std::iter::from_fn(|| decoder.next_output())
            .map(|o| o.external_id)
            .collect()
    }

    #[test]
    fn decode_ipbpb() {
        let mut decoder = new_decoder();
        decoder.activate_sequence(&sequence(1, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();
        decoder.decode(&picture(1, false, true, 1, 4)).unwrap();
        decoder.decode(&picture(2, false, false, 2, 2)).unwrap();
        decoder.decode(&picture(3, false, true, 2, 8)).unwrap();
        decoder.decode(&picture(4, false, false, 3, 6)).unwrap();

        assert_eq!(decoder.num_ready_outputs(), 3);
        decoder.flush();
        assert_eq!(outputs(&mut decoder), vec![0, 2, 1, 4, 3]);

        assert_eq!(
            decoder.backend().decoded,
            vec![
                (0, vec![None]),
                (1, vec![Some(0)]),
                (2, vec![Some(1)]),
                (3, vec![Some(1)]),
                (4, vec![Some(3)]),
            ]
        );
    }

    #[test]
    fn reordered_reference_list() {
        let mut decoder = new_decoder();
        decoder.activate_sequence(&sequence(2, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();
        decoder.decode(&picture(1, false, true, 1, 2)).unwrap();

        let mut p = picture(2, false, true, 2, 4);
        p.num_ref_idx_l0_active_minus1 = 1;
        p.ref_pic_list_modification =
            RefPicListModification::new(vec![ModificationOfPicNums::SubtractPicNum(1)]);
        decoder.decode(&p).unwrap();

        let (_, refs) = decoder.backend().decoded.last().unwrap();
        assert_eq!(refs, &vec![Some(0), Some(1)]);
    }

    #[test]
    fn decode_requires_sequence() {
        let mut decoder = new_decoder();

        assert!(matches!(
            decoder.decode(&picture(0, true, true, 0, 0)),
            Err(DecodeError::NoActiveSequence)
        ));
    }

    #[test]
    fn sequence_change_flushes() {
        let mut decoder = new_decoder();
        decoder.activate_sequence(&sequence(1, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();
        decoder.decode(&picture(1, false, true, 1, 2)).unwrap();
        assert_eq!(decoder.dpb().num_ref_frames(), 1);

        // Same parameters, nothing happens.
        decoder.activate_sequence(&sequence(1, 2)).unwrap();
        assert_eq!(decoder.dpb().num_ref_frames(), 1);
        assert_eq!(decoder.num_ready_outputs(), 0);

        decoder.activate_sequence(&sequence(2, 3)).unwrap();
        assert_eq!(decoder.dpb().num_ref_frames(), 0);
        assert_eq!(decoder.dpb().dpb_size(), 3);
        assert_eq!(outputs(&mut decoder), vec![0, 1]);
    }

    #[test]
    fn backend_failure_keeps_picture() {
        let mut decoder = new_decoder();
        decoder.backend_mut().fail_on = Some(1);
        decoder.activate_sequence(&sequence(2, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();
        assert!(matches!(
            decoder.decode(&picture(1, false, true, 1, 2)),
            Err(DecodeError::Backend(_))
        ));
        assert_eq!(decoder.dpb().num_ref_frames(), 2);

        decoder.flush();
        let records: Vec<_> = std::iter::from_fn(|| decoder.next_output()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].external_id, 1);
        assert_eq!(records[1].num_err_mbs, 1);
    }

    #[test]
    fn marking_error_is_reported() {
        let mut decoder = new_decoder();
        decoder.activate_sequence(&sequence(2, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();

        let mut p = picture(1, false, true, 1, 2);
        p.dec_ref_pic_marking = RefPicMarking::adaptive(vec![Mmco::MarkShortTermUnused {
            difference_of_pic_nums_minus1: 5,
        }]);
        assert!(matches!(
            decoder.decode(&p),
            Err(DecodeError::Dpb(DpbError::ReferenceNotFound { .. }))
        ));

        // The picture itself is kept as a reference.
        assert_eq!(decoder.dpb().num_ref_frames(), 2);
    }

    #[test]
    fn modification_error_keeps_picture() {
        let mut decoder = new_decoder();
        let mut seq = sequence(2, 2);
        seq.gaps_in_frame_num_value_allowed_flag = true;
        decoder.activate_sequence(&seq).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();

        // There is no picture 6 frames back.
        let mut p = picture(1, false, true, 1, 2);
        p.ref_pic_list_modification =
            RefPicListModification::new(vec![ModificationOfPicNums::SubtractPicNum(5)]);
        assert!(matches!(
            decoder.decode(&p),
            Err(DecodeError::Dpb(DpbError::ReferenceNotFound {
                pic_num: -5,
                long_term: false
            }))
        ));
        assert_eq!(decoder.dpb().num_ref_frames(), 2);
        assert_eq!(decoder.dpb().prev_ref_frame_num(), 1);

        // Picture 1 can still be referred to by the following pictures.
        let mut p = picture(2, false, true, 2, 4);
        p.dec_ref_pic_marking = RefPicMarking::adaptive(vec![Mmco::MarkShortTermUnused {
            difference_of_pic_nums_minus1: 0,
        }]);
        decoder.decode(&p).unwrap();

        decoder.flush();
        let records: Vec<_> = std::iter::from_fn(|| decoder.next_output()).collect();
        let ids: Vec<_> = records.iter().map(|o| o.external_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(records[1].num_err_mbs, 1);

        // The backend never saw picture 1.
        let decoded: Vec<_> = decoder.backend().decoded.iter().map(|(id, _)| *id).collect();
        assert_eq!(decoded, vec![0, 2]);
    }

    #[test]
    fn no_reordering_outputs_immediately() {
        let mut decoder =
            StreamDecoder::new(HeapFrameAllocator::new(), RecordingBackend::default(), true);
        decoder.activate_sequence(&sequence(1, 2)).unwrap();

        decoder.decode(&picture(0, true, true, 0, 0)).unwrap();
        assert_eq!(outputs(&mut decoder), vec![0]);
        decoder.decode(&picture(1, false, true, 1, 4)).unwrap();
        assert_eq!(outputs(&mut decoder), vec![1]);
        decoder.decode(&picture(2, false, false, 2, 2)).unwrap();
        assert_eq!(outputs(&mut decoder), vec![2]);
    }
}
